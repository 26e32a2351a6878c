use crate::error::Error;
use crate::limits::*;
use crate::model::*;

pub fn validate_id(field: &str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{field} must not be empty")));
    }
    if value.len() > MAX_ID_LEN {
        return Err(Error::Validation(format!("{field} too long")));
    }
    // Lists of ids travel comma-separated.
    if value.contains(',') {
        return Err(Error::Validation(format!("{field} must not contain ','")));
    }
    Ok(())
}

/// Checks a raw `[start, end)` pair and returns it as a span.
pub fn validate_span(start: Ms, end: Ms) -> Result<Span, Error> {
    if start >= end {
        return Err(Error::Validation(format!(
            "start ({start}) must be before end ({end})"
        )));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(Error::Validation("timestamp out of range".into()));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(Error::Validation("reservation too long".into()));
    }
    Ok(span)
}

pub(super) fn validate_record(record: &ReservationRecord) -> Result<(), Error> {
    validate_id("record_id", &record.record_id)?;
    validate_id("resource_id", &record.resource_id)?;
    validate_id("requester_id", &record.requester_id)?;
    validate_span(record.span.start, record.span.end)?;
    if !record.status.is_confirmed() {
        return Err(Error::Validation(
            "new reservations must be CONFIRMED".into(),
        ));
    }
    Ok(())
}

/// Reject `span` if it overlaps any confirmed record of the resource.
pub(super) fn check_no_overlap(rs: &ResourceState, span: &Span) -> Result<(), Error> {
    match rs
        .overlapping(span)
        .find(|r| r.status.is_confirmed())
    {
        Some(existing) => Err(Error::Conflict(existing.record_id.clone())),
        None => Ok(()),
    }
}
