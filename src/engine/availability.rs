use crate::model::*;

// ── Availability decision ────────────────────────────────────────

/// Verdict for a resource nobody has booked.
pub fn always_available() -> AvailabilityResult {
    AvailabilityResult {
        available_now: true,
        next_available: None,
        integrity_violation: None,
    }
}

/// Decide availability of one resource at `as_of` from a consistent view of
/// its records.
///
/// Busy: the covering confirmed record with the earliest start (then smallest
/// record id) wins and `next_available` is its end. More than one covering
/// record breaks the no-overlap invariant and is reported alongside the
/// verdict. Free: `next_available` is the start of the next confirmed
/// booking, or `None` when nothing is booked ahead.
pub fn decide(resource: &ResourceState, as_of: Ms) -> AvailabilityResult {
    let mut covering = resource.covering(as_of);
    let Some(active) = covering.next() else {
        return AvailabilityResult {
            available_now: true,
            next_available: resource.starting_after(as_of).next().map(|r| r.span.start),
            integrity_violation: None,
        };
    };

    let extra: Vec<RecordId> = covering.map(|r| r.record_id.clone()).collect();
    let integrity_violation = (!extra.is_empty()).then(|| {
        let mut record_ids = Vec::with_capacity(extra.len() + 1);
        record_ids.push(active.record_id.clone());
        record_ids.extend(extra);
        IntegrityViolation {
            resource_id: resource.id.clone(),
            at: as_of,
            record_ids,
        }
    });

    AvailabilityResult {
        available_now: false,
        next_available: Some(active.span.end),
        integrity_violation,
    }
}
