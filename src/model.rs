use serde::{Deserialize, Serialize};

/// Unix milliseconds, UTC. The only time type.
pub type Ms = i64;

pub type ResourceId = String;
pub type RecordId = String;
pub type RequesterId = String;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

/// Lifecycle of a reservation. Cancelled records stay in storage until the
/// retention reaper purges them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Cancelled { at: Ms },
}

impl ReservationStatus {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, ReservationStatus::Confirmed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Cancelled { .. } => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRecord {
    pub record_id: RecordId,
    pub resource_id: ResourceId,
    pub requester_id: RequesterId,
    pub span: Span,
    pub status: ReservationStatus,
}

impl ReservationRecord {
    pub fn confirmed(
        record_id: impl Into<RecordId>,
        resource_id: impl Into<ResourceId>,
        requester_id: impl Into<RequesterId>,
        span: Span,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            resource_id: resource_id.into(),
            requester_id: requester_id.into(),
            span,
            status: ReservationStatus::Confirmed,
        }
    }

    fn sort_key(&self) -> (Ms, &str) {
        (self.span.start, self.record_id.as_str())
    }
}

/// All reservation records of one resource.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: ResourceId,
    /// Sorted by `(span.start, record_id)`.
    pub records: Vec<ReservationRecord>,
}

impl ResourceState {
    pub fn new(id: impl Into<ResourceId>) -> Self {
        Self {
            id: id.into(),
            records: Vec::new(),
        }
    }

    /// Insert record maintaining sort order.
    pub fn insert_record(&mut self, record: ReservationRecord) {
        let pos = self
            .records
            .binary_search_by(|r| r.sort_key().cmp(&record.sort_key()))
            .unwrap_or_else(|e| e);
        self.records.insert(pos, record);
    }

    pub fn remove_record(&mut self, record_id: &str) -> Option<ReservationRecord> {
        let pos = self.records.iter().position(|r| r.record_id == record_id)?;
        Some(self.records.remove(pos))
    }

    pub fn get(&self, record_id: &str) -> Option<&ReservationRecord> {
        self.records.iter().find(|r| r.record_id == record_id)
    }

    pub fn get_mut(&mut self, record_id: &str) -> Option<&mut ReservationRecord> {
        self.records.iter_mut().find(|r| r.record_id == record_id)
    }

    /// Return only records whose span overlaps the query window.
    /// Uses binary search to skip records starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &ReservationRecord> {
        let right_bound = self
            .records
            .partition_point(|r| r.span.start < query.end);
        self.records[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// Confirmed records whose span contains `t`, in `(start, record_id)` order.
    pub fn covering(&self, t: Ms) -> impl Iterator<Item = &ReservationRecord> {
        let right_bound = self.records.partition_point(|r| r.span.start <= t);
        self.records[..right_bound]
            .iter()
            .filter(move |r| r.status.is_confirmed() && r.span.end > t)
    }

    /// Confirmed records starting strictly after `t`, in `(start, record_id)` order.
    pub fn starting_after(&self, t: Ms) -> impl Iterator<Item = &ReservationRecord> {
        let left_bound = self.records.partition_point(|r| r.span.start <= t);
        self.records[left_bound..]
            .iter()
            .filter(|r| r.status.is_confirmed())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceMetadata {
    pub id: ResourceId,
    pub name: String,
    pub location: String,
    pub capacity: u32,
}

/// Two or more confirmed records of one resource cover the same instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityViolation {
    pub resource_id: ResourceId,
    pub at: Ms,
    pub record_ids: Vec<RecordId>,
}

impl std::fmt::Display for IntegrityViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "overlapping confirmed records on {} at {}: {}",
            self.resource_id,
            self.at,
            self.record_ids.join(", ")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityResult {
    pub available_now: bool,
    /// `None` when no known boundary exists: free with nothing booked ahead.
    pub next_available: Option<Ms>,
    pub integrity_violation: Option<IntegrityViolation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeResourceView {
    pub metadata: ResourceMetadata,
    pub availability: AvailabilityResult,
}

/// Flat event types; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    MetadataCreated {
        metadata: ResourceMetadata,
    },
    ReservationCreated {
        record: ReservationRecord,
    },
    ReservationCancelled {
        record_id: RecordId,
        resource_id: ResourceId,
        at: Ms,
    },
    ReservationPurged {
        record_id: RecordId,
        resource_id: ResourceId,
    },
}
