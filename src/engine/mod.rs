pub mod availability;

use std::sync::Arc;

use tokio::time::Instant;

use crate::error::Error;
use crate::model::*;
use crate::store::{ReservationStore, validate_id};

pub use availability::{always_available, decide};

/// Answers "is this resource free at `as_of`, and until when" from the
/// reservation store.
pub struct AvailabilityEngine {
    store: Arc<ReservationStore>,
}

impl AvailabilityEngine {
    pub fn new(store: Arc<ReservationStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<ReservationStore> {
        &self.store
    }

    /// Both the "is it busy" and the "what comes next" reads happen under one
    /// read guard, so a concurrent create or cancel is seen entirely or not
    /// at all.
    pub async fn check_availability(
        &self,
        resource_id: &str,
        as_of: Ms,
        deadline: Instant,
    ) -> Result<AvailabilityResult, Error> {
        validate_id("resource_id", resource_id)?;
        let Some(snapshot) = self.store.snapshot(resource_id, deadline).await? else {
            return Ok(always_available());
        };
        let result = decide(&snapshot, as_of);
        drop(snapshot);

        if let Some(violation) = &result.integrity_violation {
            tracing::error!(
                resource_id = %violation.resource_id,
                at = violation.at,
                "integrity violation: {violation}"
            );
            metrics::counter!(crate::observability::INTEGRITY_VIOLATIONS_TOTAL).increment(1);
        }
        Ok(result)
    }
}
