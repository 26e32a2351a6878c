mod local;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::clock::Clock;
use crate::error::{Dependency, Error};
use crate::model::*;
use crate::store::validate_id;

/// Where resource descriptions come from: the local store or a remote node.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    fn is_ready(&self) -> bool;

    async fn metadata(&self, resource_id: &str, deadline: Instant)
    -> Result<ResourceMetadata, Error>;
}

/// Where availability verdicts come from: the local engine or a remote node.
#[async_trait]
pub trait AvailabilitySource: Send + Sync {
    fn is_ready(&self) -> bool;

    async fn availability(
        &self,
        resource_id: &str,
        as_of: Ms,
        deadline: Instant,
    ) -> Result<AvailabilityResult, Error>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub metadata: bool,
    pub availability: bool,
}

impl Readiness {
    pub fn ready(&self) -> bool {
        self.metadata && self.availability
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = |up: bool| if up { "ready" } else { "down" };
        write!(
            f,
            "metadata {}, availability {}",
            state(self.metadata),
            state(self.availability)
        )
    }
}

/// Builds the composite cubicle view from its two halves.
pub struct Orchestrator {
    metadata: Arc<dyn MetadataSource>,
    availability: Arc<dyn AvailabilitySource>,
    clock: Arc<dyn Clock>,
    request_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        metadata: Arc<dyn MetadataSource>,
        availability: Arc<dyn AvailabilitySource>,
        clock: Arc<dyn Clock>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            metadata,
            availability,
            clock,
            request_timeout,
        }
    }

    pub fn readiness(&self) -> Readiness {
        Readiness {
            metadata: self.metadata.is_ready(),
            availability: self.availability.is_ready(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.readiness().ready()
    }

    /// Metadata and availability for one resource, fetched concurrently.
    /// Either half failing fails the whole call; the other half is dropped.
    pub async fn get_cubicle_details(
        &self,
        resource_id: &str,
        deadline: Instant,
    ) -> Result<CompositeResourceView, Error> {
        validate_id("resource_id", resource_id)?;
        let readiness = self.readiness();
        if !readiness.ready() {
            return Err(Error::NotReady(readiness.to_string()));
        }

        let as_of = self.clock.now_ms();
        let sub_deadline = deadline.min(Instant::now() + self.request_timeout);

        let metadata = call(
            Dependency::Metadata,
            sub_deadline,
            self.metadata.metadata(resource_id, sub_deadline),
        );
        let availability = call(
            Dependency::Availability,
            sub_deadline,
            self.availability.availability(resource_id, as_of, sub_deadline),
        );
        let (metadata, availability) = tokio::try_join!(metadata, availability)?;

        Ok(CompositeResourceView {
            metadata,
            availability,
        })
    }
}

/// Run one sub-call under its deadline and tag any failure with its source.
async fn call<T>(
    which: Dependency,
    deadline: Instant,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    let result = match tokio::time::timeout_at(deadline, fut).await {
        Ok(Ok(value)) => return Ok(value),
        Ok(Err(cause)) => Error::dependency(which, cause),
        Err(_) => Error::DependencyTimeout { which },
    };
    let kind = match &result {
        Error::DependencyTimeout { .. } => "timeout",
        _ if result.is_not_found() => "not_found",
        _ => "failure",
    };
    if kind != "not_found" {
        tracing::warn!(dependency = %which, "sub-call failed: {result}");
    }
    metrics::counter!(
        crate::observability::DEPENDENCY_FAILURES_TOTAL,
        "dependency" => which.as_str(),
        "kind" => kind
    )
    .increment(1);
    Err(result)
}
