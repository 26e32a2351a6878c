use async_trait::async_trait;
use tokio::time::Instant;

use crate::engine::AvailabilityEngine;
use crate::error::Error;
use crate::model::*;
use crate::store::MetadataStore;

use super::{AvailabilitySource, MetadataSource};

// In-process components are ready as soon as they exist.

#[async_trait]
impl MetadataSource for MetadataStore {
    fn is_ready(&self) -> bool {
        true
    }

    async fn metadata(
        &self,
        resource_id: &str,
        deadline: Instant,
    ) -> Result<ResourceMetadata, Error> {
        self.get_metadata(resource_id, deadline).await
    }
}

#[async_trait]
impl AvailabilitySource for AvailabilityEngine {
    fn is_ready(&self) -> bool {
        true
    }

    async fn availability(
        &self,
        resource_id: &str,
        as_of: Ms,
        deadline: Instant,
    ) -> Result<AvailabilityResult, Error> {
        self.check_availability(resource_id, as_of, deadline).await
    }
}
