use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::Error;
use crate::limits::*;
use crate::model::*;

use super::conflict::validate_id;
use super::{Compactable, WalHandle, within};

type MetadataMap = HashMap<ResourceId, ResourceMetadata>;

/// Descriptive data per resource. Insert-once, read-mostly.
pub struct MetadataStore {
    state: Arc<RwLock<MetadataMap>>,
    wal: WalHandle,
}

fn validate_metadata(m: &ResourceMetadata) -> Result<(), Error> {
    validate_id("id", &m.id)?;
    if m.name.trim().is_empty() {
        return Err(Error::Validation("name must not be empty".into()));
    }
    if m.name.len() > MAX_NAME_LEN {
        return Err(Error::Validation("name too long".into()));
    }
    if m.location.len() > MAX_LOCATION_LEN {
        return Err(Error::Validation("location too long".into()));
    }
    if m.capacity == 0 {
        return Err(Error::Validation("capacity must be positive".into()));
    }
    Ok(())
}

impl MetadataStore {
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let (wal, events) = WalHandle::open(wal_path, "metadata")?;
        let mut map = MetadataMap::new();
        for event in events {
            if let Event::MetadataCreated { metadata } = event {
                map.insert(metadata.id.clone(), metadata);
            }
        }
        tracing::info!("metadata: replayed {} resources", map.len());
        Ok(Self {
            state: Arc::new(RwLock::new(map)),
            wal,
        })
    }

    pub async fn get_metadata(
        &self,
        resource_id: &str,
        deadline: Instant,
    ) -> Result<ResourceMetadata, Error> {
        let guard = within(deadline, self.state.read()).await?;
        guard
            .get(resource_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("resource {resource_id}")))
    }

    pub async fn list_metadata(&self, deadline: Instant) -> Result<Vec<ResourceMetadata>, Error> {
        let guard = within(deadline, self.state.read()).await?;
        let mut all: Vec<ResourceMetadata> = guard.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    pub async fn create_metadata(
        &self,
        metadata: ResourceMetadata,
        deadline: Instant,
    ) -> Result<ResourceId, Error> {
        validate_metadata(&metadata)?;
        let mut guard = within(deadline, self.state.clone().write_owned()).await?;
        if guard.contains_key(&metadata.id) {
            return Err(Error::AlreadyExists(format!("resource {}", metadata.id)));
        }

        let id = metadata.id.clone();
        let wal = self.wal.clone();
        // Same commit-in-own-task rule as reservations.
        tokio::spawn(async move {
            let event = Event::MetadataCreated { metadata };
            wal.append(&event).await?;
            if let Event::MetadataCreated { metadata } = event {
                guard.insert(metadata.id.clone(), metadata);
            }
            Ok::<(), Error>(())
        })
        .await
        .map_err(|e| Error::StorageUnavailable(format!("commit task failed: {e}")))??;
        Ok(id)
    }
}

#[async_trait]
impl Compactable for MetadataStore {
    fn store_name(&self) -> &'static str {
        "metadata"
    }

    async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }

    /// Creates take the write lock across their append, so holding the read
    /// lock until the swap finishes keeps the snapshot and the log in step.
    async fn compact_wal(&self) -> Result<(), Error> {
        let guard = self.state.read().await;
        let mut all: Vec<&ResourceMetadata> = guard.values().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        let events = all
            .into_iter()
            .map(|m| Event::MetadataCreated { metadata: m.clone() })
            .collect();
        self.wal.compact(events).await
    }
}
