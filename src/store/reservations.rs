use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;

use crate::error::Error;
use crate::limits::MAX_RECORDS_PER_RESOURCE;
use crate::model::*;

use super::conflict::{check_no_overlap, validate_id, validate_record};
use super::{Compactable, WalHandle, within};

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

/// Apply an event to a resource (caller holds the lock).
fn apply_to_resource(
    rs: &mut ResourceState,
    event: &Event,
    index: &DashMap<RecordId, ResourceId>,
) {
    match event {
        Event::ReservationCreated { record } => {
            index.insert(record.record_id.clone(), record.resource_id.clone());
            rs.insert_record(record.clone());
        }
        Event::ReservationCancelled { record_id, at, .. } => {
            if let Some(record) = rs.get_mut(record_id) {
                record.status = ReservationStatus::Cancelled { at: *at };
            }
        }
        Event::ReservationPurged { record_id, .. } => {
            rs.remove_record(record_id);
            index.remove(record_id);
        }
        Event::MetadataCreated { .. } => {}
    }
}

fn event_resource_id(event: &Event) -> Option<&str> {
    match event {
        Event::ReservationCreated { record } => Some(&record.resource_id),
        Event::ReservationCancelled { resource_id, .. }
        | Event::ReservationPurged { resource_id, .. } => Some(resource_id),
        Event::MetadataCreated { .. } => None,
    }
}

/// Durable reservation records, one lock per resource.
///
/// Every mutation holds the commit gate (shared) and then the resource's write
/// lock while it checks, logs and applies, so overlap checks and inserts are
/// serialized per resource. Compaction takes the gate exclusively.
pub struct ReservationStore {
    resources: DashMap<ResourceId, SharedResourceState>,
    /// Reverse lookup: record id → resource id.
    record_index: Arc<DashMap<RecordId, ResourceId>>,
    commit_gate: Arc<RwLock<()>>,
    wal: WalHandle,
}

impl ReservationStore {
    pub fn open(wal_path: &Path) -> io::Result<Self> {
        let (wal, events) = WalHandle::open(wal_path, "reservations")?;
        let store = Self {
            resources: DashMap::new(),
            record_index: Arc::new(DashMap::new()),
            commit_gate: Arc::new(RwLock::new(())),
            wal,
        };

        // Sole owner of these locks during replay, so try_write never fails.
        for event in &events {
            let Some(resource_id) = event_resource_id(event) else {
                continue;
            };
            let rs = store.resource_or_insert(resource_id);
            let Ok(mut guard) = rs.try_write() else {
                return Err(io::Error::other("replay: resource lock contended"));
            };
            apply_to_resource(&mut guard, event, &store.record_index);
        }
        tracing::info!(
            "reservations: replayed {} events, {} records",
            events.len(),
            store.record_index.len()
        );
        Ok(store)
    }

    fn resource(&self, id: &str) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    fn resource_or_insert(&self, id: &str) -> SharedResourceState {
        self.resources
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(id))))
            .value()
            .clone()
    }

    fn resource_for_record(&self, record_id: &str) -> Option<ResourceId> {
        self.record_index.get(record_id).map(|e| e.value().clone())
    }

    /// WAL-append then apply, in a task of its own: once the event is handed to
    /// the log, a caller that gives up cannot leave memory behind the WAL.
    async fn commit(
        &self,
        gate: OwnedRwLockReadGuard<()>,
        mut guard: OwnedRwLockWriteGuard<ResourceState>,
        event: Event,
    ) -> Result<(), Error> {
        let wal = self.wal.clone();
        let index = self.record_index.clone();
        tokio::spawn(async move {
            let _gate = gate;
            wal.append(&event).await?;
            apply_to_resource(&mut guard, &event, &index);
            Ok::<(), Error>(())
        })
        .await
        .map_err(|e| Error::StorageUnavailable(format!("commit task failed: {e}")))?
    }

    pub async fn create_reservation(
        &self,
        record: ReservationRecord,
        deadline: Instant,
    ) -> Result<RecordId, Error> {
        validate_record(&record)?;
        if self.record_index.contains_key(&record.record_id) {
            return Err(Error::AlreadyExists(record.record_id));
        }

        let gate = within(deadline, self.commit_gate.clone().read_owned()).await?;
        let rs = self.resource_or_insert(&record.resource_id);
        let guard = within(deadline, rs.write_owned()).await?;
        if guard.records.len() >= MAX_RECORDS_PER_RESOURCE {
            return Err(Error::Validation("too many reservations on resource".into()));
        }
        check_no_overlap(&guard, &record.span)?;

        // Claim the id; another resource may have taken it since the fast check.
        match self.record_index.entry(record.record_id.clone()) {
            Entry::Occupied(_) => return Err(Error::AlreadyExists(record.record_id)),
            Entry::Vacant(slot) => {
                slot.insert(record.resource_id.clone());
            }
        }

        let record_id = record.record_id.clone();
        if let Err(e) = self
            .commit(gate, guard, Event::ReservationCreated { record })
            .await
        {
            self.record_index.remove(&record_id);
            return Err(e);
        }
        Ok(record_id)
    }

    /// Mark a confirmed reservation cancelled. `Ok(false)` when there is
    /// nothing to cancel.
    pub async fn cancel_reservation(
        &self,
        record_id: &str,
        now: Ms,
        deadline: Instant,
    ) -> Result<bool, Error> {
        validate_id("record_id", record_id)?;
        let Some(resource_id) = self.resource_for_record(record_id) else {
            return Ok(false);
        };
        let Some(rs) = self.resource(&resource_id) else {
            return Ok(false);
        };
        let gate = within(deadline, self.commit_gate.clone().read_owned()).await?;
        let guard = within(deadline, rs.write_owned()).await?;
        if !guard.get(record_id).is_some_and(|r| r.status.is_confirmed()) {
            return Ok(false);
        }

        let event = Event::ReservationCancelled {
            record_id: record_id.to_string(),
            resource_id,
            at: now,
        };
        self.commit(gate, guard, event).await?;
        Ok(true)
    }

    pub async fn get_reservation(
        &self,
        record_id: &str,
        deadline: Instant,
    ) -> Result<ReservationRecord, Error> {
        let not_found = || Error::NotFound(format!("reservation {record_id}"));
        let resource_id = self.resource_for_record(record_id).ok_or_else(not_found)?;
        let rs = self.resource(&resource_id).ok_or_else(not_found)?;
        let guard = within(deadline, rs.read()).await?;
        guard.get(record_id).cloned().ok_or_else(not_found)
    }

    /// All records of a resource, any status, in start order.
    pub async fn list_reservations(
        &self,
        resource_id: &str,
        deadline: Instant,
    ) -> Result<Vec<ReservationRecord>, Error> {
        let Some(rs) = self.resource(resource_id) else {
            return Ok(Vec::new());
        };
        let guard = within(deadline, rs.read()).await?;
        Ok(guard.records.clone())
    }

    /// A consistent read view of one resource, or `None` if it has never been
    /// booked.
    pub async fn snapshot(
        &self,
        resource_id: &str,
        deadline: Instant,
    ) -> Result<Option<OwnedRwLockReadGuard<ResourceState>>, Error> {
        match self.resource(resource_id) {
            Some(rs) => Ok(Some(within(deadline, rs.read_owned()).await?)),
            None => Ok(None),
        }
    }

    /// Cancelled records whose cancellation is older than `cutoff`.
    pub async fn collect_purgeable(&self, cutoff: Ms) -> Vec<RecordId> {
        let resources: Vec<SharedResourceState> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        let mut purgeable = Vec::new();
        for rs in resources {
            let guard = rs.read().await;
            purgeable.extend(guard.records.iter().filter_map(|r| match r.status {
                ReservationStatus::Cancelled { at } if at < cutoff => Some(r.record_id.clone()),
                _ => None,
            }));
        }
        purgeable
    }

    /// Physically remove a cancelled record. Confirmed records are never purged.
    pub async fn purge(&self, record_id: &str, deadline: Instant) -> Result<bool, Error> {
        let Some(resource_id) = self.resource_for_record(record_id) else {
            return Ok(false);
        };
        let Some(rs) = self.resource(&resource_id) else {
            return Ok(false);
        };
        let gate = within(deadline, self.commit_gate.clone().read_owned()).await?;
        let guard = within(deadline, rs.write_owned()).await?;
        if !guard
            .get(record_id)
            .is_some_and(|r| !r.status.is_confirmed())
        {
            return Ok(false);
        }

        let event = Event::ReservationPurged {
            record_id: record_id.to_string(),
            resource_id,
        };
        self.commit(gate, guard, event).await?;
        Ok(true)
    }
}

#[async_trait]
impl Compactable for ReservationStore {
    fn store_name(&self) -> &'static str {
        "reservations"
    }

    async fn wal_appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }

    /// Rewrite the WAL as one `ReservationCreated` per live record, carrying
    /// its current status.
    async fn compact_wal(&self) -> Result<(), Error> {
        let _gate = self.commit_gate.write().await;
        let resources: Vec<SharedResourceState> =
            self.resources.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::with_capacity(self.record_index.len());
        for rs in resources {
            let guard = rs.read().await;
            events.extend(
                guard
                    .records
                    .iter()
                    .map(|record| Event::ReservationCreated {
                        record: record.clone(),
                    }),
            );
        }
        self.wal.compact(events).await
    }
}
