use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::info;

use crate::client::{RemoteAvailability, RemoteLink, RemoteMetadata, link_config};
use crate::clock::Clock;
use crate::config::{Config, Role};
use crate::engine::AvailabilityEngine;
use crate::error::{Dependency, Error};
use crate::orchestrator::{Orchestrator, Readiness};
use crate::reaper;
use crate::store::{MetadataStore, ReservationStore};

/// The components one process serves, chosen by its role. Commands aimed at
/// a component this node does not host fail with `Unsupported`.
pub struct Node {
    role: Role,
    clock: Arc<dyn Clock>,
    request_timeout: Duration,
    metadata: Option<Arc<MetadataStore>>,
    availability: Option<Arc<AvailabilityEngine>>,
    orchestrator: Option<Orchestrator>,
}

impl Node {
    /// Open the stores this role needs, link to remote nodes and start the
    /// background reaper and compactors.
    pub fn start(config: &Config, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let role = config.role;
        let hosts_metadata = matches!(role, Role::All | Role::Metadata);
        let hosts_reservations = matches!(role, Role::All | Role::Reservation);
        if hosts_metadata || hosts_reservations {
            std::fs::create_dir_all(&config.data_dir)?;
        }

        let metadata = if hosts_metadata {
            let store = Arc::new(MetadataStore::open(&config.data_dir.join("metadata.wal"))?);
            tokio::spawn(reaper::run_compactor(store.clone(), config.compact_threshold));
            Some(store)
        } else {
            None
        };

        let availability = if hosts_reservations {
            let store = Arc::new(ReservationStore::open(
                &config.data_dir.join("reservations.wal"),
            )?);
            tokio::spawn(reaper::run_compactor(store.clone(), config.compact_threshold));
            tokio::spawn(reaper::run_reaper(
                store.clone(),
                clock.clone(),
                config.retention_ms,
            ));
            Some(Arc::new(AvailabilityEngine::new(store)))
        } else {
            None
        };

        let orchestrator = match role {
            Role::All => match (&metadata, &availability) {
                (Some(m), Some(a)) => Some(Orchestrator::new(
                    m.clone(),
                    a.clone(),
                    clock.clone(),
                    config.request_timeout,
                )),
                _ => None,
            },
            Role::Cubicle => {
                let (Some(meta_addr), Some(res_addr)) =
                    (&config.metadata_addr, &config.reservation_addr)
                else {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "cubicle role needs metadata and reservation addresses",
                    ));
                };
                info!("linking to metadata node {meta_addr}, reservation node {res_addr}");
                let meta = RemoteLink::spawn(
                    Dependency::Metadata,
                    link_config(meta_addr, &config.password),
                );
                let avail = RemoteLink::spawn(
                    Dependency::Availability,
                    link_config(res_addr, &config.password),
                );
                Some(Orchestrator::new(
                    Arc::new(RemoteMetadata(meta)),
                    Arc::new(RemoteAvailability(avail)),
                    clock.clone(),
                    config.request_timeout,
                ))
            }
            Role::Metadata | Role::Reservation => None,
        };

        Ok(Self {
            role,
            clock,
            request_timeout: config.request_timeout,
            metadata,
            availability,
            orchestrator,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    /// Deadline for a request arriving now.
    pub fn deadline(&self) -> Instant {
        Instant::now() + self.request_timeout
    }

    fn unsupported(&self, what: &str) -> Error {
        Error::Unsupported(format!("{what} is not served by a {} node", self.role))
    }

    pub fn metadata(&self) -> Result<&MetadataStore, Error> {
        self.metadata
            .as_deref()
            .ok_or_else(|| self.unsupported("metadata"))
    }

    pub fn reservations(&self) -> Result<&ReservationStore, Error> {
        self.availability
            .as_deref()
            .map(|engine| engine.store().as_ref())
            .ok_or_else(|| self.unsupported("reservations"))
    }

    pub fn availability(&self) -> Result<&AvailabilityEngine, Error> {
        self.availability
            .as_deref()
            .ok_or_else(|| self.unsupported("availability"))
    }

    pub fn orchestrator(&self) -> Result<&Orchestrator, Error> {
        self.orchestrator
            .as_ref()
            .ok_or_else(|| self.unsupported("cubicle details"))
    }

    /// Overall readiness plus per-dependency detail. Storage nodes are ready
    /// as soon as their stores are open.
    pub fn readiness(&self) -> (bool, Readiness) {
        match &self.orchestrator {
            Some(orch) => {
                let r = orch.readiness();
                (r.ready(), r)
            }
            None => (
                true,
                Readiness {
                    metadata: self.metadata.is_some(),
                    availability: self.availability.is_some(),
                },
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use std::path::PathBuf;

    fn config(role: &str, name: &str) -> Config {
        let dir: PathBuf = std::env::temp_dir().join("cubicle_test_node").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        let dir = dir.to_string_lossy().into_owned();
        Config::from_lookup(|key| match key {
            "CUBICLE_ROLE" => Some(role.to_string()),
            "CUBICLE_DATA_DIR" => Some(dir.clone()),
            _ => None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn metadata_node_hosts_only_metadata() {
        let node = Node::start(&config("metadata", "meta_only"), Arc::new(FixedClock::new(0))).unwrap();
        assert!(node.metadata().is_ok());
        assert!(matches!(node.reservations(), Err(Error::Unsupported(_))));
        assert!(matches!(node.orchestrator(), Err(Error::Unsupported(_))));
        let (ready, detail) = node.readiness();
        assert!(ready);
        assert!(detail.metadata && !detail.availability);
    }

    #[tokio::test]
    async fn all_in_one_node_hosts_everything() {
        let node = Node::start(&config("all", "all_in_one"), Arc::new(FixedClock::new(0))).unwrap();
        assert!(node.metadata().is_ok());
        assert!(node.reservations().is_ok());
        assert!(node.availability().is_ok());
        assert!(node.orchestrator().is_ok());
        assert!(node.readiness().0);
    }
}
