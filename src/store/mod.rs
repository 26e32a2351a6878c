mod conflict;
pub mod metadata;
pub mod reservations;
#[cfg(test)]
mod tests;

pub use conflict::{validate_id, validate_span};
pub use metadata::MetadataStore;
pub use reservations::ReservationStore;

use std::future::Future;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::error::{Dependency, Error};
use crate::model::Event;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

/// Background task that owns the WAL and batches appends for group commit:
/// take the first append, drain whatever else is already queued, then one
/// fsync for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>, store: &'static str) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch: Pending = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE, "store" => store)
            .record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS, "store" => store)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("{store} WAL flush failed: {e}");
        }
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        // Non-append commands run after the batch queued ahead of them.
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &Pending) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so partial bytes don't leak into the
    // next batch; every caller in this batch is told it failed.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Cloneable handle to a store's background WAL writer.
#[derive(Clone)]
pub struct WalHandle {
    tx: mpsc::Sender<WalCommand>,
}

impl WalHandle {
    /// Recover the log at `path`, then start its writer task.
    pub fn open(path: &Path, store: &'static str) -> io::Result<(Self, Vec<Event>)> {
        let (wal, events) = Wal::recover(path)?;
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, rx, store));
        Ok((Self { tx }, events))
    }

    pub async fn append(&self, event: &Event) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| Error::StorageUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| Error::StorageUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| Error::StorageUnavailable(format!("WAL append: {e}")))
    }

    pub async fn compact(&self, events: Vec<Event>) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| Error::StorageUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| Error::StorageUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| Error::StorageUnavailable(format!("WAL compaction: {e}")))
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Run a storage step under the caller's deadline.
pub(crate) async fn within<F: Future>(deadline: Instant, fut: F) -> Result<F::Output, Error> {
    tokio::time::timeout_at(deadline, fut)
        .await
        .map_err(|_| Error::DependencyTimeout {
            which: Dependency::Storage,
        })
}

/// A store whose WAL can be rewritten from its live state.
#[async_trait]
pub trait Compactable: Send + Sync {
    fn store_name(&self) -> &'static str;

    async fn wal_appends_since_compact(&self) -> u64;

    async fn compact_wal(&self) -> Result<(), Error>;
}
