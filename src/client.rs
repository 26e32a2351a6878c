use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_postgres::{NoTls, SimpleQueryMessage, SimpleQueryRow};
use tracing::{info, warn};

use crate::config::RemoteAddr;
use crate::error::{Dependency, Error};
use crate::model::*;
use crate::orchestrator::{AvailabilitySource, MetadataSource};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection state of a link to another node. Requests go out only in
/// `Ready`.
#[derive(Clone)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Ready(Arc<tokio_postgres::Client>),
}

impl LinkState {
    pub fn label(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Ready(_) => "ready",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            LinkState::Disconnected => 0.0,
            LinkState::Connecting => 1.0,
            LinkState::Ready(_) => 2.0,
        }
    }
}

pub fn link_config(addr: &RemoteAddr, password: &str) -> tokio_postgres::Config {
    let mut config = tokio_postgres::Config::new();
    config
        .host(&addr.host)
        .port(addr.port)
        .user("cubicle")
        .password(password)
        .dbname("cubicle")
        .connect_timeout(CONNECT_TIMEOUT);
    config
}

/// A supervised connection to one remote node. A background task keeps it
/// connected, reconnecting with exponential backoff; the task stops when the
/// link is dropped.
pub struct RemoteLink {
    which: Dependency,
    state: watch::Receiver<LinkState>,
}

impl RemoteLink {
    pub fn spawn(which: Dependency, config: tokio_postgres::Config) -> Self {
        let (tx, rx) = watch::channel(LinkState::Disconnected);
        tokio::spawn(supervise(which, config, tx));
        Self { which, state: rx }
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state.borrow(), LinkState::Ready(_))
    }

    /// Wait until the link is up or `deadline` passes.
    pub async fn wait_ready(&self, deadline: Instant) -> bool {
        let mut rx = self.state.clone();
        tokio::time::timeout_at(
            deadline,
            rx.wait_for(|s| matches!(s, LinkState::Ready(_))),
        )
        .await
        .is_ok_and(|r| r.is_ok())
    }

    async fn query(&self, sql: &str, deadline: Instant) -> Result<Vec<SimpleQueryRow>, Error> {
        let client = match &*self.state.borrow() {
            LinkState::Ready(client) => client.clone(),
            other => {
                return Err(Error::NotReady(format!(
                    "{} link {}",
                    self.which,
                    other.label()
                )));
            }
        };
        let messages = tokio::time::timeout_at(deadline, client.simple_query(sql))
            .await
            .map_err(|_| Error::DependencyTimeout { which: self.which })?
            .map_err(|e| remote_error(self.which, e))?;
        Ok(messages
            .into_iter()
            .filter_map(|m| match m {
                SimpleQueryMessage::Row(row) => Some(row),
                _ => None,
            })
            .collect())
    }
}

async fn supervise(
    which: Dependency,
    config: tokio_postgres::Config,
    tx: watch::Sender<LinkState>,
) {
    let set = |state: LinkState| {
        metrics::gauge!(crate::observability::LINK_STATE, "dependency" => which.as_str())
            .set(state.gauge_value());
        tx.send_replace(state);
    };
    let mut backoff = INITIAL_BACKOFF;
    loop {
        set(LinkState::Connecting);
        match config.connect(NoTls).await {
            Ok((client, connection)) => {
                info!("{which} link ready");
                backoff = INITIAL_BACKOFF;
                set(LinkState::Ready(Arc::new(client)));
                tokio::select! {
                    result = connection => match result {
                        Ok(()) => warn!("{which} link closed by peer"),
                        Err(e) => warn!("{which} link lost: {e}"),
                    },
                    _ = tx.closed() => return,
                }
            }
            Err(e) => warn!("{which} link connect failed: {e}; retrying in {backoff:?}"),
        }
        set(LinkState::Disconnected);

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = tx.closed() => return,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Re-materialize an error sent by the remote node, keeping its kind.
fn remote_error(which: Dependency, e: tokio_postgres::Error) -> Error {
    match e.as_db_error() {
        Some(db) => Error::from_sqlstate(db.code().code(), db.message(), which),
        None => Error::StorageUnavailable(format!("{which} link: {e}")),
    }
}

/// Quote a string literal for the SQL surface.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn column<'a>(row: &'a SimpleQueryRow, name: &str) -> Result<Option<&'a str>, Error> {
    row.try_get(name)
        .map_err(|e| Error::StorageUnavailable(format!("malformed row, column {name}: {e}")))
}

fn required<'a>(row: &'a SimpleQueryRow, name: &str) -> Result<&'a str, Error> {
    column(row, name)?
        .ok_or_else(|| Error::StorageUnavailable(format!("malformed row: {name} is NULL")))
}

fn parse_num<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T, Error> {
    raw.parse()
        .map_err(|_| Error::StorageUnavailable(format!("malformed row: {name} = {raw:?}")))
}

fn parse_metadata(row: &SimpleQueryRow) -> Result<ResourceMetadata, Error> {
    Ok(ResourceMetadata {
        id: required(row, "id")?.to_string(),
        name: required(row, "name")?.to_string(),
        location: required(row, "location")?.to_string(),
        capacity: parse_num("capacity", required(row, "capacity")?)?,
    })
}

fn parse_availability(
    row: &SimpleQueryRow,
    resource_id: &str,
    as_of: Ms,
) -> Result<AvailabilityResult, Error> {
    let available_now = match required(row, "available_now")? {
        "t" | "true" => true,
        "f" | "false" => false,
        other => {
            return Err(Error::StorageUnavailable(format!(
                "malformed row: available_now = {other:?}"
            )));
        }
    };
    let next_available = column(row, "next_available")?
        .map(|raw| parse_num("next_available", raw))
        .transpose()?;
    let integrity_violation = column(row, "integrity_violation")?.map(|ids| IntegrityViolation {
        resource_id: resource_id.to_string(),
        at: as_of,
        record_ids: ids.split(',').map(str::to_string).collect(),
    });
    Ok(AvailabilityResult {
        available_now,
        next_available,
        integrity_violation,
    })
}

/// Metadata served by a remote metadata node.
pub struct RemoteMetadata(pub RemoteLink);

#[async_trait]
impl MetadataSource for RemoteMetadata {
    fn is_ready(&self) -> bool {
        self.0.is_ready()
    }

    async fn metadata(
        &self,
        resource_id: &str,
        deadline: Instant,
    ) -> Result<ResourceMetadata, Error> {
        let sql = format!("SELECT * FROM metadata WHERE id = {}", quote(resource_id));
        let rows = self.0.query(&sql, deadline).await?;
        match rows.first() {
            Some(row) => parse_metadata(row),
            None => Err(Error::NotFound(format!("resource {resource_id}"))),
        }
    }
}

/// Availability served by a remote reservation node.
pub struct RemoteAvailability(pub RemoteLink);

#[async_trait]
impl AvailabilitySource for RemoteAvailability {
    fn is_ready(&self) -> bool {
        self.0.is_ready()
    }

    async fn availability(
        &self,
        resource_id: &str,
        as_of: Ms,
        deadline: Instant,
    ) -> Result<AvailabilityResult, Error> {
        let sql = format!(
            "SELECT * FROM availability WHERE resource_id = {} AND as_of = {as_of}",
            quote(resource_id)
        );
        let rows = self.0.query(&sql, deadline).await?;
        let row = rows
            .first()
            .ok_or_else(|| Error::StorageUnavailable("availability: empty result".into()))?;
        parse_availability(row, resource_id, as_of)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_escapes_single_quotes() {
        assert_eq!(quote("C-1"), "'C-1'");
        assert_eq!(quote("o'neil"), "'o''neil'");
    }

    #[tokio::test]
    async fn unreachable_node_is_not_ready() {
        // Grab a free port, then close it so nothing listens there.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let addr = RemoteAddr {
            host: "127.0.0.1".into(),
            port,
        };
        let link = RemoteLink::spawn(Dependency::Availability, link_config(&addr, "cubicle"));
        assert!(!link.is_ready());
        assert!(!link.wait_ready(Instant::now() + Duration::from_millis(200)).await);

        let remote = RemoteAvailability(link);
        let err = remote
            .availability("C-1", 0, Instant::now() + Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotReady(_)));
        assert!(err.is_retryable());
    }
}
