use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "cubicle_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "cubicle_query_duration_seconds";

/// Counter: failed orchestrator sub-calls. Labels: dependency, kind.
pub const DEPENDENCY_FAILURES_TOTAL: &str = "cubicle_dependency_failures_total";

/// Counter: overlapping confirmed records found while answering availability.
pub const INTEGRITY_VIOLATIONS_TOTAL: &str = "cubicle_integrity_violations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "cubicle_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "cubicle_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "cubicle_connections_rejected_total";

/// Gauge: remote link state (0 disconnected, 1 connecting, 2 ready). Labels: dependency.
pub const LINK_STATE: &str = "cubicle_link_state";

/// Counter: cancelled reservations purged after retention.
pub const RESERVATIONS_PURGED_TOTAL: &str = "cubicle_reservations_purged_total";

/// Histogram: WAL group-commit flush duration in seconds. Labels: store.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "cubicle_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush). Labels: store.
pub const WAL_FLUSH_BATCH_SIZE: &str = "cubicle_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertMetadata { .. } => "create_metadata",
        Command::SelectMetadata { id: Some(_) } => "get_metadata",
        Command::SelectMetadata { id: None } => "list_metadata",
        Command::InsertReservation { .. } => "create_reservation",
        Command::DeleteReservation { .. } => "cancel_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectAvailability { .. } => "check_availability",
        Command::SelectCubicle { .. } => "get_cubicle_details",
        Command::SelectReadiness => "readiness",
    }
}
