use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "curbside_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "curbside_query_duration_seconds";

/// Counter: engine operations refused or failed. Labels: op, reason.
pub const ENGINE_REJECTIONS_TOTAL: &str = "curbside_engine_rejections_total";

// ── Booking activity ────────────────────────────────────────────

/// Counter: reservations committed.
pub const RESERVATIONS_COMMITTED_TOTAL: &str = "curbside_reservations_committed_total";

/// Counter: reservations moved to another slot.
pub const RESERVATIONS_MOVED_TOTAL: &str = "curbside_reservations_moved_total";

/// Counter: reservations cancelled. Labels: by (cancel, admin_cancel).
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "curbside_reservations_cancelled_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "curbside_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "curbside_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "curbside_connections_rejected_total";

/// Counter: sessions whose login user is not a valid caller id.
pub const AUTH_FAILURES_TOTAL: &str = "curbside_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "curbside_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "curbside_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "curbside_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if `port` is None.
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
        Command::InsertResourceDay { .. } => "insert_resource_day",
        Command::UpdateResourceDay { .. } => "update_resource_day",
        Command::SelectResourceDays { .. } => "select_resource_days",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectUpcoming => "select_upcoming",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
