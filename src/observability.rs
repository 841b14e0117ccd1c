use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "roomkeeper_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "roomkeeper_query_duration_seconds";

// ── Admission outcomes ──────────────────────────────────────────

/// Counter: reservations admitted. Labels: op (create, update).
pub const ADMISSIONS_TOTAL: &str = "roomkeeper_admissions_total";

/// Counter: reservations cancelled because a higher priority request took their slot.
pub const PREEMPTIONS_TOTAL: &str = "roomkeeper_preemptions_total";

/// Counter: admission requests turned down. Labels: kind.
pub const REJECTIONS_TOTAL: &str = "roomkeeper_rejections_total";

/// Counter: explicit cancellations.
pub const CANCELLATIONS_TOTAL: &str = "roomkeeper_cancellations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "roomkeeper_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "roomkeeper_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "roomkeeper_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "roomkeeper_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "roomkeeper_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "roomkeeper_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
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
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::SelectRooms { .. } => "select_rooms",
        Command::InsertOperatingHour { .. } => "insert_operating_hour",
        Command::UpdateOperatingHour { .. } => "update_operating_hour",
        Command::DeleteOperatingHour { .. } => "delete_operating_hour",
        Command::SelectOperatingHours { .. } => "select_operating_hours",
        Command::InsertException { .. } => "insert_exception",
        Command::UpdateException { .. } => "update_exception",
        Command::DeleteException { .. } => "delete_exception",
        Command::SelectExceptions { .. } => "select_exceptions",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::UpdateReservation { .. } => "update_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::SelectReservations { .. } => "select_reservations",
        Command::SelectEffectiveHours { .. } => "select_effective_hours",
    }
}
