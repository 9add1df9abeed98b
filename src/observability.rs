use std::net::SocketAddr;

use crate::model::Event;
use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "innkeep_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "innkeep_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "innkeep_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "innkeep_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "innkeep_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "innkeep_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "innkeep_wal_flush_batch_size";

/// Counter: WAL rewrites. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "innkeep_wal_compactions_total";

// ── Domain ─────────────────────────────────────────────────────

/// Counter: events durably committed. Labels: kind.
pub const EVENTS_COMMITTED_TOTAL: &str = "innkeep_events_committed_total";

/// Counter: writes refused because of an overlap. Labels: kind.
pub const CONFLICTS_REJECTED_TOTAL: &str = "innkeep_conflicts_rejected_total";

/// Counter: rows removed by cascading deletes. Labels: kind.
pub const CASCADE_DELETIONS_TOTAL: &str = "innkeep_cascade_deletions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus metrics exporter: {e}"),
    }
}

pub fn event_label(event: &Event) -> &'static str {
    match event {
        Event::PeriodCreated { .. } => "period_created",
        Event::PeriodUpdated { .. } => "period_updated",
        Event::PeriodDeleted { .. } => "period_deleted",
        Event::ReservationCreated { .. } => "reservation_created",
        Event::ReservationDeleted { .. } => "reservation_deleted",
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertPeriod { .. } => "insert_period",
        Command::UpdatePeriod { .. } => "update_period",
        Command::DeletePeriod { .. } => "delete_period",
        Command::DeleteAccommodationPeriods { .. } => "delete_accommodation_periods",
        Command::InsertReservation { .. } => "insert_reservation",
        Command::DeleteReservation { .. } => "delete_reservation",
        Command::DeleteUserReservations { .. } => "delete_user_reservations",
        Command::SelectPeriods { .. } => "select_periods",
        Command::SelectPeriodById { .. } => "select_period_by_id",
        Command::SelectReservationsByPeriod { .. } => "select_reservations_by_period",
        Command::SelectReservationsByUser { .. } => "select_reservations_by_user",
        Command::SelectAvailableAccommodations { .. } => "select_available_accommodations",
    }
}
