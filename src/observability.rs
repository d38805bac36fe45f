use std::io;
use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "coworkd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "coworkd_query_duration_seconds";

/// Counter: booking attempts rejected because the slot was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "coworkd_booking_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "coworkd_connections_active";
pub const CONNECTIONS_TOTAL: &str = "coworkd_connections_total";
pub const CONNECTIONS_REJECTED_TOTAL: &str = "coworkd_connections_rejected_total";

/// Gauge: spaces with a loaded engine.
pub const SPACES_ACTIVE: &str = "coworkd_spaces_active";

/// Counter: startup failures (bad password, unknown user name).
pub const AUTH_FAILURES_TOTAL: &str = "coworkd_auth_failures_total";

pub const WAL_FLUSH_DURATION_SECONDS: &str = "coworkd_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "coworkd_wal_flush_batch_size";

/// Counter: completed compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "coworkd_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op without a port.
pub fn init(port: Option<u16>) -> io::Result<()> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(io::Error::other)?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertResource { .. } => "insert_resource",
        Command::UpdateResource { .. } => "update_resource",
        Command::SelectResources => "select_resources",
        Command::InsertMember { .. } => "insert_member",
        Command::UpdateMember { .. } => "update_member",
        Command::SelectMembers => "select_members",
        Command::InsertBooking(_) => "insert_booking",
        Command::BatchInsertBookings(_) => "batch_insert_bookings",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::RescheduleBooking { .. } => "reschedule_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectFirstAvailable { .. } => "select_first_available",
        Command::SelectFreeBusy { .. } => "select_free_busy",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectUpcoming { .. } => "select_upcoming",
        Command::SelectOccupancy { .. } => "select_occupancy",
        Command::SelectInUse => "select_in_use",
    }
}
