use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "bookmyroom_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "bookmyroom_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "bookmyroom_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bookmyroom_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bookmyroom_connections_rejected_total";

/// Counter: rejected logins and session credentials.
pub const AUTH_FAILURES_TOTAL: &str = "bookmyroom_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookmyroom_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookmyroom_wal_flush_batch_size";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings admitted.
pub const BOOKINGS_CONFIRMED_TOTAL: &str = "bookmyroom_bookings_confirmed_total";

/// Counter: booking requests refused because of an overlap.
pub const BOOKING_CONFLICTS_TOTAL: &str = "bookmyroom_booking_conflicts_total";

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
        Command::Register { .. } => "register",
        Command::Login { .. } => "login",
        Command::SetSessionAuthorization { .. } => "set_session_authorization",
        Command::ResetSessionAuthorization => "reset_session_authorization",
        Command::SetUserRole { .. } => "set_user_role",
        Command::InsertRoom { .. } => "insert_room",
        Command::UpdateRoom { .. } => "update_room",
        Command::DeleteRoom { .. } => "delete_room",
        Command::SelectRooms { .. } => "select_rooms",
        Command::InsertBooking { .. } => "insert_booking",
        Command::SelectRoomBookings { .. } => "select_room_bookings",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectMyBookings => "select_my_bookings",
        Command::UpdateBookingStatus { .. } => "update_booking_status",
        Command::CancelBooking { .. } => "cancel_booking",
    }
}
