use std::net::SocketAddr;

// ── Slot lifecycle ──────────────────────────────────────────────

/// Counter: holds successfully placed.
pub const HOLDS_PLACED_TOTAL: &str = "bookable_holds_placed_total";

/// Counter: hold attempts that lost to an existing live hold or booking.
pub const HOLD_CONFLICTS_TOTAL: &str = "bookable_hold_conflicts_total";

/// Counter: expired holds released by the reaper.
pub const HOLDS_REAPED_TOTAL: &str = "bookable_holds_reaped_total";

/// Counter: slots created by the materializer.
pub const SLOTS_MATERIALIZED_TOTAL: &str = "bookable_slots_materialized_total";

/// Counter: stale open slots tombstoned during reconciliation.
pub const SLOTS_TOMBSTONED_TOTAL: &str = "bookable_slots_tombstoned_total";

// ── Booking lifecycle ───────────────────────────────────────────

/// Counter: bookings confirmed.
pub const BOOKINGS_CONFIRMED_TOTAL: &str = "bookable_bookings_confirmed_total";

/// Counter: bookings canceled. Labels: refunded.
pub const BOOKINGS_CANCELED_TOTAL: &str = "bookable_bookings_canceled_total";

/// Counter: bookings swept into Completed after their end time.
pub const BOOKINGS_COMPLETED_TOTAL: &str = "bookable_bookings_completed_total";

/// Counter: payment compensations issued after a failed confirm.
pub const PAYMENT_COMPENSATIONS_TOTAL: &str = "bookable_payment_compensations_total";

/// Counter: compensations that themselves failed. Each one is a manual
/// reconciliation case.
pub const PAYMENT_COMPENSATION_FAILURES_TOTAL: &str =
    "bookable_payment_compensation_failures_total";

// ── External capabilities ───────────────────────────────────────

/// Counter: calendar calls that failed (always non-fatal).
pub const CALENDAR_FAILURES_TOTAL: &str = "bookable_calendar_failures_total";

/// Counter: per-tutor busy-sync passes that failed.
pub const BUSY_SYNC_FAILURES_TOTAL: &str = "bookable_busy_sync_failures_total";

/// Counter: notifications that could not be delivered (always non-fatal).
pub const NOTIFY_FAILURES_TOTAL: &str = "bookable_notify_failures_total";

// ── Durability ──────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bookable_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bookable_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
