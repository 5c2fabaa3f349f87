//! Business metrics for the box office.
//!
//! Recorded through the `metrics` facade; whichever recorder the host process
//! installs (Prometheus, StatsD, none) receives them.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `box_office_seat_locks_total{outcome}` - Lock attempts by outcome (acquired, rejected)
//! - `box_office_seat_locks_reaped_total` - Expired locks released by the reaper
//! - `box_office_queue_entries_total{status}` - Queue transitions (registered, admitted, entered, expired, cancelled)
//! - `box_office_reservations_total{status}` - Reservations by status (created, cancelled)
//! - `box_office_payments_total{status}` - Payments by status (requested, succeeded, failed, cancelled)
//! - `box_office_payment_attempts_total{outcome}` - Gateway attempts by outcome
//! - `box_office_payment_revenue_cents_total` - Revenue from successful payments
//!
//! ## Histograms
//! - `box_office_payment_attempts` - Attempts needed per terminal payment

use metrics::{describe_counter, describe_histogram};

/// Register metric descriptions.
///
/// Call once at startup, after installing a recorder.
pub fn register_business_metrics() {
    describe_counter!(
        "box_office_seat_locks_total",
        "Seat lock attempts by outcome (acquired, rejected)"
    );
    describe_counter!(
        "box_office_seat_locks_reaped_total",
        "Expired seat locks released by the reaper"
    );
    describe_counter!(
        "box_office_queue_entries_total",
        "Waiting-queue transitions by resulting status"
    );
    describe_counter!(
        "box_office_reservations_total",
        "Reservations by status (created, cancelled, abandoned)"
    );
    describe_counter!(
        "box_office_payments_total",
        "Payments by status (requested, succeeded, failed, cancelled)"
    );
    describe_counter!(
        "box_office_payment_attempts_total",
        "Payment gateway attempts by outcome"
    );
    describe_counter!(
        "box_office_payment_revenue_cents_total",
        "Revenue from successful payments in minor units"
    );
    describe_histogram!(
        "box_office_payment_attempts",
        "Gateway attempts needed to reach a terminal payment state"
    );

    tracing::info!("Business metrics registered");
}

// ============================================================================
// Metric Recording Functions
// ============================================================================

/// A seat lock was granted.
pub fn record_seat_locked() {
    metrics::counter!("box_office_seat_locks_total", "outcome" => "acquired").increment(1);
}

/// A seat lock was refused because another user holds the seat.
pub fn record_seat_lock_rejected() {
    metrics::counter!("box_office_seat_locks_total", "outcome" => "rejected").increment(1);
}

/// The reaper released `count` expired locks.
pub fn record_locks_reaped(count: u64) {
    if count > 0 {
        metrics::counter!("box_office_seat_locks_reaped_total").increment(count);
    }
}

/// Queue entries moved to `status` ("registered", "admitted", ...).
pub fn record_queue_transition(status: &'static str, count: u64) {
    if count > 0 {
        metrics::counter!("box_office_queue_entries_total", "status" => status).increment(count);
    }
}

/// A reservation was created.
pub fn record_reservation_created(seats: usize) {
    metrics::counter!("box_office_reservations_total", "status" => "created").increment(1);
    tracing::debug!(seats, "Recorded reservation_created metric");
}

/// A reservation was cancelled.
pub fn record_reservation_cancelled() {
    metrics::counter!("box_office_reservations_total", "status" => "cancelled").increment(1);
}

/// The reaper cancelled `count` abandoned reservations.
pub fn record_reservations_abandoned(count: u64) {
    if count > 0 {
        metrics::counter!("box_office_reservations_total", "status" => "abandoned").increment(count);
    }
}

/// A payment was requested.
pub fn record_payment_requested() {
    metrics::counter!("box_office_payments_total", "status" => "requested").increment(1);
}

/// One gateway attempt finished with `outcome` ("completed", "failed", "gateway_error", ...).
pub fn record_payment_attempt(outcome: &'static str) {
    metrics::counter!("box_office_payment_attempts_total", "outcome" => outcome).increment(1);
}

/// A payment completed.
pub fn record_payment_succeeded(amount_cents: u64, attempts: u32) {
    metrics::counter!("box_office_payments_total", "status" => "succeeded").increment(1);
    metrics::counter!("box_office_payment_revenue_cents_total").increment(amount_cents);
    metrics::histogram!("box_office_payment_attempts").record(f64::from(attempts));
    tracing::debug!(amount_cents, attempts, "Recorded payment_succeeded metric");
}

/// A payment failed for good.
pub fn record_payment_failed(attempts: u32) {
    metrics::counter!("box_office_payments_total", "status" => "failed").increment(1);
    metrics::histogram!("box_office_payment_attempts").record(f64::from(attempts));
}

/// A payment was cancelled.
pub fn record_payment_cancelled() {
    metrics::counter!("box_office_payments_total", "status" => "cancelled").increment(1);
}
