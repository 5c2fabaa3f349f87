//! Storage ports.
//!
//! Every state change goes through a single conditional write
//! (`UPDATE ... WHERE status = ANY(expected)`), never a read followed by a
//! save. Adapters live in [`crate::persistence`].

use crate::error::Result;
use crate::payment::{Payment, PaymentStatus};
use crate::queue::{QueueStatus, WaitingQueueEntry};
use crate::reservation::{Reservation, ReservationStatus};
use crate::seat::{Grade, Seat, SeatLock, SeatStatus};
use crate::types::{
    ConcertId, GradeId, LockId, PaymentId, QueueEntryId, ReservationId, SeatId, UserId,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Outcome of a conditional update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conditional<T> {
    /// The precondition held and the entity was written; carries the new state
    Updated(T),
    /// The precondition did not hold; carries the current state, unchanged
    Conflict(T),
    /// No such entity
    Missing,
}

impl<T> Conditional<T> {
    /// Whether the write was applied.
    #[must_use]
    pub const fn is_updated(&self) -> bool {
        matches!(self, Self::Updated(_))
    }
}

/// Outcome of [`SeatLockStore::acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAcquisition {
    /// The candidate lock was stored
    Acquired {
        /// The stored lock
        lock: SeatLock,
        /// An expired lock that was removed to make room
        replaced: Option<SeatLock>,
    },
    /// The same user already holds an unexpired lock (left untouched)
    AlreadyHeld(SeatLock),
    /// Another user holds an unexpired lock
    HeldByOther(SeatLock),
}

/// Seat command and query port.
#[async_trait]
pub trait SeatStore: Send + Sync {
    /// Insert or replace a seat (inventory setup).
    async fn insert_seat(&self, seat: Seat) -> Result<()>;

    /// Find a seat.
    async fn find_seat(&self, seat_id: SeatId) -> Result<Option<Seat>>;

    /// Set the status to `next` only if the current status is one of `expected`.
    async fn compare_and_set_seat(
        &self,
        seat_id: SeatId,
        expected: &[SeatStatus],
        next: SeatStatus,
    ) -> Result<Conditional<Seat>>;

    /// Seats of a concert, ordered by label.
    async fn seats_of_concert(&self, concert_id: ConcertId) -> Result<Vec<Seat>>;

    /// Seats of a grade, ordered by label.
    async fn seats_of_grade(&self, grade_id: GradeId) -> Result<Vec<Seat>>;

    /// Seats of a concert in the given status, ordered by label.
    async fn seats_by_status(&self, concert_id: ConcertId, status: SeatStatus) -> Result<Vec<Seat>>;
}

/// Grade (price tier) port.
#[async_trait]
pub trait GradeStore: Send + Sync {
    /// Insert or replace a grade.
    async fn insert_grade(&self, grade: Grade) -> Result<()>;

    /// Find a grade.
    async fn find_grade(&self, grade_id: GradeId) -> Result<Option<Grade>>;
}

/// Seat lock port. At most one lock row exists per seat.
#[async_trait]
pub trait SeatLockStore: Send + Sync {
    /// Atomically store `candidate` unless an unexpired lock exists at `now`.
    ///
    /// An expired lock (of any user) is replaced. An unexpired lock of the
    /// candidate's user is returned as [`LockAcquisition::AlreadyHeld`] without
    /// touching its expiry.
    async fn acquire(&self, candidate: SeatLock, now: DateTime<Utc>) -> Result<LockAcquisition>;

    /// Current lock row of a seat, expired or not.
    async fn find_lock(&self, seat_id: SeatId) -> Result<Option<SeatLock>>;

    /// Set a new expiry, only if the seat is still locked by `lock_id`.
    async fn update_expiry(
        &self,
        seat_id: SeatId,
        lock_id: LockId,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<SeatLock>>;

    /// Delete the seat's lock only if it is still `lock_id`. Returns whether a row was deleted.
    async fn delete_lock_if(&self, seat_id: SeatId, lock_id: LockId) -> Result<bool>;

    /// Locks with `expires_at <= now`.
    async fn expired_locks(&self, now: DateTime<Utc>) -> Result<Vec<SeatLock>>;
}

/// Waiting-queue port.
#[async_trait]
pub trait WaitingQueueStore: Send + Sync {
    /// Issue the concert's next position and insert a WAITING entry.
    ///
    /// Position issuance is serialized per concert. Fails with
    /// `AlreadyRegistered` if the user has an active entry for the concert.
    async fn register_next(
        &self,
        concert_id: ConcertId,
        user_id: &UserId,
        now: DateTime<Utc>,
    ) -> Result<WaitingQueueEntry>;

    /// Find an entry.
    async fn find_entry(&self, entry_id: QueueEntryId) -> Result<Option<WaitingQueueEntry>>;

    /// The user's active (WAITING, ADMITTED or ENTERED) entry for a concert.
    async fn find_active_entry(
        &self,
        concert_id: ConcertId,
        user_id: &UserId,
    ) -> Result<Option<WaitingQueueEntry>>;

    /// Move the entry to `next` only if its status is one of `expected`.
    ///
    /// Stamps `admitted_at` / `entered_at` when moving to ADMITTED / ENTERED.
    async fn transition_entry(
        &self,
        entry_id: QueueEntryId,
        expected: &[QueueStatus],
        next: QueueStatus,
        now: DateTime<Utc>,
    ) -> Result<Conditional<WaitingQueueEntry>>;

    /// Up to `limit` WAITING entries with the lowest positions.
    async fn lowest_waiting(&self, concert_id: ConcertId, limit: usize) -> Result<Vec<WaitingQueueEntry>>;

    /// Number of WAITING entries with a position strictly below `position`.
    async fn count_waiting_before(&self, concert_id: ConcertId, position: u64) -> Result<u64>;

    /// ADMITTED entries (all concerts) admitted at or before `cutoff`.
    async fn admitted_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<WaitingQueueEntry>>;
}

/// Reservation port.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Insert a new reservation with its details.
    async fn insert_reservation(&self, reservation: Reservation) -> Result<()>;

    /// Find a reservation.
    async fn find_reservation(&self, reservation_id: ReservationId) -> Result<Option<Reservation>>;

    /// Reservations of a user, newest first.
    async fn reservations_of_user(&self, user_id: &UserId) -> Result<Vec<Reservation>>;

    /// Every PENDING reservation, oldest first.
    async fn pending_reservations(&self) -> Result<Vec<Reservation>>;

    /// Move the reservation to `next` only if its status is one of `expected`.
    async fn transition_reservation(
        &self,
        reservation_id: ReservationId,
        expected: &[ReservationStatus],
        next: ReservationStatus,
        now: DateTime<Utc>,
    ) -> Result<Conditional<Reservation>>;
}

/// Payment port. At most one payment exists per reservation.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    /// Insert a new payment. Fails with `StateConflict` if the reservation already has one.
    async fn insert_payment(&self, payment: Payment) -> Result<()>;

    /// Find a payment.
    async fn find_payment(&self, payment_id: PaymentId) -> Result<Option<Payment>>;

    /// The payment of a reservation.
    async fn find_payment_by_reservation(&self, reservation_id: ReservationId) -> Result<Option<Payment>>;

    /// The payment currently bound to a gateway payment id.
    async fn find_payment_by_gateway_id(&self, gateway_payment_id: &str) -> Result<Option<Payment>>;

    /// All PENDING payments.
    async fn pending_payments(&self) -> Result<Vec<Payment>>;

    /// Record a new gateway attempt, only while the payment is PENDING.
    ///
    /// `gateway_payment_id` replaces the stored one; `None` (the gateway
    /// refused the request) clears it.
    async fn record_attempt(
        &self,
        payment_id: PaymentId,
        gateway_payment_id: Option<&str>,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Result<Conditional<Payment>>;

    /// Move the payment to `next` only if its status is one of `expected`.
    async fn transition_payment(
        &self,
        payment_id: PaymentId,
        expected: &[PaymentStatus],
        next: PaymentStatus,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Conditional<Payment>>;
}
