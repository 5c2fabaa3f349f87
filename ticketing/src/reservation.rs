//! Reservations: a user's claim on a set of held seats, awaiting payment.
//!
//! A PENDING reservation with no payment lives as long as its owner's seat
//! locks. Once none of them is live any more,
//! [`ReservationService::expire_abandoned`] cancels it and frees its seats.

use crate::error::{Result, TicketingError};
use crate::metrics;
use crate::payment::PaymentStatus;
use crate::ports::{Conditional, GradeStore, PaymentStore, ReservationStore};
use crate::seat::{SeatLedger, SeatLockManager, SeatTransition};
use crate::sweeper::SweepReport;
use crate::types::{ConcertId, Money, ReservationId, SeatId, UserId};
use box_office_core::environment::Clock;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Status of a reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Seats reserved, payment outstanding
    Pending,
    /// Paid
    Completed,
    /// Given up (by the user, payment failure or payment cancellation)
    Cancelled,
}

/// A reservation state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReservationTransition {
    /// `PENDING → COMPLETED`
    Complete,
    /// `PENDING | COMPLETED → CANCELLED`
    Cancel,
}

impl ReservationTransition {
    /// Statuses the transition may start from.
    #[must_use]
    pub const fn allowed_from(self) -> &'static [ReservationStatus] {
        match self {
            Self::Complete => &[ReservationStatus::Pending],
            Self::Cancel => &[ReservationStatus::Pending, ReservationStatus::Completed],
        }
    }

    /// Status after the transition.
    #[must_use]
    pub const fn target(self) -> ReservationStatus {
        match self {
            Self::Complete => ReservationStatus::Completed,
            Self::Cancel => ReservationStatus::Cancelled,
        }
    }
}

impl ReservationStatus {
    /// Apply a transition.
    ///
    /// # Errors
    ///
    /// [`TicketingError::StateConflict`] if the transition is not legal from `self`.
    pub fn apply(self, transition: ReservationTransition) -> Result<Self> {
        if transition.allowed_from().contains(&self) {
            Ok(transition.target())
        } else {
            Err(TicketingError::StateConflict(format!(
                "reservation is {self}, cannot {transition:?}"
            )))
        }
    }

    /// Stable string form, used for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = TicketingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(TicketingError::Storage(format!("unknown reservation status: {other}"))),
        }
    }
}

/// One reserved seat with the price it was reserved at.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationDetail {
    /// The seat
    pub seat_id: SeatId,
    /// Grade price at reservation time
    pub price: Money,
}

/// A user's reservation of one or more seats of a concert.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation id
    pub id: ReservationId,
    /// Owner
    pub user_id: UserId,
    /// Concert all seats belong to
    pub concert_id: ConcertId,
    /// Reserved seats, in request order
    pub details: Vec<ReservationDetail>,
    /// Sum of the detail prices
    pub total_amount: Money,
    /// Current status
    pub status: ReservationStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    /// Reserved seat ids, in request order.
    pub fn seat_ids(&self) -> impl Iterator<Item = SeatId> + '_ {
        self.details.iter().map(|detail| detail.seat_id)
    }

    /// Whether `user_id` owns the reservation.
    #[must_use]
    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        &self.user_id == user_id
    }
}

/// Creates and cancels reservations over held seats.
#[derive(Clone)]
pub struct ReservationService {
    reservations: Arc<dyn ReservationStore>,
    grades: Arc<dyn GradeStore>,
    payments: Arc<dyn PaymentStore>,
    locks: SeatLockManager,
    clock: Arc<dyn Clock>,
}

impl ReservationService {
    /// Create a reservation service.
    #[must_use]
    pub fn new(
        reservations: Arc<dyn ReservationStore>,
        grades: Arc<dyn GradeStore>,
        payments: Arc<dyn PaymentStore>,
        locks: SeatLockManager,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            reservations,
            grades,
            payments,
            locks,
            clock,
        }
    }

    fn ledger(&self) -> &SeatLedger {
        self.locks.ledger()
    }

    /// Reserve seats the user currently holds.
    ///
    /// Every check runs before the first seat moves. If a `reserve` still loses
    /// a race, the seats already moved go back to SELECTED under the user's
    /// locks and the error is returned.
    ///
    /// # Errors
    ///
    /// - `Validation` for an empty or duplicated seat list, or a seat of another concert
    /// - `OwnershipViolation` if a seat is not locked by the user
    /// - `Expired` if the user's lock on a seat has expired
    /// - `NotFound` for an unknown seat or grade
    /// - `StateConflict` if a seat cannot be reserved
    #[instrument(skip(self, seat_ids), fields(user_id = %user_id, concert_id = %concert_id, seats = seat_ids.len()))]
    pub async fn create(&self, user_id: &UserId, concert_id: ConcertId, seat_ids: &[SeatId]) -> Result<Reservation> {
        if seat_ids.is_empty() {
            return Err(TicketingError::Validation("a reservation needs at least one seat".to_string()));
        }
        let mut seen = HashSet::with_capacity(seat_ids.len());
        if let Some(duplicate) = seat_ids.iter().find(|seat_id| !seen.insert(**seat_id)) {
            return Err(TicketingError::Validation(format!("seat {duplicate} requested twice")));
        }

        let now = self.clock.now();
        let mut details = Vec::with_capacity(seat_ids.len());
        for &seat_id in seat_ids {
            let seat = self.ledger().find(seat_id).await?;
            if seat.concert_id != concert_id {
                return Err(TicketingError::Validation(format!(
                    "seat {seat_id} does not belong to concert {concert_id}"
                )));
            }
            seat.status.apply(SeatTransition::Reserve)?;

            match self.locks.current_lock(seat_id).await? {
                Some(lock) if !lock.is_held_by(user_id) => {
                    return Err(TicketingError::OwnershipViolation(format!(
                        "seat {seat_id} is not held by {user_id}"
                    )));
                }
                Some(lock) if lock.is_expired(now) => {
                    return Err(TicketingError::Expired(format!(
                        "lock on seat {seat_id} expired at {}",
                        lock.expires_at
                    )));
                }
                Some(_) => {}
                None => {
                    return Err(TicketingError::OwnershipViolation(format!(
                        "seat {seat_id} is not locked by {user_id}"
                    )));
                }
            }

            let grade = self
                .grades
                .find_grade(seat.grade_id)
                .await?
                .ok_or_else(|| TicketingError::not_found("grade", seat.grade_id))?;
            details.push(ReservationDetail {
                seat_id,
                price: grade.price,
            });
        }

        let total_amount = Money::checked_sum(details.iter().map(|detail| detail.price))
            .ok_or_else(|| TicketingError::Validation("reservation total overflows".to_string()))?;

        for (reserved, detail) in details.iter().enumerate() {
            if let Err(e) = self.ledger().reserve(detail.seat_id).await {
                self.unreserve(details[..reserved].iter().map(|detail| detail.seat_id)).await;
                return Err(e);
            }
        }

        let reservation = Reservation {
            id: ReservationId::new(),
            user_id: user_id.clone(),
            concert_id,
            details,
            total_amount,
            status: ReservationStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.reservations.insert_reservation(reservation.clone()).await?;

        info!(reservation_id = %reservation.id, total = %reservation.total_amount, "Reservation created");
        metrics::record_reservation_created(reservation.details.len());
        Ok(reservation)
    }

    async fn unreserve(&self, seat_ids: impl Iterator<Item = SeatId>) {
        for seat_id in seat_ids {
            if let Err(e) = self.ledger().unreserve(seat_id).await {
                error!(seat_id = %seat_id, error = %e, "Could not roll back reserved seat");
            }
        }
    }

    /// Find a reservation.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown reservation.
    pub async fn find(&self, reservation_id: ReservationId) -> Result<Reservation> {
        self.reservations
            .find_reservation(reservation_id)
            .await?
            .ok_or_else(|| TicketingError::not_found("reservation", reservation_id))
    }

    /// Find a reservation the user owns.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown reservation, `OwnershipViolation` for someone else's.
    pub async fn find_for_user(&self, user_id: &UserId, reservation_id: ReservationId) -> Result<Reservation> {
        let reservation = self.find(reservation_id).await?;
        if !reservation.is_owned_by(user_id) {
            return Err(TicketingError::OwnershipViolation(format!(
                "reservation {reservation_id} does not belong to {user_id}"
            )));
        }
        Ok(reservation)
    }

    /// The user's reservations, newest first.
    ///
    /// # Errors
    ///
    /// `Storage` on adapter failure.
    pub async fn list_for_user(&self, user_id: &UserId) -> Result<Vec<Reservation>> {
        self.reservations.reservations_of_user(user_id).await
    }

    /// Cancel a PENDING reservation and free its seats.
    ///
    /// Every seat still RESERVED is released, whoever holds its lock.
    ///
    /// # Errors
    ///
    /// - `NotFound` / `OwnershipViolation` as for [`Self::find_for_user`]
    /// - `StateConflict` if the reservation is not PENDING, or a payment for it
    ///   is pending or completed (cancel the payment instead)
    #[instrument(skip(self), fields(user_id = %user_id, reservation_id = %reservation_id))]
    pub async fn cancel(&self, user_id: &UserId, reservation_id: ReservationId) -> Result<Reservation> {
        let reservation = self.find_for_user(user_id, reservation_id).await?;
        if reservation.status != ReservationStatus::Pending {
            return Err(TicketingError::StateConflict(format!(
                "reservation {reservation_id} is {}, only PENDING reservations can be cancelled",
                reservation.status
            )));
        }
        if let Some(payment) = self.payments.find_payment_by_reservation(reservation_id).await? {
            if matches!(payment.status, PaymentStatus::Pending | PaymentStatus::Completed) {
                return Err(TicketingError::StateConflict(format!(
                    "reservation {reservation_id} has a {} payment, cancel the payment instead",
                    payment.status
                )));
            }
        }

        let cancelled = self.close_pending(reservation_id).await?;
        info!("Reservation cancelled");
        metrics::record_reservation_cancelled();
        Ok(cancelled)
    }

    /// Cancel every PENDING reservation that has no payment and whose owner
    /// holds no live lock on any of its seats.
    ///
    /// Failures are counted and logged per reservation; they never abort the sweep.
    ///
    /// # Errors
    ///
    /// `Storage` if the pending reservations cannot be listed.
    pub async fn expire_abandoned(&self) -> Result<SweepReport> {
        let pending = self.reservations.pending_reservations().await?;
        let mut report = SweepReport::default();

        for reservation in pending {
            match self.expire_if_abandoned(&reservation).await {
                Ok(true) => report.released += 1,
                Ok(false) => {}
                Err(TicketingError::StateConflict(reason)) => {
                    debug!(reservation_id = %reservation.id, %reason, "Reservation moved on");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(reservation_id = %reservation.id, error = %e, "Failed to expire reservation");
                    report.failed += 1;
                }
            }
        }

        if !report.is_empty() {
            info!(
                released = report.released,
                skipped = report.skipped,
                failed = report.failed,
                "Abandoned reservations swept"
            );
        }
        metrics::record_reservations_abandoned(report.released);
        Ok(report)
    }

    async fn expire_if_abandoned(&self, reservation: &Reservation) -> Result<bool> {
        if self.payments.find_payment_by_reservation(reservation.id).await?.is_some() {
            return Ok(false);
        }
        for seat_id in reservation.seat_ids() {
            if self.locks.is_locked_by_user(seat_id, &reservation.user_id).await? {
                return Ok(false);
            }
        }
        self.close_pending(reservation.id).await?;
        info!(reservation_id = %reservation.id, user_id = %reservation.user_id, "Abandoned reservation cancelled");
        Ok(true)
    }

    /// `PENDING → CANCELLED`, then release the seats.
    async fn close_pending(&self, reservation_id: ReservationId) -> Result<Reservation> {
        let cancelled = match self
            .reservations
            .transition_reservation(reservation_id, &[ReservationStatus::Pending], ReservationStatus::Cancelled, self.clock.now())
            .await?
        {
            Conditional::Updated(reservation) => reservation,
            Conditional::Conflict(current) => {
                return Err(TicketingError::StateConflict(format!(
                    "reservation {reservation_id} changed concurrently to {}",
                    current.status
                )));
            }
            Conditional::Missing => return Err(TicketingError::not_found("reservation", reservation_id)),
        };

        for seat_id in cancelled.seat_ids() {
            if let Err(e) = self.locks.release_reserved(seat_id).await {
                warn!(seat_id = %seat_id, error = %e, "Failed to release seat of cancelled reservation");
            }
        }
        Ok(cancelled)
    }
}
