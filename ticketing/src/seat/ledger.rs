//! The seat ledger: the single place double-booking is prevented.

use crate::error::{Result, TicketingError};
use crate::ports::{Conditional, SeatStore};
use crate::seat::{Seat, SeatStatus, SeatTransition};
use crate::types::{ConcertId, GradeId, SeatId, UserId};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Authoritative seat state machine.
///
/// Every transition is one compare-and-set on the [`SeatStore`]; the status
/// read and the write are never split across two calls.
#[derive(Clone)]
pub struct SeatLedger {
    seats: Arc<dyn SeatStore>,
}

impl SeatLedger {
    /// Create a ledger over a seat store.
    #[must_use]
    pub fn new(seats: Arc<dyn SeatStore>) -> Self {
        Self { seats }
    }

    /// `AVAILABLE → SELECTED`.
    ///
    /// `user_id` is only recorded in logs; the hold itself is the lock manager's job.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown seat, `StateConflict` if the seat is not AVAILABLE.
    #[instrument(skip(self), fields(seat_id = %seat_id, user_id = %user_id))]
    pub async fn select(&self, seat_id: SeatId, user_id: &UserId) -> Result<Seat> {
        self.transition(seat_id, SeatTransition::Select).await
    }

    /// `SELECTED | AVAILABLE → RESERVED`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown seat, `StateConflict` otherwise.
    #[instrument(skip(self), fields(seat_id = %seat_id))]
    pub async fn reserve(&self, seat_id: SeatId) -> Result<Seat> {
        self.transition(seat_id, SeatTransition::Reserve).await
    }

    /// `RESERVED → SOLD`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown seat, `StateConflict` otherwise.
    #[instrument(skip(self), fields(seat_id = %seat_id))]
    pub async fn sell(&self, seat_id: SeatId) -> Result<Seat> {
        self.transition(seat_id, SeatTransition::Sell).await
    }

    /// Anything but `SOLD` → `AVAILABLE`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown seat, `StateConflict` for a SOLD seat.
    #[instrument(skip(self), fields(seat_id = %seat_id))]
    pub async fn reset(&self, seat_id: SeatId) -> Result<Seat> {
        self.transition(seat_id, SeatTransition::Reset).await
    }

    /// `RESERVED → SELECTED`, for a reserve whose reservation was never created.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown seat, `StateConflict` unless the seat is RESERVED.
    #[instrument(skip(self), fields(seat_id = %seat_id))]
    pub async fn unreserve(&self, seat_id: SeatId) -> Result<Seat> {
        self.transition(seat_id, SeatTransition::Unreserve).await
    }

    /// `expected → AVAILABLE`, only while the seat is still in `expected`.
    ///
    /// Returns `false` when the seat has moved on. A SOLD seat is never reset.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown seat, `StateConflict` when `expected` is SOLD.
    #[instrument(skip(self), fields(seat_id = %seat_id, expected = %expected))]
    pub async fn reset_if(&self, seat_id: SeatId, expected: SeatStatus) -> Result<bool> {
        if expected == SeatStatus::Sold {
            return Err(TicketingError::StateConflict(format!("seat {seat_id} is sold for good")));
        }
        match self
            .seats
            .compare_and_set_seat(seat_id, &[expected], SeatStatus::Available)
            .await?
        {
            Conditional::Updated(_) => {
                debug!("Seat reset");
                Ok(true)
            }
            Conditional::Conflict(seat) => {
                debug!(status = %seat.status, "Seat moved on, left as is");
                Ok(false)
            }
            Conditional::Missing => Err(TicketingError::not_found("seat", seat_id)),
        }
    }

    async fn transition(&self, seat_id: SeatId, transition: SeatTransition) -> Result<Seat> {
        match self
            .seats
            .compare_and_set_seat(seat_id, transition.allowed_from(), transition.target())
            .await?
        {
            Conditional::Updated(seat) => {
                debug!(status = %seat.status, "Seat transitioned");
                Ok(seat)
            }
            Conditional::Conflict(seat) => {
                debug!(status = %seat.status, ?transition, "Seat transition rejected");
                Err(seat.status.apply(transition).err().unwrap_or_else(|| {
                    TicketingError::StateConflict(format!(
                        "seat {seat_id} changed concurrently to {}",
                        seat.status
                    ))
                }))
            }
            Conditional::Missing => Err(TicketingError::not_found("seat", seat_id)),
        }
    }

    /// Find a seat.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown seat, `Storage` on adapter failure.
    pub async fn find(&self, seat_id: SeatId) -> Result<Seat> {
        self.seats
            .find_seat(seat_id)
            .await?
            .ok_or_else(|| TicketingError::not_found("seat", seat_id))
    }

    /// All seats of a concert.
    ///
    /// # Errors
    ///
    /// `Storage` on adapter failure.
    pub async fn seats_of_concert(&self, concert_id: ConcertId) -> Result<Vec<Seat>> {
        self.seats.seats_of_concert(concert_id).await
    }

    /// All seats of a grade.
    ///
    /// # Errors
    ///
    /// `Storage` on adapter failure.
    pub async fn seats_of_grade(&self, grade_id: GradeId) -> Result<Vec<Seat>> {
        self.seats.seats_of_grade(grade_id).await
    }

    /// Seats of a concert in a given status.
    ///
    /// # Errors
    ///
    /// `Storage` on adapter failure.
    pub async fn seats_by_status(&self, concert_id: ConcertId, status: SeatStatus) -> Result<Vec<Seat>> {
        self.seats.seats_by_status(concert_id, status).await
    }

    /// AVAILABLE seats of a concert.
    ///
    /// # Errors
    ///
    /// `Storage` on adapter failure.
    pub async fn available_seats(&self, concert_id: ConcertId) -> Result<Vec<Seat>> {
        self.seats_by_status(concert_id, SeatStatus::Available).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::persistence::memory::InMemoryStore;
    use crate::seat::Grade;
    use crate::types::Money;

    async fn ledger_with_seat() -> (SeatLedger, SeatId) {
        let store = Arc::new(InMemoryStore::new());
        let concert = ConcertId::new();
        let grade = Grade::new(concert, "R", Money::from_cents(50_000));
        let seat = Seat::new(concert, grade.id, "A-1");
        let seat_id = seat.id;
        store.insert_seat(seat).await.unwrap();
        (SeatLedger::new(store), seat_id)
    }

    #[tokio::test]
    async fn full_lifecycle() {
        let (ledger, seat_id) = ledger_with_seat().await;
        let user = UserId::from("alice");

        assert_eq!(ledger.select(seat_id, &user).await.unwrap().status, SeatStatus::Selected);
        assert_eq!(ledger.reserve(seat_id).await.unwrap().status, SeatStatus::Reserved);
        assert_eq!(ledger.sell(seat_id).await.unwrap().status, SeatStatus::Sold);

        let reset = ledger.reset(seat_id).await;
        assert!(matches!(reset, Err(TicketingError::StateConflict(_))));
        assert_eq!(ledger.find(seat_id).await.unwrap().status, SeatStatus::Sold);
    }

    #[tokio::test]
    async fn select_twice_conflicts() {
        let (ledger, seat_id) = ledger_with_seat().await;
        let user = UserId::from("alice");

        ledger.select(seat_id, &user).await.unwrap();
        let second = ledger.select(seat_id, &UserId::from("bob")).await;
        assert!(matches!(second, Err(TicketingError::StateConflict(_))));
    }

    #[tokio::test]
    async fn sell_from_selected_conflicts() {
        let (ledger, seat_id) = ledger_with_seat().await;
        ledger.select(seat_id, &UserId::from("alice")).await.unwrap();

        assert!(ledger.sell(seat_id).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn reset_if_leaves_a_seat_that_moved_on() {
        let (ledger, seat_id) = ledger_with_seat().await;
        ledger.select(seat_id, &UserId::from("alice")).await.unwrap();
        ledger.reserve(seat_id).await.unwrap();

        assert!(!ledger.reset_if(seat_id, SeatStatus::Selected).await.unwrap());
        assert_eq!(ledger.find(seat_id).await.unwrap().status, SeatStatus::Reserved);

        assert_eq!(ledger.unreserve(seat_id).await.unwrap().status, SeatStatus::Selected);
        assert!(ledger.reset_if(seat_id, SeatStatus::Selected).await.unwrap());
        assert_eq!(ledger.find(seat_id).await.unwrap().status, SeatStatus::Available);
        assert!(ledger.reset_if(seat_id, SeatStatus::Sold).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn unknown_seat_is_not_found() {
        let (ledger, _) = ledger_with_seat().await;
        let result = ledger.reserve(SeatId::new()).await;
        assert!(matches!(result, Err(TicketingError::NotFound { entity: "seat", .. })));
    }

    #[tokio::test]
    async fn available_seats_excludes_selected() {
        let (ledger, seat_id) = ledger_with_seat().await;
        let concert = ledger.find(seat_id).await.unwrap().concert_id;
        assert_eq!(ledger.available_seats(concert).await.unwrap().len(), 1);

        ledger.select(seat_id, &UserId::from("alice")).await.unwrap();
        assert!(ledger.available_seats(concert).await.unwrap().is_empty());
        assert_eq!(
            ledger.seats_by_status(concert, SeatStatus::Selected).await.unwrap().len(),
            1
        );
    }
}
