//! Shared fixtures for the integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use box_office_testing::{InMemoryMessageBus, ManualClock};
use std::sync::Arc;
use std::time::Duration;
use ticketing::payment::ScriptedPaymentGateway;
use ticketing::{BoxOffice, ConcertId, Config, Money, Payment, Reservation, Seat, SeatId, UserId};

/// Price of every seat in the fixture concert.
pub const SEAT_PRICE: u64 = 12_000;

/// A box office on the in-memory store with one concert of four seats.
pub struct Harness {
    pub office: BoxOffice,
    pub gateway: ScriptedPaymentGateway,
    pub bus: Arc<InMemoryMessageBus>,
    pub clock: Arc<ManualClock>,
    pub concert: ConcertId,
    pub seats: Vec<Seat>,
}

impl Harness {
    pub async fn new(gateway: ScriptedPaymentGateway) -> Self {
        Self::with_config(Config::default(), gateway).await
    }

    pub async fn with_config(config: Config, gateway: ScriptedPaymentGateway) -> Self {
        let bus = Arc::new(InMemoryMessageBus::new());
        let clock = Arc::new(ManualClock::default());
        let office = BoxOffice::in_memory(config, Arc::new(gateway.clone()), bus.clone(), clock.clone());

        let concert = ConcertId::new();
        let grade = office
            .add_grade(concert, "R", Money::from_cents(SEAT_PRICE))
            .await
            .unwrap();
        let mut seats = Vec::new();
        for n in 1..=4 {
            seats.push(office.add_seat(concert, grade.id, &format!("R{n}")).await.unwrap());
        }

        Self {
            office,
            gateway,
            bus,
            clock,
            concert,
            seats,
        }
    }

    pub fn seat_ids(&self, count: usize) -> Vec<SeatId> {
        self.seats.iter().take(count).map(|seat| seat.id).collect()
    }

    /// Register, admit and enter `user`. Nobody else may be waiting.
    pub async fn enter(&self, user: &UserId) {
        self.office.register_queue(self.concert, user).await.unwrap();
        self.office.admit_next(self.concert, Some(1)).await.unwrap();
        self.office.enter_queue(self.concert, user).await.unwrap();
    }

    /// Enter `user` and hold the first `count` seats.
    pub async fn hold(&self, user: &UserId, count: usize) -> Vec<SeatId> {
        self.enter(user).await;
        let seat_ids = self.seat_ids(count);
        for seat_id in &seat_ids {
            self.office.select_seat(*seat_id, user).await.unwrap();
        }
        seat_ids
    }

    /// Hold and reserve the first `count` seats for `user`.
    pub async fn reserve(&self, user: &UserId, count: usize) -> Reservation {
        let seat_ids = self.hold(user, count).await;
        self.office
            .create_reservation(user, self.concert, &seat_ids)
            .await
            .unwrap()
    }

    /// Wait (in paused tokio time) until no driver works on the payment.
    pub async fn settle(&self, user: &UserId, payment: &Payment) -> Payment {
        for _ in 0..10_000 {
            if !self.office.saga().is_driving(payment.id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.office.payment_status(user, payment.id).await.unwrap()
    }
}
