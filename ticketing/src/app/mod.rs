//! The box office facade.
//!
//! [`BoxOffice`] wires the seat ledger, lock manager, admission controller,
//! reservation service and payment saga to one set of stores, and owns the
//! background work (reapers, admission pumps, payment drivers). Its methods
//! are what a transport layer would call.

use crate::config::Config;
use crate::error::{Result, TicketingError};
use crate::payment::{GatewayStatus, Payment, PaymentGateway, PaymentSaga};
use crate::persistence::{InMemoryStore, PostgresStore};
use crate::ports::{GradeStore, PaymentStore, ReservationStore, SeatLockStore, SeatStore, WaitingQueueStore};
use crate::queue::{AdmissionController, QueuePosition, WaitingQueueEntry};
use crate::reservation::{Reservation, ReservationService};
use crate::seat::{Grade, Seat, SeatLedger, SeatLock, SeatLockManager};
use crate::sweeper::Reapers;
use crate::types::{ConcertId, GradeId, Money, PaymentId, PaymentMethod, ReservationId, SeatId, UserId};
use box_office_core::environment::Clock;
use box_office_core::message_bus::MessageBus;
use box_office_runtime::{PeriodicTask, ShutdownTrigger, shutdown_channel};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// A store implementing every port.
pub trait TicketingStore:
    SeatStore + GradeStore + SeatLockStore + WaitingQueueStore + ReservationStore + PaymentStore + 'static
{
}

impl<S> TicketingStore for S where
    S: SeatStore + GradeStore + SeatLockStore + WaitingQueueStore + ReservationStore + PaymentStore + 'static
{
}

#[derive(Default)]
struct Background {
    reapers: Option<Reapers>,
    pumps: Vec<(ConcertId, JoinHandle<()>)>,
}

/// Entry point to every ticketing operation.
pub struct BoxOffice {
    config: Config,
    seats: Arc<dyn SeatStore>,
    grades: Arc<dyn GradeStore>,
    locks: SeatLockManager,
    queue: AdmissionController,
    reservations: ReservationService,
    saga: PaymentSaga,
    shutdown: ShutdownTrigger,
    background: Mutex<Background>,
}

impl BoxOffice {
    /// Wire every service to `store`.
    #[must_use]
    pub fn with_store<S: TicketingStore>(
        config: Config,
        store: Arc<S>,
        gateway: Arc<dyn PaymentGateway>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let seats: Arc<dyn SeatStore> = store.clone();
        let grades: Arc<dyn GradeStore> = store.clone();
        let lock_store: Arc<dyn SeatLockStore> = store.clone();
        let queue_store: Arc<dyn WaitingQueueStore> = store.clone();
        let reservation_store: Arc<dyn ReservationStore> = store.clone();
        let payments: Arc<dyn PaymentStore> = store;

        let ledger = SeatLedger::new(seats.clone());
        let locks = SeatLockManager::new(lock_store, ledger, clock.clone());
        let queue = AdmissionController::new(
            queue_store,
            bus.clone(),
            clock.clone(),
            config.waiting_queue.admission_settings(),
        );
        let reservations = ReservationService::new(
            reservation_store.clone(),
            grades.clone(),
            payments.clone(),
            locks.clone(),
            clock.clone(),
        );
        let saga = PaymentSaga::new(
            payments,
            reservation_store,
            locks.clone(),
            gateway,
            bus,
            clock,
            config.payment.saga_settings(),
        );
        let (shutdown, _) = shutdown_channel();

        Self {
            config,
            seats,
            grades,
            locks,
            queue,
            reservations,
            saga,
            shutdown,
            background: Mutex::new(Background::default()),
        }
    }

    /// Run on a fresh [`InMemoryStore`].
    #[must_use]
    pub fn in_memory(
        config: Config,
        gateway: Arc<dyn PaymentGateway>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_store(config, Arc::new(InMemoryStore::default()), gateway, bus, clock)
    }

    /// Connect to `PostgreSQL`, run migrations and wire every service to it.
    ///
    /// # Errors
    ///
    /// `Validation` without a database URL, `Storage` if the connection or
    /// a migration fails.
    pub async fn connect(
        config: Config,
        gateway: Arc<dyn PaymentGateway>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let store = PostgresStore::connect(&config.database).await?;
        store.migrate().await?;
        Ok(Self::with_store(config, Arc::new(store), gateway, bus, clock))
    }

    /// Loaded configuration.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Seat ledger.
    #[must_use]
    pub const fn ledger(&self) -> &SeatLedger {
        self.locks.ledger()
    }

    /// Seat lock manager.
    #[must_use]
    pub const fn locks(&self) -> &SeatLockManager {
        &self.locks
    }

    /// Waiting-queue admission controller.
    #[must_use]
    pub const fn queue(&self) -> &AdmissionController {
        &self.queue
    }

    /// Reservation service.
    #[must_use]
    pub const fn reservations(&self) -> &ReservationService {
        &self.reservations
    }

    /// Payment saga.
    #[must_use]
    pub const fn saga(&self) -> &PaymentSaga {
        &self.saga
    }

    // ------------------------------------------------------------------
    // Inventory setup
    // ------------------------------------------------------------------

    /// Add a price tier to a concert.
    ///
    /// # Errors
    ///
    /// `Validation` for an empty name, `Storage` on adapter failure.
    pub async fn add_grade(&self, concert_id: ConcertId, name: &str, price: Money) -> Result<Grade> {
        if name.trim().is_empty() {
            return Err(TicketingError::Validation("grade name must not be empty".to_string()));
        }
        let grade = Grade::new(concert_id, name, price);
        self.grades.insert_grade(grade.clone()).await?;
        Ok(grade)
    }

    /// Add an AVAILABLE seat of `grade_id`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown grade, `Validation` if the grade belongs to
    /// another concert.
    pub async fn add_seat(&self, concert_id: ConcertId, grade_id: GradeId, label: &str) -> Result<Seat> {
        let grade = self
            .grades
            .find_grade(grade_id)
            .await?
            .ok_or_else(|| TicketingError::not_found("grade", grade_id))?;
        if grade.concert_id != concert_id {
            return Err(TicketingError::Validation(format!(
                "grade {grade_id} belongs to concert {}",
                grade.concert_id
            )));
        }
        let seat = Seat::new(concert_id, grade_id, label);
        self.seats.insert_seat(seat.clone()).await?;
        Ok(seat)
    }

    /// AVAILABLE seats of a concert.
    ///
    /// # Errors
    ///
    /// `Storage` on adapter failure.
    pub async fn available_seats(&self, concert_id: ConcertId) -> Result<Vec<Seat>> {
        self.ledger().available_seats(concert_id).await
    }

    // ------------------------------------------------------------------
    // Seats
    // ------------------------------------------------------------------

    /// Hold a seat with the configured TTL. The user must have entered the
    /// seat's concert through the waiting queue.
    ///
    /// # Errors
    ///
    /// Queue gate errors from [`AdmissionController::ensure_entered`], then
    /// lock errors from [`SeatLockManager::lock`].
    #[instrument(skip(self), fields(seat_id = %seat_id, user_id = %user_id))]
    pub async fn select_seat(&self, seat_id: SeatId, user_id: &UserId) -> Result<SeatLock> {
        let seat = self.ledger().find(seat_id).await?;
        self.queue.ensure_entered(seat.concert_id, user_id).await?;
        self.locks.lock(seat_id, user_id, self.config.seat_lock.ttl_minutes).await
    }

    /// Extend the user's hold by the configured TTL.
    ///
    /// # Errors
    ///
    /// See [`SeatLockManager::extend`].
    pub async fn extend_seat(&self, seat_id: SeatId, user_id: &UserId) -> Result<SeatLock> {
        self.locks.extend(seat_id, user_id, self.config.seat_lock.ttl_minutes).await
    }

    /// Give up the user's hold.
    ///
    /// # Errors
    ///
    /// See [`SeatLockManager::cancel`].
    pub async fn cancel_seat(&self, seat_id: SeatId, user_id: &UserId) -> Result<()> {
        self.locks.cancel(seat_id, user_id).await
    }

    /// Sell a held seat once it is RESERVED.
    ///
    /// # Errors
    ///
    /// See [`SeatLockManager::confirm`].
    pub async fn confirm_seat(&self, seat_id: SeatId, user_id: &UserId) -> Result<Seat> {
        self.locks.confirm(seat_id, user_id).await
    }

    // ------------------------------------------------------------------
    // Waiting queue
    // ------------------------------------------------------------------

    /// Join a concert's waiting queue.
    ///
    /// # Errors
    ///
    /// `AlreadyRegistered` if the user has an active entry.
    pub async fn register_queue(&self, concert_id: ConcertId, user_id: &UserId) -> Result<WaitingQueueEntry> {
        self.queue.register(concert_id, user_id).await
    }

    /// The user's queue entry, users ahead and estimated wait.
    ///
    /// # Errors
    ///
    /// `NotFound` without an active entry.
    pub async fn queue_status(&self, concert_id: ConcertId, user_id: &UserId) -> Result<QueuePosition> {
        self.queue.status(concert_id, user_id).await
    }

    /// Admit the next batch; `None` uses the configured batch size.
    ///
    /// # Errors
    ///
    /// `Storage` on adapter failure.
    pub async fn admit_next(&self, concert_id: ConcertId, batch_size: Option<u32>) -> Result<Vec<WaitingQueueEntry>> {
        match batch_size {
            Some(size) => self.queue.admit_next_batch(concert_id, size).await,
            None => self.queue.admit_next_default_batch(concert_id).await,
        }
    }

    /// Enter seat selection after admission.
    ///
    /// # Errors
    ///
    /// See [`AdmissionController::enter`].
    pub async fn enter_queue(&self, concert_id: ConcertId, user_id: &UserId) -> Result<WaitingQueueEntry> {
        self.queue.enter(concert_id, user_id).await
    }

    /// Leave the waiting queue.
    ///
    /// # Errors
    ///
    /// `NotFound` without an active entry.
    pub async fn leave_queue(&self, concert_id: ConcertId, user_id: &UserId) -> Result<WaitingQueueEntry> {
        self.queue.cancel(concert_id, user_id).await
    }

    // ------------------------------------------------------------------
    // Reservations
    // ------------------------------------------------------------------

    /// Reserve seats the user holds.
    ///
    /// # Errors
    ///
    /// See [`ReservationService::create`].
    pub async fn create_reservation(
        &self,
        user_id: &UserId,
        concert_id: ConcertId,
        seat_ids: &[SeatId],
    ) -> Result<Reservation> {
        self.reservations.create(user_id, concert_id, seat_ids).await
    }

    /// One of the user's reservations.
    ///
    /// # Errors
    ///
    /// `NotFound` or `OwnershipViolation`.
    pub async fn reservation(&self, user_id: &UserId, reservation_id: ReservationId) -> Result<Reservation> {
        self.reservations.find_for_user(user_id, reservation_id).await
    }

    /// The user's reservations, newest first.
    ///
    /// # Errors
    ///
    /// `Storage` on adapter failure.
    pub async fn reservations_of(&self, user_id: &UserId) -> Result<Vec<Reservation>> {
        self.reservations.list_for_user(user_id).await
    }

    /// Cancel a PENDING reservation.
    ///
    /// # Errors
    ///
    /// See [`ReservationService::cancel`].
    pub async fn cancel_reservation(&self, user_id: &UserId, reservation_id: ReservationId) -> Result<Reservation> {
        self.reservations.cancel(user_id, reservation_id).await
    }

    // ------------------------------------------------------------------
    // Payments
    // ------------------------------------------------------------------

    /// Start paying a reservation.
    ///
    /// # Errors
    ///
    /// See [`PaymentSaga::request_payment`].
    pub async fn request_payment(
        &self,
        user_id: &UserId,
        reservation_id: ReservationId,
        amount: Money,
        method: PaymentMethod,
    ) -> Result<Payment> {
        self.saga.request_payment(user_id, reservation_id, amount, method).await
    }

    /// Current payment state, reconciled with the gateway while PENDING.
    ///
    /// # Errors
    ///
    /// See [`PaymentSaga::check_payment_status`].
    pub async fn payment_status(&self, user_id: &UserId, payment_id: PaymentId) -> Result<Payment> {
        self.saga.check_payment_status(user_id, payment_id).await
    }

    /// Cancel a payment and release its seats.
    ///
    /// # Errors
    ///
    /// See [`PaymentSaga::cancel_payment`].
    pub async fn cancel_payment(&self, user_id: &UserId, payment_id: PaymentId) -> Result<Payment> {
        self.saga.cancel_payment(user_id, payment_id).await
    }

    /// Gateway webhook.
    ///
    /// # Errors
    ///
    /// See [`PaymentSaga::handle_callback`].
    pub async fn payment_callback(&self, gateway_payment_id: &str, outcome: GatewayStatus) -> Result<Payment> {
        self.saga.handle_callback(gateway_payment_id, outcome).await
    }

    // ------------------------------------------------------------------
    // Background work
    // ------------------------------------------------------------------

    /// Start the reapers and resume every PENDING payment.
    ///
    /// Calling it again only resumes payments without a running driver.
    /// Returns the number of payments resumed.
    ///
    /// # Errors
    ///
    /// `Storage` if the pending payments cannot be listed.
    pub async fn start_background(&self) -> Result<usize> {
        {
            let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
            if background.reapers.is_none() {
                background.reapers = Some(Reapers::spawn(
                    self.locks.clone(),
                    self.reservations.clone(),
                    self.queue.clone(),
                    self.config.seat_lock.reaper_interval(),
                    self.config.waiting_queue.reaper_interval(),
                    &self.shutdown.subscribe(),
                ));
            }
        }
        self.saga.resume_pending().await
    }

    /// Admit the configured batch of `concert_id` every admission interval.
    ///
    /// Returns `false` if a pump already runs for the concert.
    pub fn start_admission_pump(&self, concert_id: ConcertId) -> bool {
        let mut background = self.background.lock().unwrap_or_else(PoisonError::into_inner);
        if background.pumps.iter().any(|(id, handle)| *id == concert_id && !handle.is_finished()) {
            return false;
        }

        let queue = self.queue.clone();
        let handle = PeriodicTask::new(format!("admission-pump-{concert_id}"), self.queue.settings().admission_interval)
            .spawn(self.shutdown.subscribe(), move || {
                let queue = queue.clone();
                async move {
                    if let Err(e) = queue.admit_next_default_batch(concert_id).await {
                        error!(concert_id = %concert_id, error = %e, "Admission batch failed");
                    }
                }
            });
        background.pumps.retain(|(_, handle)| !handle.is_finished());
        background.pumps.push((concert_id, handle));
        info!(concert_id = %concert_id, "Admission pump started");
        true
    }

    /// Stop all background work within the configured shutdown timeout.
    ///
    /// PENDING payments stay PENDING and are resumed by the next
    /// [`Self::start_background`].
    pub async fn shutdown(&self) {
        let timeout = self.config.shutdown_timeout();
        self.shutdown.trigger();

        let background = std::mem::take(&mut *self.background.lock().unwrap_or_else(PoisonError::into_inner));
        if let Some(reapers) = background.reapers {
            reapers.join(timeout).await;
        }
        for (concert_id, handle) in background.pumps {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(concert_id = %concert_id, "Admission pump did not stop within timeout");
            }
        }

        let stuck = self.saga.shutdown(timeout).await;
        if stuck > 0 {
            warn!(stuck, "Payment drivers did not stop within timeout");
        }
        info!("Box office stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::payment::ScriptedPaymentGateway;
    use box_office_core::message_bus::NoopMessageBus;
    use box_office_testing::ManualClock;

    fn box_office() -> BoxOffice {
        BoxOffice::in_memory(
            Config::default(),
            Arc::new(ScriptedPaymentGateway::new()),
            Arc::new(NoopMessageBus),
            Arc::new(ManualClock::default()),
        )
    }

    #[tokio::test]
    async fn seats_need_a_grade_of_the_same_concert() {
        let office = box_office();
        let concert = ConcertId::new();
        let grade = office.add_grade(concert, "VIP", Money::from_cents(15_000)).await.unwrap();

        let err = office.add_seat(ConcertId::new(), grade.id, "A1").await.unwrap_err();
        assert!(matches!(err, TicketingError::Validation(_)));
        let err = office.add_seat(concert, GradeId::new(), "A1").await.unwrap_err();
        assert!(matches!(err, TicketingError::NotFound { .. }));

        let seat = office.add_seat(concert, grade.id, "A1").await.unwrap();
        assert_eq!(office.available_seats(concert).await.unwrap(), vec![seat]);
    }

    #[tokio::test]
    async fn selecting_a_seat_requires_entering_the_queue() {
        let office = box_office();
        let concert = ConcertId::new();
        let grade = office.add_grade(concert, "R", Money::from_cents(9_000)).await.unwrap();
        let seat = office.add_seat(concert, grade.id, "B7").await.unwrap();
        let user = UserId::from("alice");

        let err = office.select_seat(seat.id, &user).await.unwrap_err();
        assert!(matches!(err, TicketingError::NotFound { .. }));

        office.register_queue(concert, &user).await.unwrap();
        let err = office.select_seat(seat.id, &user).await.unwrap_err();
        assert!(matches!(err, TicketingError::StateConflict(_)));

        office.admit_next(concert, Some(1)).await.unwrap();
        office.enter_queue(concert, &user).await.unwrap();
        let lock = office.select_seat(seat.id, &user).await.unwrap();
        assert_eq!(lock.user_id, user);
        assert_eq!(lock.expires_at - lock.locked_at, chrono::Duration::minutes(10));
    }

    #[tokio::test]
    async fn admission_pump_runs_once_per_concert() {
        let office = box_office();
        let concert = ConcertId::new();

        assert!(office.start_admission_pump(concert));
        assert!(!office.start_admission_pump(concert));
        assert!(office.start_admission_pump(ConcertId::new()));

        office.shutdown().await;
    }
}
