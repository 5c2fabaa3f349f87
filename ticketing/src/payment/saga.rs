//! Payment saga orchestrator.
//!
//! A requested payment is driven to a terminal state by a background driver
//! task, one per payment, running under a [`TaskSupervisor`]. Each attempt
//! requests a fresh gateway charge and polls it; failed attempts are retried
//! with exponential backoff until the attempt budget is spent. Every sleep is
//! cancellable through the driver's shutdown signal, and no lock or storage
//! transaction is held across a sleep.
//!
//! - **completion**: payment and reservation COMPLETED, each seat sold and its
//!   lock dropped, `payment.success` plus one `payment.success.detailed` per seat.
//!   A paid reservation whose seats are no longer all RESERVED is refunded and
//!   failed instead.
//! - **exhaustion**: payment FAILED, reservation CANCELLED, each seat released
//!   (compensation), `payment.failure` plus one `payment.failure.detailed` per seat
//!
//! Terminal transitions are conditional writes, so whichever path (driver,
//! status check, callback, cancel) gets there first wins and the others see a
//! `StateConflict`.

use crate::error::{Result, TicketingError};
use crate::messages::{self, PaymentOutcome, PaymentRequested, SeatPaymentDetail};
use crate::metrics;
use crate::payment::gateway::{GatewayStatus, PaymentGateway};
use crate::payment::{Payment, PaymentStatus, PaymentTransition};
use crate::ports::{Conditional, PaymentStore, ReservationStore};
use crate::reservation::{Reservation, ReservationStatus, ReservationTransition};
use crate::seat::{SeatLockManager, SeatStatus};
use crate::types::{Money, PaymentId, PaymentMethod, ReservationId, SeatId, UserId};
use box_office_core::environment::Clock;
use box_office_core::message_bus::MessageBus;
use box_office_runtime::shutdown::sleep_or_shutdown;
use box_office_runtime::{RetryPolicy, ShutdownSignal, TaskSupervisor};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

/// Saga timing and attempt budget.
#[derive(Clone, Debug)]
pub struct SagaSettings {
    /// Attempt budget and backoff between attempts
    pub retry: RetryPolicy,
    /// Pause between status polls of one attempt
    pub poll_interval: Duration,
    /// Polls before an IN_PROGRESS attempt counts as failed
    pub max_polls_per_attempt: u32,
    /// How long `cancel_payment` waits for the driver to stop
    pub cancel_timeout: Duration,
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_secs(2),
            max_polls_per_attempt: 10,
            cancel_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
enum AttemptOutcome {
    Completed,
    Failed { kind: &'static str, reason: String },
    Stopped,
}

impl AttemptOutcome {
    fn failed(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            reason: reason.into(),
        }
    }
}

struct Inner {
    payments: Arc<dyn PaymentStore>,
    reservations: Arc<dyn ReservationStore>,
    locks: SeatLockManager,
    gateway: Arc<dyn PaymentGateway>,
    bus: Arc<dyn MessageBus>,
    clock: Arc<dyn Clock>,
    settings: SagaSettings,
    drivers: TaskSupervisor<PaymentId>,
}

/// Drives payments against the gateway and reconciles the outcome.
#[derive(Clone)]
pub struct PaymentSaga {
    inner: Arc<Inner>,
}

impl PaymentSaga {
    /// Create a saga orchestrator.
    #[must_use]
    pub fn new(
        payments: Arc<dyn PaymentStore>,
        reservations: Arc<dyn ReservationStore>,
        locks: SeatLockManager,
        gateway: Arc<dyn PaymentGateway>,
        bus: Arc<dyn MessageBus>,
        clock: Arc<dyn Clock>,
        settings: SagaSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                payments,
                reservations,
                locks,
                gateway,
                bus,
                clock,
                settings,
                drivers: TaskSupervisor::new(),
            }),
        }
    }

    /// Whether a driver is currently working on the payment.
    #[must_use]
    pub fn is_driving(&self, payment_id: PaymentId) -> bool {
        self.inner.drivers.is_running(&payment_id)
    }

    /// Number of running drivers.
    #[must_use]
    pub fn active_drivers(&self) -> usize {
        self.inner.drivers.len()
    }

    /// Start paying a reservation.
    ///
    /// Persists a PENDING payment, publishes `payment.process` and hands the
    /// payment to a background driver. Returns as soon as the driver is spawned.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown reservation
    /// - `OwnershipViolation` if the reservation belongs to someone else
    /// - `StateConflict` if the reservation is not PENDING, the amount differs
    ///   from its total, or it already has a payment
    #[instrument(skip(self), fields(user_id = %user_id, reservation_id = %reservation_id, amount = amount.cents()))]
    pub async fn request_payment(
        &self,
        user_id: &UserId,
        reservation_id: ReservationId,
        amount: Money,
        method: PaymentMethod,
    ) -> Result<Payment> {
        let reservation = self
            .inner
            .reservations
            .find_reservation(reservation_id)
            .await?
            .ok_or_else(|| TicketingError::not_found("reservation", reservation_id))?;

        if !reservation.is_owned_by(user_id) {
            return Err(TicketingError::OwnershipViolation(format!(
                "reservation {reservation_id} does not belong to {user_id}"
            )));
        }
        if reservation.status != ReservationStatus::Pending {
            return Err(TicketingError::StateConflict(format!(
                "reservation {reservation_id} is {}",
                reservation.status
            )));
        }
        if amount != reservation.total_amount {
            return Err(TicketingError::StateConflict(format!(
                "amount {amount} does not match reservation total {}",
                reservation.total_amount
            )));
        }
        if let Some(existing) = self.inner.payments.find_payment_by_reservation(reservation_id).await? {
            return Err(TicketingError::StateConflict(format!(
                "reservation {reservation_id} already has payment {} ({})",
                existing.id, existing.status
            )));
        }

        let now = self.inner.clock.now();
        let payment = Payment::new(reservation_id, user_id.clone(), amount, method, now);
        self.inner.payments.insert_payment(payment.clone()).await?;

        info!(payment_id = %payment.id, method = %method, "Payment requested");
        metrics::record_payment_requested();
        messages::publish(
            self.inner.bus.as_ref(),
            &PaymentRequested {
                payment_id: payment.id,
                reservation_id,
                user_id: user_id.clone(),
                amount,
                method,
                timestamp: now,
            },
        )
        .await;

        self.spawn_driver(payment.id);
        Ok(payment)
    }

    /// The user's payment, reconciled with the gateway if it is still PENDING.
    ///
    /// A COMPLETED answer completes the payment; a FAILED answer with no live
    /// driver fails it. Otherwise the payment is returned unchanged.
    ///
    /// # Errors
    ///
    /// - `NotFound` / `OwnershipViolation` for an unknown or foreign payment
    /// - `ExternalGateway` if the gateway cannot be queried
    #[instrument(skip(self), fields(user_id = %user_id, payment_id = %payment_id))]
    pub async fn check_payment_status(&self, user_id: &UserId, payment_id: PaymentId) -> Result<Payment> {
        let payment = self.owned_payment(user_id, payment_id).await?;
        if payment.status.is_terminal() {
            return Ok(payment);
        }
        let Some(gateway_payment_id) = payment.gateway_payment_id.clone() else {
            return Ok(payment);
        };

        let status = self
            .inner
            .gateway
            .get_payment_status(&gateway_payment_id)
            .await
            .map_err(|e| TicketingError::ExternalGateway(e.to_string()))?;
        debug!(gateway_payment_id = %gateway_payment_id, ?status, "Gateway status");

        self.reconcile(payment, status).await
    }

    /// Apply a processor callback for `gateway_payment_id`.
    ///
    /// Callbacks for payments that are already terminal are acknowledged
    /// without effect.
    ///
    /// # Errors
    ///
    /// - `NotFound` if no payment is bound to the gateway id
    /// - `ExternalGateway` if the gateway cannot verify the charge
    #[instrument(skip(self), fields(gateway_payment_id = %gateway_payment_id))]
    pub async fn handle_callback(&self, gateway_payment_id: &str, outcome: GatewayStatus) -> Result<Payment> {
        let payment = self
            .inner
            .payments
            .find_payment_by_gateway_id(gateway_payment_id)
            .await?
            .ok_or_else(|| TicketingError::not_found("payment", gateway_payment_id))?;
        if payment.status.is_terminal() {
            debug!(status = %payment.status, "Callback for settled payment ignored");
            return Ok(payment);
        }

        let verified = self
            .inner
            .gateway
            .verify_payment(gateway_payment_id, payment.amount)
            .await
            .map_err(|e| TicketingError::ExternalGateway(e.to_string()))?;
        if !verified {
            warn!(payment_id = %payment.id, "Gateway did not verify callback");
            return Err(TicketingError::ExternalGateway(format!(
                "gateway did not verify payment {gateway_payment_id}"
            )));
        }

        self.reconcile(payment, outcome).await
    }

    /// Cancel the user's payment.
    ///
    /// Stops the driver, cancels the charge at the gateway, then moves the
    /// payment and its reservation to CANCELLED and releases the seats. Seats
    /// already SOLD stay SOLD.
    ///
    /// # Errors
    ///
    /// - `NotFound` / `OwnershipViolation` for an unknown or foreign payment
    /// - `StateConflict` if the payment is FAILED or CANCELLED
    /// - `ExternalGateway` if the gateway refuses the cancellation; the payment
    ///   is left as it was and a PENDING payment keeps being driven
    #[instrument(skip(self), fields(user_id = %user_id, payment_id = %payment_id))]
    pub async fn cancel_payment(&self, user_id: &UserId, payment_id: PaymentId) -> Result<Payment> {
        let payment = self.owned_payment(user_id, payment_id).await?;
        payment.status.apply(PaymentTransition::Cancel)?;

        if !self
            .inner
            .drivers
            .cancel_and_wait(&payment_id, self.inner.settings.cancel_timeout)
            .await
        {
            warn!("Payment driver did not stop in time, cancelling anyway");
        }

        // The driver may have settled the payment while stopping.
        let payment = self.find_payment(payment_id).await?;
        payment.status.apply(PaymentTransition::Cancel)?;

        if let Some(gateway_payment_id) = &payment.gateway_payment_id {
            if let Err(e) = self.inner.gateway.cancel_payment(gateway_payment_id).await {
                warn!(error = %e, "Gateway refused cancellation");
                if payment.status == PaymentStatus::Pending {
                    self.spawn_driver(payment_id);
                }
                return Err(TicketingError::ExternalGateway(e.to_string()));
            }
        }

        let cancelled = match self
            .transition(payment_id, PaymentTransition::Cancel, None)
            .await?
        {
            Conditional::Updated(payment) => payment,
            Conditional::Conflict(current) => return Err(rejection(&current, PaymentTransition::Cancel)),
            Conditional::Missing => return Err(TicketingError::not_found("payment", payment_id)),
        };

        if let Some(reservation) = self
            .transition_reservation(cancelled.reservation_id, ReservationTransition::Cancel)
            .await
        {
            self.compensate(&cancelled, &reservation, None).await;
        }

        info!(previous = %payment.status, "Payment cancelled");
        metrics::record_payment_cancelled();
        Ok(cancelled)
    }

    /// Complete a PENDING payment: sell its seats and publish the success.
    ///
    /// Every seat of the reservation must still be RESERVED. Otherwise the
    /// charge is cancelled at the gateway and the payment FAILED, since the
    /// reservation can no longer be honoured.
    ///
    /// # Errors
    ///
    /// - `StateConflict` if the payment is already terminal or a seat was lost
    /// - `NotFound` if unknown
    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn complete(&self, payment_id: PaymentId) -> Result<Payment> {
        let current = self.find_payment(payment_id).await?;
        current.status.apply(PaymentTransition::Complete)?;
        if let Some(seat_id) = self.lost_seat(&current).await? {
            let reason = format!("seat {seat_id} is no longer reserved for this payment");
            error!(seat_id = %seat_id, "Paid reservation lost a seat, refunding");
            self.refund(&current).await;
            self.fail(payment_id, reason.clone()).await?;
            return Err(TicketingError::StateConflict(reason));
        }

        let payment = match self.transition(payment_id, PaymentTransition::Complete, None).await? {
            Conditional::Updated(payment) => payment,
            Conditional::Conflict(current) => return Err(rejection(&current, PaymentTransition::Complete)),
            Conditional::Missing => return Err(TicketingError::not_found("payment", payment_id)),
        };
        let now = self.inner.clock.now();

        if let Some(reservation) = self
            .transition_reservation(payment.reservation_id, ReservationTransition::Complete)
            .await
        {
            for seat_id in reservation.seat_ids() {
                let seat_lock_id = match self.inner.locks.settle(seat_id).await {
                    Ok(lock) => lock.map(|lock| lock.id),
                    Err(e) => {
                        error!(seat_id = %seat_id, error = %e, "Paid seat could not be sold");
                        None
                    }
                };
                messages::publish(
                    self.inner.bus.as_ref(),
                    &SeatPaymentDetail {
                        payment_id,
                        concert_id: reservation.concert_id,
                        seat_id,
                        seat_lock_id,
                        timestamp: now,
                        retry_count: None,
                    },
                )
                .await;
            }
        }

        messages::publish(self.inner.bus.as_ref(), &outcome_message(&payment, now)).await;
        info!(attempts = payment.retry_count, "Payment completed");
        metrics::record_payment_succeeded(payment.amount.cents(), payment.retry_count);
        Ok(payment)
    }

    /// Fail a PENDING payment: cancel its reservation, release its seats and
    /// publish the failure.
    ///
    /// # Errors
    ///
    /// `StateConflict` if the payment is already terminal, `NotFound` if unknown.
    #[instrument(skip(self, reason), fields(payment_id = %payment_id))]
    pub async fn fail(&self, payment_id: PaymentId, reason: impl Into<String>) -> Result<Payment> {
        let reason = reason.into();
        let payment = match self
            .transition(payment_id, PaymentTransition::Fail, Some(reason.clone()))
            .await?
        {
            Conditional::Updated(payment) => payment,
            Conditional::Conflict(current) => return Err(rejection(&current, PaymentTransition::Fail)),
            Conditional::Missing => return Err(TicketingError::not_found("payment", payment_id)),
        };
        let now = self.inner.clock.now();

        if let Some(reservation) = self
            .transition_reservation(payment.reservation_id, ReservationTransition::Cancel)
            .await
        {
            self.compensate(&payment, &reservation, Some(payment.retry_count)).await;
        }

        messages::publish(self.inner.bus.as_ref(), &outcome_message(&payment, now)).await;
        warn!(attempts = payment.retry_count, %reason, "Payment failed");
        metrics::record_payment_failed(payment.retry_count);
        Ok(payment)
    }

    /// Spawn drivers for every PENDING payment, e.g. after a restart.
    ///
    /// Returns the number of drivers spawned.
    ///
    /// # Errors
    ///
    /// `Storage` if the pending payments cannot be listed.
    pub async fn resume_pending(&self) -> Result<usize> {
        let pending = self.inner.payments.pending_payments().await?;
        let spawned = pending
            .iter()
            .filter(|payment| self.spawn_driver(payment.id))
            .count();
        if spawned > 0 {
            info!(spawned, "Resumed pending payments");
        }
        Ok(spawned)
    }

    /// Stop every driver, waiting up to `timeout`.
    ///
    /// Payments stay PENDING and can be resumed with [`Self::resume_pending`].
    /// Returns the number of drivers that did not stop in time.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.inner.drivers.shutdown(timeout).await
    }

    fn spawn_driver(&self, payment_id: PaymentId) -> bool {
        let saga = self.clone();
        self.inner.drivers.spawn(payment_id, move |signal| {
            async move { saga.drive(payment_id, signal).await }
                .instrument(info_span!("payment_driver", payment_id = %payment_id))
        })
    }

    async fn drive(&self, payment_id: PaymentId, mut signal: ShutdownSignal) {
        let payment = match self.inner.payments.find_payment(payment_id).await {
            Ok(Some(payment)) if !payment.status.is_terminal() => payment,
            Ok(_) => return,
            Err(e) => {
                error!(error = %e, "Could not load payment for driving");
                return;
            }
        };

        let policy = &self.inner.settings.retry;
        let mut attempts = payment.retry_count;
        // After a restart, finish polling the attempt that was in flight.
        let mut resume = payment.gateway_payment_id.clone().filter(|_| attempts > 0);
        let mut last_reason = String::from("no attempt made");

        loop {
            let outcome = if let Some(gateway_payment_id) = resume.take() {
                debug!(attempt = attempts, "Resuming in-flight attempt");
                self.poll_attempt(&gateway_payment_id, &mut signal).await
            } else {
                if !policy.should_retry(attempts) {
                    break;
                }
                attempts += 1;
                self.run_attempt(&payment, attempts, &mut signal).await
            };

            match outcome {
                AttemptOutcome::Completed => {
                    metrics::record_payment_attempt("completed");
                    match self.complete(payment_id).await {
                        Ok(_) => {}
                        Err(TicketingError::StateConflict(reason)) => debug!(%reason, "Payment settled elsewhere"),
                        Err(e) => error!(error = %e, "Could not complete paid payment"),
                    }
                    return;
                }
                AttemptOutcome::Stopped => {
                    debug!(attempt = attempts, "Payment driver stopped");
                    return;
                }
                AttemptOutcome::Failed { kind, reason } => {
                    metrics::record_payment_attempt(kind);
                    warn!(attempt = attempts, max_attempts = policy.max_attempts, %reason, "Payment attempt failed");
                    last_reason = reason;
                }
            }

            if policy.should_retry(attempts) {
                let delay = policy.delay_for_attempt(attempts.saturating_sub(1));
                debug!(delay_ms = delay.as_millis(), "Backing off before next attempt");
                if !sleep_or_shutdown(delay, &mut signal).await {
                    return;
                }
            }
        }

        let reason = format!("{}: {last_reason}", TicketingError::RetriesExhausted { attempts });
        match self.fail(payment_id, reason).await {
            Ok(_) => {}
            Err(TicketingError::StateConflict(reason)) => debug!(%reason, "Payment settled elsewhere"),
            Err(e) => error!(error = %e, "Could not fail exhausted payment"),
        }
    }

    async fn run_attempt(&self, payment: &Payment, attempt: u32, signal: &mut ShutdownSignal) -> AttemptOutcome {
        if signal.is_shutdown() {
            return AttemptOutcome::Stopped;
        }

        let requested = self
            .inner
            .gateway
            .request_payment(payment.id, payment.amount, payment.method)
            .await;
        let gateway_payment_id = requested.as_ref().ok().map(String::as_str);

        let now = self.inner.clock.now();
        match self
            .inner
            .payments
            .record_attempt(payment.id, gateway_payment_id, attempt, now)
            .await
        {
            Ok(Conditional::Updated(_)) => {}
            Ok(Conditional::Conflict(current)) => {
                debug!(status = %current.status, "Payment no longer pending");
                return AttemptOutcome::Stopped;
            }
            Ok(Conditional::Missing) => return AttemptOutcome::Stopped,
            Err(e) => return AttemptOutcome::failed("storage_error", format!("could not record attempt: {e}")),
        }

        match requested {
            Ok(gateway_payment_id) => {
                debug!(attempt, gateway_payment_id = %gateway_payment_id, "Gateway charge requested");
                self.poll_attempt(&gateway_payment_id, signal).await
            }
            Err(e) => AttemptOutcome::failed("request_error", format!("gateway request failed: {e}")),
        }
    }

    async fn poll_attempt(&self, gateway_payment_id: &str, signal: &mut ShutdownSignal) -> AttemptOutcome {
        let max_polls = self.inner.settings.max_polls_per_attempt.max(1);

        for poll in 1..=max_polls {
            if signal.is_shutdown() {
                return AttemptOutcome::Stopped;
            }
            match self.inner.gateway.get_payment_status(gateway_payment_id).await {
                Ok(GatewayStatus::Completed) => return AttemptOutcome::Completed,
                Ok(GatewayStatus::Failed) => {
                    return AttemptOutcome::failed("failed", format!("gateway reported {gateway_payment_id} failed"));
                }
                Ok(GatewayStatus::InProgress) => debug!(poll, "Gateway charge in progress"),
                Err(e) => return AttemptOutcome::failed("status_error", format!("status query failed: {e}")),
            }
            if poll < max_polls && !sleep_or_shutdown(self.inner.settings.poll_interval, signal).await {
                return AttemptOutcome::Stopped;
            }
        }

        AttemptOutcome::failed(
            "timed_out",
            format!("{gateway_payment_id} still in progress after {max_polls} polls"),
        )
    }

    /// Apply a gateway answer obtained outside the driver.
    async fn reconcile(&self, payment: Payment, status: GatewayStatus) -> Result<Payment> {
        let settled = match status {
            GatewayStatus::Completed => self.complete(payment.id).await,
            GatewayStatus::Failed if !self.is_driving(payment.id) => {
                self.fail(payment.id, "gateway reported failure").await
            }
            _ => return Ok(payment),
        };

        match settled {
            Ok(payment) => {
                self.inner.drivers.cancel(&payment.id);
                Ok(payment)
            }
            // Lost the race: report whatever state won.
            Err(TicketingError::StateConflict(_)) => self.find_payment(payment.id).await,
            Err(e) => Err(e),
        }
    }

    /// The first seat of the payment's reservation that is not RESERVED.
    async fn lost_seat(&self, payment: &Payment) -> Result<Option<SeatId>> {
        let Some(reservation) = self.inner.reservations.find_reservation(payment.reservation_id).await? else {
            return Ok(None);
        };
        for seat_id in reservation.seat_ids() {
            if self.inner.locks.ledger().find(seat_id).await?.status != SeatStatus::Reserved {
                return Ok(Some(seat_id));
            }
        }
        Ok(None)
    }

    async fn refund(&self, payment: &Payment) {
        let Some(gateway_payment_id) = &payment.gateway_payment_id else {
            return;
        };
        match self.inner.gateway.cancel_payment(gateway_payment_id).await {
            Ok(()) => info!(gateway_payment_id = %gateway_payment_id, "Charge refunded"),
            Err(e) => error!(gateway_payment_id = %gateway_payment_id, error = %e, "Refund failed"),
        }
    }

    /// Release the reservation's seats, publishing one detail message per seat.
    ///
    /// Every seat still RESERVED is released whoever holds its lock.
    async fn compensate(&self, payment: &Payment, reservation: &Reservation, retry_count: Option<u32>) {
        let now = self.inner.clock.now();
        for seat_id in reservation.seat_ids() {
            let seat_lock_id = match self.inner.locks.release_reserved(seat_id).await {
                Ok(lock) => lock.map(|lock| lock.id),
                Err(e) => {
                    error!(seat_id = %seat_id, error = %e, "Seat release failed during compensation");
                    None
                }
            };
            if retry_count.is_some() {
                messages::publish(
                    self.inner.bus.as_ref(),
                    &SeatPaymentDetail {
                        payment_id: payment.id,
                        concert_id: reservation.concert_id,
                        seat_id,
                        seat_lock_id,
                        timestamp: now,
                        retry_count,
                    },
                )
                .await;
            }
        }
    }

    async fn transition(
        &self,
        payment_id: PaymentId,
        transition: PaymentTransition,
        failure_reason: Option<String>,
    ) -> Result<Conditional<Payment>> {
        self.inner
            .payments
            .transition_payment(
                payment_id,
                transition.allowed_from(),
                transition.target(),
                failure_reason,
                self.inner.clock.now(),
            )
            .await
    }

    /// Move the reservation along with its payment.
    ///
    /// The payment transition already committed, so a reservation in an
    /// unexpected state is logged rather than surfaced. Returns the reservation
    /// whenever it exists.
    async fn transition_reservation(
        &self,
        reservation_id: ReservationId,
        transition: ReservationTransition,
    ) -> Option<Reservation> {
        let result = self
            .inner
            .reservations
            .transition_reservation(
                reservation_id,
                transition.allowed_from(),
                transition.target(),
                self.inner.clock.now(),
            )
            .await;
        match result {
            Ok(Conditional::Updated(reservation)) => Some(reservation),
            Ok(Conditional::Conflict(reservation)) => {
                warn!(
                    reservation_id = %reservation_id,
                    status = %reservation.status,
                    ?transition,
                    "Reservation not in expected state"
                );
                Some(reservation)
            }
            Ok(Conditional::Missing) => {
                error!(reservation_id = %reservation_id, "Reservation of payment is missing");
                None
            }
            Err(e) => {
                error!(reservation_id = %reservation_id, error = %e, "Reservation transition failed");
                None
            }
        }
    }

    async fn find_payment(&self, payment_id: PaymentId) -> Result<Payment> {
        self.inner
            .payments
            .find_payment(payment_id)
            .await?
            .ok_or_else(|| TicketingError::not_found("payment", payment_id))
    }

    async fn owned_payment(&self, user_id: &UserId, payment_id: PaymentId) -> Result<Payment> {
        let payment = self.find_payment(payment_id).await?;
        if !payment.is_owned_by(user_id) {
            return Err(TicketingError::OwnershipViolation(format!(
                "payment {payment_id} does not belong to {user_id}"
            )));
        }
        Ok(payment)
    }
}

fn rejection(current: &Payment, transition: PaymentTransition) -> TicketingError {
    current
        .status
        .apply(transition)
        .err()
        .unwrap_or_else(|| TicketingError::StateConflict(format!("payment {} changed concurrently", current.id)))
}

fn outcome_message(payment: &Payment, timestamp: chrono::DateTime<chrono::Utc>) -> PaymentOutcome {
    PaymentOutcome {
        payment_id: payment.id,
        reservation_id: payment.reservation_id,
        user_id: payment.user_id.clone(),
        amount: payment.amount,
        status: payment.status,
        retry_count: payment.retry_count,
        failure_reason: payment.failure_reason.clone(),
        timestamp,
    }
}
