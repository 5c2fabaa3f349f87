//! Payment gateway port and the gateways used for development and tests.
//!
//! A real processor (card network, bank transfer, mobile pay) answers
//! asynchronously: a request returns a gateway payment id immediately and the
//! outcome is polled or pushed later by callback. Every attempt gets a fresh
//! gateway id.

use crate::types::{Money, PaymentId, PaymentMethod};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Gateway result.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Gateway failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The processor refused the request
    #[error("payment declined: {reason}")]
    Declined {
        /// Decline reason
        reason: String,
    },
    /// The gateway did not answer in time
    #[error("gateway timeout")]
    Timeout,
    /// The gateway could not be reached
    #[error("gateway unavailable: {0}")]
    Unavailable(String),
    /// The gateway does not know the payment id
    #[error("unknown gateway payment: {0}")]
    UnknownPayment(String),
}

/// What the gateway reports for one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayStatus {
    /// Charged
    Completed,
    /// Refused or abandoned
    Failed,
    /// Still being processed
    InProgress,
}

/// Payment gateway port.
///
/// Abstraction over payment processors.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Start a charge. Returns the gateway's payment id.
    async fn request_payment(
        &self,
        payment_id: PaymentId,
        amount: Money,
        method: PaymentMethod,
    ) -> GatewayResult<String>;

    /// Current status of a charge.
    async fn get_payment_status(&self, gateway_payment_id: &str) -> GatewayResult<GatewayStatus>;

    /// Cancel (or refund) a charge.
    async fn cancel_payment(&self, gateway_payment_id: &str) -> GatewayResult<()>;

    /// Whether the gateway vouches for a charge of `amount` under this id.
    async fn verify_payment(&self, gateway_payment_id: &str, amount: Money) -> GatewayResult<bool>;
}

#[derive(Debug, Clone)]
struct Charge {
    amount: Money,
    polls_left: u32,
    outcome: GatewayStatus,
    cancelled: bool,
}

impl Charge {
    fn poll(&mut self) -> GatewayStatus {
        if self.cancelled {
            return GatewayStatus::Failed;
        }
        if self.polls_left > 0 {
            self.polls_left -= 1;
            return GatewayStatus::InProgress;
        }
        self.outcome
    }
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Gateway simulating a processor with a fixed success rate.
///
/// Each charge reports IN_PROGRESS for `settle_after_polls` polls and then
/// settles to an outcome drawn at request time.
#[derive(Clone, Debug)]
pub struct SimulatedPaymentGateway {
    success_rate: f64,
    settle_after_polls: u32,
    latency: Duration,
    charges: Arc<Mutex<HashMap<String, Charge>>>,
}

impl SimulatedPaymentGateway {
    /// A gateway that approves `success_rate` (clamped to `[0, 1]`) of all charges.
    #[must_use]
    pub fn new(success_rate: f64) -> Self {
        Self {
            success_rate: success_rate.clamp(0.0, 1.0),
            settle_after_polls: 1,
            latency: Duration::ZERO,
            charges: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of IN_PROGRESS answers before a charge settles.
    #[must_use]
    pub const fn settle_after_polls(mut self, polls: u32) -> Self {
        self.settle_after_polls = polls;
        self
    }

    /// Simulated network latency per call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Creates an Arc-wrapped instance for sharing
    #[must_use]
    pub fn shared(success_rate: f64) -> Arc<dyn PaymentGateway> {
        Arc::new(Self::new(success_rate))
    }

    async fn network(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for SimulatedPaymentGateway {
    fn default() -> Self {
        Self::new(0.8)
    }
}

#[async_trait]
impl PaymentGateway for SimulatedPaymentGateway {
    async fn request_payment(
        &self,
        payment_id: PaymentId,
        amount: Money,
        method: PaymentMethod,
    ) -> GatewayResult<String> {
        self.network().await;

        let approved = rand::thread_rng().gen_bool(self.success_rate);
        let gateway_payment_id = format!("sim_{}", uuid::Uuid::new_v4().simple());
        let outcome = if approved {
            GatewayStatus::Completed
        } else {
            GatewayStatus::Failed
        };

        guard(&self.charges).insert(
            gateway_payment_id.clone(),
            Charge {
                amount,
                polls_left: self.settle_after_polls,
                outcome,
                cancelled: false,
            },
        );

        tracing::debug!(
            payment_id = %payment_id,
            gateway_payment_id = %gateway_payment_id,
            amount = amount.cents(),
            method = %method,
            ?outcome,
            "Simulated charge requested"
        );
        Ok(gateway_payment_id)
    }

    async fn get_payment_status(&self, gateway_payment_id: &str) -> GatewayResult<GatewayStatus> {
        self.network().await;
        guard(&self.charges)
            .get_mut(gateway_payment_id)
            .map(Charge::poll)
            .ok_or_else(|| GatewayError::UnknownPayment(gateway_payment_id.to_string()))
    }

    async fn cancel_payment(&self, gateway_payment_id: &str) -> GatewayResult<()> {
        self.network().await;
        let mut charges = guard(&self.charges);
        let charge = charges
            .get_mut(gateway_payment_id)
            .ok_or_else(|| GatewayError::UnknownPayment(gateway_payment_id.to_string()))?;
        charge.cancelled = true;
        Ok(())
    }

    async fn verify_payment(&self, gateway_payment_id: &str, amount: Money) -> GatewayResult<bool> {
        self.network().await;
        Ok(guard(&self.charges)
            .get(gateway_payment_id)
            .is_some_and(|charge| charge.amount == amount))
    }
}

#[derive(Debug, Clone, Copy)]
enum ScriptStep {
    Charge { in_progress: u32, outcome: GatewayStatus },
    RequestError,
}

#[derive(Debug, Default)]
struct Script {
    steps: VecDeque<ScriptStep>,
    charges: HashMap<String, Charge>,
}

/// Deterministic gateway for tests.
///
/// Each `request_payment` consumes the next scripted step; once the script is
/// exhausted every charge settles to the default outcome on its first poll.
///
/// ```
/// use ticketing::payment::{GatewayStatus, ScriptedPaymentGateway};
///
/// let gateway = ScriptedPaymentGateway::new()
///     .then_fail()
///     .then_in_progress(2, GatewayStatus::Completed);
/// assert_eq!(gateway.request_count(), 0);
/// ```
#[derive(Clone, Debug)]
pub struct ScriptedPaymentGateway {
    script: Arc<Mutex<Script>>,
    default_outcome: GatewayStatus,
    requests: Arc<AtomicU64>,
    polls: Arc<AtomicU64>,
    cancels: Arc<AtomicU64>,
    counter: Arc<AtomicU64>,
    failing_cancellations: Arc<AtomicBool>,
    failing_status: Arc<AtomicBool>,
}

impl Default for ScriptedPaymentGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedPaymentGateway {
    /// An empty script whose charges complete.
    #[must_use]
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            default_outcome: GatewayStatus::Completed,
            requests: Arc::new(AtomicU64::new(0)),
            polls: Arc::new(AtomicU64::new(0)),
            cancels: Arc::new(AtomicU64::new(0)),
            counter: Arc::new(AtomicU64::new(0)),
            failing_cancellations: Arc::new(AtomicBool::new(false)),
            failing_status: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Outcome of charges requested after the script runs out.
    #[must_use]
    pub const fn with_default(mut self, outcome: GatewayStatus) -> Self {
        self.default_outcome = outcome;
        self
    }

    /// Next charge fails on its first poll.
    #[must_use]
    pub fn then_fail(self) -> Self {
        self.push(ScriptStep::Charge {
            in_progress: 0,
            outcome: GatewayStatus::Failed,
        })
    }

    /// Next charge completes on its first poll.
    #[must_use]
    pub fn then_complete(self) -> Self {
        self.push(ScriptStep::Charge {
            in_progress: 0,
            outcome: GatewayStatus::Completed,
        })
    }

    /// Next charge reports IN_PROGRESS `polls` times, then `outcome`.
    #[must_use]
    pub fn then_in_progress(self, polls: u32, outcome: GatewayStatus) -> Self {
        self.push(ScriptStep::Charge {
            in_progress: polls,
            outcome,
        })
    }

    /// Next `request_payment` call errors.
    #[must_use]
    pub fn then_request_error(self) -> Self {
        self.push(ScriptStep::RequestError)
    }

    fn push(self, step: ScriptStep) -> Self {
        guard(&self.script).steps.push_back(step);
        self
    }

    /// Make `cancel_payment` fail (or succeed again).
    pub fn fail_cancellations(&self, failing: bool) {
        self.failing_cancellations.store(failing, Ordering::SeqCst);
    }

    /// Make `get_payment_status` fail (or succeed again).
    pub fn fail_status_queries(&self, failing: bool) {
        self.failing_status.store(failing, Ordering::SeqCst);
    }

    /// Settle a charge immediately, as a processor callback would.
    ///
    /// Returns `false` for an unknown gateway id.
    pub fn resolve(&self, gateway_payment_id: &str, outcome: GatewayStatus) -> bool {
        match guard(&self.script).charges.get_mut(gateway_payment_id) {
            Some(charge) => {
                charge.polls_left = 0;
                charge.outcome = outcome;
                true
            }
            None => false,
        }
    }

    /// `request_payment` calls so far.
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::SeqCst)
    }

    /// `get_payment_status` calls so far.
    #[must_use]
    pub fn poll_count(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }

    /// `cancel_payment` calls so far.
    #[must_use]
    pub fn cancel_count(&self) -> u64 {
        self.cancels.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedPaymentGateway {
    async fn request_payment(
        &self,
        _payment_id: PaymentId,
        amount: Money,
        _method: PaymentMethod,
    ) -> GatewayResult<String> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let mut script = guard(&self.script);
        let step = script.steps.pop_front().unwrap_or(ScriptStep::Charge {
            in_progress: 0,
            outcome: self.default_outcome,
        });

        match step {
            ScriptStep::RequestError => Err(GatewayError::Unavailable("scripted request error".to_string())),
            ScriptStep::Charge { in_progress, outcome } => {
                let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                let gateway_payment_id = format!("scripted_{n}");
                script.charges.insert(
                    gateway_payment_id.clone(),
                    Charge {
                        amount,
                        polls_left: in_progress,
                        outcome,
                        cancelled: false,
                    },
                );
                Ok(gateway_payment_id)
            }
        }
    }

    async fn get_payment_status(&self, gateway_payment_id: &str) -> GatewayResult<GatewayStatus> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if self.failing_status.load(Ordering::SeqCst) {
            return Err(GatewayError::Timeout);
        }
        guard(&self.script)
            .charges
            .get_mut(gateway_payment_id)
            .map(Charge::poll)
            .ok_or_else(|| GatewayError::UnknownPayment(gateway_payment_id.to_string()))
    }

    async fn cancel_payment(&self, gateway_payment_id: &str) -> GatewayResult<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        if self.failing_cancellations.load(Ordering::SeqCst) {
            return Err(GatewayError::Unavailable("scripted cancel error".to_string()));
        }
        let mut script = guard(&self.script);
        let charge = script
            .charges
            .get_mut(gateway_payment_id)
            .ok_or_else(|| GatewayError::UnknownPayment(gateway_payment_id.to_string()))?;
        charge.cancelled = true;
        Ok(())
    }

    async fn verify_payment(&self, gateway_payment_id: &str, amount: Money) -> GatewayResult<bool> {
        Ok(guard(&self.script)
            .charges
            .get(gateway_payment_id)
            .is_some_and(|charge| charge.amount == amount))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_steps_are_consumed_in_order() {
        let gateway = ScriptedPaymentGateway::new()
            .then_request_error()
            .then_in_progress(1, GatewayStatus::Failed)
            .with_default(GatewayStatus::Completed);
        let amount = Money::from_cents(1_000);

        let first = gateway.request_payment(PaymentId::new(), amount, PaymentMethod::CreditCard).await;
        assert!(matches!(first, Err(GatewayError::Unavailable(_))));

        let second = gateway.request_payment(PaymentId::new(), amount, PaymentMethod::CreditCard).await.unwrap();
        assert_eq!(gateway.get_payment_status(&second).await.unwrap(), GatewayStatus::InProgress);
        assert_eq!(gateway.get_payment_status(&second).await.unwrap(), GatewayStatus::Failed);

        let third = gateway.request_payment(PaymentId::new(), amount, PaymentMethod::CreditCard).await.unwrap();
        assert_ne!(second, third);
        assert_eq!(gateway.get_payment_status(&third).await.unwrap(), GatewayStatus::Completed);
        assert_eq!(gateway.request_count(), 3);
    }

    #[tokio::test]
    async fn verify_checks_amount() {
        let gateway = ScriptedPaymentGateway::new();
        let gid = gateway
            .request_payment(PaymentId::new(), Money::from_cents(500), PaymentMethod::BankTransfer)
            .await
            .unwrap();

        assert!(gateway.verify_payment(&gid, Money::from_cents(500)).await.unwrap());
        assert!(!gateway.verify_payment(&gid, Money::from_cents(400)).await.unwrap());
        assert!(!gateway.verify_payment("nope", Money::from_cents(500)).await.unwrap());
    }

    #[tokio::test]
    async fn simulated_gateway_settles_after_polls() {
        let gateway = SimulatedPaymentGateway::new(1.0).settle_after_polls(2);
        let gid = gateway
            .request_payment(PaymentId::new(), Money::from_cents(100), PaymentMethod::MobilePay)
            .await
            .unwrap();

        assert_eq!(gateway.get_payment_status(&gid).await.unwrap(), GatewayStatus::InProgress);
        assert_eq!(gateway.get_payment_status(&gid).await.unwrap(), GatewayStatus::InProgress);
        assert_eq!(gateway.get_payment_status(&gid).await.unwrap(), GatewayStatus::Completed);

        gateway.cancel_payment(&gid).await.unwrap();
        assert_eq!(gateway.get_payment_status(&gid).await.unwrap(), GatewayStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_charge_is_an_error() {
        let gateway = SimulatedPaymentGateway::new(0.0);
        let result = gateway.get_payment_status("missing").await;
        assert_eq!(result, Err(GatewayError::UnknownPayment("missing".to_string())));
    }
}
