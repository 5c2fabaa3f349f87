//! Payments and the saga that drives them to a terminal state.
//!
//! ```text
//! PENDING ──complete──▶ COMPLETED ──cancel──▶ CANCELLED
//!    │                                         ▲
//!    ├──fail──▶ FAILED                         │
//!    └──cancel─────────────────────────────────┘
//! ```

pub mod gateway;
pub mod saga;

pub use gateway::{GatewayError, GatewayStatus, PaymentGateway, ScriptedPaymentGateway, SimulatedPaymentGateway};
pub use saga::{PaymentSaga, SagaSettings};

use crate::error::{Result, TicketingError};
use crate::types::{Money, PaymentId, PaymentMethod, ReservationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a payment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    /// Being driven against the gateway
    Pending,
    /// Paid
    Completed,
    /// Gave up; terminal
    Failed,
    /// Cancelled by the user; terminal
    Cancelled,
}

/// A payment state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PaymentTransition {
    /// `PENDING → COMPLETED`
    Complete,
    /// `PENDING → FAILED`
    Fail,
    /// `PENDING | COMPLETED → CANCELLED`
    Cancel,
}

impl PaymentTransition {
    /// Statuses the transition may start from.
    #[must_use]
    pub const fn allowed_from(self) -> &'static [PaymentStatus] {
        match self {
            Self::Complete | Self::Fail => &[PaymentStatus::Pending],
            Self::Cancel => &[PaymentStatus::Pending, PaymentStatus::Completed],
        }
    }

    /// Status after the transition.
    #[must_use]
    pub const fn target(self) -> PaymentStatus {
        match self {
            Self::Complete => PaymentStatus::Completed,
            Self::Fail => PaymentStatus::Failed,
            Self::Cancel => PaymentStatus::Cancelled,
        }
    }
}

impl PaymentStatus {
    /// Apply a transition.
    ///
    /// # Errors
    ///
    /// [`TicketingError::StateConflict`] if the transition is not legal from `self`.
    pub fn apply(self, transition: PaymentTransition) -> Result<Self> {
        if transition.allowed_from().contains(&self) {
            Ok(transition.target())
        } else {
            Err(TicketingError::StateConflict(format!(
                "payment is {self}, cannot {transition:?}"
            )))
        }
    }

    /// Anything but PENDING.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Stable string form, used for storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = TicketingError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(TicketingError::Storage(format!("unknown payment status: {other}"))),
        }
    }
}

/// Payment of one reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Payment id
    pub id: PaymentId,
    /// Paid reservation (one payment per reservation)
    pub reservation_id: ReservationId,
    /// Payer
    pub user_id: UserId,
    /// Amount in minor units, equal to the reservation total
    pub amount: Money,
    /// Payment method
    pub method: PaymentMethod,
    /// Current status
    pub status: PaymentStatus,
    /// Gateway id of the latest attempt
    pub gateway_payment_id: Option<String>,
    /// Gateway attempts made so far
    pub retry_count: u32,
    /// Why the payment failed
    pub failure_reason: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    /// A new PENDING payment with no gateway attempt yet.
    #[must_use]
    pub fn new(
        reservation_id: ReservationId,
        user_id: UserId,
        amount: Money,
        method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: PaymentId::new(),
            reservation_id,
            user_id,
            amount,
            method,
            status: PaymentStatus::Pending,
            gateway_payment_id: None,
            retry_count: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `user_id` made the payment.
    #[must_use]
    pub fn is_owned_by(&self, user_id: &UserId) -> bool {
        &self.user_id == user_id
    }
}
