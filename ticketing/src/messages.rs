//! Asynchronous message contracts.
//!
//! Every message is camelCase JSON and its message type doubles as the topic.
//! Publishing happens after the state change is committed and is best effort:
//! a bus failure is logged and never rolls back the committed transition.

use crate::payment::PaymentStatus;
use crate::types::{ConcertId, LockId, Money, PaymentId, PaymentMethod, QueueEntryId, ReservationId, SeatId, UserId};
use box_office_core::message::{Message, SerializedMessage};
use box_office_core::message_bus::MessageBus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Message types (and topics).
pub mod topics {
    /// A user joined a concert's waiting queue
    pub const QUEUE_REGISTER: &str = "waiting-queue.register";
    /// A waiting user was admitted
    pub const QUEUE_PROCESS: &str = "waiting-queue.process";
    /// An admitted user entered seat selection
    pub const QUEUE_ENTER: &str = "waiting-queue.enter";
    /// A payment was requested and is being driven
    pub const PAYMENT_PROCESS: &str = "payment.process";
    /// A payment completed
    pub const PAYMENT_SUCCESS: &str = "payment.success";
    /// A payment failed for good
    pub const PAYMENT_FAILURE: &str = "payment.failure";
    /// Per-seat detail of a completed payment
    pub const PAYMENT_SUCCESS_DETAILED: &str = "payment.success.detailed";
    /// Per-seat detail of a failed payment
    pub const PAYMENT_FAILURE_DETAILED: &str = "payment.failure.detailed";
}

/// Waiting-queue entry change, published for register, admission and entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntryMessage {
    /// Entry id
    pub entry_id: QueueEntryId,
    /// Concert
    pub concert_id: ConcertId,
    /// User
    pub user_id: UserId,
    /// Position in the concert's queue
    pub queue_position: u64,
    /// When the change happened
    pub timestamp: DateTime<Utc>,
}

macro_rules! queue_message {
    ($(#[$meta:meta])* $name:ident, $topic:expr) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub QueueEntryMessage);

        impl Message for $name {
            fn message_type(&self) -> &'static str {
                $topic
            }
        }
    };
}

queue_message!(
    /// `waiting-queue.register`
    QueueRegistered,
    topics::QUEUE_REGISTER
);
queue_message!(
    /// `waiting-queue.process`
    QueueAdmitted,
    topics::QUEUE_PROCESS
);
queue_message!(
    /// `waiting-queue.enter`
    QueueEntered,
    topics::QUEUE_ENTER
);

/// `payment.process`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequested {
    /// Payment
    pub payment_id: PaymentId,
    /// Reservation being paid
    pub reservation_id: ReservationId,
    /// Payer
    pub user_id: UserId,
    /// Amount in minor units
    pub amount: Money,
    /// Payment method
    pub method: PaymentMethod,
    /// When the payment was requested
    pub timestamp: DateTime<Utc>,
}

impl Message for PaymentRequested {
    fn message_type(&self) -> &'static str {
        topics::PAYMENT_PROCESS
    }
}

/// Terminal payment outcome, published as `payment.success` or `payment.failure`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOutcome {
    /// Payment
    pub payment_id: PaymentId,
    /// Reservation
    pub reservation_id: ReservationId,
    /// Payer
    pub user_id: UserId,
    /// Amount in minor units
    pub amount: Money,
    /// Terminal status
    pub status: PaymentStatus,
    /// Gateway attempts made
    pub retry_count: u32,
    /// Why the payment failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// When the outcome was recorded
    pub timestamp: DateTime<Utc>,
}

impl Message for PaymentOutcome {
    fn message_type(&self) -> &'static str {
        if self.status == PaymentStatus::Completed {
            topics::PAYMENT_SUCCESS
        } else {
            topics::PAYMENT_FAILURE
        }
    }
}

/// Per-seat payment detail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeatPaymentDetail {
    /// Payment
    pub payment_id: PaymentId,
    /// Concert of the seat
    pub concert_id: ConcertId,
    /// The seat
    pub seat_id: SeatId,
    /// Lock that held the seat, if one was still present
    pub seat_lock_id: Option<LockId>,
    /// When the seat was settled or released
    pub timestamp: DateTime<Utc>,
    /// Gateway attempts made (failures only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl Message for SeatPaymentDetail {
    fn message_type(&self) -> &'static str {
        if self.retry_count.is_some() {
            topics::PAYMENT_FAILURE_DETAILED
        } else {
            topics::PAYMENT_SUCCESS_DETAILED
        }
    }
}

/// Serialize and publish, logging instead of failing.
///
/// Returns whether the message reached the bus.
pub async fn publish<M>(bus: &dyn MessageBus, message: &M) -> bool
where
    M: Message + Serialize,
{
    let serialized = match SerializedMessage::from_message(message, None) {
        Ok(serialized) => serialized,
        Err(e) => {
            warn!(message_type = message.message_type(), error = %e, "Failed to serialize message");
            return false;
        }
    };

    match bus.publish(message.message_type(), &serialized).await {
        Ok(()) => true,
        Err(e) => {
            warn!(message_type = message.message_type(), error = %e, "Failed to publish message");
            false
        }
    }
}
