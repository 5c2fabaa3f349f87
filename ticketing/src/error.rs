//! Error type shared by every ticketing operation.

use crate::types::{ConcertId, SeatId, UserId};
use std::fmt::Display;
use thiserror::Error;

/// Result alias for ticketing operations.
pub type Result<T> = std::result::Result<T, TicketingError>;

/// Everything a ticketing operation can fail with.
///
/// Validation, ownership and state errors are the caller's fault (4xx in an
/// HTTP layer); `ExternalGateway` and `Storage` are infrastructure failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TicketingError {
    /// The referenced entity does not exist
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity ("seat", "payment", ...)
        entity: &'static str,
        /// Identifier that was looked up
        id: String,
    },

    /// The entity is not in the state the operation requires
    #[error("state conflict: {0}")]
    StateConflict(String),

    /// The user already has an active waiting-queue entry for the concert
    #[error("user {user_id} is already registered in the queue for concert {concert_id}")]
    AlreadyRegistered {
        /// Concert the user tried to queue for
        concert_id: ConcertId,
        /// The user
        user_id: UserId,
    },

    /// Another user holds an unexpired lock on the seat
    #[error("seat {seat_id} is locked by another user")]
    AlreadyLocked {
        /// The contested seat
        seat_id: SeatId,
    },

    /// A lock or queue admission is past its deadline
    #[error("expired: {0}")]
    Expired(String),

    /// The caller does not own the lock, reservation or payment
    #[error("ownership violation: {0}")]
    OwnershipViolation(String),

    /// The payment gateway was unreachable or answered unexpectedly
    #[error("payment gateway error: {0}")]
    ExternalGateway(String),

    /// The payment saga gave up after its attempt budget
    #[error("payment retries exhausted after {attempts} attempts")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
    },

    /// The storage adapter failed
    #[error("storage error: {0}")]
    Storage(String),

    /// The request itself is malformed
    #[error("validation error: {0}")]
    Validation(String),
}

impl TicketingError {
    /// Shorthand for [`TicketingError::NotFound`].
    pub fn not_found(entity: &'static str, id: impl Display) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the error is the caller's fault rather than an infrastructure failure.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        !matches!(
            self,
            Self::ExternalGateway(_) | Self::Storage(_) | Self::RetriesExhausted { .. }
        )
    }

    /// Whether the error is a state conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::StateConflict(_))
    }
}

impl From<sqlx::Error> for TicketingError {
    fn from(error: sqlx::Error) -> Self {
        Self::Storage(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_classified() {
        assert!(TicketingError::not_found("seat", SeatId::new()).is_client_error());
        assert!(TicketingError::StateConflict("seat is SOLD".into()).is_client_error());
        assert!(!TicketingError::Storage("connection reset".into()).is_client_error());
        assert!(!TicketingError::ExternalGateway("timeout".into()).is_client_error());
        assert!(!TicketingError::RetriesExhausted { attempts: 5 }.is_client_error());
    }

    #[test]
    fn not_found_message_names_entity() {
        let error = TicketingError::not_found("payment", "p-1");
        assert_eq!(error.to_string(), "payment not found: p-1");
    }
}
