//! Message trait and related types for asynchronous message contracts.
//!
//! Messages are facts or requests exchanged with other services through the
//! message bus (queue registration, payment outcomes, ...). Unlike internal
//! state they cross process boundaries, so they are serialized as JSON: any
//! consumer, in any language, can read them.
//!
//! # Example
//!
//! ```
//! use box_office_core::message::Message;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct SeatReleased {
//!     seat_id: String,
//! }
//!
//! impl Message for SeatReleased {
//!     fn message_type(&self) -> &'static str {
//!         "seat.released.v1"
//!     }
//! }
//! ```

use serde::{Serialize, de::DeserializeOwned};
use std::fmt;
use thiserror::Error;

/// Error types for message operations.
#[derive(Error, Debug)]
pub enum MessageError {
    /// Failed to serialize message to JSON.
    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    /// Failed to deserialize message from JSON.
    #[error("Failed to deserialize message: {0}")]
    DeserializationError(String),

    /// The payload carries a different message type than expected.
    #[error("Unexpected message type: expected {expected}, got {actual}")]
    UnexpectedType {
        /// Type the caller asked for
        expected: String,
        /// Type found on the wire
        actual: String,
    },
}

/// A message that can be published on the message bus.
///
/// # Naming Convention
///
/// `message_type()` returns a stable, dotted identifier that doubles as the
/// routing key, e.g. `"payment.success"` or `"waiting-queue.register"`.
pub trait Message: Send + Sync + 'static {
    /// Returns the message type identifier.
    fn message_type(&self) -> &'static str;

    /// Serialize this message to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::SerializationError` if the message cannot be serialized.
    fn to_json(&self) -> Result<Vec<u8>, MessageError>
    where
        Self: Serialize,
    {
        serde_json::to_vec(self).map_err(|e| MessageError::SerializationError(e.to_string()))
    }

    /// Deserialize a message from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::DeserializationError` if the bytes do not match the schema.
    fn from_json(bytes: &[u8]) -> Result<Self, MessageError>
    where
        Self: DeserializeOwned + Sized,
    {
        serde_json::from_slice(bytes).map_err(|e| MessageError::DeserializationError(e.to_string()))
    }
}

/// A serialized message ready for the bus.
///
/// This is the wire format between the services and the message bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SerializedMessage {
    /// The message type identifier (e.g., `"payment.success"`).
    pub message_type: String,

    /// The JSON-serialized message body.
    pub payload: Vec<u8>,

    /// Optional metadata.
    ///
    /// Common metadata fields:
    /// - `correlation_id`: Links related messages (usually the payment id)
    /// - `published_at`: When the message was published (ISO 8601)
    pub metadata: Option<serde_json::Value>,
}

impl SerializedMessage {
    /// Create a new serialized message.
    #[must_use]
    pub const fn new(
        message_type: String,
        payload: Vec<u8>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            message_type,
            payload,
            metadata,
        }
    }

    /// Create a serialized message from a [`Message`].
    ///
    /// # Errors
    ///
    /// Returns `MessageError::SerializationError` if the message cannot be serialized.
    pub fn from_message<M: Message + Serialize>(
        message: &M,
        metadata: Option<serde_json::Value>,
    ) -> Result<Self, MessageError> {
        Ok(Self {
            message_type: message.message_type().to_string(),
            payload: message.to_json()?,
            metadata,
        })
    }

    /// Decode the payload into a concrete message, checking its type tag.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::UnexpectedType` when `expected_type` does not match,
    /// or `MessageError::DeserializationError` when the payload is malformed.
    pub fn decode<M: Message + DeserializeOwned>(
        &self,
        expected_type: &str,
    ) -> Result<M, MessageError> {
        if self.message_type != expected_type {
            return Err(MessageError::UnexpectedType {
                expected: expected_type.to_string(),
                actual: self.message_type.clone(),
            });
        }
        M::from_json(&self.payload)
    }

    /// Payload as a JSON value, mostly for logging and assertions.
    ///
    /// # Errors
    ///
    /// Returns `MessageError::DeserializationError` if the payload is not JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value, MessageError> {
        serde_json::from_slice(&self.payload)
            .map_err(|e| MessageError::DeserializationError(e.to_string()))
    }
}

impl fmt::Display for SerializedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedMessage {{ type: {}, size: {} bytes }}",
            self.message_type,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct SeatHeld {
        seat_id: String,
        user_id: String,
    }

    impl Message for SeatHeld {
        fn message_type(&self) -> &'static str {
            "seat.held"
        }
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn serialized_message_uses_json_payload() {
        let message = SeatHeld {
            seat_id: "42".to_string(),
            user_id: "alice".to_string(),
        };

        let serialized = SerializedMessage::from_message(&message, None)
            .expect("serialization should succeed");

        assert_eq!(serialized.message_type, "seat.held");
        let json = serialized.payload_json().expect("payload is json");
        assert_eq!(json["seatId"], "42");
        assert_eq!(json["userId"], "alice");
    }

    #[test]
    #[allow(clippy::expect_used)]
    fn decode_rejects_other_message_types() {
        let message = SeatHeld {
            seat_id: "1".to_string(),
            user_id: "bob".to_string(),
        };
        let serialized =
            SerializedMessage::from_message(&message, None).expect("serialization should succeed");

        let result = serialized.decode::<SeatHeld>("seat.released");
        assert!(matches!(result, Err(MessageError::UnexpectedType { .. })));

        let decoded = serialized
            .decode::<SeatHeld>("seat.held")
            .expect("matching type decodes");
        assert_eq!(decoded, message);
    }

    #[test]
    fn serialized_message_display() {
        let serialized = SerializedMessage::new("seat.held".to_string(), vec![b'{', b'}'], None);
        let display = format!("{serialized}");
        assert!(display.contains("seat.held"));
        assert!(display.contains("2 bytes"));
    }
}
