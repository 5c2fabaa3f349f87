//! Message bus abstraction for the asynchronous message contracts.
//!
//! The services publish queue and payment messages through the [`MessageBus`]
//! trait. The broker itself (Kafka, RabbitMQ, ...) is an external collaborator;
//! only the contracts are owned here.
//!
//! # Key Principles
//!
//! - **State first**: Local state is persisted before the message is published
//! - **At-least-once delivery**: Consumers must tolerate duplicates
//! - **Best effort on the publisher side**: A publish failure is logged by the
//!   caller and never rolls back a committed state transition
//!
//! # Topic Naming Convention
//!
//! The message type is used as the topic (`"payment.success"`,
//! `"waiting-queue.enter"`, ...).

use crate::message::SerializedMessage;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during message bus operations.
#[derive(Error, Debug, Clone)]
pub enum MessageBusError {
    /// Failed to connect to the message bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Generic error for other failures
    #[error("Message bus error: {0}")]
    Other(String),
}

/// Stream of messages from subscriptions.
pub type MessageStream =
    Pin<Box<dyn Stream<Item = Result<SerializedMessage, MessageBusError>> + Send>>;

/// Trait for message bus implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so services can hold it as `Arc<dyn MessageBus>`.
pub trait MessageBus: Send + Sync {
    /// Publish a message to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::PublishFailed`] if the publish operation fails.
    fn publish(
        &self,
        topic: &str,
        message: &SerializedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessageBusError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a stream of messages.
    ///
    /// # Errors
    ///
    /// Returns [`MessageBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, MessageBusError>> + Send + '_>>;
}

/// A bus that accepts and drops every message.
///
/// Useful when a deployment has no broker configured; the services still run
/// and log what they would have published.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMessageBus;

impl MessageBus for NoopMessageBus {
    fn publish(
        &self,
        _topic: &str,
        _message: &SerializedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessageBusError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }

    fn subscribe(
        &self,
        _topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, MessageBusError>> + Send + '_>> {
        Box::pin(async {
            let stream: MessageStream = Box::pin(futures::stream::empty());
            Ok(stream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    #[allow(clippy::expect_used)]
    async fn noop_bus_accepts_and_yields_nothing() {
        let bus = NoopMessageBus;
        let message = SerializedMessage::new("seat.held".to_string(), b"{}".to_vec(), None);

        bus.publish("seat.held", &message)
            .await
            .expect("noop publish never fails");

        let mut stream = bus
            .subscribe(&["seat.held"])
            .await
            .expect("noop subscribe never fails");
        assert!(stream.next().await.is_none());
    }
}
