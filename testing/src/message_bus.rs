//! In-memory [`MessageBus`] that records every publish.
//!
//! Tests assert on what the services emitted (`published_of("payment.success")`)
//! and can also subscribe, in which case messages are fanned out over a tokio
//! broadcast channel.

use box_office_core::message::SerializedMessage;
use box_office_core::message_bus::{MessageBus, MessageBusError, MessageStream};
use futures::StreamExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 1024;

/// A message as it was handed to the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Topic it was published to
    pub topic: String,
    /// The message itself
    pub message: SerializedMessage,
}

impl PublishedMessage {
    /// Payload parsed as JSON.
    ///
    /// Returns `Value::Null` if the payload is not valid JSON.
    #[must_use]
    pub fn json(&self) -> serde_json::Value {
        self.message.payload_json().unwrap_or(serde_json::Value::Null)
    }
}

/// Recording message bus for tests.
///
/// Clones share the same log and subscribers.
#[derive(Debug, Clone)]
pub struct InMemoryMessageBus {
    published: Arc<Mutex<Vec<PublishedMessage>>>,
    sender: broadcast::Sender<PublishedMessage>,
    failing: Arc<AtomicBool>,
}

impl Default for InMemoryMessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMessageBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            published: Arc::new(Mutex::new(Vec::new())),
            sender,
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every subsequent publish fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Everything published so far, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Published messages with the given message type.
    #[must_use]
    pub fn published_of(&self, message_type: &str) -> Vec<PublishedMessage> {
        self.published()
            .into_iter()
            .filter(|entry| entry.message.message_type == message_type)
            .collect()
    }

    /// Number of published messages with the given message type.
    #[must_use]
    pub fn count_of(&self, message_type: &str) -> usize {
        self.published_of(message_type).len()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl MessageBus for InMemoryMessageBus {
    fn publish(
        &self,
        topic: &str,
        message: &SerializedMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), MessageBusError>> + Send + '_>> {
        let entry = PublishedMessage {
            topic: topic.to_string(),
            message: message.clone(),
        };
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(MessageBusError::PublishFailed {
                    topic: entry.topic,
                    reason: "bus configured to fail".to_string(),
                });
            }
            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(entry.clone());
            // No subscribers is fine.
            let _ = self.sender.send(entry);
            Ok(())
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, MessageBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|topic| (*topic).to_string()).collect();
        let receiver = self.sender.subscribe();
        Box::pin(async move {
            let stream = futures::stream::unfold(receiver, |mut receiver| async move {
                match receiver.recv().await {
                    Ok(entry) => Some((Ok(entry), receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        let error = MessageBusError::Other(format!("subscriber lagged by {skipped} messages"));
                        Some((Err(error), receiver))
                    }
                    Err(broadcast::error::RecvError::Closed) => None,
                }
            })
            .filter_map(move |item| {
                let item = match item {
                    Ok(entry) if topics.contains(&entry.topic) => Some(Ok(entry.message)),
                    Ok(_) => None,
                    Err(error) => Some(Err(error)),
                };
                async move { item }
            });

            let stream: MessageStream = Box::pin(stream);
            Ok(stream)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(message_type: &str) -> SerializedMessage {
        SerializedMessage::new(message_type.to_string(), br#"{"seatId":1}"#.to_vec(), None)
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn records_published_messages_in_order() {
        let bus = InMemoryMessageBus::new();
        bus.publish("payment.process", &message("payment.process")).await.unwrap();
        bus.publish("payment.success", &message("payment.success")).await.unwrap();

        let published = bus.published();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].topic, "payment.process");
        assert_eq!(bus.count_of("payment.success"), 1);
        assert_eq!(published[1].json()["seatId"], 1);

        bus.clear();
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn subscribers_only_see_their_topics() {
        let bus = InMemoryMessageBus::new();
        let mut stream = bus.subscribe(&["payment.success"]).await.unwrap();

        bus.publish("payment.failure", &message("payment.failure")).await.unwrap();
        bus.publish("payment.success", &message("payment.success")).await.unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.message_type, "payment.success");
    }

    #[tokio::test]
    async fn failing_bus_rejects_publish_without_recording() {
        let bus = InMemoryMessageBus::new();
        bus.set_failing(true);

        let result = bus.publish("payment.success", &message("payment.success")).await;
        assert!(matches!(result, Err(MessageBusError::PublishFailed { .. })));
        assert!(bus.published().is_empty());
    }
}
