//! Message publishing/subscription abstraction (mechanics only).
//!
//! The transport is a durable queue keyed by message type:
//!
//! - **At-least-once delivery** per consumer group; consumers must be idempotent
//! - **No ordering guarantee** across message types, best-effort within one type
//! - **Explicit acknowledgement**: a delivery stays pending until it is acked,
//!   negatively acked (redelivered later) or dead-lettered
//!
//! Implementations: `InMemoryMessageBus` (tests/dev) and the Redis Streams bus
//! in `waypoint-infra`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::{Message, MessageEnvelope};

#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),

    #[error("bus command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("subscription closed")]
    Closed,
}

/// One delivery of a message to one consumer.
///
/// `attempt` starts at 1 and grows on every redelivery of the same message.
#[derive(Debug, Clone)]
pub struct Delivery {
    tag: String,
    attempt: u32,
    envelope: MessageEnvelope,
}

impl Delivery {
    pub fn new(tag: impl Into<String>, attempt: u32, envelope: MessageEnvelope) -> Self {
        Self {
            tag: tag.into(),
            attempt,
            envelope,
        }
    }

    /// Transport-specific handle used to ack/nack this delivery.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn envelope(&self) -> &MessageEnvelope {
        &self.envelope
    }
}

/// Publishing half of the bus.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), BusError>;
}

/// Wrap `message` in a fresh envelope and publish it.
pub async fn publish_message<P, M>(publisher: &P, message: &M) -> Result<MessageEnvelope, BusError>
where
    P: MessagePublisher + ?Sized,
    M: Message,
{
    let envelope =
        MessageEnvelope::wrap(message).map_err(|e| BusError::Serialization(e.to_string()))?;
    publisher.publish(envelope.clone()).await?;
    Ok(envelope)
}

/// A consumer's view of one message type within one consumer group.
///
/// Subscriptions are designed for single-task consumption. Competing consumers
/// each open their own subscription on the same group.
#[async_trait]
pub trait Subscription: Send {
    /// Wait up to `wait` for the next delivery. `Ok(None)` means nothing arrived.
    async fn next(&mut self, wait: Duration) -> Result<Option<Delivery>, BusError>;

    /// Remove the message from the queue.
    async fn ack(&mut self, delivery: &Delivery) -> Result<(), BusError>;

    /// Leave the message pending; it is redelivered after (roughly) `redeliver_after`.
    async fn nack(&mut self, delivery: &Delivery, redeliver_after: Duration) -> Result<(), BusError>;

    /// Park the message on the dead-letter queue and remove it from the main queue.
    async fn dead_letter(&mut self, delivery: &Delivery, reason: &str) -> Result<(), BusError>;
}

/// Durable publish/subscribe queue keyed by message type.
#[async_trait]
pub trait MessageBus: MessagePublisher {
    /// Join `group` as `consumer` on the queue for `message_type`.
    ///
    /// Creating the group is idempotent.
    async fn subscribe(
        &self,
        message_type: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn Subscription>, BusError>;
}

#[async_trait]
impl<P> MessagePublisher for Arc<P>
where
    P: MessagePublisher + ?Sized,
{
    async fn publish(&self, envelope: MessageEnvelope) -> Result<(), BusError> {
        (**self).publish(envelope).await
    }
}

#[async_trait]
impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    async fn subscribe(
        &self,
        message_type: &str,
        group: &str,
        consumer: &str,
    ) -> Result<Box<dyn Subscription>, BusError> {
        (**self).subscribe(message_type, group, consumer).await
    }
}
