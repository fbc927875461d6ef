//! Topic-based, at-least-once message bus between fetch and persistence
//! workers.

use crate::error::Result;
use crate::model::Topic;
use crate::model::message::{Payload, ResultMessage};
use async_trait::async_trait;
use std::time::Duration;

/// One received message. Invisible to other consumers until acked,
/// requeued, or its visibility timeout lapses.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: i64,
    pub topic: Topic,
    pub payload: serde_json::Value,
    /// How many times this message has been handed out, this one included.
    pub read_count: i32,
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Create any missing topic queues.
    async fn ensure_topics(&self) -> Result<()>;

    async fn publish(&self, topic: Topic, payload: &serde_json::Value) -> Result<i64>;

    async fn receive(&self, topic: Topic, visibility: Duration) -> Result<Option<Delivery>>;

    /// Remove a handled message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Make a message visible again after `delay`.
    async fn requeue(&self, delivery: &Delivery, delay: Duration) -> Result<()>;
}

/// Encode and publish a typed payload on its topic.
pub async fn publish<T: Payload>(bus: &dyn Bus, payload: &T) -> Result<i64> {
    let message = ResultMessage::new(payload)?;
    bus.publish(message.topic(), message.payload()).await
}
