use crate::bus::{Bus, Delivery};
use crate::error::Result;
use crate::model::Topic;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

struct Stored {
    id: i64,
    payload: serde_json::Value,
    read_count: i32,
    visible_at: Instant,
}

#[derive(Default)]
struct BusState {
    next_id: i64,
    queues: HashMap<Topic, Vec<Stored>>,
    published: HashMap<Topic, Vec<serde_json::Value>>,
}

/// Bus held in process memory, with visibility timeouts like pgmq.
#[derive(Default)]
pub struct MemoryBus {
    state: Mutex<BusState>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages on `topic` not yet acknowledged.
    pub async fn pending(&self, topic: Topic) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(&topic)
            .map_or(0, Vec::len)
    }

    /// Every payload ever published on `topic`, in publish order.
    pub async fn published(&self, topic: Topic) -> Vec<serde_json::Value> {
        self.state
            .lock()
            .await
            .published
            .get(&topic)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl Bus for MemoryBus {
    async fn ensure_topics(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        for topic in Topic::ALL {
            state.queues.entry(topic).or_default();
        }
        Ok(())
    }

    async fn publish(&self, topic: Topic, payload: &serde_json::Value) -> Result<i64> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state.queues.entry(topic).or_default().push(Stored {
            id,
            payload: payload.clone(),
            read_count: 0,
            visible_at: Instant::now(),
        });
        state
            .published
            .entry(topic)
            .or_default()
            .push(payload.clone());
        Ok(id)
    }

    async fn receive(&self, topic: Topic, visibility: Duration) -> Result<Option<Delivery>> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let Some(message) = state
            .queues
            .get_mut(&topic)
            .and_then(|q| q.iter_mut().find(|m| m.visible_at <= now))
        else {
            return Ok(None);
        };
        message.read_count += 1;
        message.visible_at = now + visibility;
        Ok(Some(Delivery {
            id: message.id,
            topic,
            payload: message.payload.clone(),
            read_count: message.read_count,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(queue) = state.queues.get_mut(&delivery.topic) {
            queue.retain(|m| m.id != delivery.id);
        }
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        let visible_at = Instant::now() + delay;
        if let Some(message) = state
            .queues
            .get_mut(&delivery.topic)
            .and_then(|q| q.iter_mut().find(|m| m.id == delivery.id))
        {
            message.visible_at = visible_at;
        }
        Ok(())
    }
}
