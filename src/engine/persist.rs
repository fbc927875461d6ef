//! Persistence worker pool: drain every topic into the store.
//!
//! A handled message is acked. A malformed one is logged and acked so it
//! cannot poison the topic. Any other failure requeues the message after
//! a delay, so delivery is at-least-once and every write is an upsert.

use super::handlers;
use crate::bus::{Bus, Delivery};
use crate::config::PersistConfig;
use crate::error::{Error, ErrorClass, Result};
use crate::model::Topic;
use crate::shutdown::Shutdown;
use crate::store::Store;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_message_span};
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

/// The contract every topic handler implements.
#[async_trait]
pub trait TopicHandler: Send + Sync {
    fn topic(&self) -> Topic;

    /// Decode `payload` and write it. Must be idempotent.
    async fn handle(&self, store: &dyn Store, payload: serde_json::Value) -> Result<()>;
}

/// One handler per topic.
#[derive(Default)]
pub struct TopicRegistry {
    handlers: HashMap<Topic, Arc<dyn TopicHandler>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn standard() -> Result<Self> {
        let mut registry = Self::new();
        for handler in handlers::all() {
            registry.register(handler)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, handler: Arc<dyn TopicHandler>) -> Result<()> {
        let topic = handler.topic();
        if self.handlers.insert(topic, handler).is_some() {
            return Err(Error::Config(format!("topic {topic} registered twice")));
        }
        Ok(())
    }

    /// Fail unless every topic has a handler.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = Topic::ALL
            .iter()
            .filter(|topic| !self.handlers.contains_key(*topic))
            .map(|topic| topic.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "no handler for topics: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn get(&self, topic: Topic) -> Option<&Arc<dyn TopicHandler>> {
        self.handlers.get(&topic)
    }
}

/// What became of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    /// Malformed; acked without a write.
    Dropped,
    /// Left for redelivery after the requeue delay.
    Requeued,
}

impl Disposition {
    fn as_str(self) -> &'static str {
        match self {
            Disposition::Acked => "ack",
            Disposition::Dropped => "dropped",
            Disposition::Requeued => "requeue",
        }
    }
}

/// Decrements the in-flight count when a handler finishes, even by panic.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct PersistPool {
    bus: Arc<dyn Bus>,
    store: Arc<dyn Store>,
    registry: Arc<TopicRegistry>,
    config: PersistConfig,
    in_flight: Arc<AtomicUsize>,
}

impl PersistPool {
    pub fn new(
        bus: Arc<dyn Bus>,
        store: Arc<dyn Store>,
        registry: TopicRegistry,
        config: PersistConfig,
    ) -> Result<Self> {
        registry.validate()?;
        Ok(Self {
            bus,
            store,
            registry: Arc::new(registry),
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Handle one delivery and settle it on the bus. Only a failure to
    /// ack or requeue is returned.
    pub async fn handle_delivery(&self, delivery: Delivery) -> Result<Disposition> {
        let span = start_message_span(delivery.topic.as_str(), delivery.id, delivery.read_count);
        let _guard = InFlight::enter(&self.in_flight);

        let result = match self.registry.get(delivery.topic) {
            Some(handler) => {
                handler
                    .handle(self.store.as_ref(), delivery.payload.clone())
                    .instrument(span.clone())
                    .await
            }
            None => Err(Error::UnknownTopic(delivery.topic.to_string())),
        };

        let disposition = match result {
            Ok(()) => {
                self.bus.ack(&delivery).await?;
                Disposition::Acked
            }
            Err(e) if e.class() == ErrorClass::Decode => {
                span.in_scope(|| {
                    error!(topic = %delivery.topic, id = delivery.id, error = %e, "malformed message, dropping")
                });
                self.bus.ack(&delivery).await?;
                Disposition::Dropped
            }
            Err(e) => {
                span.in_scope(|| {
                    warn!(
                        topic = %delivery.topic,
                        id = delivery.id,
                        read_count = delivery.read_count,
                        error = %e,
                        "handler failed, requeueing"
                    )
                });
                self.bus
                    .requeue(&delivery, self.config.requeue_delay())
                    .await?;
                Disposition::Requeued
            }
        };

        record_state_transition(&span, "received", disposition.as_str());
        metrics::messages_handled().add(
            1,
            &[
                KeyValue::new("topic", delivery.topic.as_str()),
                KeyValue::new("outcome", disposition.as_str()),
            ],
        );
        Ok(disposition)
    }

    /// Handle every currently visible message on `topic`. Returns how many
    /// were handled. Requeued messages stay invisible until their delay
    /// passes, so this terminates.
    pub async fn drain(&self, topic: Topic) -> Result<usize> {
        let visibility = self.config.visibility_timeout();
        let mut handled = 0;
        while let Some(delivery) = self.bus.receive(topic, visibility).await? {
            self.handle_delivery(delivery).await?;
            handled += 1;
        }
        Ok(handled)
    }

    /// [`drain`](Self::drain) every topic once.
    pub async fn drain_all(&self) -> Result<usize> {
        let mut handled = 0;
        for topic in Topic::ALL {
            handled += self.drain(topic).await?;
        }
        Ok(handled)
    }

    /// Consume every topic until shutdown. Consumers stop taking new
    /// messages once the signal fires; the call returns after in-flight
    /// handlers finish.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) -> Result<()> {
        self.bus.ensure_topics().await?;

        let per_topic = self.config.consumers_per_topic.max(1);
        let mut tasks = JoinSet::new();
        for topic in Topic::ALL {
            for consumer in 0..per_topic {
                let pool = Arc::clone(&self);
                let shutdown = shutdown.clone();
                tasks.spawn(async move { pool.consume(topic, consumer, shutdown).await });
            }
        }
        info!(
            topics = Topic::ALL.len(),
            consumers_per_topic = per_topic,
            "persistence pool started"
        );

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "consumer panicked");
            }
        }
        info!(in_flight = self.in_flight(), "persistence pool stopped");
        Ok(())
    }

    async fn consume(&self, topic: Topic, consumer: usize, mut shutdown: Shutdown) {
        let poll = self.config.poll_interval();
        let visibility = self.config.visibility_timeout();

        while !shutdown.is_triggered() {
            match self.bus.receive(topic, visibility).await {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.handle_delivery(delivery).await {
                        warn!(topic = %topic, consumer, error = %e, "could not settle message");
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(topic = %topic, consumer, error = %e, "receive failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.wait() => break,
            }
        }
        debug!(topic = %topic, consumer, "consumer stopped");
    }
}
