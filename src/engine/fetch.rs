//! Fetch worker pool: dequeue work, run its operation, move on.
//!
//! A failed item is logged and dropped. Entities that are still due get
//! rediscovered by their trigger on its next cycle.

use super::operations;
use crate::error::{Error, ErrorClass, Result};
use crate::model::{Notification, OperationKind, WorkItem};
use crate::queue::cooldown_namespace;
use crate::services::Services;
use crate::shutdown::Shutdown;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_work_span};
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, warn};

/// The contract every operation handler implements.
#[async_trait]
pub trait Operation: Send + Sync {
    fn kind(&self) -> OperationKind;

    /// Validate the item's parameter, call the API and publish the results.
    async fn run(&self, services: &Services, item: &WorkItem) -> Result<()>;
}

/// One handler per operation tag.
#[derive(Default)]
pub struct OperationRegistry {
    handlers: HashMap<OperationKind, Arc<dyn Operation>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry with every built-in operation.
    pub fn standard() -> Result<Self> {
        let mut registry = Self::new();
        for op in operations::all() {
            registry.register(op)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, op: Arc<dyn Operation>) -> Result<()> {
        let kind = op.kind();
        if self.handlers.insert(kind, op).is_some() {
            return Err(Error::Config(format!("operation {kind} registered twice")));
        }
        Ok(())
    }

    /// Fail unless every known operation tag has a handler.
    pub fn validate(&self) -> Result<()> {
        let missing: Vec<&str> = OperationKind::ALL
            .iter()
            .filter(|kind| !self.handlers.contains_key(*kind))
            .map(|kind| kind.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(format!(
                "no handler for operations: {}",
                missing.join(", ")
            )))
        }
    }

    pub fn get(&self, kind: OperationKind) -> Option<&Arc<dyn Operation>> {
        self.handlers.get(&kind)
    }
}

/// How one work item ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    Done,
    /// The target is cooling down; the handler was not called.
    Skipped,
    /// The target was refused upstream and is now cooling down.
    CooledDown,
    /// Logged and dropped.
    Failed,
}

impl WorkOutcome {
    fn as_str(self) -> &'static str {
        match self {
            WorkOutcome::Done => "ok",
            WorkOutcome::Skipped => "skipped",
            WorkOutcome::CooledDown => "cooldown",
            WorkOutcome::Failed => "error",
        }
    }
}

pub struct FetchPool {
    services: Services,
    registry: Arc<OperationRegistry>,
    active: Arc<AtomicUsize>,
}

impl FetchPool {
    /// Build the pool after checking the registry covers every tag.
    pub fn new(services: Services, registry: OperationRegistry) -> Result<Self> {
        registry.validate()?;
        Ok(Self {
            services,
            registry: Arc::new(registry),
            active: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of items currently being processed.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Run one item to completion. Never fails: every error is logged,
    /// counted and folded into the outcome.
    pub async fn process(&self, item: WorkItem) -> WorkOutcome {
        let operation = item.operation;
        let span = start_work_span(
            operation.as_str(),
            &item.id.to_string(),
            &item.priority.to_string(),
        );
        record_state_transition(&span, "queued", "running");
        self.active.fetch_add(1, Ordering::Relaxed);

        let outcome = self.process_inner(&item).instrument(span.clone()).await;

        self.active.fetch_sub(1, Ordering::Relaxed);
        record_state_transition(&span, "running", outcome.as_str());
        metrics::work_processed().add(
            1,
            &[
                KeyValue::new("operation", operation.as_str()),
                KeyValue::new("outcome", outcome.as_str()),
            ],
        );
        outcome
    }

    async fn process_inner(&self, item: &WorkItem) -> WorkOutcome {
        let operation = item.operation;
        let namespace = cooldown_namespace(operation);
        let target = item.target_key();

        match self.services.queue.check_completed(&namespace, &target).await {
            Ok(true) => {
                debug!(operation = %operation, target = %target, "target cooling down, skipping");
                return WorkOutcome::Skipped;
            }
            Ok(false) => {}
            Err(e) => warn!(operation = %operation, error = %e, "cool-down check failed"),
        }

        let Some(handler) = self.registry.get(operation) else {
            error!(operation = %operation, "no handler registered, dropping item");
            return WorkOutcome::Failed;
        };

        let started = Instant::now();
        let result = handler.run(&self.services, item).await;
        metrics::operation_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("operation", operation.as_str())],
        );

        match result {
            Ok(()) => WorkOutcome::Done,
            Err(e) if e.class() == ErrorClass::PermanentAuth => {
                warn!(operation = %operation, target = %target, error = %e, "target refused, cooling down");
                self.cool_down(operation, &namespace, &target, &e).await;
                WorkOutcome::CooledDown
            }
            Err(e) => {
                error!(operation = %operation, target = %target, error = %e, "operation failed, dropping item");
                WorkOutcome::Failed
            }
        }
    }

    async fn cool_down(
        &self,
        operation: OperationKind,
        namespace: &str,
        target: &str,
        cause: &Error,
    ) {
        let ttl = self.services.fetch.cooldown();
        if let Err(e) = self
            .services
            .queue
            .mark_completed(namespace, target, ttl)
            .await
        {
            warn!(operation = %operation, error = %e, "could not record cool-down");
            return;
        }
        let note = Notification::new(
            "cooldown_applied",
            format!("{operation} {target}"),
            cause.to_string(),
        );
        if let Err(e) = self.services.publish(&note).await {
            warn!(operation = %operation, error = %e, "could not publish cool-down notice");
        }
    }

    /// Process items until the queue is empty. Returns how many ran.
    pub async fn drain(&self) -> Result<usize> {
        let mut processed = 0;
        while let Some(item) = self.services.queue.try_dequeue().await? {
            self.process(item).await;
            processed += 1;
        }
        Ok(processed)
    }

    /// Run the configured number of workers until shutdown. Items already
    /// dequeued are finished before a worker exits.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) -> Result<()> {
        self.services.queue.validate_pending().await?;

        let workers = self.services.fetch.workers.max(1);
        let mut tasks = JoinSet::new();
        for worker in 0..workers {
            let pool = Arc::clone(&self);
            let shutdown = shutdown.clone();
            tasks.spawn(async move { pool.worker_loop(worker, shutdown).await });
        }
        info!(workers, "fetch pool started");

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "fetch worker panicked");
            }
        }
        info!(active = self.active(), "fetch pool stopped");
        Ok(())
    }

    async fn worker_loop(&self, worker: usize, mut shutdown: Shutdown) {
        let poll = self.services.fetch.poll_interval();
        let max_backoff = Duration::from_secs(self.services.fetch.max_backoff_secs.max(1));
        let mut backoff = poll;

        loop {
            match self.services.queue.dequeue(poll, &mut shutdown).await {
                Ok(Some(item)) => {
                    backoff = poll;
                    self.process(item).await;
                }
                Ok(None) => break,
                Err(e) if e.class() == ErrorClass::Fatal => {
                    // An undecodable row was already removed; nothing to retry.
                    error!(worker, error = %e, "dropping unreadable work item");
                }
                Err(e) => {
                    warn!(worker, error = %e, backoff_ms = backoff.as_millis() as u64, "queue unavailable");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.wait() => break,
                    }
                    backoff = (backoff * 2).min(max_backoff);
                }
            }
        }
        debug!(worker, "fetch worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_is_complete() {
        let registry = OperationRegistry::standard().unwrap();
        registry.validate().unwrap();
    }

    #[test]
    fn missing_handlers_are_named() {
        let err = OperationRegistry::new().validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("character"), "{msg}");
        assert!(msg.contains("marketMaintenance"), "{msg}");
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = OperationRegistry::new();
        registry.register(Arc::new(operations::FetchCharacter)).unwrap();
        assert!(registry.register(Arc::new(operations::FetchCharacter)).is_err());
    }
}
