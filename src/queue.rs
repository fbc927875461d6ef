//! Priority work queue and dedup ledger.
//!
//! [`WorkQueue`] is the facade every producer and consumer uses; the
//! storage behind it is a [`QueueBackend`] (Postgres in production, memory
//! in tests and dry runs).

use crate::error::Result;
use crate::model::{OperationKind, Priority, Work, WorkItem};
use crate::shutdown::Shutdown;
use crate::telemetry::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

/// Ledger namespace: market region fetched within the current window.
pub const MARKET_REGION: &str = "market-region";
/// Ledger namespace: killmails already fetched.
pub const KNOWN_KILLS: &str = "known-kills";
/// Time-scheduled set of market regions, scored by next refresh time.
pub const MARKET_REGIONS: &str = "market-regions";
/// Ledger namespace: wars that have ended and need no further fetches.
pub const FINISHED_WARS: &str = "finished-wars";

/// Ledger namespace holding cool-downs for one operation's targets.
pub fn cooldown_namespace(operation: OperationKind) -> String {
    format!("cooldown:{operation}")
}

/// Storage primitives behind the work queue.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Insert all items atomically.
    async fn push(&self, items: &[WorkItem]) -> Result<()>;

    /// Remove and return the oldest item of the highest non-empty tier.
    async fn pop(&self) -> Result<Option<WorkItem>>;

    async fn len(&self) -> Result<u64>;

    /// Distinct operation tags currently stored, as raw strings.
    async fn pending_operations(&self) -> Result<Vec<String>>;

    async fn is_completed(&self, namespace: &str, key: &str) -> Result<bool>;

    /// Set or refresh a completion record.
    async fn mark_completed(&self, namespace: &str, key: &str, ttl: Duration) -> Result<()>;

    /// Set a completion record only if none is live. Returns whether this
    /// call set it.
    async fn claim(&self, namespace: &str, key: &str, ttl: Duration) -> Result<bool>;

    /// Add or move `member` in `set` to fire at `due_at`. With
    /// `only_if_absent`, an existing member keeps its time.
    async fn schedule(
        &self,
        set: &str,
        member: i64,
        due_at: DateTime<Utc>,
        only_if_absent: bool,
    ) -> Result<()>;

    /// Remove and return up to `limit` members due at or before `now`.
    async fn take_due(&self, set: &str, now: DateTime<Utc>, limit: usize) -> Result<Vec<i64>>;

    /// Move up to `limit` due members of `set` onto the queue as
    /// `operation` items. A member leaves the set only together with its
    /// item entering the queue.
    ///
    /// Backends that can do both in one transaction should override this.
    /// The default takes the members first and schedules them back, due
    /// at `now`, when the push fails.
    async fn promote_due(
        &self,
        set: &str,
        now: DateTime<Utc>,
        limit: usize,
        operation: OperationKind,
        priority: Priority,
    ) -> Result<Vec<i64>> {
        let members = self.take_due(set, now, limit).await?;
        if members.is_empty() {
            return Ok(members);
        }
        let items = due_items(&members, operation, priority);
        if let Err(e) = self.push(&items).await {
            for member in &members {
                if let Err(restore) = self.schedule(set, *member, now, false).await {
                    error!(set, member, error = %restore, "due member lost from schedule");
                }
            }
            return Err(e);
        }
        Ok(members)
    }
}

/// One work item per promoted member.
pub fn due_items(members: &[i64], operation: OperationKind, priority: Priority) -> Vec<WorkItem> {
    members
        .iter()
        .map(|member| WorkItem::from_work(Work::new(operation, *member), priority))
        .collect()
}

/// Handle to the shared work queue. Cheap to clone.
#[derive(Clone)]
pub struct WorkQueue {
    backend: Arc<dyn QueueBackend>,
}

impl WorkQueue {
    pub fn new(backend: Arc<dyn QueueBackend>) -> Self {
        Self { backend }
    }

    /// Enqueue `work` at `priority` as one atomic batch.
    pub async fn enqueue(&self, work: Vec<Work>, priority: Priority) -> Result<usize> {
        if work.is_empty() {
            return Ok(0);
        }
        let items: Vec<WorkItem> = work
            .into_iter()
            .map(|w| WorkItem::from_work(w, priority))
            .collect();
        self.backend.push(&items).await?;
        metrics::queue_operations().add(
            items.len() as u64,
            &[
                KeyValue::new("operation", "enqueue"),
                KeyValue::new("priority", priority.to_string()),
            ],
        );
        Ok(items.len())
    }

    pub async fn enqueue_one(&self, work: Work, priority: Priority) -> Result<()> {
        self.enqueue(vec![work], priority).await.map(|_| ())
    }

    /// Remove one item without waiting.
    pub async fn try_dequeue(&self) -> Result<Option<WorkItem>> {
        let item = self.backend.pop().await?;
        let op = if item.is_some() {
            "dequeue"
        } else {
            "dequeue_empty"
        };
        metrics::queue_operations().add(1, &[KeyValue::new("operation", op)]);
        Ok(item)
    }

    /// Remove one item, polling every `poll` while the queue is empty.
    ///
    /// Returns `Ok(None)` only once `shutdown` has been triggered. Backend
    /// errors are returned to the caller.
    pub async fn dequeue(&self, poll: Duration, shutdown: &mut Shutdown) -> Result<Option<WorkItem>> {
        loop {
            if shutdown.is_triggered() {
                return Ok(None);
            }
            if let Some(item) = self.try_dequeue().await? {
                return Ok(Some(item));
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.wait() => return Ok(None),
            }
        }
    }

    /// Total pending items across tiers.
    pub async fn size(&self) -> Result<u64> {
        self.backend.len().await
    }

    pub async fn check_completed(&self, namespace: &str, key: &str) -> Result<bool> {
        self.backend.is_completed(namespace, key).await
    }

    pub async fn mark_completed(&self, namespace: &str, key: &str, ttl: Duration) -> Result<()> {
        self.backend.mark_completed(namespace, key, ttl).await?;
        metrics::queue_operations().add(
            1,
            &[
                KeyValue::new("operation", "mark_completed"),
                KeyValue::new("namespace", namespace.to_string()),
            ],
        );
        Ok(())
    }

    /// Check-and-set on the ledger in one step.
    pub async fn claim(&self, namespace: &str, key: &str, ttl: Duration) -> Result<bool> {
        let claimed = self.backend.claim(namespace, key, ttl).await?;
        if claimed {
            metrics::queue_operations().add(
                1,
                &[
                    KeyValue::new("operation", "mark_completed"),
                    KeyValue::new("namespace", namespace.to_string()),
                ],
            );
        }
        Ok(claimed)
    }

    pub async fn schedule(
        &self,
        set: &str,
        member: i64,
        due_at: DateTime<Utc>,
        only_if_absent: bool,
    ) -> Result<()> {
        self.backend.schedule(set, member, due_at, only_if_absent).await?;
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "schedule")]);
        Ok(())
    }

    pub async fn take_due(&self, set: &str, now: DateTime<Utc>, limit: usize) -> Result<Vec<i64>> {
        let members = self.backend.take_due(set, now, limit).await?;
        metrics::queue_operations().add(1, &[KeyValue::new("operation", "take_due")]);
        Ok(members)
    }

    /// Enqueue every member of `set` that is due as an `operation` item.
    /// On error the members stay scheduled.
    pub async fn promote_due(
        &self,
        set: &str,
        now: DateTime<Utc>,
        limit: usize,
        operation: OperationKind,
        priority: Priority,
    ) -> Result<Vec<i64>> {
        let members = self
            .backend
            .promote_due(set, now, limit, operation, priority)
            .await?;
        metrics::queue_operations().add(
            members.len() as u64,
            &[
                KeyValue::new("operation", "enqueue"),
                KeyValue::new("priority", priority.to_string()),
            ],
        );
        Ok(members)
    }

    /// Fail if any stored item carries a tag this build does not know.
    pub async fn validate_pending(&self) -> Result<()> {
        for tag in self.backend.pending_operations().await? {
            tag.parse::<OperationKind>()?;
        }
        Ok(())
    }
}
