use crate::error::{Error, Result};
use crate::model::{OperationKind, Priority, WorkItem};
use crate::queue::{QueueBackend, due_items};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Default)]
struct QueueState {
    tiers: HashMap<Priority, VecDeque<WorkItem>>,
    ledger: HashMap<(String, String), Instant>,
    sets: HashMap<String, HashMap<i64, DateTime<Utc>>>,
    unavailable: bool,
}

impl QueueState {
    fn available(&self) -> Result<()> {
        if self.unavailable {
            Err(Error::Storage(sqlx::Error::PoolTimedOut))
        } else {
            Ok(())
        }
    }

    /// Write a completion record, dropping records that have lapsed.
    fn record(&mut self, namespace: &str, key: &str, ttl: Duration) {
        let now = Instant::now();
        self.ledger.retain(|_, expires| *expires > now);
        self.ledger
            .insert((namespace.to_string(), key.to_string()), now + ttl);
    }

    /// Remove up to `limit` members due at or before `now`, earliest first.
    fn take_due(&mut self, set: &str, now: DateTime<Utc>, limit: usize) -> Vec<i64> {
        let Some(members) = self.sets.get_mut(set) else {
            return Vec::new();
        };
        let mut due: Vec<(DateTime<Utc>, i64)> = members
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(member, at)| (*at, *member))
            .collect();
        due.sort();
        due.truncate(limit);
        for (_, member) in &due {
            members.remove(member);
        }
        due.into_iter().map(|(_, member)| member).collect()
    }

    fn live(&self, namespace: &str, key: &str) -> bool {
        self.ledger
            .get(&(namespace.to_string(), key.to_string()))
            .is_some_and(|expires| *expires > Instant::now())
    }
}

/// Work queue held in process memory.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until switched back, as an unreachable store would.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Live completion records in `namespace`.
    pub async fn ledger_len(&self, namespace: &str) -> usize {
        let now = Instant::now();
        self.state
            .lock()
            .await
            .ledger
            .iter()
            .filter(|((ns, _), expires)| ns == namespace && **expires > now)
            .count()
    }

    /// Completion records held, lapsed ones included.
    pub async fn stored_records(&self) -> usize {
        self.state.lock().await.ledger.len()
    }

    /// When `member` of `set` is next due, if scheduled.
    pub async fn scheduled_at(&self, set: &str, member: i64) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .sets
            .get(set)
            .and_then(|members| members.get(&member).copied())
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn push(&self, items: &[WorkItem]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.available()?;
        for item in items {
            state
                .tiers
                .entry(item.priority)
                .or_default()
                .push_back(item.clone());
        }
        Ok(())
    }

    async fn pop(&self) -> Result<Option<WorkItem>> {
        let mut state = self.state.lock().await;
        state.available()?;
        for tier in Priority::DESCENDING {
            if let Some(item) = state.tiers.get_mut(&tier).and_then(VecDeque::pop_front) {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    async fn len(&self) -> Result<u64> {
        let state = self.state.lock().await;
        state.available()?;
        Ok(state.tiers.values().map(|q| q.len() as u64).sum())
    }

    async fn pending_operations(&self) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        state.available()?;
        let mut tags: Vec<String> = state
            .tiers
            .values()
            .flatten()
            .map(|item| item.operation.to_string())
            .collect();
        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    async fn is_completed(&self, namespace: &str, key: &str) -> Result<bool> {
        let state = self.state.lock().await;
        state.available()?;
        Ok(state.live(namespace, key))
    }

    async fn mark_completed(&self, namespace: &str, key: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state.lock().await;
        state.available()?;
        state.record(namespace, key, ttl);
        Ok(())
    }

    async fn claim(&self, namespace: &str, key: &str, ttl: Duration) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.available()?;
        if state.live(namespace, key) {
            return Ok(false);
        }
        state.record(namespace, key, ttl);
        Ok(true)
    }

    async fn schedule(
        &self,
        set: &str,
        member: i64,
        due_at: DateTime<Utc>,
        only_if_absent: bool,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.available()?;
        let members = state.sets.entry(set.to_string()).or_default();
        if only_if_absent {
            members.entry(member).or_insert(due_at);
        } else {
            members.insert(member, due_at);
        }
        Ok(())
    }

    async fn take_due(&self, set: &str, now: DateTime<Utc>, limit: usize) -> Result<Vec<i64>> {
        let mut state = self.state.lock().await;
        state.available()?;
        Ok(state.take_due(set, now, limit))
    }

    async fn promote_due(
        &self,
        set: &str,
        now: DateTime<Utc>,
        limit: usize,
        operation: OperationKind,
        priority: Priority,
    ) -> Result<Vec<i64>> {
        let mut state = self.state.lock().await;
        state.available()?;
        let members = state.take_due(set, now, limit);
        let tier = state.tiers.entry(priority).or_default();
        tier.extend(due_items(&members, operation, priority));
        Ok(members)
    }
}
