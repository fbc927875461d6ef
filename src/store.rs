//! Storage backend seam.
//!
//! Every write is an upsert keyed by the entity's natural id, and every
//! timestamp written comes from the message, so applying the same message
//! twice leaves the same rows behind.

use crate::error::Result;
use crate::model::Notification;
use crate::model::message::{
    AllianceHistoryPayload, AlliancePayload, CharacterPayload, CorporationHistoryPayload,
    CorporationPayload, KillmailPayload, LoyaltyStorePayload, MarketHistoryPayload,
    MarketOrdersPayload, WarPayload,
};
use crate::telemetry::metrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use rand::Rng;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tracing::warn;

/// Lowest id of a player-created character or corporation; lower ids are
/// NPC entities that never change.
pub const FIRST_PLAYER_ID: i32 = 90_000_000;

/// How long a stored character, corporation or alliance stays fresh.
pub fn cache_window() -> chrono::Duration {
    chrono::Duration::days(31)
}

/// Orders not re-reported within this window are purged by maintenance.
pub fn stale_order_age() -> chrono::Duration {
    chrono::Duration::hours(3)
}

const CONFLICT_BACKOFF: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Character,
    Corporation,
    Alliance,
}

impl EntityKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Character => "character",
            EntityKind::Corporation => "corporation",
            EntityKind::Alliance => "alliance",
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CharacterRow {
    pub character_id: i32,
    pub name: String,
    pub corporation_id: i32,
    pub alliance_id: Option<i32>,
    pub faction_id: Option<i32>,
    pub birthday: DateTime<Utc>,
    pub gender: String,
    pub race_id: i32,
    pub bloodline_id: i32,
    pub ancestry_id: Option<i32>,
    pub security_status: Option<f64>,
    pub updated_at: DateTime<Utc>,
    pub cache_until: DateTime<Utc>,
}

impl CharacterRow {
    pub fn from_payload(p: &CharacterPayload) -> Self {
        let c = &p.character;
        Self {
            character_id: p.character_id,
            name: c.name.clone(),
            corporation_id: c.corporation_id,
            alliance_id: c.alliance_id,
            faction_id: c.faction_id,
            birthday: c.birthday,
            gender: c.gender.clone(),
            race_id: c.race_id,
            bloodline_id: c.bloodline_id,
            ancestry_id: c.ancestry_id,
            security_status: c.security_status,
            updated_at: p.fetched_at,
            cache_until: p.fetched_at + cache_window(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CorporationRow {
    pub corporation_id: i32,
    pub name: String,
    pub ticker: String,
    pub ceo_id: i32,
    pub alliance_id: Option<i32>,
    pub faction_id: Option<i32>,
    pub member_count: i32,
    pub date_founded: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub cache_until: DateTime<Utc>,
}

impl CorporationRow {
    pub fn from_payload(p: &CorporationPayload) -> Self {
        let c = &p.corporation;
        Self {
            corporation_id: p.corporation_id,
            name: c.name.clone(),
            ticker: c.ticker.clone(),
            ceo_id: c.ceo_id,
            alliance_id: c.alliance_id,
            faction_id: c.faction_id,
            member_count: c.member_count,
            date_founded: c.date_founded,
            updated_at: p.fetched_at,
            cache_until: p.fetched_at + cache_window(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct AllianceRow {
    pub alliance_id: i32,
    pub name: String,
    pub ticker: String,
    pub executor_corporation_id: Option<i32>,
    pub faction_id: Option<i32>,
    pub date_founded: DateTime<Utc>,
    pub corporation_count: i32,
    /// Sum of member corporations' head counts, filled in by maintenance.
    pub member_count: i32,
    pub updated_at: DateTime<Utc>,
    pub cache_until: DateTime<Utc>,
}

impl AllianceRow {
    pub fn from_payload(p: &AlliancePayload) -> Self {
        let a = &p.alliance;
        Self {
            alliance_id: p.alliance_id,
            name: a.name.clone(),
            ticker: a.ticker.clone(),
            executor_corporation_id: a.executor_corporation_id,
            faction_id: a.faction_id,
            date_founded: a.date_founded,
            corporation_count: p.corporations.len() as i32,
            member_count: 0,
            updated_at: p.fetched_at,
            cache_until: p.fetched_at + cache_window(),
        }
    }
}

/// What one maintenance pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub orders_purged: u64,
    pub alliances_updated: u64,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_character(&self, payload: &CharacterPayload) -> Result<()>;
    async fn upsert_corporation(&self, payload: &CorporationPayload) -> Result<()>;
    async fn upsert_alliance(&self, payload: &AlliancePayload) -> Result<()>;
    async fn upsert_corporation_history(&self, payload: &CorporationHistoryPayload) -> Result<()>;
    async fn upsert_alliance_history(&self, payload: &AllianceHistoryPayload) -> Result<()>;
    async fn upsert_loyalty_offers(&self, payload: &LoyaltyStorePayload) -> Result<()>;
    async fn upsert_market_orders(&self, payload: &MarketOrdersPayload) -> Result<()>;
    async fn upsert_killmail(&self, payload: &KillmailPayload) -> Result<()>;
    async fn upsert_war(&self, payload: &WarPayload) -> Result<()>;
    /// One row per (region, type, day); a later report of a day replaces it.
    async fn upsert_market_history(&self, payload: &MarketHistoryPayload) -> Result<()>;
    async fn record_notification(&self, notification: &Notification) -> Result<()>;

    /// Purge expired and stale orders, then recompute alliance head counts.
    async fn maintain_market(&self, now: DateTime<Utc>) -> Result<MaintenanceReport>;

    /// Player characters whose cache window has passed.
    async fn characters_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<i32>>;

    /// Player corporations with members whose cache window has passed.
    async fn corporations_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<i32>>;

    /// Distinct (region, type) pairs with stored regional orders.
    async fn market_history_pairs(&self) -> Result<Vec<(i32, i32)>>;

    async fn character(&self, character_id: i32) -> Result<Option<CharacterRow>>;
    async fn corporation(&self, corporation_id: i32) -> Result<Option<CorporationRow>>;
    async fn alliance(&self, alliance_id: i32) -> Result<Option<AllianceRow>>;

    /// Move a trigger's next-eligible time to `next`, but only if it is
    /// unset or at or before `now`. Returns whether this caller won.
    async fn try_advance_trigger(
        &self,
        name: &str,
        now: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool>;

    async fn trigger_next_eligible(&self, name: &str) -> Result<Option<DateTime<Utc>>>;
}

/// Run `write` until it succeeds or fails with something other than a
/// storage conflict. Conflicts are retried without limit.
pub async fn retry_on_conflict<T, F, Fut>(operation: &str, mut write: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u64 = 0;
    loop {
        match write().await {
            Err(e) if e.is_conflict() => {
                attempt += 1;
                metrics::storage_conflicts()
                    .add(1, &[KeyValue::new("operation", operation.to_string())]);
                warn!(operation, attempt, error = %e, "storage conflict, retrying");
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                tokio::time::sleep(CONFLICT_BACKOFF + jitter).await;
            }
            other => return other,
        }
    }
}

/// Keep the last entry per key, preserving first-seen order. Postgres
/// rejects an `ON CONFLICT DO UPDATE` batch that touches a row twice.
pub fn dedup_by_key<T, K, F>(items: &[T], key: F) -> Vec<&T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut positions: HashMap<K, usize> = HashMap::with_capacity(items.len());
    let mut out: Vec<&T> = Vec::with_capacity(items.len());
    for item in items {
        match positions.entry(key(item)) {
            Entry::Occupied(slot) => out[*slot.get()] = item,
            Entry::Vacant(slot) => {
                slot.insert(out.len());
                out.push(item);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn conflicts_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = retry_on_conflict("test", move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n < 3 {
                Err(Error::StorageConflict("deadlock detected".into()))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let err = retry_on_conflict("test", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(Error::Storage(sqlx::Error::PoolTimedOut))
        })
        .await
        .unwrap_err();
        assert!(!err.is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dedup_keeps_last_value_in_first_position() {
        let rows = [(1, "a"), (2, "b"), (1, "c")];
        let kept = dedup_by_key(&rows, |r| r.0);
        assert_eq!(kept, vec![&(1, "c"), &(2, "b")]);
    }
}
