use crate::error::{Error, Result};
use crate::model::Notification;
use crate::model::esi::{
    AllianceHistoryEntry, CorporationHistoryEntry, Killmail, LoyaltyOffer, MarketHistoryEntry,
    MarketOrder, War,
};
use crate::model::message::{
    AllianceHistoryPayload, AlliancePayload, CharacterPayload, CorporationHistoryPayload,
    CorporationPayload, KillmailPayload, LoyaltyStorePayload, MarketHistoryPayload,
    MarketOrdersPayload, MarketSource, WarPayload,
};
use crate::store::{
    AllianceRow, CharacterRow, CorporationRow, EntityKind, FIRST_PLAYER_ID, MaintenanceReport,
    Store, stale_order_age,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

/// A stored market order with where and when it was last reported.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredOrder {
    pub order: MarketOrder,
    pub source: MarketSource,
    pub reported_at: DateTime<Utc>,
}

/// Every table of the in-memory store. Compared whole in idempotence tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tables {
    pub entities: BTreeMap<i32, EntityKind>,
    pub characters: BTreeMap<i32, CharacterRow>,
    pub corporations: BTreeMap<i32, CorporationRow>,
    pub alliances: BTreeMap<i32, AllianceRow>,
    /// Keyed by (character, record).
    pub corporation_history: BTreeMap<(i32, i32), CorporationHistoryEntry>,
    /// Keyed by (corporation, record).
    pub alliance_history: BTreeMap<(i32, i32), AllianceHistoryEntry>,
    /// Keyed by (corporation, offer).
    pub lp_offers: BTreeMap<(i32, i32), LoyaltyOffer>,
    pub market_orders: BTreeMap<i64, StoredOrder>,
    /// Killmail and its hash, by killmail id.
    pub killmails: BTreeMap<i32, (String, Killmail)>,
    pub wars: BTreeMap<i32, War>,
    /// Keyed by (region, type, day).
    pub market_history: BTreeMap<(i32, i32, NaiveDate), MarketHistoryEntry>,
    pub notifications: BTreeMap<Uuid, Notification>,
}

/// Store held in process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    triggers: Mutex<HashMap<String, DateTime<Utc>>>,
    pending_conflicts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` writes with a storage conflict.
    pub fn inject_conflicts(&self, n: u32) {
        self.pending_conflicts.store(n, Ordering::SeqCst);
    }

    pub async fn snapshot(&self) -> Tables {
        self.tables.lock().await.clone()
    }

    fn conflict(&self) -> Result<()> {
        let took = self
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(Error::StorageConflict("deadlock detected".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_character(&self, payload: &CharacterPayload) -> Result<()> {
        self.conflict()?;
        let mut t = self.tables.lock().await;
        t.characters
            .insert(payload.character_id, CharacterRow::from_payload(payload));
        t.entities.insert(payload.character_id, EntityKind::Character);
        Ok(())
    }

    async fn upsert_corporation(&self, payload: &CorporationPayload) -> Result<()> {
        self.conflict()?;
        let mut t = self.tables.lock().await;
        t.corporations
            .insert(payload.corporation_id, CorporationRow::from_payload(payload));
        t.entities
            .insert(payload.corporation_id, EntityKind::Corporation);
        Ok(())
    }

    async fn upsert_alliance(&self, payload: &AlliancePayload) -> Result<()> {
        self.conflict()?;
        let mut t = self.tables.lock().await;
        let mut row = AllianceRow::from_payload(payload);
        if let Some(existing) = t.alliances.get(&payload.alliance_id) {
            row.member_count = existing.member_count;
        }
        t.alliances.insert(payload.alliance_id, row);
        t.entities.insert(payload.alliance_id, EntityKind::Alliance);
        Ok(())
    }

    async fn upsert_corporation_history(&self, payload: &CorporationHistoryPayload) -> Result<()> {
        self.conflict()?;
        let mut t = self.tables.lock().await;
        for entry in &payload.history {
            t.corporation_history
                .insert((payload.character_id, entry.record_id), entry.clone());
        }
        Ok(())
    }

    async fn upsert_alliance_history(&self, payload: &AllianceHistoryPayload) -> Result<()> {
        self.conflict()?;
        let mut t = self.tables.lock().await;
        for entry in &payload.history {
            t.alliance_history
                .insert((payload.corporation_id, entry.record_id), entry.clone());
        }
        Ok(())
    }

    async fn upsert_loyalty_offers(&self, payload: &LoyaltyStorePayload) -> Result<()> {
        self.conflict()?;
        let mut t = self.tables.lock().await;
        for offer in &payload.offers {
            t.lp_offers
                .insert((payload.corporation_id, offer.offer_id), offer.clone());
        }
        Ok(())
    }

    async fn upsert_market_orders(&self, payload: &MarketOrdersPayload) -> Result<()> {
        self.conflict()?;
        let mut t = self.tables.lock().await;
        for order in &payload.orders {
            t.market_orders.insert(
                order.order_id,
                StoredOrder {
                    order: order.clone(),
                    source: payload.source,
                    reported_at: payload.fetched_at,
                },
            );
        }
        Ok(())
    }

    async fn upsert_killmail(&self, payload: &KillmailPayload) -> Result<()> {
        self.conflict()?;
        let mut t = self.tables.lock().await;
        t.killmails.insert(
            payload.killmail.killmail_id,
            (payload.hash.clone(), payload.killmail.clone()),
        );
        Ok(())
    }

    async fn upsert_war(&self, payload: &WarPayload) -> Result<()> {
        self.conflict()?;
        let mut t = self.tables.lock().await;
        t.wars.insert(payload.war_id, payload.war.clone());
        Ok(())
    }

    async fn upsert_market_history(&self, payload: &MarketHistoryPayload) -> Result<()> {
        self.conflict()?;
        let mut t = self.tables.lock().await;
        for entry in &payload.history {
            t.market_history.insert(
                (payload.region_id, payload.type_id, entry.date),
                entry.clone(),
            );
        }
        Ok(())
    }

    async fn record_notification(&self, notification: &Notification) -> Result<()> {
        self.conflict()?;
        let mut t = self.tables.lock().await;
        t.notifications
            .entry(notification.id)
            .or_insert_with(|| notification.clone());
        Ok(())
    }

    async fn maintain_market(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        self.conflict()?;
        let mut t = self.tables.lock().await;
        let stale_before = now - stale_order_age();
        let before = t.market_orders.len();
        t.market_orders.retain(|_, stored| {
            let expires = stored.order.issued + chrono::Duration::days(i64::from(stored.order.duration));
            expires >= now && stored.reported_at >= stale_before
        });
        let orders_purged = (before - t.market_orders.len()) as u64;

        let mut heads: HashMap<i32, i32> = HashMap::new();
        for corp in t.corporations.values() {
            if let Some(alliance_id) = corp.alliance_id {
                *heads.entry(alliance_id).or_default() += corp.member_count;
            }
        }
        let mut alliances_updated = 0;
        for (id, alliance) in t.alliances.iter_mut() {
            alliance.member_count = heads.get(id).copied().unwrap_or(0);
            alliances_updated += 1;
        }

        Ok(MaintenanceReport {
            orders_purged,
            alliances_updated,
        })
    }

    async fn characters_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<i32>> {
        let t = self.tables.lock().await;
        let mut due: Vec<(DateTime<Utc>, i32)> = t
            .characters
            .values()
            .filter(|c| c.character_id > FIRST_PLAYER_ID && c.cache_until < now)
            .map(|c| (c.cache_until, c.character_id))
            .collect();
        due.sort();
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, id)| id)
            .collect())
    }

    async fn corporations_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<i32>> {
        let t = self.tables.lock().await;
        let mut due: Vec<(DateTime<Utc>, i32)> = t
            .corporations
            .values()
            .filter(|c| {
                c.corporation_id > FIRST_PLAYER_ID && c.member_count > 0 && c.cache_until < now
            })
            .map(|c| (c.cache_until, c.corporation_id))
            .collect();
        due.sort();
        Ok(due
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, id)| id)
            .collect())
    }

    async fn market_history_pairs(&self) -> Result<Vec<(i32, i32)>> {
        let t = self.tables.lock().await;
        let pairs: BTreeSet<(i32, i32)> = t
            .market_orders
            .values()
            .filter_map(|stored| match stored.source {
                MarketSource::Region { region_id } => Some((region_id, stored.order.type_id)),
                MarketSource::Structure { .. } => None,
            })
            .collect();
        Ok(pairs.into_iter().collect())
    }

    async fn character(&self, character_id: i32) -> Result<Option<CharacterRow>> {
        Ok(self.tables.lock().await.characters.get(&character_id).cloned())
    }

    async fn corporation(&self, corporation_id: i32) -> Result<Option<CorporationRow>> {
        Ok(self
            .tables
            .lock()
            .await
            .corporations
            .get(&corporation_id)
            .cloned())
    }

    async fn alliance(&self, alliance_id: i32) -> Result<Option<AllianceRow>> {
        Ok(self.tables.lock().await.alliances.get(&alliance_id).cloned())
    }

    async fn try_advance_trigger(
        &self,
        name: &str,
        now: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool> {
        let mut triggers = self.triggers.lock().await;
        match triggers.get(name) {
            Some(eligible) if *eligible > now => Ok(false),
            _ => {
                triggers.insert(name.to_string(), next);
                Ok(true)
            }
        }
    }

    async fn trigger_next_eligible(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.triggers.lock().await.get(name).copied())
    }
}
