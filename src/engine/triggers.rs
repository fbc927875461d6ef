//! The standard discovery triggers.
//!
//! Each one reads the store, the API or a scheduled set and enqueues
//! work; none of them fetches or persists entity data itself.

use super::scheduler::{Scheduler, TriggerHandler};
use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::model::{OperationKind, Priority, Work};
use crate::queue::MARKET_REGIONS;
use crate::services::Services;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const CHARACTER_UPDATE: &str = "characterUpdate";
pub const CORPORATION_UPDATE: &str = "corporationUpdate";
pub const ALLIANCE_UPDATE: &str = "allianceUpdate";
pub const NPC_CORPORATIONS: &str = "npcCorporations";
pub const MARKET_REGION_SEED: &str = "marketRegionSeed";
pub const MARKET_REGIONS_DUE: &str = "marketRegions";
pub const MARKET_MAINTENANCE: &str = "marketMaintenance";
pub const MARKET_HISTORY: &str = "marketHistory";
pub const STRUCTURE_MARKETS: &str = "structureMarkets";
pub const WARS: &str = "wars";

/// Register every standard trigger, with intervals overridable by name.
pub fn register_standard(scheduler: &mut Scheduler, config: &SchedulerConfig) -> Result<()> {
    let table: [(&str, u64, Arc<dyn TriggerHandler>); 10] = [
        (CHARACTER_UPDATE, 120, Arc::new(CharacterUpdate)),
        (CORPORATION_UPDATE, 120, Arc::new(CorporationUpdate)),
        (ALLIANCE_UPDATE, 3600, Arc::new(AllianceUpdate)),
        (NPC_CORPORATIONS, 172_800, Arc::new(NpcCorporations)),
        (MARKET_REGION_SEED, 86_400, Arc::new(MarketRegionSeed)),
        (MARKET_REGIONS_DUE, 60, Arc::new(MarketRegionsDue)),
        (MARKET_MAINTENANCE, 3600, Arc::new(MarketMaintenance)),
        (MARKET_HISTORY, 86_400, Arc::new(MarketHistory)),
        (STRUCTURE_MARKETS, 3600, Arc::new(StructureMarkets)),
        (WARS, 3600, Arc::new(Wars)),
    ];
    for (name, default_secs, handler) in table {
        let interval = config.interval_for(name, Duration::from_secs(default_secs));
        scheduler.register(name, interval, handler)?;
    }
    Ok(())
}

fn works(operation: OperationKind, ids: impl IntoIterator<Item = i32>) -> Vec<Work> {
    ids.into_iter().map(|id| Work::new(operation, id)).collect()
}

/// Player characters whose cached record has expired.
pub struct CharacterUpdate;

#[async_trait]
impl TriggerHandler for CharacterUpdate {
    async fn fire(&self, services: &Services) -> Result<()> {
        let due = services
            .store
            .characters_due(Utc::now(), services.scheduler.discovery_batch)
            .await?;
        let n = services
            .queue
            .enqueue(works(OperationKind::Character, due), Priority::Normal)
            .await?;
        info!(enqueued = n, "characters due for refresh");
        Ok(())
    }
}

/// Corporations whose cached record has expired.
pub struct CorporationUpdate;

#[async_trait]
impl TriggerHandler for CorporationUpdate {
    async fn fire(&self, services: &Services) -> Result<()> {
        let due = services
            .store
            .corporations_due(Utc::now(), services.scheduler.discovery_batch)
            .await?;
        let n = services
            .queue
            .enqueue(works(OperationKind::Corporation, due), Priority::Normal)
            .await?;
        info!(enqueued = n, "corporations due for refresh");
        Ok(())
    }
}

/// Every alliance the API lists.
pub struct AllianceUpdate;

#[async_trait]
impl TriggerHandler for AllianceUpdate {
    async fn fire(&self, services: &Services) -> Result<()> {
        let alliances = services.api.alliances().await?.data;
        let n = services
            .queue
            .enqueue(works(OperationKind::Alliance, alliances), Priority::Low)
            .await?;
        info!(enqueued = n, "alliances enqueued");
        Ok(())
    }
}

/// NPC corporations and their loyalty stores.
pub struct NpcCorporations;

#[async_trait]
impl TriggerHandler for NpcCorporations {
    async fn fire(&self, services: &Services) -> Result<()> {
        let corporations = services.api.npc_corporations().await?.data;
        let mut work = works(OperationKind::Corporation, corporations.iter().copied());
        work.extend(works(OperationKind::LoyaltyStore, corporations));
        let n = services.queue.enqueue(work, Priority::Low).await?;
        info!(enqueued = n, "npc corporations enqueued");
        Ok(())
    }
}

/// Adds newly listed regions to the market schedule. Regions already
/// scheduled keep their refresh time.
pub struct MarketRegionSeed;

#[async_trait]
impl TriggerHandler for MarketRegionSeed {
    async fn fire(&self, services: &Services) -> Result<()> {
        let regions = services.api.regions().await?.data;
        let now = Utc::now();
        for region in &regions {
            services
                .queue
                .schedule(MARKET_REGIONS, i64::from(*region), now, true)
                .await?;
        }
        info!(regions = regions.len(), "market regions seeded");
        Ok(())
    }
}

/// Moves regions whose refresh time has come onto the work queue.
pub struct MarketRegionsDue;

#[async_trait]
impl TriggerHandler for MarketRegionsDue {
    async fn fire(&self, services: &Services) -> Result<()> {
        let limit = usize::try_from(services.scheduler.discovery_batch).unwrap_or(0);
        let due = services
            .queue
            .promote_due(
                MARKET_REGIONS,
                Utc::now(),
                limit,
                OperationKind::MarketOrders,
                Priority::High,
            )
            .await?;
        if !due.is_empty() {
            info!(enqueued = due.len(), "market regions due");
        }
        Ok(())
    }
}

pub struct MarketMaintenance;

#[async_trait]
impl TriggerHandler for MarketMaintenance {
    async fn fire(&self, services: &Services) -> Result<()> {
        services
            .queue
            .enqueue_one(
                Work::new(OperationKind::MarketMaintenance, serde_json::Value::Null),
                Priority::Normal,
            )
            .await
    }
}

/// Recent daily statistics for every type with orders in a known region.
pub struct MarketHistory;

#[async_trait]
impl TriggerHandler for MarketHistory {
    async fn fire(&self, services: &Services) -> Result<()> {
        let pairs = services.store.market_history_pairs().await?;
        let work: Vec<Work> = pairs
            .into_iter()
            .map(|(region_id, type_id)| {
                Work::new(OperationKind::MarketHistory, json!([region_id, type_id]))
            })
            .collect();
        let n = services.queue.enqueue(work, Priority::Low).await?;
        info!(enqueued = n, "market history enqueued");
        Ok(())
    }
}

/// Public structures with a market. Denied ones are cooled down by the
/// fetch pool.
pub struct StructureMarkets;

#[async_trait]
impl TriggerHandler for StructureMarkets {
    async fn fire(&self, services: &Services) -> Result<()> {
        let structures = services.api.market_structures().await?.data;
        let work: Vec<Work> = structures
            .into_iter()
            .map(|id| Work::new(OperationKind::StructureOrders, id))
            .collect();
        let n = services.queue.enqueue(work, Priority::Normal).await?;
        info!(enqueued = n, "structure markets enqueued");
        Ok(())
    }
}

/// Recently declared wars. Each war in turn queues its killmails.
pub struct Wars;

#[async_trait]
impl TriggerHandler for Wars {
    async fn fire(&self, services: &Services) -> Result<()> {
        let wars = services.api.wars().await?.data;
        let n = services
            .queue
            .enqueue(works(OperationKind::War, wars), Priority::Low)
            .await?;
        info!(enqueued = n, "wars enqueued");
        Ok(())
    }
}
