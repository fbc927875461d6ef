//! Fetch handlers, one per operation tag.

use super::fetch::Operation;
use crate::error::Result;
use crate::model::message::{
    AllianceHistoryPayload, AlliancePayload, CharacterPayload, CorporationHistoryPayload,
    CorporationPayload, KillmailPayload, LoyaltyStorePayload, MarketHistoryPayload,
    MarketOrdersPayload, MarketSource, WarPayload,
};
use crate::model::esi::recent_history;
use crate::model::{OperationKind, Priority, Work, WorkItem};
use crate::queue::{FINISHED_WARS, KNOWN_KILLS, MARKET_REGION, MARKET_REGIONS};
use crate::services::Services;
use crate::store::retry_on_conflict;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Every operation handler, in [`OperationKind::ALL`] order.
pub fn all() -> Vec<Arc<dyn Operation>> {
    vec![
        Arc::new(FetchCharacter),
        Arc::new(FetchCharacterHistory),
        Arc::new(FetchCorporation),
        Arc::new(FetchAllianceHistory),
        Arc::new(FetchAlliance),
        Arc::new(FetchLoyaltyStore),
        Arc::new(FetchMarketOrders),
        Arc::new(FetchStructureOrders),
        Arc::new(FetchMarketHistory),
        Arc::new(FetchKillmail),
        Arc::new(FetchWar),
        Arc::new(MaintainMarket),
    ]
}

pub struct FetchCharacter;

#[async_trait]
impl Operation for FetchCharacter {
    fn kind(&self) -> OperationKind {
        OperationKind::Character
    }

    async fn run(&self, services: &Services, item: &WorkItem) -> Result<()> {
        let character_id: i32 = item.param()?;
        let response = services.api.character(character_id).await?;
        services
            .publish(&CharacterPayload {
                character_id,
                character: response.data,
                fetched_at: Utc::now(),
            })
            .await?;
        services
            .queue
            .enqueue_one(
                Work::new(OperationKind::CharacterHistory, character_id),
                item.priority,
            )
            .await
    }
}

pub struct FetchCharacterHistory;

#[async_trait]
impl Operation for FetchCharacterHistory {
    fn kind(&self) -> OperationKind {
        OperationKind::CharacterHistory
    }

    async fn run(&self, services: &Services, item: &WorkItem) -> Result<()> {
        let character_id: i32 = item.param()?;
        let history = services.api.corporation_history(character_id).await?.data;
        services
            .publish(&CorporationHistoryPayload {
                character_id,
                history,
            })
            .await?;
        Ok(())
    }
}

pub struct FetchCorporation;

#[async_trait]
impl Operation for FetchCorporation {
    fn kind(&self) -> OperationKind {
        OperationKind::Corporation
    }

    async fn run(&self, services: &Services, item: &WorkItem) -> Result<()> {
        let corporation_id: i32 = item.param()?;
        let response = services.api.corporation(corporation_id).await?;
        services
            .publish(&CorporationPayload {
                corporation_id,
                corporation: response.data,
                fetched_at: Utc::now(),
            })
            .await?;
        services
            .queue
            .enqueue_one(
                Work::new(OperationKind::AllianceHistory, corporation_id),
                item.priority,
            )
            .await
    }
}

pub struct FetchAllianceHistory;

#[async_trait]
impl Operation for FetchAllianceHistory {
    fn kind(&self) -> OperationKind {
        OperationKind::AllianceHistory
    }

    async fn run(&self, services: &Services, item: &WorkItem) -> Result<()> {
        let corporation_id: i32 = item.param()?;
        let history = services.api.alliance_history(corporation_id).await?.data;
        services
            .publish(&AllianceHistoryPayload {
                corporation_id,
                history,
            })
            .await?;
        Ok(())
    }
}

/// The alliance record together with its member corporations, each of
/// which is queued for its own refresh.
pub struct FetchAlliance;

#[async_trait]
impl Operation for FetchAlliance {
    fn kind(&self) -> OperationKind {
        OperationKind::Alliance
    }

    async fn run(&self, services: &Services, item: &WorkItem) -> Result<()> {
        let alliance_id: i32 = item.param()?;
        let alliance = services.api.alliance(alliance_id).await?.data;
        let corporations = services.api.alliance_corporations(alliance_id).await?.data;

        let members: Vec<Work> = corporations
            .iter()
            .map(|id| Work::new(OperationKind::Corporation, *id))
            .collect();
        services
            .publish(&AlliancePayload {
                alliance_id,
                alliance,
                corporations,
                fetched_at: Utc::now(),
            })
            .await?;
        services.queue.enqueue(members, Priority::Low).await?;
        Ok(())
    }
}

pub struct FetchLoyaltyStore;

#[async_trait]
impl Operation for FetchLoyaltyStore {
    fn kind(&self) -> OperationKind {
        OperationKind::LoyaltyStore
    }

    async fn run(&self, services: &Services, item: &WorkItem) -> Result<()> {
        let corporation_id: i32 = item.param()?;
        let offers = services.api.loyalty_offers(corporation_id).await?.data;
        services
            .publish(&LoyaltyStorePayload {
                corporation_id,
                offers,
            })
            .await?;
        Ok(())
    }
}

/// All orders of one region, one message per page.
///
/// A region is fetched at most once per window however many items name
/// it. Afterwards it goes back on the schedule for the later of the
/// refresh interval and the upstream cache expiry.
pub struct FetchMarketOrders;

impl FetchMarketOrders {
    async fn fetch_pages(
        &self,
        services: &Services,
        region_id: i32,
    ) -> Result<Option<DateTime<Utc>>> {
        let mut page = 1;
        let mut expires: Option<DateTime<Utc>> = None;
        loop {
            let response = services.api.region_orders(region_id, page).await?;
            expires = expires.max(response.expires);
            let next = response.next_page(page);
            if !response.data.is_empty() {
                services
                    .publish(&MarketOrdersPayload {
                        source: MarketSource::Region { region_id },
                        page,
                        orders: response.data,
                        fetched_at: Utc::now(),
                    })
                    .await?;
            }
            match next {
                Some(n) => page = n,
                None => break,
            }
        }
        debug!(region_id, pages = page, "region orders fetched");
        Ok(expires)
    }
}

#[async_trait]
impl Operation for FetchMarketOrders {
    fn kind(&self) -> OperationKind {
        OperationKind::MarketOrders
    }

    async fn run(&self, services: &Services, item: &WorkItem) -> Result<()> {
        let region_id: i32 = item.param()?;
        let key = region_id.to_string();
        let window = services.fetch.region_window();
        if !services.queue.claim(MARKET_REGION, &key, window).await? {
            debug!(region_id, "region already fetched in this window");
            return Ok(());
        }

        let now = Utc::now();
        match self.fetch_pages(services, region_id).await {
            Ok(expires) => {
                let refresh = chrono::Duration::from_std(services.fetch.region_refresh())
                    .unwrap_or_else(|_| chrono::Duration::hours(1));
                let due = expires.map_or(now + refresh, |e| e.max(now + refresh));
                services
                    .queue
                    .schedule(MARKET_REGIONS, i64::from(region_id), due, false)
                    .await
            }
            Err(e) => {
                // Put the region back once the window lapses instead of
                // waiting for the daily seed.
                let retry = chrono::Duration::from_std(window)
                    .unwrap_or_else(|_| chrono::Duration::minutes(15));
                if let Err(schedule_err) = services
                    .queue
                    .schedule(MARKET_REGIONS, i64::from(region_id), now + retry, false)
                    .await
                {
                    warn!(region_id, error = %schedule_err, "could not reschedule region");
                }
                Err(e)
            }
        }
    }
}

/// Orders in a player structure. Needs the bearer token; a denied
/// structure is cooled down by the fetch pool.
pub struct FetchStructureOrders;

#[async_trait]
impl Operation for FetchStructureOrders {
    fn kind(&self) -> OperationKind {
        OperationKind::StructureOrders
    }

    async fn run(&self, services: &Services, item: &WorkItem) -> Result<()> {
        let structure_id: i64 = item.param()?;
        let mut page = 1;
        loop {
            let response = services.api.structure_orders(structure_id, page).await?;
            let next = response.next_page(page);
            if !response.data.is_empty() {
                services
                    .publish(&MarketOrdersPayload {
                        source: MarketSource::Structure { structure_id },
                        page,
                        orders: response.data,
                        fetched_at: Utc::now(),
                    })
                    .await?;
            }
            match next {
                Some(n) => page = n,
                None => return Ok(()),
            }
        }
    }
}

/// Recent daily statistics for one type in one region. Older days are
/// dropped before publishing.
pub struct FetchMarketHistory;

#[async_trait]
impl Operation for FetchMarketHistory {
    fn kind(&self) -> OperationKind {
        OperationKind::MarketHistory
    }

    async fn run(&self, services: &Services, item: &WorkItem) -> Result<()> {
        let (region_id, type_id): (i32, i32) = item.param()?;
        let entries = services.api.market_history(region_id, type_id).await?.data;
        let history = recent_history(entries, Utc::now(), services.fetch.market_history_days);
        if history.is_empty() {
            debug!(region_id, type_id, "no recent market history");
            return Ok(());
        }
        services
            .publish(&MarketHistoryPayload {
                region_id,
                type_id,
                history,
            })
            .await?;
        Ok(())
    }
}

/// A single killmail, addressed as `[hash, id]` and skipped when already
/// known. Characters on it are queued at low priority. Kills of
/// ground-combat ships are not published and only their attackers are
/// followed.
pub struct FetchKillmail;

#[async_trait]
impl Operation for FetchKillmail {
    fn kind(&self) -> OperationKind {
        OperationKind::Killmail
    }

    async fn run(&self, services: &Services, item: &WorkItem) -> Result<()> {
        let (hash, killmail_id): (String, i32) = item.param()?;
        let key = killmail_id.to_string();
        if services.queue.check_completed(KNOWN_KILLS, &key).await? {
            debug!(killmail_id, "killmail already known");
            return Ok(());
        }

        let killmail = services.api.killmail(killmail_id, &hash).await?.data;
        let dust = killmail.is_dust();
        let followed = if dust {
            killmail.attacker_ids()
        } else {
            killmail.character_ids()
        };
        let characters: Vec<Work> = followed
            .into_iter()
            .map(|id| Work::new(OperationKind::Character, id))
            .collect();
        if dust {
            debug!(
                killmail_id,
                ship_type_id = killmail.victim.ship_type_id,
                "ground-combat kill not stored"
            );
        } else {
            services.publish(&KillmailPayload { hash, killmail }).await?;
        }
        services
            .queue
            .mark_completed(KNOWN_KILLS, &key, services.fetch.known_kill_ttl())
            .await?;
        services.queue.enqueue(characters, Priority::Low).await?;
        Ok(())
    }
}

/// A war record. Corporations fighting outside an alliance and every
/// killmail not yet known are queued at low priority. Wars that have
/// ended are remembered and not fetched again.
pub struct FetchWar;

impl FetchWar {
    async fn unknown_killmails(&self, services: &Services, war_id: i32) -> Result<Vec<Work>> {
        let mut page = 1;
        let mut work = Vec::new();
        loop {
            let response = services.api.war_killmails(war_id, page).await?;
            let next = response.next_page(page);
            for kill in response.data {
                let known = services
                    .queue
                    .check_completed(KNOWN_KILLS, &kill.killmail_id.to_string())
                    .await?;
                if !known {
                    work.push(Work::new(
                        OperationKind::Killmail,
                        json!([kill.killmail_hash, kill.killmail_id]),
                    ));
                }
            }
            match next {
                Some(n) => page = n,
                None => return Ok(work),
            }
        }
    }
}

#[async_trait]
impl Operation for FetchWar {
    fn kind(&self) -> OperationKind {
        OperationKind::War
    }

    async fn run(&self, services: &Services, item: &WorkItem) -> Result<()> {
        let war_id: i32 = item.param()?;
        let key = war_id.to_string();
        if services.queue.check_completed(FINISHED_WARS, &key).await? {
            debug!(war_id, "war already finished");
            return Ok(());
        }

        let war = services.api.war(war_id).await?.data;
        let now = Utc::now();
        let finished = war.is_over(now);
        let corporations: Vec<Work> = war
            .unaffiliated_corporations()
            .into_iter()
            .map(|id| Work::new(OperationKind::Corporation, id))
            .collect();
        services
            .publish(&WarPayload {
                war_id,
                war,
                fetched_at: now,
            })
            .await?;
        services.queue.enqueue(corporations, Priority::Low).await?;

        let kills = self.unknown_killmails(services, war_id).await?;
        debug!(war_id, killmails = kills.len(), "war killmails queued");
        services.queue.enqueue(kills, Priority::Low).await?;

        if finished {
            services
                .queue
                .mark_completed(FINISHED_WARS, &key, services.fetch.finished_war_ttl())
                .await?;
        }
        Ok(())
    }
}

/// Aggregate maintenance written straight to the store.
pub struct MaintainMarket;

#[async_trait]
impl Operation for MaintainMarket {
    fn kind(&self) -> OperationKind {
        OperationKind::MarketMaintenance
    }

    async fn run(&self, services: &Services, _item: &WorkItem) -> Result<()> {
        let store = services.store.as_ref();
        let now = Utc::now();
        let report =
            retry_on_conflict("market_maintenance", move || store.maintain_market(now)).await?;
        info!(
            orders_purged = report.orders_purged,
            alliances_updated = report.alliances_updated,
            "market maintenance done"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn one_handler_per_operation() {
        let kinds: Vec<OperationKind> = all().iter().map(|op| op.kind()).collect();
        assert_eq!(kinds, OperationKind::ALL.to_vec());
        let unique: HashSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
    }
}
