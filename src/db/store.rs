//! Entity store on Postgres.
//!
//! Single-entity writes are one `INSERT … ON CONFLICT DO UPDATE`; list
//! payloads go out as one multi-row upsert per chunk. The entity row and
//! its `entities` registration share a transaction.

use crate::error::Result;
use crate::model::Notification;
use crate::model::esi::RequiredItem;
use crate::model::message::{
    AllianceHistoryPayload, AlliancePayload, CharacterPayload, CorporationHistoryPayload,
    CorporationPayload, KillmailPayload, LoyaltyStorePayload, MarketHistoryPayload,
    MarketOrdersPayload, MarketSource, WarPayload,
};
use crate::store::{
    AllianceRow, CharacterRow, CorporationRow, EntityKind, FIRST_PLAYER_ID, MaintenanceReport,
    Store, dedup_by_key, stale_order_age,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Transaction};
use tracing::debug;

/// Rows per multi-row statement. Orders carry 15 binds per row.
const BATCH_ROWS: usize = 2000;

async fn register_entity(
    tx: &mut Transaction<'_, Postgres>,
    id: i32,
    kind: EntityKind,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO entities (id, kind) VALUES ($1, $2)
         ON CONFLICT (id) DO UPDATE SET kind = EXCLUDED.kind",
    )
    .bind(id)
    .bind(kind.as_str())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn source_columns(source: MarketSource) -> (&'static str, i64) {
    match source {
        MarketSource::Region { region_id } => ("region", i64::from(region_id)),
        MarketSource::Structure { structure_id } => ("structure", structure_id),
    }
}

#[async_trait]
impl Store for super::Db {
    async fn upsert_character(&self, payload: &CharacterPayload) -> Result<()> {
        let row = CharacterRow::from_payload(payload);
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO characters
                 (character_id, name, corporation_id, alliance_id, faction_id, birthday, gender,
                  race_id, bloodline_id, ancestry_id, security_status, updated_at, cache_until)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
             ON CONFLICT (character_id) DO UPDATE SET
                 name = EXCLUDED.name,
                 corporation_id = EXCLUDED.corporation_id,
                 alliance_id = EXCLUDED.alliance_id,
                 faction_id = EXCLUDED.faction_id,
                 birthday = EXCLUDED.birthday,
                 gender = EXCLUDED.gender,
                 race_id = EXCLUDED.race_id,
                 bloodline_id = EXCLUDED.bloodline_id,
                 ancestry_id = EXCLUDED.ancestry_id,
                 security_status = EXCLUDED.security_status,
                 updated_at = EXCLUDED.updated_at,
                 cache_until = EXCLUDED.cache_until",
        )
        .bind(row.character_id)
        .bind(&row.name)
        .bind(row.corporation_id)
        .bind(row.alliance_id)
        .bind(row.faction_id)
        .bind(row.birthday)
        .bind(&row.gender)
        .bind(row.race_id)
        .bind(row.bloodline_id)
        .bind(row.ancestry_id)
        .bind(row.security_status)
        .bind(row.updated_at)
        .bind(row.cache_until)
        .execute(&mut *tx)
        .await?;
        register_entity(&mut tx, row.character_id, EntityKind::Character).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_corporation(&self, payload: &CorporationPayload) -> Result<()> {
        let row = CorporationRow::from_payload(payload);
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO corporations
                 (corporation_id, name, ticker, ceo_id, alliance_id, faction_id, member_count,
                  date_founded, updated_at, cache_until)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (corporation_id) DO UPDATE SET
                 name = EXCLUDED.name,
                 ticker = EXCLUDED.ticker,
                 ceo_id = EXCLUDED.ceo_id,
                 alliance_id = EXCLUDED.alliance_id,
                 faction_id = EXCLUDED.faction_id,
                 member_count = EXCLUDED.member_count,
                 date_founded = EXCLUDED.date_founded,
                 updated_at = EXCLUDED.updated_at,
                 cache_until = EXCLUDED.cache_until",
        )
        .bind(row.corporation_id)
        .bind(&row.name)
        .bind(&row.ticker)
        .bind(row.ceo_id)
        .bind(row.alliance_id)
        .bind(row.faction_id)
        .bind(row.member_count)
        .bind(row.date_founded)
        .bind(row.updated_at)
        .bind(row.cache_until)
        .execute(&mut *tx)
        .await?;
        register_entity(&mut tx, row.corporation_id, EntityKind::Corporation).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_alliance(&self, payload: &AlliancePayload) -> Result<()> {
        let row = AllianceRow::from_payload(payload);
        let mut tx = self.pool().begin().await?;
        // member_count belongs to maintenance and is left alone on update.
        sqlx::query(
            "INSERT INTO alliances
                 (alliance_id, name, ticker, executor_corporation_id, faction_id, date_founded,
                  corporation_count, member_count, updated_at, cache_until)
             VALUES ($1, $2, $3, $4, $5, $6, $7, 0, $8, $9)
             ON CONFLICT (alliance_id) DO UPDATE SET
                 name = EXCLUDED.name,
                 ticker = EXCLUDED.ticker,
                 executor_corporation_id = EXCLUDED.executor_corporation_id,
                 faction_id = EXCLUDED.faction_id,
                 date_founded = EXCLUDED.date_founded,
                 corporation_count = EXCLUDED.corporation_count,
                 updated_at = EXCLUDED.updated_at,
                 cache_until = EXCLUDED.cache_until",
        )
        .bind(row.alliance_id)
        .bind(&row.name)
        .bind(&row.ticker)
        .bind(row.executor_corporation_id)
        .bind(row.faction_id)
        .bind(row.date_founded)
        .bind(row.corporation_count)
        .bind(row.updated_at)
        .bind(row.cache_until)
        .execute(&mut *tx)
        .await?;
        register_entity(&mut tx, row.alliance_id, EntityKind::Alliance).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_corporation_history(&self, payload: &CorporationHistoryPayload) -> Result<()> {
        let entries = dedup_by_key(&payload.history, |e| e.record_id);
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        for chunk in entries.chunks(BATCH_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO corporation_history
                     (character_id, record_id, corporation_id, start_date, is_deleted) ",
            );
            qb.push_values(chunk, |mut b, e| {
                b.push_bind(payload.character_id)
                    .push_bind(e.record_id)
                    .push_bind(e.corporation_id)
                    .push_bind(e.start_date)
                    .push_bind(e.is_deleted);
            });
            qb.push(
                " ON CONFLICT (character_id, record_id) DO UPDATE SET
                     corporation_id = EXCLUDED.corporation_id,
                     start_date = EXCLUDED.start_date,
                     is_deleted = EXCLUDED.is_deleted",
            );
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_alliance_history(&self, payload: &AllianceHistoryPayload) -> Result<()> {
        let entries = dedup_by_key(&payload.history, |e| e.record_id);
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool().begin().await?;
        for chunk in entries.chunks(BATCH_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO alliance_history
                     (corporation_id, record_id, alliance_id, start_date, is_deleted) ",
            );
            qb.push_values(chunk, |mut b, e| {
                b.push_bind(payload.corporation_id)
                    .push_bind(e.record_id)
                    .push_bind(e.alliance_id)
                    .push_bind(e.start_date)
                    .push_bind(e.is_deleted);
            });
            qb.push(
                " ON CONFLICT (corporation_id, record_id) DO UPDATE SET
                     alliance_id = EXCLUDED.alliance_id,
                     start_date = EXCLUDED.start_date,
                     is_deleted = EXCLUDED.is_deleted",
            );
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_loyalty_offers(&self, payload: &LoyaltyStorePayload) -> Result<()> {
        let offers = dedup_by_key(&payload.offers, |o| o.offer_id);
        if offers.is_empty() {
            return Ok(());
        }
        let requirements: Vec<(i32, &RequiredItem)> = offers
            .iter()
            .flat_map(|o| o.required_items.iter().map(move |r| (o.offer_id, r)))
            .collect();
        let requirements = dedup_by_key(&requirements, |(offer, r)| (*offer, r.type_id));

        let mut tx = self.pool().begin().await?;
        for chunk in offers.chunks(BATCH_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO lp_offers
                     (corporation_id, offer_id, type_id, quantity, lp_cost, isk_cost, ak_cost) ",
            );
            qb.push_values(chunk, |mut b, o| {
                b.push_bind(payload.corporation_id)
                    .push_bind(o.offer_id)
                    .push_bind(o.type_id)
                    .push_bind(o.quantity)
                    .push_bind(o.lp_cost)
                    .push_bind(o.isk_cost)
                    .push_bind(o.ak_cost);
            });
            qb.push(
                " ON CONFLICT (corporation_id, offer_id) DO UPDATE SET
                     type_id = EXCLUDED.type_id,
                     quantity = EXCLUDED.quantity,
                     lp_cost = EXCLUDED.lp_cost,
                     isk_cost = EXCLUDED.isk_cost,
                     ak_cost = EXCLUDED.ak_cost",
            );
            qb.build().execute(&mut *tx).await?;
        }
        for chunk in requirements.chunks(BATCH_ROWS) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO lp_offer_requirements (offer_id, type_id, quantity) ");
            qb.push_values(chunk, |mut b, (offer_id, r)| {
                b.push_bind(*offer_id)
                    .push_bind(r.type_id)
                    .push_bind(r.quantity);
            });
            qb.push(
                " ON CONFLICT (offer_id, type_id) DO UPDATE SET quantity = EXCLUDED.quantity",
            );
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_market_orders(&self, payload: &MarketOrdersPayload) -> Result<()> {
        let orders = dedup_by_key(&payload.orders, |o| o.order_id);
        if orders.is_empty() {
            return Ok(());
        }
        let (source_kind, source_id) = source_columns(payload.source);
        let mut tx = self.pool().begin().await?;
        for chunk in orders.chunks(BATCH_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO market_orders
                     (order_id, source_kind, source_id, type_id, location_id, system_id,
                      volume_total, volume_remain, min_volume, price, is_buy_order, duration,
                      issued, range, reported_at) ",
            );
            qb.push_values(chunk, |mut b, o| {
                b.push_bind(o.order_id)
                    .push_bind(source_kind)
                    .push_bind(source_id)
                    .push_bind(o.type_id)
                    .push_bind(o.location_id)
                    .push_bind(o.system_id)
                    .push_bind(o.volume_total)
                    .push_bind(o.volume_remain)
                    .push_bind(o.min_volume)
                    .push_bind(o.price)
                    .push_bind(o.is_buy_order)
                    .push_bind(o.duration)
                    .push_bind(o.issued)
                    .push_bind(&o.range)
                    .push_bind(payload.fetched_at);
            });
            qb.push(
                " ON CONFLICT (order_id) DO UPDATE SET
                     source_kind = EXCLUDED.source_kind,
                     source_id = EXCLUDED.source_id,
                     volume_remain = EXCLUDED.volume_remain,
                     price = EXCLUDED.price,
                     issued = EXCLUDED.issued,
                     duration = EXCLUDED.duration,
                     reported_at = EXCLUDED.reported_at",
            );
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_killmail(&self, payload: &KillmailPayload) -> Result<()> {
        let km = &payload.killmail;
        let mut tx = self.pool().begin().await?;
        sqlx::query(
            "INSERT INTO killmails
                 (killmail_id, hash, killmail_time, solar_system_id, war_id, victim_character_id,
                  victim_corporation_id, victim_alliance_id, ship_type_id, damage_taken)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             ON CONFLICT (killmail_id) DO UPDATE SET
                 hash = EXCLUDED.hash,
                 killmail_time = EXCLUDED.killmail_time,
                 solar_system_id = EXCLUDED.solar_system_id,
                 war_id = EXCLUDED.war_id,
                 victim_character_id = EXCLUDED.victim_character_id,
                 victim_corporation_id = EXCLUDED.victim_corporation_id,
                 victim_alliance_id = EXCLUDED.victim_alliance_id,
                 ship_type_id = EXCLUDED.ship_type_id,
                 damage_taken = EXCLUDED.damage_taken",
        )
        .bind(km.killmail_id)
        .bind(&payload.hash)
        .bind(km.killmail_time)
        .bind(km.solar_system_id)
        .bind(km.war_id)
        .bind(km.victim.character_id)
        .bind(km.victim.corporation_id)
        .bind(km.victim.alliance_id)
        .bind(km.victim.ship_type_id)
        .bind(km.victim.damage_taken)
        .execute(&mut *tx)
        .await?;

        let attackers: Vec<(i32, _)> = km
            .attackers
            .iter()
            .enumerate()
            .map(|(i, a)| (i as i32, a))
            .collect();
        for chunk in attackers.chunks(BATCH_ROWS) {
            let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO killmail_attackers
                     (killmail_id, position, character_id, corporation_id, alliance_id,
                      ship_type_id, weapon_type_id, damage_done, final_blow) ",
            );
            qb.push_values(chunk, |mut b, (position, a)| {
                b.push_bind(km.killmail_id)
                    .push_bind(*position)
                    .push_bind(a.character_id)
                    .push_bind(a.corporation_id)
                    .push_bind(a.alliance_id)
                    .push_bind(a.ship_type_id)
                    .push_bind(a.weapon_type_id)
                    .push_bind(a.damage_done)
                    .push_bind(a.final_blow);
            });
            qb.push(
                " ON CONFLICT (killmail_id, position) DO UPDATE SET
                     character_id = EXCLUDED.character_id,
                     corporation_id = EXCLUDED.corporation_id,
                     alliance_id = EXCLUDED.alliance_id,
                     ship_type_id = EXCLUDED.ship_type_id,
                     weapon_type_id = EXCLUDED.weapon_type_id,
                     damage_done = EXCLUDED.damage_done,
                     final_blow = EXCLUDED.final_blow",
            );
            qb.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_war(&self, payload: &WarPayload) -> Result<()> {
        let war = &payload.war;
        sqlx::query(
            "INSERT INTO wars
                 (war_id, declared, started, finished, retracted, mutual, open_for_allies,
                  aggressor_alliance_id, aggressor_corporation_id, aggressor_isk_destroyed,
                  aggressor_ships_killed, defender_alliance_id, defender_corporation_id,
                  defender_isk_destroyed, defender_ships_killed, allies, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
             ON CONFLICT (war_id) DO UPDATE SET
                 started = EXCLUDED.started,
                 finished = EXCLUDED.finished,
                 retracted = EXCLUDED.retracted,
                 mutual = EXCLUDED.mutual,
                 open_for_allies = EXCLUDED.open_for_allies,
                 aggressor_isk_destroyed = EXCLUDED.aggressor_isk_destroyed,
                 aggressor_ships_killed = EXCLUDED.aggressor_ships_killed,
                 defender_isk_destroyed = EXCLUDED.defender_isk_destroyed,
                 defender_ships_killed = EXCLUDED.defender_ships_killed,
                 allies = EXCLUDED.allies,
                 updated_at = EXCLUDED.updated_at",
        )
        .bind(payload.war_id)
        .bind(war.declared)
        .bind(war.started)
        .bind(war.finished)
        .bind(war.retracted)
        .bind(war.mutual)
        .bind(war.open_for_allies)
        .bind(war.aggressor.alliance_id)
        .bind(war.aggressor.corporation_id)
        .bind(war.aggressor.isk_destroyed)
        .bind(war.aggressor.ships_killed)
        .bind(war.defender.alliance_id)
        .bind(war.defender.corporation_id)
        .bind(war.defender.isk_destroyed)
        .bind(war.defender.ships_killed)
        .bind(Json(&war.allies))
        .bind(payload.fetched_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn upsert_market_history(&self, payload: &MarketHistoryPayload) -> Result<()> {
        let entries = dedup_by_key(&payload.history, |e| e.date);
        if entries.is_empty() {
            return Ok(());
        }
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO market_history
                 (region_id, type_id, day, lowest, highest, average, volume, order_count) ",
        );
        qb.push_values(&entries, |mut b, e| {
            b.push_bind(payload.region_id)
                .push_bind(payload.type_id)
                .push_bind(e.date)
                .push_bind(e.lowest)
                .push_bind(e.highest)
                .push_bind(e.average)
                .push_bind(e.volume)
                .push_bind(e.order_count);
        });
        qb.push(
            " ON CONFLICT (region_id, type_id, day) DO UPDATE SET
                 lowest = EXCLUDED.lowest,
                 highest = EXCLUDED.highest,
                 average = EXCLUDED.average,
                 volume = EXCLUDED.volume,
                 order_count = EXCLUDED.order_count",
        );
        qb.build().execute(self.pool()).await?;
        Ok(())
    }

    async fn record_notification(&self, notification: &Notification) -> Result<()> {
        sqlx::query(
            "INSERT INTO notifications (id, kind, subject, body, created_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(notification.id)
        .bind(&notification.kind)
        .bind(&notification.subject)
        .bind(&notification.body)
        .bind(notification.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn maintain_market(&self, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let purged = sqlx::query(
            "DELETE FROM market_orders
             WHERE issued + make_interval(days => duration) < $1 OR reported_at < $2",
        )
        .bind(now)
        .bind(now - stale_order_age())
        .execute(self.pool())
        .await?;

        let updated = sqlx::query(
            "UPDATE alliances A SET member_count = COALESCE(
                 (SELECT SUM(C.member_count)::INTEGER FROM corporations C
                  WHERE C.alliance_id = A.alliance_id),
                 0)",
        )
        .execute(self.pool())
        .await?;

        let ledger = self.purge_expired_records().await?;
        debug!(ledger_rows = ledger, "expired completion records purged");

        Ok(MaintenanceReport {
            orders_purged: purged.rows_affected(),
            alliances_updated: updated.rows_affected(),
        })
    }

    async fn characters_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<i32>> {
        let rows: Vec<(i32,)> = sqlx::query_as(
            "SELECT character_id FROM characters
             WHERE character_id > $1 AND cache_until < $2
             ORDER BY cache_until
             LIMIT $3",
        )
        .bind(FIRST_PLAYER_ID)
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn corporations_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<i32>> {
        let rows: Vec<(i32,)> = sqlx::query_as(
            "SELECT corporation_id FROM corporations
             WHERE corporation_id > $1 AND member_count > 0 AND cache_until < $2
             ORDER BY cache_until
             LIMIT $3",
        )
        .bind(FIRST_PLAYER_ID)
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn market_history_pairs(&self) -> Result<Vec<(i32, i32)>> {
        let rows: Vec<(i64, i32)> = sqlx::query_as(
            "SELECT DISTINCT source_id, type_id FROM market_orders
             WHERE source_kind = 'region'
             ORDER BY source_id, type_id",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows
            .into_iter()
            .filter_map(|(region, type_id)| i32::try_from(region).ok().map(|r| (r, type_id)))
            .collect())
    }

    async fn character(&self, character_id: i32) -> Result<Option<CharacterRow>> {
        let row = sqlx::query_as(
            "SELECT character_id, name, corporation_id, alliance_id, faction_id, birthday, gender,
                    race_id, bloodline_id, ancestry_id, security_status, updated_at, cache_until
             FROM characters WHERE character_id = $1",
        )
        .bind(character_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    async fn corporation(&self, corporation_id: i32) -> Result<Option<CorporationRow>> {
        let row = sqlx::query_as(
            "SELECT corporation_id, name, ticker, ceo_id, alliance_id, faction_id, member_count,
                    date_founded, updated_at, cache_until
             FROM corporations WHERE corporation_id = $1",
        )
        .bind(corporation_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    async fn alliance(&self, alliance_id: i32) -> Result<Option<AllianceRow>> {
        let row = sqlx::query_as(
            "SELECT alliance_id, name, ticker, executor_corporation_id, faction_id, date_founded,
                    corporation_count, member_count, updated_at, cache_until
             FROM alliances WHERE alliance_id = $1",
        )
        .bind(alliance_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    async fn try_advance_trigger(
        &self,
        name: &str,
        now: DateTime<Utc>,
        next: DateTime<Utc>,
    ) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            "INSERT INTO trigger_state (name, next_eligible_at) VALUES ($1, $3)
             ON CONFLICT (name) DO UPDATE SET next_eligible_at = EXCLUDED.next_eligible_at
             WHERE trigger_state.next_eligible_at <= $2
             RETURNING name",
        )
        .bind(name)
        .bind(now)
        .bind(next)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.is_some())
    }

    async fn trigger_next_eligible(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let row: Option<(DateTime<Utc>,)> =
            sqlx::query_as("SELECT next_eligible_at FROM trigger_state WHERE name = $1")
                .bind(name)
                .fetch_optional(self.pool())
                .await?;
        Ok(row.map(|(at,)| at))
    }
}
