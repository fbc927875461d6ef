//! Response types of the external API.
//!
//! Field names follow the API's JSON. Optional fields the API omits for
//! some entities are `Option`; unused fields are not modelled.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
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
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorporationHistoryEntry {
    pub corporation_id: i32,
    pub record_id: i32,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Corporation {
    pub name: String,
    pub ticker: String,
    pub ceo_id: i32,
    pub alliance_id: Option<i32>,
    pub faction_id: Option<i32>,
    pub member_count: i32,
    pub date_founded: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllianceHistoryEntry {
    pub alliance_id: Option<i32>,
    pub record_id: i32,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alliance {
    pub name: String,
    pub ticker: String,
    pub executor_corporation_id: Option<i32>,
    pub creator_id: Option<i32>,
    pub faction_id: Option<i32>,
    pub date_founded: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequiredItem {
    pub type_id: i32,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoyaltyOffer {
    pub offer_id: i32,
    pub type_id: i32,
    pub quantity: i32,
    pub lp_cost: i64,
    pub isk_cost: i64,
    #[serde(default)]
    pub ak_cost: i64,
    #[serde(default)]
    pub required_items: Vec<RequiredItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOrder {
    pub order_id: i64,
    pub type_id: i32,
    pub location_id: i64,
    pub system_id: Option<i32>,
    pub volume_total: i32,
    pub volume_remain: i32,
    #[serde(default = "one")]
    pub min_volume: i32,
    pub price: f64,
    pub is_buy_order: bool,
    pub duration: i32,
    pub issued: DateTime<Utc>,
    pub range: String,
}

fn one() -> i32 {
    1
}

/// One day of trading for a type in a region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketHistoryEntry {
    pub date: NaiveDate,
    pub lowest: f64,
    pub highest: f64,
    pub average: f64,
    pub volume: i64,
    pub order_count: i64,
}

/// Entries dated within the last `days` days of `now`.
pub fn recent_history(
    entries: Vec<MarketHistoryEntry>,
    now: DateTime<Utc>,
    days: i64,
) -> Vec<MarketHistoryEntry> {
    let cutoff = (now - chrono::Duration::days(days)).date_naive();
    entries.into_iter().filter(|e| e.date > cutoff).collect()
}

/// Ship type ids from here up belong to the retired ground-combat game
/// and are not stored.
pub const DUST_TYPE_FLOOR: i32 = 65_535;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Victim {
    pub character_id: Option<i32>,
    pub corporation_id: Option<i32>,
    pub alliance_id: Option<i32>,
    pub ship_type_id: i32,
    pub damage_taken: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attacker {
    pub character_id: Option<i32>,
    pub corporation_id: Option<i32>,
    pub alliance_id: Option<i32>,
    pub ship_type_id: Option<i32>,
    pub weapon_type_id: Option<i32>,
    pub damage_done: i32,
    pub final_blow: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Killmail {
    pub killmail_id: i32,
    pub killmail_time: DateTime<Utc>,
    pub solar_system_id: i32,
    pub war_id: Option<i32>,
    pub victim: Victim,
    #[serde(default)]
    pub attackers: Vec<Attacker>,
}

impl Killmail {
    pub fn is_dust(&self) -> bool {
        self.victim.ship_type_id >= DUST_TYPE_FLOOR
    }

    /// Player characters involved, victim first, without duplicates.
    pub fn character_ids(&self) -> Vec<i32> {
        distinct(
            std::iter::once(self.victim.character_id)
                .chain(self.attackers.iter().map(|a| a.character_id))
                .flatten(),
        )
    }

    /// Attacking player characters, without duplicates.
    pub fn attacker_ids(&self) -> Vec<i32> {
        distinct(self.attackers.iter().filter_map(|a| a.character_id))
    }
}

fn distinct(ids: impl Iterator<Item = i32>) -> Vec<i32> {
    let mut out: Vec<i32> = Vec::new();
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

/// One side of a war.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarParty {
    pub alliance_id: Option<i32>,
    pub corporation_id: Option<i32>,
    #[serde(default)]
    pub isk_destroyed: f64,
    #[serde(default)]
    pub ships_killed: i32,
}

impl WarParty {
    /// The corporation fighting on its own, outside any alliance.
    pub fn unaffiliated_corporation(&self) -> Option<i32> {
        match self.alliance_id {
            Some(_) => None,
            None => self.corporation_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarAlly {
    pub alliance_id: Option<i32>,
    pub corporation_id: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct War {
    pub id: i32,
    pub declared: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub retracted: Option<DateTime<Utc>>,
    #[serde(default)]
    pub mutual: bool,
    #[serde(default)]
    pub open_for_allies: bool,
    pub aggressor: WarParty,
    pub defender: WarParty,
    #[serde(default)]
    pub allies: Vec<WarAlly>,
}

impl War {
    /// Whether the war ended before `now`.
    pub fn is_over(&self, now: DateTime<Utc>) -> bool {
        self.finished.is_some_and(|f| f < now)
    }

    /// Corporations on either side that belong to no alliance.
    pub fn unaffiliated_corporations(&self) -> Vec<i32> {
        distinct(
            [&self.aggressor, &self.defender]
                .into_iter()
                .filter_map(WarParty::unaffiliated_corporation),
        )
    }
}

/// A killmail reference listed under a war.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillmailRef {
    pub killmail_id: i32,
    pub killmail_hash: String,
}
