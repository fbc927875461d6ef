//! Result messages published by fetch workers and consumed by persistence
//! workers.

use super::esi;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// The closed set of bus topics. Each has exactly one persistence handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Topic {
    Character,
    Corporation,
    Alliance,
    CorporationHistory,
    AllianceHistory,
    LoyaltyStore,
    MarketOrders,
    MarketHistory,
    Killmail,
    War,
    /// Operator-facing notices (trigger failures, applied cool-downs).
    Notification,
}

impl Topic {
    pub const ALL: [Topic; 11] = [
        Topic::Character,
        Topic::Corporation,
        Topic::Alliance,
        Topic::CorporationHistory,
        Topic::AllianceHistory,
        Topic::LoyaltyStore,
        Topic::MarketOrders,
        Topic::MarketHistory,
        Topic::Killmail,
        Topic::War,
        Topic::Notification,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::Character => "character",
            Topic::Corporation => "corporation",
            Topic::Alliance => "alliance",
            Topic::CorporationHistory => "corporationHistory",
            Topic::AllianceHistory => "allianceHistory",
            Topic::LoyaltyStore => "loyaltyStore",
            Topic::MarketOrders => "marketOrders",
            Topic::MarketHistory => "marketHistory",
            Topic::Killmail => "killmail",
            Topic::War => "war",
            Topic::Notification => "notification",
        }
    }

    /// Name of the backing queue on the bus.
    pub fn queue_name(self) -> &'static str {
        match self {
            Topic::Character => "harvest_character",
            Topic::Corporation => "harvest_corporation",
            Topic::Alliance => "harvest_alliance",
            Topic::CorporationHistory => "harvest_corporation_history",
            Topic::AllianceHistory => "harvest_alliance_history",
            Topic::LoyaltyStore => "harvest_loyalty_store",
            Topic::MarketOrders => "harvest_market_orders",
            Topic::MarketHistory => "harvest_market_history",
            Topic::Killmail => "harvest_killmail",
            Topic::War => "harvest_war",
            Topic::Notification => "harvest_notification",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Topic::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::UnknownTopic(s.to_string()))
    }
}

/// A payload type bound to the topic it is published on.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync {
    const TOPIC: Topic;
}

// ---------------------------------------------------------------------------
// Result message
// ---------------------------------------------------------------------------

/// An encoded payload on its topic. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultMessage {
    topic: Topic,
    payload: serde_json::Value,
}

impl ResultMessage {
    pub fn new<T: Payload>(payload: &T) -> Result<Self> {
        Ok(Self {
            topic: T::TOPIC,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterPayload {
    pub character_id: i32,
    pub character: esi::Character,
    pub fetched_at: DateTime<Utc>,
}

impl Payload for CharacterPayload {
    const TOPIC: Topic = Topic::Character;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorporationPayload {
    pub corporation_id: i32,
    pub corporation: esi::Corporation,
    pub fetched_at: DateTime<Utc>,
}

impl Payload for CorporationPayload {
    const TOPIC: Topic = Topic::Corporation;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlliancePayload {
    pub alliance_id: i32,
    pub alliance: esi::Alliance,
    pub corporations: Vec<i32>,
    pub fetched_at: DateTime<Utc>,
}

impl Payload for AlliancePayload {
    const TOPIC: Topic = Topic::Alliance;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorporationHistoryPayload {
    pub character_id: i32,
    pub history: Vec<esi::CorporationHistoryEntry>,
}

impl Payload for CorporationHistoryPayload {
    const TOPIC: Topic = Topic::CorporationHistory;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllianceHistoryPayload {
    pub corporation_id: i32,
    pub history: Vec<esi::AllianceHistoryEntry>,
}

impl Payload for AllianceHistoryPayload {
    const TOPIC: Topic = Topic::AllianceHistory;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoyaltyStorePayload {
    pub corporation_id: i32,
    pub offers: Vec<esi::LoyaltyOffer>,
}

impl Payload for LoyaltyStorePayload {
    const TOPIC: Topic = Topic::LoyaltyStore;
}

/// Where a page of market orders came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketSource {
    Region { region_id: i32 },
    Structure { structure_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOrdersPayload {
    pub source: MarketSource,
    pub page: u32,
    pub orders: Vec<esi::MarketOrder>,
    pub fetched_at: DateTime<Utc>,
}

impl Payload for MarketOrdersPayload {
    const TOPIC: Topic = Topic::MarketOrders;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillmailPayload {
    pub hash: String,
    pub killmail: esi::Killmail,
}

impl Payload for KillmailPayload {
    const TOPIC: Topic = Topic::Killmail;
}

/// Recent daily statistics for one item type in one region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketHistoryPayload {
    pub region_id: i32,
    pub type_id: i32,
    pub history: Vec<esi::MarketHistoryEntry>,
}

impl Payload for MarketHistoryPayload {
    const TOPIC: Topic = Topic::MarketHistory;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarPayload {
    pub war_id: i32,
    pub war: esi::War,
    pub fetched_at: DateTime<Utc>,
}

impl Payload for WarPayload {
    const TOPIC: Topic = Topic::War;
}

/// An operator-facing notice. The id makes redelivery idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub kind: String,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(kind: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            subject: subject.into(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }
}

impl Payload for Notification {
    const TOPIC: Topic = Topic::Notification;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_parse_from_their_names() {
        for topic in Topic::ALL {
            assert_eq!(topic.as_str().parse::<Topic>().unwrap(), topic);
            assert!(topic.queue_name().starts_with("harvest_"));
        }
        assert!(matches!("wars".parse::<Topic>(), Err(Error::UnknownTopic(_))));
    }

    #[test]
    fn message_takes_topic_from_payload_type() {
        let note = Notification::new("trigger_failed", "characterUpdate", "boom");
        let msg = ResultMessage::new(&note).unwrap();
        assert_eq!(msg.topic(), Topic::Notification);
        assert_eq!(msg.payload()["subject"], "characterUpdate");
    }
}
