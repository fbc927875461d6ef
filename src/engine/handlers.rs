//! Persistence handlers, one per topic.
//!
//! Each decodes its payload and upserts it. Writes that hit a deadlock or
//! serialization failure are retried here; anything else goes back to the
//! pool, which requeues the message.

use super::persist::TopicHandler;
use crate::error::Result;
use crate::model::Topic;
use crate::model::message::{
    AllianceHistoryPayload, AlliancePayload, CharacterPayload, CorporationHistoryPayload,
    CorporationPayload, KillmailPayload, LoyaltyStorePayload, MarketHistoryPayload,
    MarketOrdersPayload, Notification, Payload, WarPayload,
};
use crate::store::{Store, retry_on_conflict};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// Every topic handler, in [`Topic::ALL`] order.
pub fn all() -> Vec<Arc<dyn TopicHandler>> {
    vec![
        Arc::new(CharacterHandler),
        Arc::new(CorporationHandler),
        Arc::new(AllianceHandler),
        Arc::new(CorporationHistoryHandler),
        Arc::new(AllianceHistoryHandler),
        Arc::new(LoyaltyStoreHandler),
        Arc::new(MarketOrdersHandler),
        Arc::new(MarketHistoryHandler),
        Arc::new(KillmailHandler),
        Arc::new(WarHandler),
        Arc::new(NotificationHandler),
    ]
}

fn decode<T: Payload>(payload: serde_json::Value) -> Result<T> {
    Ok(serde_json::from_value(payload)?)
}

pub struct CharacterHandler;

#[async_trait]
impl TopicHandler for CharacterHandler {
    fn topic(&self) -> Topic {
        CharacterPayload::TOPIC
    }

    async fn handle(&self, store: &dyn Store, payload: serde_json::Value) -> Result<()> {
        let payload: CharacterPayload = decode(payload)?;
        let payload = &payload;
        retry_on_conflict("upsert_character", move || store.upsert_character(payload)).await
    }
}

pub struct CorporationHandler;

#[async_trait]
impl TopicHandler for CorporationHandler {
    fn topic(&self) -> Topic {
        CorporationPayload::TOPIC
    }

    async fn handle(&self, store: &dyn Store, payload: serde_json::Value) -> Result<()> {
        let payload: CorporationPayload = decode(payload)?;
        let payload = &payload;
        retry_on_conflict("upsert_corporation", move || {
            store.upsert_corporation(payload)
        })
        .await
    }
}

pub struct AllianceHandler;

#[async_trait]
impl TopicHandler for AllianceHandler {
    fn topic(&self) -> Topic {
        AlliancePayload::TOPIC
    }

    async fn handle(&self, store: &dyn Store, payload: serde_json::Value) -> Result<()> {
        let payload: AlliancePayload = decode(payload)?;
        let payload = &payload;
        retry_on_conflict("upsert_alliance", move || store.upsert_alliance(payload)).await
    }
}

pub struct CorporationHistoryHandler;

#[async_trait]
impl TopicHandler for CorporationHistoryHandler {
    fn topic(&self) -> Topic {
        CorporationHistoryPayload::TOPIC
    }

    async fn handle(&self, store: &dyn Store, payload: serde_json::Value) -> Result<()> {
        let payload: CorporationHistoryPayload = decode(payload)?;
        let payload = &payload;
        retry_on_conflict("upsert_corporation_history", move || {
            store.upsert_corporation_history(payload)
        })
        .await
    }
}

pub struct AllianceHistoryHandler;

#[async_trait]
impl TopicHandler for AllianceHistoryHandler {
    fn topic(&self) -> Topic {
        AllianceHistoryPayload::TOPIC
    }

    async fn handle(&self, store: &dyn Store, payload: serde_json::Value) -> Result<()> {
        let payload: AllianceHistoryPayload = decode(payload)?;
        let payload = &payload;
        retry_on_conflict("upsert_alliance_history", move || {
            store.upsert_alliance_history(payload)
        })
        .await
    }
}

pub struct LoyaltyStoreHandler;

#[async_trait]
impl TopicHandler for LoyaltyStoreHandler {
    fn topic(&self) -> Topic {
        LoyaltyStorePayload::TOPIC
    }

    async fn handle(&self, store: &dyn Store, payload: serde_json::Value) -> Result<()> {
        let payload: LoyaltyStorePayload = decode(payload)?;
        let payload = &payload;
        retry_on_conflict("upsert_loyalty_offers", move || {
            store.upsert_loyalty_offers(payload)
        })
        .await
    }
}

pub struct MarketOrdersHandler;

#[async_trait]
impl TopicHandler for MarketOrdersHandler {
    fn topic(&self) -> Topic {
        MarketOrdersPayload::TOPIC
    }

    async fn handle(&self, store: &dyn Store, payload: serde_json::Value) -> Result<()> {
        let payload: MarketOrdersPayload = decode(payload)?;
        let payload = &payload;
        retry_on_conflict("upsert_market_orders", move || {
            store.upsert_market_orders(payload)
        })
        .await
    }
}

pub struct MarketHistoryHandler;

#[async_trait]
impl TopicHandler for MarketHistoryHandler {
    fn topic(&self) -> Topic {
        MarketHistoryPayload::TOPIC
    }

    async fn handle(&self, store: &dyn Store, payload: serde_json::Value) -> Result<()> {
        let payload: MarketHistoryPayload = decode(payload)?;
        let payload = &payload;
        retry_on_conflict("upsert_market_history", move || {
            store.upsert_market_history(payload)
        })
        .await
    }
}

pub struct KillmailHandler;

#[async_trait]
impl TopicHandler for KillmailHandler {
    fn topic(&self) -> Topic {
        KillmailPayload::TOPIC
    }

    async fn handle(&self, store: &dyn Store, payload: serde_json::Value) -> Result<()> {
        let payload: KillmailPayload = decode(payload)?;
        let payload = &payload;
        retry_on_conflict("upsert_killmail", move || store.upsert_killmail(payload)).await
    }
}

pub struct WarHandler;

#[async_trait]
impl TopicHandler for WarHandler {
    fn topic(&self) -> Topic {
        WarPayload::TOPIC
    }

    async fn handle(&self, store: &dyn Store, payload: serde_json::Value) -> Result<()> {
        let payload: WarPayload = decode(payload)?;
        let payload = &payload;
        retry_on_conflict("upsert_war", move || store.upsert_war(payload)).await
    }
}

/// Operator notices: surfaced in the log and kept in the store.
pub struct NotificationHandler;

#[async_trait]
impl TopicHandler for NotificationHandler {
    fn topic(&self) -> Topic {
        Notification::TOPIC
    }

    async fn handle(&self, store: &dyn Store, payload: serde_json::Value) -> Result<()> {
        let note: Notification = decode(payload)?;
        warn!(
            kind = %note.kind,
            subject = %note.subject,
            body = %note.body,
            "notification"
        );
        let note = &note;
        retry_on_conflict("record_notification", move || {
            store.record_notification(note)
        })
        .await
    }
}
