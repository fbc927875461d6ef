//! Persistence pool: ack/requeue/drop decisions, idempotence, conflict retry.

mod common;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use common::{StubApi, character_json, harness, order_json};
use harvest::bus::{self, Bus};
use harvest::config::PersistConfig;
use harvest::engine::handlers;
use harvest::engine::{Disposition, PersistPool, TopicHandler, TopicRegistry};
use harvest::error::{Error, Result};
use harvest::model::Topic;
use harvest::model::esi::MarketHistoryEntry;
use harvest::model::message::{
    AlliancePayload, CharacterPayload, MarketHistoryPayload, MarketOrdersPayload, MarketSource,
};
use harvest::store::Store;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn pool(h: &common::Harness) -> PersistPool {
    PersistPool::new(
        h.services.bus.clone(),
        h.services.store.clone(),
        TopicRegistry::standard().unwrap(),
        PersistConfig::default(),
    )
    .unwrap()
}

fn character_payload() -> CharacterPayload {
    CharacterPayload {
        character_id: 95_465_499,
        character: serde_json::from_value(character_json()).unwrap(),
        fetched_at: Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap(),
    }
}

fn orders_payload() -> MarketOrdersPayload {
    MarketOrdersPayload {
        source: MarketSource::Region {
            region_id: 10_000_002,
        },
        page: 1,
        // The same order twice in one page; the later copy wins.
        orders: vec![
            serde_json::from_value(order_json(6_000_000_001, 34)).unwrap(),
            serde_json::from_value(order_json(6_000_000_002, 35)).unwrap(),
            serde_json::from_value(order_json(6_000_000_001, 34)).unwrap(),
        ],
        fetched_at: Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap(),
    }
}

#[tokio::test]
async fn handled_message_is_acked_and_stored() {
    let h = harness(StubApi::new());
    bus::publish(h.bus.as_ref(), &character_payload()).await.unwrap();

    assert_eq!(pool(&h).drain(Topic::Character).await.unwrap(), 1);

    assert_eq!(h.bus.pending(Topic::Character).await, 0);
    let row = h.store.character(95_465_499).await.unwrap().unwrap();
    assert_eq!(row.name, "Ignatius Crumwell");
    assert_eq!(row.corporation_id, 98_000_001);
    assert_eq!(row.cache_until, row.updated_at + chrono::Duration::days(31));
}

#[tokio::test]
async fn applying_a_message_twice_changes_nothing() {
    let h = harness(StubApi::new());
    let pool = pool(&h);

    bus::publish(h.bus.as_ref(), &character_payload()).await.unwrap();
    bus::publish(h.bus.as_ref(), &orders_payload()).await.unwrap();
    pool.drain_all().await.unwrap();
    let once = h.store.snapshot().await;
    assert_eq!(once.market_orders.len(), 2);

    bus::publish(h.bus.as_ref(), &character_payload()).await.unwrap();
    bus::publish(h.bus.as_ref(), &orders_payload()).await.unwrap();
    pool.drain_all().await.unwrap();

    assert_eq!(h.store.snapshot().await, once);
}

fn history_payload(volume: i64) -> MarketHistoryPayload {
    let day = |d| NaiveDate::from_ymd_opt(2026, 10, d).unwrap();
    MarketHistoryPayload {
        region_id: 10_000_002,
        type_id: 34,
        history: [15, 16]
            .into_iter()
            .map(|d| MarketHistoryEntry {
                date: day(d),
                lowest: 4.9,
                highest: 5.6,
                average: 5.25,
                volume: volume + i64::from(d),
                order_count: 40,
            })
            .collect(),
    }
}

#[tokio::test]
async fn later_history_report_replaces_the_day() {
    let h = harness(StubApi::new());
    let pool = pool(&h);

    bus::publish(h.bus.as_ref(), &history_payload(1000)).await.unwrap();
    pool.drain(Topic::MarketHistory).await.unwrap();
    bus::publish(h.bus.as_ref(), &history_payload(2000)).await.unwrap();
    pool.drain(Topic::MarketHistory).await.unwrap();

    let history = h.store.snapshot().await.market_history;
    let volumes: Vec<i64> = history.values().map(|e| e.volume).collect();
    assert_eq!(volumes, vec![2015, 2016]);
}

#[tokio::test(start_paused = true)]
async fn conflicts_are_retried_inside_the_handler() {
    let h = harness(StubApi::new());
    h.store.inject_conflicts(3);
    bus::publish(h.bus.as_ref(), &character_payload()).await.unwrap();

    let delivery = h
        .bus
        .receive(Topic::Character, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    let outcome = pool(&h).handle_delivery(delivery).await.unwrap();

    assert_eq!(outcome, Disposition::Acked);
    assert!(h.store.character(95_465_499).await.unwrap().is_some());
}

#[tokio::test]
async fn malformed_message_is_dropped() {
    let h = harness(StubApi::new());
    h.bus
        .publish(Topic::Character, &json!({"character_id": "not a number"}))
        .await
        .unwrap();

    let delivery = h
        .bus
        .receive(Topic::Character, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    let outcome = pool(&h).handle_delivery(delivery).await.unwrap();

    assert_eq!(outcome, Disposition::Dropped);
    assert_eq!(h.bus.pending(Topic::Character).await, 0);
    assert!(h.store.snapshot().await.characters.is_empty());
}

struct Unwritable;

#[async_trait]
impl TopicHandler for Unwritable {
    fn topic(&self) -> Topic {
        Topic::Character
    }

    async fn handle(&self, _store: &dyn Store, _payload: serde_json::Value) -> Result<()> {
        Err(Error::Storage(sqlx::Error::PoolTimedOut))
    }
}

#[tokio::test(start_paused = true)]
async fn storage_failure_requeues_for_later() {
    let h = harness(StubApi::new());
    let mut registry = TopicRegistry::new();
    for handler in handlers::all() {
        if handler.topic() != Topic::Character {
            registry.register(handler).unwrap();
        }
    }
    registry.register(Arc::new(Unwritable)).unwrap();
    let config = PersistConfig {
        requeue_delay_secs: 5,
        ..PersistConfig::default()
    };
    let pool = PersistPool::new(h.services.bus.clone(), h.services.store.clone(), registry, config)
        .unwrap();

    bus::publish(h.bus.as_ref(), &character_payload()).await.unwrap();
    let delivery = h
        .bus
        .receive(Topic::Character, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        pool.handle_delivery(delivery).await.unwrap(),
        Disposition::Requeued
    );
    assert_eq!(h.bus.pending(Topic::Character).await, 1);

    // Hidden until the requeue delay passes, then redelivered.
    assert_eq!(pool.drain(Topic::Character).await.unwrap(), 0);
    tokio::time::advance(Duration::from_secs(6)).await;
    let again = h
        .bus
        .receive(Topic::Character, Duration::from_secs(60))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.read_count, 2);
}

#[tokio::test]
async fn alliance_upsert_keeps_maintained_member_count() {
    let h = harness(StubApi::new());
    let payload = AlliancePayload {
        alliance_id: 99_000_001,
        alliance: serde_json::from_value(json!({
            "name": "Test Alliance Please Ignore",
            "ticker": "TEST",
            "executor_corporation_id": 98_000_001,
            "creator_id": 95_465_499,
            "date_founded": "2010-05-12T00:00:00Z"
        }))
        .unwrap(),
        corporations: vec![98_000_001, 98_000_002],
        fetched_at: Utc.with_ymd_and_hms(2026, 10, 16, 9, 0, 0).unwrap(),
    };
    bus::publish(h.bus.as_ref(), &payload).await.unwrap();
    pool(&h).drain(Topic::Alliance).await.unwrap();

    let row = h.store.alliance(99_000_001).await.unwrap().unwrap();
    assert_eq!(row.corporation_count, 2);
    assert_eq!(row.member_count, 0);
}

#[tokio::test(start_paused = true)]
async fn run_stops_after_shutdown_with_nothing_in_flight() {
    let h = harness(StubApi::new());
    let pool = Arc::new(pool(&h));
    let (trigger, stop) = harvest::shutdown::channel();
    let running = tokio::spawn(pool.clone().run(stop));

    bus::publish(h.bus.as_ref(), &character_payload()).await.unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    trigger.trigger();
    running.await.unwrap().unwrap();

    assert_eq!(pool.in_flight(), 0);
    assert_eq!(h.bus.pending(Topic::Character).await, 0);
    assert!(h.store.character(95_465_499).await.unwrap().is_some());
}
