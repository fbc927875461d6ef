//! End to end over the in-memory backends: enqueue, fetch, publish, persist.

mod common;

use common::{
    StubApi, character_json, corporation_history_json, harness, killmail_json, ok, order_json,
    response,
};
use harvest::config::PersistConfig;
use harvest::engine::{FetchPool, OperationRegistry, PersistPool, TopicRegistry, WorkOutcome};
use harvest::model::message::{MarketOrdersPayload, Notification};
use harvest::model::{OperationKind, Priority, Topic, Work};
use harvest::queue::{
    FINISHED_WARS, KNOWN_KILLS, MARKET_REGION, MARKET_REGIONS, QueueBackend, cooldown_namespace,
};
use harvest::store::Store;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn fetch_pool(h: &common::Harness) -> FetchPool {
    FetchPool::new(h.services.clone(), OperationRegistry::standard().unwrap()).unwrap()
}

fn persist_pool(h: &common::Harness) -> PersistPool {
    PersistPool::new(
        h.services.bus.clone(),
        h.services.store.clone(),
        TopicRegistry::standard().unwrap(),
        PersistConfig::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn character_work_ends_as_a_stored_row() {
    let api = StubApi::new();
    api.route("/v5/characters/95465499/", ok(character_json()));
    api.route(
        "/v1/characters/95465499/corporationhistory/",
        ok(corporation_history_json()),
    );
    let h = harness(api);

    h.services
        .queue
        .enqueue_one(Work::new(OperationKind::Character, 95_465_499), Priority::Normal)
        .await
        .unwrap();

    // The character plus its follow-up history fetch.
    assert_eq!(fetch_pool(&h).drain().await.unwrap(), 2);
    assert_eq!(h.bus.published(Topic::Character).await.len(), 1);
    assert_eq!(h.bus.published(Topic::CorporationHistory).await.len(), 1);

    persist_pool(&h).drain_all().await.unwrap();

    let row = h.store.character(95_465_499).await.unwrap().unwrap();
    assert_eq!(row.character_id, 95_465_499);
    assert_eq!(row.name, "Ignatius Crumwell");
    assert_eq!(row.corporation_id, 98_000_001);
    assert_eq!(row.alliance_id, Some(99_000_001));
    assert_eq!(h.store.snapshot().await.corporation_history.len(), 2);
}

#[tokio::test]
async fn one_region_fetch_per_window() {
    let api = StubApi::new();
    api.route(
        "/v1/markets/10000002/orders/?page=1",
        response(
            200,
            &json!([order_json(1, 34), order_json(2, 35)]),
            &[("x-pages", "2"), ("expires", "Fri, 16 Oct 2099 12:05:00 GMT")],
        ),
    );
    api.route(
        "/v1/markets/10000002/orders/?page=2",
        response(200, &json!([order_json(3, 36)]), &[("x-pages", "2")]),
    );
    let h = harness(api.clone());

    h.services
        .queue
        .enqueue(
            vec![
                Work::new(OperationKind::MarketOrders, 10_000_002),
                Work::new(OperationKind::MarketOrders, 10_000_002),
            ],
            Priority::High,
        )
        .await
        .unwrap();
    fetch_pool(&h).drain().await.unwrap();

    assert_eq!(api.calls_to("/v1/markets/10000002/orders/?page=1"), 1);
    assert_eq!(api.calls_to("/v1/markets/10000002/orders/?page=2"), 1);
    assert_eq!(h.queue.ledger_len(MARKET_REGION).await, 1);

    let pages: Vec<MarketOrdersPayload> = h
        .bus
        .published(Topic::MarketOrders)
        .await
        .into_iter()
        .map(|v| serde_json::from_value(v).unwrap())
        .collect();
    assert_eq!(pages.iter().map(|p| p.page).collect::<Vec<_>>(), vec![1, 2]);

    // Rescheduled at the upstream expiry, which is later than the refresh interval.
    let due = h.queue.scheduled_at(MARKET_REGIONS, 10_000_002).await.unwrap();
    assert_eq!(due.to_rfc3339(), "2099-10-16T12:05:00+00:00");

    persist_pool(&h).drain_all().await.unwrap();
    assert_eq!(h.store.snapshot().await.market_orders.len(), 3);
}

#[tokio::test]
async fn refused_structure_cools_down() {
    let api = StubApi::new();
    api.route(
        "/v1/markets/structures/1035466617946/?page=1",
        response(403, &json!({"error": "forbidden"}), &[]),
    );
    let h = harness(api.clone());
    let pool = fetch_pool(&h);
    let work = || Work::new(OperationKind::StructureOrders, 1_035_466_617_946_i64);

    h.services.queue.enqueue_one(work(), Priority::Normal).await.unwrap();
    let item = h.services.queue.try_dequeue().await.unwrap().unwrap();
    assert_eq!(pool.process(item).await, WorkOutcome::CooledDown);

    h.services.queue.enqueue_one(work(), Priority::Normal).await.unwrap();
    let item = h.services.queue.try_dequeue().await.unwrap().unwrap();
    assert_eq!(pool.process(item).await, WorkOutcome::Skipped);

    assert_eq!(api.calls().len(), 1);
    let namespace = cooldown_namespace(OperationKind::StructureOrders);
    assert_eq!(h.queue.ledger_len(&namespace).await, 1);

    let notes = h.bus.published(Topic::Notification).await;
    let note: Notification = serde_json::from_value(notes[0].clone()).unwrap();
    assert_eq!(note.kind, "cooldown_applied");
}

#[tokio::test]
async fn known_killmails_are_fetched_once() {
    let api = StubApi::new();
    api.route("/v1/killmails/56271/abc123/", ok(killmail_json(56_271)));
    let h = harness(api.clone());
    let pool = fetch_pool(&h);

    for _ in 0..2 {
        h.services
            .queue
            .enqueue_one(
                Work::new(OperationKind::Killmail, json!(["abc123", 56_271])),
                Priority::Normal,
            )
            .await
            .unwrap();
        let item = h.services.queue.try_dequeue().await.unwrap().unwrap();
        assert_eq!(pool.process(item).await, WorkOutcome::Done);
    }

    assert_eq!(api.calls_to("/v1/killmails/56271/abc123/"), 1);
    assert_eq!(h.queue.ledger_len(KNOWN_KILLS).await, 1);

    // Victim and the one named attacker, deduplicated, at low priority.
    let mut ids = Vec::new();
    while let Some(item) = h.services.queue.try_dequeue().await.unwrap() {
        assert_eq!(item.operation, OperationKind::Character);
        assert_eq!(item.priority, Priority::Low);
        ids.push(item.param::<i32>().unwrap());
    }
    assert_eq!(ids, vec![95_465_499, 95_000_100]);
}

#[tokio::test]
async fn ground_combat_kills_follow_only_the_attackers() {
    let mut kill = killmail_json(56_272);
    kill["victim"]["ship_type_id"] = json!(70_000);
    let api = StubApi::new();
    api.route("/v1/killmails/56272/def456/", ok(kill));
    let h = harness(api);

    h.services
        .queue
        .enqueue_one(
            Work::new(OperationKind::Killmail, json!(["def456", 56_272])),
            Priority::Normal,
        )
        .await
        .unwrap();
    let item = h.services.queue.try_dequeue().await.unwrap().unwrap();
    assert_eq!(fetch_pool(&h).process(item).await, WorkOutcome::Done);

    assert!(h.bus.published(Topic::Killmail).await.is_empty());
    assert!(h.queue.is_completed(KNOWN_KILLS, "56272").await.unwrap());

    // The victim also appears as an attacker, so both ids are followed.
    let mut ids = Vec::new();
    while let Some(item) = h.services.queue.try_dequeue().await.unwrap() {
        assert_eq!(item.operation, OperationKind::Character);
        ids.push(item.param::<i32>().unwrap());
    }
    assert_eq!(ids, vec![95_000_100, 95_465_499]);
}

#[tokio::test]
async fn ground_combat_victim_alone_is_not_followed() {
    let mut kill = killmail_json(56_273);
    kill["victim"]["ship_type_id"] = json!(65_535);
    kill["attackers"] = json!([{"character_id": 95_000_100, "damage_done": 800, "final_blow": true}]);
    let api = StubApi::new();
    api.route("/v1/killmails/56273/aaa111/", ok(kill));
    let h = harness(api);

    h.services
        .queue
        .enqueue_one(
            Work::new(OperationKind::Killmail, json!(["aaa111", 56_273])),
            Priority::Normal,
        )
        .await
        .unwrap();
    let item = h.services.queue.try_dequeue().await.unwrap().unwrap();
    assert_eq!(fetch_pool(&h).process(item).await, WorkOutcome::Done);

    assert!(h.bus.published(Topic::Killmail).await.is_empty());
    let item = h.services.queue.try_dequeue().await.unwrap().unwrap();
    assert_eq!(item.param::<i32>().unwrap(), 95_000_100);
    assert!(h.services.queue.try_dequeue().await.unwrap().is_none());
}

fn war_json(finished: &str) -> serde_json::Value {
    json!({
        "id": 615_000,
        "declared": "2026-09-01T10:00:00Z",
        "started": "2026-09-02T10:00:00Z",
        "finished": finished,
        "mutual": false,
        "open_for_allies": true,
        "aggressor": {"alliance_id": 99_000_001, "isk_destroyed": 1.5e9, "ships_killed": 12},
        "defender": {"corporation_id": 98_000_002, "isk_destroyed": 2.0e8, "ships_killed": 3},
        "allies": [{"corporation_id": 98_000_003}]
    })
}

#[tokio::test]
async fn finished_war_queues_its_kills_once() {
    let api = StubApi::new();
    api.route("/v1/wars/615000/", ok(war_json("2026-10-01T10:00:00Z")));
    api.route(
        "/v1/wars/615000/killmails/?page=1",
        response(
            200,
            &json!([
                {"killmail_id": 56_271, "killmail_hash": "abc123"},
                {"killmail_id": 56_272, "killmail_hash": "def456"}
            ]),
            &[("x-pages", "1")],
        ),
    );
    let h = harness(api.clone());
    h.services
        .queue
        .mark_completed(KNOWN_KILLS, "56271", Duration::from_secs(3600))
        .await
        .unwrap();
    let pool = fetch_pool(&h);

    for _ in 0..2 {
        h.services
            .queue
            .enqueue_one(Work::new(OperationKind::War, 615_000), Priority::Low)
            .await
            .unwrap();
        let item = h.services.queue.try_dequeue().await.unwrap().unwrap();
        assert_eq!(pool.process(item).await, WorkOutcome::Done);
    }

    assert_eq!(api.calls_to("/v1/wars/615000/"), 1);
    assert_eq!(api.calls_to("/v1/wars/615000/killmails/?page=1"), 1);
    assert!(h.queue.is_completed(FINISHED_WARS, "615000").await.unwrap());
    assert_eq!(h.bus.published(Topic::War).await.len(), 1);

    // The defender fights outside an alliance; only the unknown kill is queued.
    let corporation = h.services.queue.try_dequeue().await.unwrap().unwrap();
    assert_eq!(corporation.operation, OperationKind::Corporation);
    assert_eq!(corporation.priority, Priority::Low);
    assert_eq!(corporation.param::<i32>().unwrap(), 98_000_002);
    let kill = h.services.queue.try_dequeue().await.unwrap().unwrap();
    assert_eq!(kill.operation, OperationKind::Killmail);
    assert_eq!(kill.param::<(String, i32)>().unwrap(), ("def456".to_string(), 56_272));
    assert!(h.services.queue.try_dequeue().await.unwrap().is_none());

    persist_pool(&h).drain_all().await.unwrap();
    let wars = h.store.snapshot().await.wars;
    assert_eq!(wars[&615_000].defender.corporation_id, Some(98_000_002));
    assert_eq!(wars[&615_000].allies.len(), 1);
}

#[tokio::test]
async fn ongoing_war_is_fetched_again() {
    let api = StubApi::new();
    api.route("/v1/wars/615000/", ok(war_json("2099-01-01T00:00:00Z")));
    api.route(
        "/v1/wars/615000/killmails/?page=1",
        response(200, &json!([]), &[("x-pages", "1")]),
    );
    let h = harness(api.clone());
    let pool = fetch_pool(&h);

    for _ in 0..2 {
        h.services
            .queue
            .enqueue_one(Work::new(OperationKind::War, 615_000), Priority::Low)
            .await
            .unwrap();
        let item = h.services.queue.try_dequeue().await.unwrap().unwrap();
        assert_eq!(pool.process(item).await, WorkOutcome::Done);
        while h.services.queue.try_dequeue().await.unwrap().is_some() {}
    }

    assert_eq!(api.calls_to("/v1/wars/615000/"), 2);
    assert!(!h.queue.is_completed(FINISHED_WARS, "615000").await.unwrap());
}

#[tokio::test]
async fn market_history_keeps_the_recent_days() {
    let today = Utc::now().date_naive();
    let day = |back: i64| (today - chrono::Duration::days(back)).to_string();
    let entry = |date: String, volume: i64| {
        json!({
            "date": date,
            "lowest": 4.9,
            "highest": 5.6,
            "average": 5.25,
            "volume": volume,
            "order_count": 40
        })
    };
    let api = StubApi::new();
    api.route(
        "/v1/markets/10000002/history/",
        ok(json!([
            entry(day(5), 900),
            entry(day(3), 1000),
            entry(day(1), 1100),
            entry(day(0), 1200)
        ])),
    );
    let h = harness(api);

    h.services
        .queue
        .enqueue_one(
            Work::new(OperationKind::MarketHistory, json!([10_000_002, 34])),
            Priority::Low,
        )
        .await
        .unwrap();
    assert_eq!(fetch_pool(&h).drain().await.unwrap(), 1);
    assert_eq!(h.bus.published(Topic::MarketHistory).await.len(), 1);

    persist_pool(&h).drain_all().await.unwrap();
    let history = h.store.snapshot().await.market_history;
    let volumes: Vec<i64> = history.values().map(|e| e.volume).collect();
    assert_eq!(volumes, vec![1100, 1200]);
    assert!(history.keys().all(|(region, type_id, _)| (*region, *type_id) == (10_000_002, 34)));
}

#[tokio::test]
async fn bad_parameter_is_dropped() {
    let h = harness(StubApi::new());
    h.services
        .queue
        .enqueue_one(Work::new(OperationKind::Character, "nobody"), Priority::Normal)
        .await
        .unwrap();
    let item = h.services.queue.try_dequeue().await.unwrap().unwrap();

    assert_eq!(fetch_pool(&h).process(item).await, WorkOutcome::Failed);
    assert!(h.api.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn fetch_workers_ride_out_an_unavailable_queue() {
    let api = StubApi::new();
    api.route("/v5/characters/95465499/", ok(character_json()));
    api.route(
        "/v1/characters/95465499/corporationhistory/",
        ok(corporation_history_json()),
    );
    let h = harness(api);

    let pool = Arc::new(fetch_pool(&h));
    let (trigger, stop) = harvest::shutdown::channel();
    let running = tokio::spawn(pool.clone().run(stop));

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.queue.set_unavailable(true).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    h.queue.set_unavailable(false).await;
    h.services
        .queue
        .enqueue_one(Work::new(OperationKind::Character, 95_465_499), Priority::Normal)
        .await
        .unwrap();

    // Longer than the backoff cap.
    tokio::time::sleep(Duration::from_secs(45)).await;
    trigger.trigger();
    running.await.unwrap().unwrap();

    assert_eq!(pool.active(), 0);
    assert_eq!(h.services.queue.size().await.unwrap(), 0);
    assert_eq!(h.bus.published(Topic::Character).await.len(), 1);
}

#[tokio::test]
async fn maintenance_runs_against_the_store() {
    let h = harness(StubApi::new());
    h.services
        .queue
        .enqueue_one(
            Work::new(OperationKind::MarketMaintenance, serde_json::Value::Null),
            Priority::Normal,
        )
        .await
        .unwrap();
    let item = h.services.queue.try_dequeue().await.unwrap().unwrap();
    assert_eq!(fetch_pool(&h).process(item).await, WorkOutcome::Done);
}
