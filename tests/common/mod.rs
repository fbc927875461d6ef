//! Shared test harness: a scripted API behind the `HttpSend` seam and a
//! `Services` wired to the in-memory backends.
#![allow(dead_code)]

use async_trait::async_trait;
use harvest::config::{FetchConfig, SchedulerConfig, TransportConfig};
use harvest::esi::EsiClient;
use harvest::memory::{MemoryBus, MemoryQueue, MemoryStore};
use harvest::queue::WorkQueue;
use harvest::services::Services;
use harvest::transport::{ApiRequest, ApiResponse, HttpSend, RateLimitedTransport, TransportError};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use secrecy::SecretString;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const BASE_URL: &str = "https://esi.test/latest";

pub fn response(status: u16, body: &Value, headers: &[(&str, &str)]) -> ApiResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    ApiResponse {
        status,
        headers: map,
        body: serde_json::to_vec(body).unwrap(),
    }
}

pub fn ok(body: Value) -> ApiResponse {
    response(200, &body, &[])
}

type Scripted = Result<ApiResponse, TransportError>;

/// Replies from a script keyed by path (plus `?page=N` when paged). The
/// last reply for a key repeats; unknown keys get a 404.
#[derive(Default)]
pub struct StubApi {
    routes: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<String>>,
}

impl StubApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, key: &str, reply: ApiResponse) {
        self.script(key, Ok(reply));
    }

    pub fn script(&self, key: &str, reply: Scripted) {
        self.routes
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, key: &str) -> usize {
        self.calls().iter().filter(|k| k.as_str() == key).count()
    }

    fn key(request: &ApiRequest) -> String {
        let path = request.url.strip_prefix(BASE_URL).unwrap_or(&request.url);
        match request.query.iter().find(|(k, _)| k == "page") {
            Some((_, page)) => format!("{path}?page={page}"),
            None => path.to_string(),
        }
    }
}

#[async_trait]
impl HttpSend for StubApi {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let key = Self::key(request);
        self.calls.lock().unwrap().push(key.clone());
        let mut routes = self.routes.lock().unwrap();
        match routes.get_mut(&key) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap(),
            Some(script) => script.front().cloned().unwrap(),
            None => Ok(response(404, &json!({"error": "not found"}), &[])),
        }
    }
}

pub struct Harness {
    pub services: Services,
    pub api: Arc<StubApi>,
    pub queue: Arc<MemoryQueue>,
    pub bus: Arc<MemoryBus>,
    pub store: Arc<MemoryStore>,
}

pub fn transport_config() -> TransportConfig {
    TransportConfig {
        jitter_secs: 0,
        ..TransportConfig::default()
    }
}

pub fn harness(api: Arc<StubApi>) -> Harness {
    let queue = Arc::new(MemoryQueue::new());
    let bus = Arc::new(MemoryBus::new());
    let store = Arc::new(MemoryStore::new());
    let transport = RateLimitedTransport::new(api.clone(), transport_config());
    let client = EsiClient::new(
        transport,
        BASE_URL,
        Some(SecretString::from("test-token".to_string())),
    );
    let services = Services {
        api: Arc::new(client),
        queue: WorkQueue::new(queue.clone()),
        bus: bus.clone(),
        store: store.clone(),
        fetch: FetchConfig {
            poll_interval_ms: 10,
            ..FetchConfig::default()
        },
        scheduler: SchedulerConfig::default(),
    };
    Harness {
        services,
        api,
        queue,
        bus,
        store,
    }
}

pub fn character_json() -> Value {
    json!({
        "name": "Ignatius Crumwell",
        "corporation_id": 98_000_001,
        "alliance_id": 99_000_001,
        "birthday": "2015-03-24T11:37:00Z",
        "gender": "male",
        "race_id": 1,
        "bloodline_id": 3,
        "ancestry_id": 12,
        "security_status": 1.5
    })
}

pub fn corporation_history_json() -> Value {
    json!([
        {"corporation_id": 98_000_001, "record_id": 2, "start_date": "2016-01-01T00:00:00Z"},
        {"corporation_id": 1_000_009, "record_id": 1, "start_date": "2015-03-24T11:37:00Z"}
    ])
}

pub fn order_json(order_id: i64, type_id: i32) -> Value {
    json!({
        "order_id": order_id,
        "type_id": type_id,
        "location_id": 60_003_760_i64,
        "system_id": 30_000_142,
        "volume_total": 100,
        "volume_remain": 40,
        "min_volume": 1,
        "price": 5.25,
        "is_buy_order": false,
        "duration": 90,
        "issued": "2026-10-15T08:00:00Z",
        "range": "region"
    })
}

pub fn killmail_json(killmail_id: i32) -> Value {
    json!({
        "killmail_id": killmail_id,
        "killmail_time": "2026-10-14T20:15:00Z",
        "solar_system_id": 30_002_187,
        "victim": {
            "character_id": 95_465_499,
            "corporation_id": 98_000_001,
            "ship_type_id": 587,
            "damage_taken": 1200
        },
        "attackers": [
            {"character_id": 95_000_100, "damage_done": 800, "final_blow": true, "ship_type_id": 24_690},
            {"character_id": 95_465_499, "damage_done": 0, "final_blow": false},
            {"damage_done": 400, "final_blow": false}
        ]
    })
}
