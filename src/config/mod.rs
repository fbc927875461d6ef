//! Typed configuration.
//!
//! Process settings come from environment variables and are loaded once at
//! startup, failing fast if required vars are missing. Sensitive values are
//! wrapped in secrecy::SecretString to prevent log leaks.
//!
//! Pipeline tuning (pool sizes, ledger windows, trigger intervals) lives in
//! an optional TOML file; every field has a default.

pub mod secrets;

use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ESI_BASE_URL: &str = "https://esi.evetech.net/latest";
pub const DEFAULT_USER_AGENT: &str = "harvest-rs";

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub esi_base_url: String,
    pub esi_user_agent: String,
    /// Bearer token for authenticated endpoints. Refresh is handled elsewhere.
    pub esi_access_token: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub log_json: bool,
    pub pipeline_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            esi_base_url: std::env::var("ESI_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_ESI_BASE_URL.to_string()),
            esi_user_agent: std::env::var("ESI_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            esi_access_token: std::env::var("ESI_ACCESS_TOKEN").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_json: std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")),
            pipeline_file: std::env::var("HARVEST_CONFIG").ok().map(PathBuf::from),
        })
    }

    /// Load the pipeline file named by `HARVEST_CONFIG`, or defaults.
    pub fn pipeline(&self) -> Result<PipelineConfig> {
        match &self.pipeline_file {
            Some(path) => PipelineConfig::load(path),
            None => Ok(PipelineConfig::default()),
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

/// Pipeline tuning, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,
    pub transport: TransportConfig,
    pub fetch: FetchConfig,
    pub persist: PersistConfig,
    pub scheduler: SchedulerConfig,
}

impl PipelineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read pipeline config {}: {e}", path.display()))
        })?;
        Self::parse(&content)
            .map_err(|e| Error::Config(format!("bad pipeline config {}: {e}", path.display())))
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { max_connections: 10 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Total attempts per request, including the first.
    pub max_attempts: u32,
    pub remaining_header: String,
    pub reset_header: String,
    /// Upper bound of the random jitter added to a rate-limit cool-down.
    pub jitter_secs: u64,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_attempts: 11,
            remaining_header: "x-esi-error-limit-remain".to_string(),
            reset_header: "x-esi-error-limit-reset".to_string(),
            jitter_secs: 30,
            timeout_secs: 30,
            connect_timeout_secs: 60,
            pool_max_idle_per_host: 20,
        }
    }
}

impl TransportConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub workers: usize,
    pub poll_interval_ms: u64,
    /// Cap for the backoff applied when the queue store is unavailable.
    pub max_backoff_secs: u64,
    /// Suppression window after a permanent-class API error on a target.
    pub cooldown_secs: u64,
    /// Window during which a market region is not fetched twice.
    pub region_window_secs: u64,
    /// Minimum time before a fetched region is due again.
    pub region_refresh_secs: u64,
    pub known_kill_ttl_secs: u64,
    /// How long an ended war stays in the ledger.
    pub finished_war_ttl_secs: u64,
    /// Days of market history kept per fetch.
    pub market_history_days: i64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            poll_interval_ms: 1000,
            max_backoff_secs: 30,
            cooldown_secs: 86_400,
            region_window_secs: 900,
            region_refresh_secs: 3600,
            known_kill_ttl_secs: 30 * 86_400,
            finished_war_ttl_secs: 365 * 86_400,
            market_history_days: 2,
        }
    }
}

impl FetchConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn region_window(&self) -> Duration {
        Duration::from_secs(self.region_window_secs)
    }

    pub fn region_refresh(&self) -> Duration {
        Duration::from_secs(self.region_refresh_secs)
    }

    pub fn known_kill_ttl(&self) -> Duration {
        Duration::from_secs(self.known_kill_ttl_secs)
    }

    pub fn finished_war_ttl(&self) -> Duration {
        Duration::from_secs(self.finished_war_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Subscription instances started per topic.
    pub consumers_per_topic: usize,
    pub visibility_timeout_secs: u32,
    pub requeue_delay_secs: u32,
    pub poll_interval_ms: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            consumers_per_topic: 1,
            visibility_timeout_secs: 60,
            requeue_delay_secs: 1,
            poll_interval_ms: 500,
        }
    }
}

impl PersistConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.visibility_timeout_secs))
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_secs(u64::from(self.requeue_delay_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Longest sleep between due checks, whatever the trigger's interval.
    pub max_tick_secs: u64,
    /// Rows a discovery trigger pulls from the store per run.
    pub discovery_batch: i64,
    /// Per-trigger interval overrides, in seconds.
    pub intervals: HashMap<String, u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_tick_secs: 60,
            discovery_batch: 5000,
            intervals: HashMap::new(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval_for(&self, trigger: &str, default: Duration) -> Duration {
        self.intervals
            .get(trigger)
            .map(|secs| Duration::from_secs(*secs))
            .unwrap_or(default)
    }

    pub fn max_tick(&self) -> Duration {
        Duration::from_secs(self.max_tick_secs)
    }
}
