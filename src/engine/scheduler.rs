//! Trigger scheduler: interval-driven discovery of due work.
//!
//! Each trigger moves Idle → Due → Running → Idle. The durable
//! next-eligible time is advanced *before* the handler runs, through a
//! conditional write that only one caller can win, so concurrent
//! schedulers and restarts never double-fire a trigger and a crash
//! mid-handler waits for the next interval.

use crate::error::{Error, Result};
use crate::model::Notification;
use crate::services::Services;
use crate::shutdown::Shutdown;
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_trigger_span};
use async_trait::async_trait;
use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, warn};

#[async_trait]
pub trait TriggerHandler: Send + Sync {
    /// Discover due work and enqueue it. Must be safe to re-run.
    async fn fire(&self, services: &Services) -> Result<()>;
}

struct Trigger {
    name: String,
    interval: Duration,
    handler: Arc<dyn TriggerHandler>,
}

/// What a single due check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Still inside its interval, or another scheduler got there first.
    NotDue,
    Ran,
    /// The handler failed; the trigger waits for its next interval.
    Failed,
}

pub struct Scheduler {
    services: Services,
    triggers: Vec<Trigger>,
}

impl Scheduler {
    pub fn new(services: Services) -> Self {
        Self {
            services,
            triggers: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        interval: Duration,
        handler: Arc<dyn TriggerHandler>,
    ) -> Result<()> {
        let name = name.into();
        if interval.is_zero() {
            return Err(Error::Config(format!("trigger {name} has a zero interval")));
        }
        if chrono::Duration::from_std(interval).is_err() {
            return Err(Error::Config(format!("trigger {name} interval is out of range")));
        }
        if self.triggers.iter().any(|t| t.name == name) {
            return Err(Error::Config(format!("trigger {name} registered twice")));
        }
        self.triggers.push(Trigger {
            name,
            interval,
            handler,
        });
        Ok(())
    }

    pub fn trigger_names(&self) -> Vec<&str> {
        self.triggers.iter().map(|t| t.name.as_str()).collect()
    }

    /// Run the named trigger if its next-eligible time has passed.
    ///
    /// Only storage failures while claiming the slot are returned as
    /// errors; a handler failure is logged, counted, announced on the
    /// notification topic and reported as [`FireOutcome::Failed`].
    pub async fn fire_if_due(&self, name: &str) -> Result<FireOutcome> {
        let trigger = self
            .triggers
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::Config(format!("unknown trigger {name}")))?;

        let now = Utc::now();
        let interval = chrono::Duration::from_std(trigger.interval)
            .map_err(|e| Error::Config(format!("trigger {name}: {e}")))?;
        let claimed = self
            .services
            .store
            .try_advance_trigger(name, now, now + interval)
            .await?;
        if !claimed {
            return Ok(FireOutcome::NotDue);
        }

        let span = start_trigger_span(name);
        record_state_transition(&span, "idle", "due");
        record_state_transition(&span, "due", "running");

        let result = trigger
            .handler
            .fire(&self.services)
            .instrument(span.clone())
            .await;

        record_state_transition(&span, "running", "idle");
        match result {
            Ok(()) => {
                metrics::trigger_runs().add(
                    1,
                    &[
                        KeyValue::new("trigger", name.to_string()),
                        KeyValue::new("outcome", "ok"),
                    ],
                );
                debug!(trigger = name, "trigger ran");
                Ok(FireOutcome::Ran)
            }
            Err(e) => {
                metrics::trigger_runs().add(
                    1,
                    &[
                        KeyValue::new("trigger", name.to_string()),
                        KeyValue::new("outcome", "error"),
                    ],
                );
                error!(trigger = name, error = %e, "trigger failed");
                let note = Notification::new("trigger_failed", name, e.to_string());
                if let Err(publish_err) = self.services.publish(&note).await {
                    warn!(trigger = name, error = %publish_err, "could not publish trigger failure");
                }
                Ok(FireOutcome::Failed)
            }
        }
    }

    /// One due check of every trigger, in registration order.
    pub async fn run_due(&self) -> Result<Vec<(String, FireOutcome)>> {
        let mut outcomes = Vec::with_capacity(self.triggers.len());
        for trigger in &self.triggers {
            let outcome = self.fire_if_due(&trigger.name).await?;
            outcomes.push((trigger.name.clone(), outcome));
        }
        Ok(outcomes)
    }

    /// Tick every trigger until shutdown. A handler already running when
    /// the signal arrives finishes first.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) -> Result<()> {
        let max_tick = self.services.scheduler.max_tick();
        let mut tasks = JoinSet::new();

        for trigger in &self.triggers {
            let scheduler = Arc::clone(&self);
            let name = trigger.name.clone();
            let tick = trigger.interval.min(max_tick).max(Duration::from_secs(1));
            let mut shutdown = shutdown.clone();

            tasks.spawn(async move {
                let mut ticker = tokio::time::interval(tick);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = scheduler.fire_if_due(&name).await {
                                warn!(trigger = %name, error = %e, "due check failed");
                            }
                        }
                        _ = shutdown.wait() => break,
                    }
                }
            });
        }

        info!(triggers = self.triggers.len(), "scheduler started");
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "trigger task panicked");
            }
        }
        info!("scheduler stopped");
        Ok(())
    }
}
