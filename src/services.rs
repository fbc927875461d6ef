//! The environment object shared by the scheduler and every worker pool.

use crate::bus::{self, Bus};
use crate::config::{Config, FetchConfig, PipelineConfig, SchedulerConfig};
use crate::db::Db;
use crate::error::Result;
use crate::esi::EsiClient;
use crate::model::message::Payload;
use crate::queue::WorkQueue;
use crate::store::Store;
use crate::transport::{RateLimitedTransport, ReqwestSender};
use std::sync::Arc;

/// Everything a handler may touch, built once per process.
#[derive(Clone)]
pub struct Services {
    pub api: Arc<EsiClient>,
    pub queue: WorkQueue,
    pub bus: Arc<dyn Bus>,
    pub store: Arc<dyn Store>,
    pub fetch: FetchConfig,
    pub scheduler: SchedulerConfig,
}

impl Services {
    /// Wire the production backends: one Postgres pool behind the queue,
    /// the bus, and the store, and a reqwest client behind the API.
    pub fn production(config: &Config, pipeline: &PipelineConfig, db: Arc<Db>) -> Result<Self> {
        let sender = ReqwestSender::new(&pipeline.transport, &config.esi_user_agent)?;
        let transport = RateLimitedTransport::new(Arc::new(sender), pipeline.transport.clone());
        let api = EsiClient::new(
            transport,
            config.esi_base_url.clone(),
            config.esi_access_token.clone(),
        );
        Ok(Self {
            api: Arc::new(api),
            queue: WorkQueue::new(db.clone()),
            bus: db.clone(),
            store: db,
            fetch: pipeline.fetch.clone(),
            scheduler: pipeline.scheduler.clone(),
        })
    }

    /// Encode `payload` and publish it on its topic.
    pub async fn publish<T: Payload>(&self, payload: &T) -> Result<i64> {
        bus::publish(self.bus.as_ref(), payload).await
    }
}
