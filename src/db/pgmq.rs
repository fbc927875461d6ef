//! The bus over pgmq, via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.set_vt, pgmq.delete. One pgmq queue per topic.

use crate::bus::{Bus, Delivery};
use crate::error::Result;
use crate::model::Topic;
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::time::Duration;

fn record(topic: Topic, operation: &'static str) {
    metrics::bus_operations().add(
        1,
        &[
            KeyValue::new("topic", topic.as_str()),
            KeyValue::new("operation", operation),
        ],
    );
}

/// pgmq takes visibility offsets in whole seconds.
fn whole_secs(d: Duration) -> i32 {
    i32::try_from(d.as_secs()).unwrap_or(i32::MAX)
}

#[async_trait]
impl Bus for super::Db {
    /// Create every topic's queue (idempotent).
    async fn ensure_topics(&self) -> Result<()> {
        for topic in Topic::ALL {
            sqlx::query("SELECT pgmq.create($1)")
                .bind(topic.queue_name())
                .execute(self.pool())
                .await?;
            record(topic, "create");
        }
        Ok(())
    }

    async fn publish(&self, topic: Topic, payload: &serde_json::Value) -> Result<i64> {
        let (msg_id,): (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, 0)")
            .bind(topic.queue_name())
            .bind(payload)
            .fetch_one(self.pool())
            .await?;
        record(topic, "publish");
        Ok(msg_id)
    }

    async fn receive(&self, topic: Topic, visibility: Duration) -> Result<Option<Delivery>> {
        let row: Option<(i64, i32, serde_json::Value)> =
            sqlx::query_as("SELECT msg_id, read_ct, message FROM pgmq.read($1, $2, 1)")
                .bind(topic.queue_name())
                .bind(whole_secs(visibility))
                .fetch_optional(self.pool())
                .await?;

        record(
            topic,
            if row.is_some() {
                "receive"
            } else {
                "receive_empty"
            },
        );

        Ok(row.map(|(id, read_count, payload)| Delivery {
            id,
            topic,
            payload,
            read_count,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(delivery.topic.queue_name())
            .bind(delivery.id)
            .execute(self.pool())
            .await?;
        record(delivery.topic, "ack");
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        sqlx::query("SELECT pgmq.set_vt($1, $2, $3)")
            .bind(delivery.topic.queue_name())
            .bind(delivery.id)
            .bind(whole_secs(delay))
            .execute(self.pool())
            .await?;
        record(delivery.topic, "requeue");
        Ok(())
    }
}
