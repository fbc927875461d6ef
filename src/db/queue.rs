//! Work queue, dedup ledger and scheduled sets on plain Postgres tables.
//!
//! Dequeue deletes the row it hands out in the same statement that picks
//! it, with `SKIP LOCKED` so concurrent workers never wait on each other.

use crate::error::{Error, Result};
use crate::model::{OperationKind, Priority, WorkId, WorkItem};
use crate::queue::{QueueBackend, due_items};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder, Transaction};
use std::time::Duration;
use uuid::Uuid;

/// Rows per INSERT; five binds each keeps well under the 65535 limit.
const PUSH_CHUNK: usize = 5000;

#[derive(sqlx::FromRow)]
struct WorkRow {
    work_id: Uuid,
    operation: String,
    parameter: serde_json::Value,
    priority: i16,
    enqueued_at: DateTime<Utc>,
}

impl WorkRow {
    fn try_into_work_item(self) -> Result<WorkItem> {
        let operation: OperationKind = self.operation.parse()?;
        let priority = Priority::from_i16(self.priority)
            .ok_or_else(|| Error::Other(format!("invalid priority {} in queue", self.priority)))?;
        Ok(WorkItem {
            id: WorkId(self.work_id),
            operation,
            parameter: self.parameter,
            priority,
            enqueued_at: self.enqueued_at,
        })
    }
}

async fn insert_items(tx: &mut Transaction<'_, Postgres>, items: &[WorkItem]) -> Result<()> {
    for chunk in items.chunks(PUSH_CHUNK) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO work_queue (work_id, operation, parameter, priority, enqueued_at) ",
        );
        qb.push_values(chunk, |mut b, item| {
            b.push_bind(item.id.0)
                .push_bind(item.operation.as_str())
                .push_bind(&item.parameter)
                .push_bind(item.priority.as_i16())
                .push_bind(item.enqueued_at);
        });
        qb.build().execute(&mut **tx).await?;
    }
    Ok(())
}

const TAKE_DUE: &str = "DELETE FROM scheduled_members
     WHERE set_name = $1 AND member IN (
         SELECT member FROM scheduled_members
         WHERE set_name = $1 AND due_at <= $2
         ORDER BY due_at
         LIMIT $3
         FOR UPDATE SKIP LOCKED
     )
     RETURNING member";

#[async_trait]
impl QueueBackend for super::Db {
    async fn push(&self, items: &[WorkItem]) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        insert_items(&mut tx, items).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn pop(&self) -> Result<Option<WorkItem>> {
        let row: Option<WorkRow> = sqlx::query_as(
            "DELETE FROM work_queue
             WHERE id = (
                 SELECT id FROM work_queue
                 ORDER BY priority DESC, id
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING work_id, operation, parameter, priority, enqueued_at",
        )
        .fetch_optional(self.pool())
        .await?;

        row.map(WorkRow::try_into_work_item).transpose()
    }

    async fn len(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM work_queue")
            .fetch_one(self.pool())
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn pending_operations(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT operation FROM work_queue ORDER BY operation")
                .fetch_all(self.pool())
                .await?;
        Ok(rows.into_iter().map(|(op,)| op).collect())
    }

    async fn is_completed(&self, namespace: &str, key: &str) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (
                 SELECT 1 FROM completion_records
                 WHERE namespace = $1 AND key = $2 AND expires_at > now()
             )",
        )
        .bind(namespace)
        .bind(key)
        .fetch_one(self.pool())
        .await?;
        Ok(exists)
    }

    async fn mark_completed(&self, namespace: &str, key: &str, ttl: Duration) -> Result<()> {
        sqlx::query(
            "INSERT INTO completion_records (namespace, key, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (namespace, key) DO UPDATE SET expires_at = EXCLUDED.expires_at",
        )
        .bind(namespace)
        .bind(key)
        .bind(ttl.as_secs_f64())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn claim(&self, namespace: &str, key: &str, ttl: Duration) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as(
            "INSERT INTO completion_records (namespace, key, expires_at)
             VALUES ($1, $2, now() + make_interval(secs => $3))
             ON CONFLICT (namespace, key) DO UPDATE SET expires_at = EXCLUDED.expires_at
             WHERE completion_records.expires_at <= now()
             RETURNING key",
        )
        .bind(namespace)
        .bind(key)
        .bind(ttl.as_secs_f64())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.is_some())
    }

    async fn schedule(
        &self,
        set: &str,
        member: i64,
        due_at: DateTime<Utc>,
        only_if_absent: bool,
    ) -> Result<()> {
        let sql = if only_if_absent {
            "INSERT INTO scheduled_members (set_name, member, due_at) VALUES ($1, $2, $3)
             ON CONFLICT (set_name, member) DO NOTHING"
        } else {
            "INSERT INTO scheduled_members (set_name, member, due_at) VALUES ($1, $2, $3)
             ON CONFLICT (set_name, member) DO UPDATE SET due_at = EXCLUDED.due_at"
        };
        sqlx::query(sql)
            .bind(set)
            .bind(member)
            .bind(due_at)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    async fn take_due(&self, set: &str, now: DateTime<Utc>, limit: usize) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(TAKE_DUE)
            .bind(set)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(|(member,)| member).collect())
    }

    async fn promote_due(
        &self,
        set: &str,
        now: DateTime<Utc>,
        limit: usize,
        operation: OperationKind,
        priority: Priority,
    ) -> Result<Vec<i64>> {
        let mut tx = self.pool().begin().await?;
        let rows: Vec<(i64,)> = sqlx::query_as(TAKE_DUE)
            .bind(set)
            .bind(now)
            .bind(limit as i64)
            .fetch_all(&mut *tx)
            .await?;
        let members: Vec<i64> = rows.into_iter().map(|(member,)| member).collect();
        insert_items(&mut tx, &due_items(&members, operation, priority)).await?;
        tx.commit().await?;
        Ok(members)
    }
}

impl super::Db {
    /// Drop ledger rows whose window has passed. Returns rows removed.
    pub async fn purge_expired_records(&self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM completion_records WHERE expires_at <= now()")
            .execute(self.pool())
            .await?;
        Ok(done.rows_affected())
    }
}
