//! Database connection pool, migrations, and health check.
//!
//! One Postgres pool backs all three production seams: the work queue
//! (`queue`), the bus over pgmq (`pgmq`), and the entity store (`store`).

pub mod pgmq;
pub mod queue;
pub mod store;

use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool shared across all modules.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }
}
