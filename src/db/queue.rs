//! The shared fetch queue: a durable FIFO de-duplicated on repository name.
//!
//! The ingestor adds, any number of fetcher processes pop. Popping commits
//! consumption; there is no ack. That is fine for a hot workload: active
//! repositories keep producing events that re-enqueue them, so a lost pop
//! self-heals within one cycle.

use sqlx::{PgPool, Row};

pub struct Queue {
    pool: PgPool,
}

impl Queue {
    /// Bind to the queue table, creating it when absent.
    pub async fn open(pool: PgPool) -> Result<Self, sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS queue (
                id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                parent TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Queue { pool })
    }

    /// Enqueue `name`. If it is already queued the call is a no-op that
    /// keeps the existing position and parent.
    pub async fn add(&self, name: &str, parent: &str) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO queue (name, parent) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .bind(parent)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove and return the oldest entry, or `None` when the queue is
    /// empty. Selection and deletion happen in one transaction with
    /// `SKIP LOCKED`, so concurrent consumers never see the same row.
    pub async fn pop(&self) -> Result<Option<(String, String)>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, name, parent FROM queue
             ORDER BY id ASC LIMIT 1
             FOR UPDATE SKIP LOCKED",
        )
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let id: i64 = row.get("id");
        let name: String = row.get("name");
        let parent: String = row.get("parent");

        sqlx::query("DELETE FROM queue WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(Some((name, parent)))
    }

    /// Approximate queue depth, for telemetry only.
    pub async fn len(&self) -> Result<i64, sqlx::Error> {
        let row = sqlx::query("SELECT count(*) AS n FROM queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}
