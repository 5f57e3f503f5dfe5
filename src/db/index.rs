//! The fetch index: the authoritative catalog of what was archived when.
//!
//! One row per successful fetch, carrying the refs snapshot and the blob
//! key of the packfile, plus the pack-dependency edges needed to rebuild a
//! clone from incremental packs. The blacklist lives here too so the
//! fetcher can consult both with one handle.

use std::collections::{BTreeMap, HashSet};

use sqlx::{PgPool, Row};
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error("corrupt refs column for {name}: {source}")]
    CorruptRefs {
        name: String,
        source: serde_json::Error,
    },
}

/// Moderation status of a repository. `Neutral` is the absence of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistState {
    Blacklisted,
    Whitelisted,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub name: String,
    pub state: BlacklistState,
    pub reason: String,
}

pub struct Index {
    pool: PgPool,
}

impl Index {
    pub async fn open(pool: PgPool) -> Result<Self, IndexError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS fetches (
                name TEXT NOT NULL,
                parent TEXT NOT NULL DEFAULT '',
                timestamp TIMESTAMPTZ NOT NULL,
                refs TEXT NOT NULL,
                pack_id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
                pack_ref TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS fetches_name_idx ON fetches (name)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pack_deps (
                pack_id BIGINT NOT NULL,
                dep BIGINT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS pack_deps_idx ON pack_deps (pack_id)")
            .execute(&pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blacklist (
                name TEXT PRIMARY KEY,
                whitelisted BOOLEAN NOT NULL DEFAULT FALSE,
                reason TEXT NOT NULL DEFAULT ''
            )",
        )
        .execute(&pool)
        .await?;

        Ok(Index { pool })
    }

    /// Record one fetch. The row and its dependency edges commit in a
    /// single transaction; a fetch either fully exists or never happened.
    /// Returns the assigned pack id.
    pub async fn add_fetch(
        &self,
        name: &str,
        parent: &str,
        timestamp: OffsetDateTime,
        refs: &BTreeMap<String, String>,
        pack_ref: &str,
        deps: &[i64],
    ) -> Result<i64, IndexError> {
        let refs_json = serde_json::to_string(refs).map_err(|source| IndexError::CorruptRefs {
            name: name.to_string(),
            source,
        })?;

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "INSERT INTO fetches (name, parent, timestamp, refs, pack_ref)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING pack_id",
        )
        .bind(name)
        .bind(parent)
        .bind(timestamp)
        .bind(&refs_json)
        .bind(pack_ref)
        .fetch_one(&mut *tx)
        .await?;
        let pack_id: i64 = row.get("pack_id");

        for dep in deps {
            sqlx::query("INSERT INTO pack_deps (pack_id, dep) VALUES ($1, $2)")
                .bind(pack_id)
                .bind(dep)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        Ok(pack_id)
    }

    /// Timestamp of the most recent fetch of `name`, if any.
    pub async fn latest_fetch(
        &self,
        name: &str,
    ) -> Result<Option<OffsetDateTime>, IndexError> {
        let row = sqlx::query(
            "SELECT timestamp FROM fetches WHERE name = $1
             ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("timestamp")))
    }

    /// Haves and pack dependencies for the next fetch of `name`.
    ///
    /// The latest fetch of the repository supplies its refs and pack id.
    /// A repository never fetched before inherits from `parent` instead,
    /// so forks skip re-downloading the common history. Inheritance is a
    /// single level; deeper fork chains start from scratch.
    pub async fn get_haves(
        &self,
        name: &str,
        parent: &str,
    ) -> Result<(HashSet<String>, Vec<i64>), IndexError> {
        if let Some(found) = self.haves_of(name).await? {
            return Ok(found);
        }
        if !parent.is_empty() {
            if let Some(found) = self.haves_of(parent).await? {
                return Ok(found);
            }
        }
        Ok((HashSet::new(), Vec::new()))
    }

    async fn haves_of(
        &self,
        name: &str,
    ) -> Result<Option<(HashSet<String>, Vec<i64>)>, IndexError> {
        let row = sqlx::query(
            "SELECT refs, pack_id FROM fetches WHERE name = $1
             ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };

        let refs_json: String = row.get("refs");
        let pack_id: i64 = row.get("pack_id");
        let refs: BTreeMap<String, String> =
            serde_json::from_str(&refs_json).map_err(|source| IndexError::CorruptRefs {
                name: name.to_string(),
                source,
            })?;

        Ok(Some((refs.into_values().collect(), vec![pack_id])))
    }

    pub async fn blacklist_state(&self, name: &str) -> Result<BlacklistState, IndexError> {
        let row = sqlx::query("SELECT whitelisted FROM blacklist WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            None => BlacklistState::Neutral,
            Some(row) if row.get::<bool, _>("whitelisted") => BlacklistState::Whitelisted,
            Some(_) => BlacklistState::Blacklisted,
        })
    }

    /// Blacklist `name`. Idempotent: an existing row, whatever its state,
    /// is left untouched.
    pub async fn add_blacklist(&self, name: &str, reason: &str) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO blacklist (name, reason) VALUES ($1, $2)
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flip an entry between the two explicit states; `Neutral` deletes
    /// the row, since neutrality is the absence of one.
    pub async fn set_blacklist_state(
        &self,
        name: &str,
        state: BlacklistState,
    ) -> Result<(), IndexError> {
        match state {
            BlacklistState::Neutral => {
                sqlx::query("DELETE FROM blacklist WHERE name = $1")
                    .bind(name)
                    .execute(&self.pool)
                    .await?;
            }
            BlacklistState::Whitelisted | BlacklistState::Blacklisted => {
                sqlx::query("UPDATE blacklist SET whitelisted = $1 WHERE name = $2")
                    .bind(state == BlacklistState::Whitelisted)
                    .bind(name)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn list_blacklist(&self) -> Result<Vec<BlacklistEntry>, IndexError> {
        let rows = sqlx::query("SELECT name, whitelisted, reason FROM blacklist")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| BlacklistEntry {
                name: row.get("name"),
                state: if row.get::<bool, _>("whitelisted") {
                    BlacklistState::Whitelisted
                } else {
                    BlacklistState::Blacklisted
                },
                reason: row.get("reason"),
            })
            .collect())
    }
}
