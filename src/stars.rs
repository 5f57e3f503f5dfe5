//! The star tracker: a durable popularity cache over the GitHub REST API.
//!
//! The first sighting of a repository costs one API call; from then on the
//! count is maintained purely from replayed timeline events, so the cache
//! stays accurate without further network traffic. The same SQLite file
//! also holds the ingestor's `_resume` checkpoint so both advance together.

use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use time::OffsetDateTime;

use crate::archive::HourStamp;

const RESUME_KEY: &str = "_resume";

#[derive(Debug, Error)]
pub enum StarsError {
    /// The repository is gone from the forge (404). Not cached.
    #[error("repository vanished: {0}")]
    Vanished(String),

    /// API quota exhausted; retry after `reset_at`.
    #[error("rate limited until {reset_at}")]
    RateLimited { reset_at: OffsetDateTime },

    #[error("malformed repository name: {0:?}")]
    BadName(String),

    #[error("GITHUB_TOKEN is not a valid header value")]
    BadToken,

    #[error("github api error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("bad checkpoint value: {0:?}")]
    Checkpoint(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

pub struct StarTracker {
    db: SqlitePool,
    http: reqwest::Client,
}

#[derive(Debug, serde::Deserialize)]
struct ApiRepo {
    stargazers_count: i64,
    parent: Option<ApiParent>,
}

#[derive(Debug, serde::Deserialize)]
struct ApiParent {
    full_name: String,
}

impl StarTracker {
    /// Open (or create) the cache at `path`. `token` authenticates API
    /// lookups; an empty token sends unauthenticated requests, which only
    /// makes sense in tests.
    pub async fn open(path: &str, token: &str) -> Result<Self, StarsError> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let db = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS repos (
                name TEXT PRIMARY KEY,
                stars INTEGER NOT NULL,
                parent TEXT NOT NULL DEFAULT '',
                last_updated INTEGER NOT NULL
            )",
        )
        .execute(&db)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        )
        .execute(&db)
        .await?;

        use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
        let mut headers = HeaderMap::new();
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        headers.insert(
            "X-GitHub-Api-Version",
            HeaderValue::from_static("2022-11-28"),
        );
        if !token.is_empty() {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| StarsError::BadToken)?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .user_agent(crate::USER_AGENT)
            .default_headers(headers)
            .build()?;

        Ok(StarTracker { db, http })
    }

    /// Star count and fork parent for `owner/repo`. Cached entries never
    /// touch the network; a miss performs one API lookup and caches it.
    pub async fn get(&self, name: &str) -> Result<(i64, String), StarsError> {
        let row = sqlx::query("SELECT stars, parent FROM repos WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.db)
            .await?;
        if let Some(row) = row {
            return Ok((row.get(0), row.get(1)));
        }

        let (owner, repo) = name
            .split_once('/')
            .filter(|(o, r)| !o.is_empty() && !r.is_empty() && !r.contains('/'))
            .ok_or_else(|| StarsError::BadName(name.to_string()))?;

        let now = OffsetDateTime::now_utc().unix_timestamp();
        let resp = self
            .http
            .get(format!("https://api.github.com/repos/{owner}/{repo}"))
            .send()
            .await?;
        let status = resp.status();

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StarsError::Vanished(name.to_string()));
        }
        if rate_limited(status, &resp) {
            return Err(StarsError::RateLimited {
                reset_at: rate_reset(&resp),
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(StarsError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let api: ApiRepo = resp.json().await?;
        let parent = api.parent.map(|p| p.full_name).unwrap_or_default();

        sqlx::query(
            "INSERT OR REPLACE INTO repos (name, stars, parent, last_updated)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(name)
        .bind(api.stargazers_count)
        .bind(&parent)
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok((api.stargazers_count, parent))
    }

    /// Count one star, but only for repositories we already track and only
    /// when the event is newer than the entry. Replays are no-ops.
    pub async fn watch_event(
        &self,
        name: &str,
        created_at: OffsetDateTime,
    ) -> Result<(), StarsError> {
        sqlx::query(
            "UPDATE repos SET stars = stars + 1, last_updated = ?2
             WHERE name = ?1 AND last_updated < ?2",
        )
        .bind(name)
        .bind(created_at.unix_timestamp())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// Record a newly created (or newly public, or forked) repository with
    /// zero stars. A no-op when the repository is already tracked.
    pub async fn create_event(
        &self,
        name: &str,
        parent: &str,
        created_at: OffsetDateTime,
    ) -> Result<(), StarsError> {
        sqlx::query(
            "INSERT OR IGNORE INTO repos (name, stars, parent, last_updated)
             VALUES (?1, 0, ?2, ?3)",
        )
        .bind(name)
        .bind(parent)
        .bind(created_at.unix_timestamp())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    /// The next hour the ingestor should consume, if one was ever saved.
    pub async fn load_checkpoint(&self) -> Result<Option<HourStamp>, StarsError> {
        let row = sqlx::query("SELECT value FROM meta WHERE key = ?1")
            .bind(RESUME_KEY)
            .fetch_optional(&self.db)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let value: String = row.get(0);
                HourStamp::parse(&value)
                    .map(Some)
                    .map_err(|_| StarsError::Checkpoint(value))
            }
        }
    }

    pub async fn save_checkpoint(&self, hour: HourStamp) -> Result<(), StarsError> {
        sqlx::query("INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)")
            .bind(RESUME_KEY)
            .bind(hour.to_string())
            .execute(&self.db)
            .await?;
        Ok(())
    }
}

fn rate_limited(status: reqwest::StatusCode, resp: &reqwest::Response) -> bool {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        return true;
    }
    status == reqwest::StatusCode::FORBIDDEN
        && resp
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            == Some("0")
}

fn rate_reset(resp: &reqwest::Response) -> OffsetDateTime {
    resp.headers()
        .get("x-ratelimit-reset")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
        .unwrap_or_else(|| OffsetDateTime::now_utc() + time::Duration::minutes(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    async fn tracker() -> StarTracker {
        StarTracker::open(":memory:", "").await.unwrap()
    }

    #[tokio::test]
    async fn test_create_then_get_never_hits_network() {
        let st = tracker().await;
        st.create_event("a/b", "", datetime!(2016-03-01 13:00 UTC))
            .await
            .unwrap();
        assert_eq!(st.get("a/b").await.unwrap(), (0, String::new()));
    }

    #[tokio::test]
    async fn test_fork_parent_is_recorded() {
        let st = tracker().await;
        st.create_event("alice/fork", "upstream/repo", datetime!(2016-03-01 13:00 UTC))
            .await
            .unwrap();
        assert_eq!(
            st.get("alice/fork").await.unwrap(),
            (0, "upstream/repo".to_string())
        );
    }

    #[tokio::test]
    async fn test_watch_before_first_sighting_is_noop() {
        let st = tracker().await;
        st.watch_event("ghost/repo", datetime!(2016-03-01 13:00 UTC))
            .await
            .unwrap();
        // Still untracked: a `get` would have to go to the network, which
        // an in-memory test can prove by the malformed-name error path.
        assert!(matches!(
            st.get("ghost").await,
            Err(StarsError::BadName(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_monotonicity() {
        let st = tracker().await;
        let t0 = datetime!(2016-03-01 13:00 UTC);
        let t1 = datetime!(2016-03-01 14:00 UTC);

        st.create_event("a/b", "", t0).await.unwrap();

        st.watch_event("a/b", t1).await.unwrap();
        assert_eq!(st.get("a/b").await.unwrap().0, 1);

        // Replay of the same event: no double count.
        st.watch_event("a/b", t1).await.unwrap();
        assert_eq!(st.get("a/b").await.unwrap().0, 1);

        // An event older than the entry never counts.
        st.watch_event("a/b", t0).await.unwrap();
        assert_eq!(st.get("a/b").await.unwrap().0, 1);
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let st = tracker().await;
        let t0 = datetime!(2016-03-01 13:00 UTC);
        let t1 = datetime!(2016-03-01 14:00 UTC);

        st.create_event("a/b", "", t0).await.unwrap();
        st.watch_event("a/b", t1).await.unwrap();
        // A replayed creation must not reset the count or the parent.
        st.create_event("a/b", "x/y", t0).await.unwrap();
        assert_eq!(st.get("a/b").await.unwrap(), (1, String::new()));
    }

    #[tokio::test]
    async fn test_replay_gives_same_state() {
        let events = [
            ("a/b", datetime!(2016-03-01 13:05 UTC)),
            ("a/b", datetime!(2016-03-01 13:10 UTC)),
            ("a/b", datetime!(2016-03-01 13:15 UTC)),
        ];

        let st = tracker().await;
        st.create_event("a/b", "", datetime!(2016-03-01 13:00 UTC))
            .await
            .unwrap();
        for (name, t) in events {
            st.watch_event(name, t).await.unwrap();
        }
        let first = st.get("a/b").await.unwrap();

        // Replay the whole sequence on top of the existing state.
        st.create_event("a/b", "", datetime!(2016-03-01 13:00 UTC))
            .await
            .unwrap();
        for (name, t) in events {
            st.watch_event(name, t).await.unwrap();
        }
        assert_eq!(st.get("a/b").await.unwrap(), first);
        assert_eq!(first.0, 3);
    }

    #[tokio::test]
    async fn test_checkpoint_round_trip() {
        let st = tracker().await;
        assert!(st.load_checkpoint().await.unwrap().is_none());

        let hour = HourStamp::parse("2016-03-01-13").unwrap();
        st.save_checkpoint(hour).await.unwrap();
        assert_eq!(st.load_checkpoint().await.unwrap(), Some(hour));

        st.save_checkpoint(hour.next()).await.unwrap();
        assert_eq!(
            st.load_checkpoint().await.unwrap(),
            Some(HourStamp::parse("2016-03-01-14").unwrap())
        );
    }
}
