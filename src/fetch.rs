//! The fetcher: pops the queue and archives one repository at a time.
//!
//! Each pop runs the full pipeline: blacklist gate, incremental-fetch plan
//! from the index, git transport, streamed upload, fetch row. Expected
//! remote absences (vanished, DMCA) are counted and swallowed; anything
//! else is fatal and leaves the restart to the supervisor.

use std::collections::HashSet;
use std::time::Duration;

use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::db::{BlacklistState, Index, Queue, index::IndexError};
use crate::git::{self, GitError};
use crate::metrics::Metrics;
use crate::schedule::WeekMap;
use crate::store::{PackStore, StoreError};
use crate::{canonical_name, short_name};

const EMPTY_SLEEP: Duration = Duration::from_secs(30);
const OFF_HOURS_SLEEP: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Queue(#[from] sqlx::Error),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Fetcher {
    pub queue: Queue,
    pub index: Index,
    pub store: PackStore,
    pub schedule: WeekMap,
    pub max_repo_size: u64,
    pub metrics: Metrics,
    pub cancel: CancellationToken,
}

impl Fetcher {
    /// Worker loop: honor the weekly schedule, pop, fetch, repeat until
    /// cancelled or a fatal error.
    pub async fn run(&self) -> Result<(), FetchError> {
        while !self.cancel.is_cancelled() {
            if !self.schedule.get(OffsetDateTime::now_utc()) {
                self.metrics.add("offhours", 1);
                if !self.sleep(OFF_HOURS_SLEEP).await {
                    break;
                }
                continue;
            }

            let Some((name, parent)) = self.queue.pop().await? else {
                if !self.sleep(EMPTY_SLEEP).await {
                    break;
                }
                continue;
            };

            self.fetch_one(&name, &parent).await?;
        }
        Ok(())
    }

    /// Archive one repository. `name` and `parent` come from the queue in
    /// bare `owner/repo` form.
    pub async fn fetch_one(&self, name: &str, parent: &str) -> Result<(), FetchError> {
        let name = canonical_name(name);
        let parent = if parent.is_empty() {
            String::new()
        } else {
            canonical_name(parent)
        };

        let state = self.index.blacklist_state(&name).await?;
        if state == BlacklistState::Blacklisted {
            tracing::info!(repo = %name, "skipping blacklisted repository");
            self.metrics.add("blacklisted", 1);
            return Ok(());
        }

        let (haves, deps) = self.index.get_haves(&name, &parent).await?;

        tracing::info!(
            repo = %name,
            parent = %parent,
            haves = haves.len(),
            verb = if haves.is_empty() { "clone" } else { "fetch" },
            "fetching repository"
        );

        let result = self.fetch_transport(&name, &haves).await;
        let fetched = match result {
            Err(GitError::Remote(msg)) if msg.contains("Repository not found.") => {
                tracing::info!(repo = %name, "repository vanished");
                self.metrics.add("vanished", 1);
                return Ok(());
            }
            Err(GitError::Remote(msg)) if msg.contains("DMCA") => {
                tracing::warn!(repo = %name, error = %msg, "repository taken down");
                self.metrics.add("dmca", 1);
                return Ok(());
            }
            other => other?,
        };

        let key = blob_key(&name, OffsetDateTime::now_utc());
        let pack_ref = match fetched.pack {
            None => {
                self.metrics.add("emptypacks", 1);
                empty_ref(&key)
            }
            Some(mut pack) => {
                let mut upload = self.store.start_upload(&key).await?;
                loop {
                    let chunk = match pack.next_chunk().await {
                        Ok(Some(chunk)) => chunk,
                        Ok(None) => break,
                        Err(e) => {
                            let _ = upload.abort().await;
                            return Err(e.into());
                        }
                    };
                    if let Err(e) = upload.write(&chunk).await {
                        let _ = upload.abort().await;
                        return Err(e.into());
                    }
                    if state != BlacklistState::Whitelisted && upload.total > self.max_repo_size
                    {
                        tracing::warn!(
                            repo = %name,
                            bytes = upload.total,
                            cap = self.max_repo_size,
                            "repository exceeds the size cap, blacklisting"
                        );
                        upload.abort().await?;
                        self.index.add_blacklist(&name, "Too big.").await?;
                        self.metrics.add("toobig", 1);
                        return Ok(());
                    }
                }
                let total = upload.complete().await?;
                self.metrics.add("fetchbytes", total as i64);
                key
            }
        };

        self.index
            .add_fetch(
                &name,
                &parent,
                OffsetDateTime::now_utc(),
                &fetched.refs,
                &pack_ref,
                &deps,
            )
            .await?;
        self.metrics.add("fetched", 1);

        Ok(())
    }

    async fn fetch_transport(
        &self,
        name: &str,
        haves: &HashSet<String>,
    ) -> Result<git::FetchResult, GitError> {
        let url = format!("git://github.com/{}.git", short_name(name));
        git::fetch(&url, haves).await
    }

    /// `true` when the full duration elapsed, `false` on cancellation.
    async fn sleep(&self, d: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }
}

fn blob_key(name: &str, now: OffsetDateTime) -> String {
    format!("{}/{}", name, now.unix_timestamp_nanos())
}

/// Pack reference recorded when a fetch produced no new objects; the
/// prefix marks that no blob exists under the key.
fn empty_ref(key: &str) -> String {
    format!("EMPTY|{key}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_blob_key_layout() {
        let key = blob_key(
            "github.com/go-git/go-git",
            datetime!(2016-03-01 13:00:00.000000001 UTC),
        );
        assert_eq!(key, "github.com/go-git/go-git/1456837200000000001");
    }

    #[test]
    fn test_empty_ref_sentinel() {
        assert_eq!(
            empty_ref("github.com/a/b/123"),
            "EMPTY|github.com/a/b/123"
        );
    }
}
