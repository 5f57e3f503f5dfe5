//! Continuous archiver for public GitHub repositories.
//!
//! Three long-running processes share a Postgres queue + fetch index:
//! the `ingestor` drinks the hourly event archive and enqueues repositories
//! worth archiving, the `fetcher` pops the queue and performs incremental
//! git fetches into blob storage, and `modsync` reconciles the blacklist
//! with a moderation board.

pub mod archive;
pub mod db;
pub mod fetch;
pub mod git;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod modsync;
pub mod schedule;
pub mod stars;
pub mod store;
pub mod trello;

/// User-agent presented to GitHub, the archive host, and git servers.
pub const USER_AGENT: &str = concat!("packvault/", env!("CARGO_PKG_VERSION"));

/// Canonical repository identifier: `github.com/{owner}/{repo}`.
///
/// Queue entries and event payloads carry the bare `owner/repo` name; the
/// index and blob keys always use the canonical form.
pub fn canonical_name(name: &str) -> String {
    if name.starts_with("github.com/") {
        name.to_string()
    } else {
        format!("github.com/{name}")
    }
}

/// The bare `owner/repo` form of a canonical name.
pub fn short_name(name: &str) -> &str {
    name.strip_prefix("github.com/").unwrap_or(name)
}

/// Cancel `cancel` when the process receives SIGINT or SIGTERM.
pub fn cancel_on_signal(cancel: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut term = match signal(SignalKind::terminate()) {
                Ok(term) => term,
                Err(err) => {
                    tracing::error!(error = %err, "failed to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("stopping gracefully");
        cancel.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_name() {
        assert_eq!(canonical_name("go-git/go-git"), "github.com/go-git/go-git");
        assert_eq!(
            canonical_name("github.com/go-git/go-git"),
            "github.com/go-git/go-git"
        );
    }

    #[test]
    fn test_short_name() {
        assert_eq!(short_name("github.com/alice/fork"), "alice/fork");
        assert_eq!(short_name("alice/fork"), "alice/fork");
    }
}
