//! The ingestor's drinking loop: one hourly archive at a time.
//!
//! Every event updates the star tracker and, for pushes on repositories
//! over the popularity threshold, the fetch queue. The checkpoint advances
//! only after a whole hour went down without error, so a crash replays the
//! hour; every dispatch below is idempotent, which makes the replay safe.

use thiserror::Error;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use crate::archive::{self, ArchiveError, Event, EventStream, HourStamp};
use crate::canonical_name;
use crate::db::{Index, Queue, index::IndexError};
use crate::metrics::Metrics;
use crate::stars::{StarTracker, StarsError};

/// Repositories below this star count are not worth archiving.
const STAR_THRESHOLD: i64 = 10;

/// Slack added on top of the advertised rate-limit reset.
const RATE_LIMIT_SLACK: time::Duration = time::Duration::minutes(1);

/// Retry delay when an archive has not been published yet.
const LATE_ARCHIVE_DELAY: time::Duration = time::Duration::minutes(2);

#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Stars(#[from] StarsError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Db(#[from] sqlx::Error),

    #[error("archive {0} is not published yet")]
    ArchiveMissing(HourStamp),
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct Drinker {
    pub queue: Queue,
    pub index: Index,
    pub stars: StarTracker,
    pub http: reqwest::Client,
    pub metrics: Metrics,
    pub cancel: CancellationToken,
}

impl Drinker {
    /// Continuous mode: consume archives hour after hour, checkpointing
    /// after each one, until cancelled or a download/consumption error.
    pub async fn run(&self, start: HourStamp) -> Result<(), IngestError> {
        let mut hour = start;
        let mut ready = hour.download_ready_at();

        while !self.cancel.is_cancelled() {
            let now = OffsetDateTime::now_utc();
            if now < ready {
                tracing::info!(archive = %hour, until = %ready, "waiting for the next archive");
                if !self.sleep_until(ready).await {
                    break;
                }
            }

            let Some(mut stream) = archive::download(&self.http, hour).await? else {
                // Publication sometimes runs late; try again shortly.
                self.metrics.add("archives404", 1);
                ready = OffsetDateTime::now_utc() + LATE_ARCHIVE_DELAY;
                continue;
            };

            tracing::info!(archive = %hour, "archive found, consuming");
            if self.drink(&mut stream).await? == Flow::Stop {
                break;
            }

            self.metrics.add("archivesfinished", 1);
            if let Ok(depth) = self.queue.len().await {
                self.metrics.record("queuelen", depth);
            }
            hour = hour.next();
            self.stars.save_checkpoint(hour).await?;
            ready = hour.download_ready_at();
        }
        Ok(())
    }

    /// One-shot mode: consume a single hour without checkpointing.
    pub async fn drink_hour(&self, hour: HourStamp) -> Result<(), IngestError> {
        let Some(mut stream) = archive::download(&self.http, hour).await? else {
            return Err(IngestError::ArchiveMissing(hour));
        };
        self.drink(&mut stream).await?;
        Ok(())
    }

    async fn drink(&self, stream: &mut EventStream) -> Result<Flow, IngestError> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(Flow::Stop);
            }

            let event = match stream.next().await {
                Ok(None) => return Ok(Flow::Continue),
                Ok(Some(event)) => event,
                Err(ArchiveError::Decode { line, reason }) => {
                    self.metrics.add("dropped", 1);
                    tracing::warn!(reason = %reason, line = %line, "dropped undecodable event");
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            self.metrics.add(&format!("events.{}", event.kind()), 1);
            if let Some(t) = event.created_at() {
                self.metrics.set("latestevent", t.to_string());
            }

            match event {
                Event::Push { repo, created_at } => {
                    if self.handle_push(&repo, created_at).await? == Flow::Stop {
                        return Ok(Flow::Stop);
                    }
                }
                Event::Create { repo, created_at } => {
                    self.stars.create_event(&repo, "", created_at).await?;
                }
                Event::Watch { repo, created_at } => {
                    self.stars.watch_event(&repo, created_at).await?;
                }
                Event::Fork {
                    forkee,
                    origin,
                    created_at,
                } => {
                    self.stars.create_event(&forkee, &origin, created_at).await?;
                }
                Event::Public { repo, created_at } => {
                    self.stars.create_event(&repo, "", created_at).await?;
                }
                Event::Other { .. } => {}
            }
        }
    }

    /// Decide whether a push is worth a fetch. Rate limits park the loop
    /// until the advertised reset and then retry the same event.
    async fn handle_push(
        &self,
        repo: &str,
        created_at: OffsetDateTime,
    ) -> Result<Flow, IngestError> {
        match self.index.latest_fetch(&canonical_name(repo)).await {
            Ok(Some(latest)) if created_at < latest => {
                self.metrics.add("alreadyfetched", 1);
                return Ok(Flow::Continue);
            }
            Ok(_) => {}
            // The index is an optimization here; on error fall through to
            // the oracle rather than dropping the event.
            Err(err) => {
                tracing::warn!(repo = %repo, error = %err, "index lookup failed");
            }
        }

        loop {
            match self.stars.get(repo).await {
                Ok((stars, parent)) => {
                    if stars < STAR_THRESHOLD {
                        self.metrics.add("skipped", 1);
                    } else {
                        self.queue.add(repo, &parent).await?;
                        self.metrics.add("queued", 1);
                    }
                    return Ok(Flow::Continue);
                }
                Err(StarsError::Vanished(_)) => {
                    self.metrics.add("vanished", 1);
                    return Ok(Flow::Continue);
                }
                Err(StarsError::RateLimited { reset_at }) => {
                    self.metrics.add("ratehits", 1);
                    let until = reset_at + RATE_LIMIT_SLACK;
                    tracing::warn!(until = %until, "github rate limit hit, sleeping");
                    if !self.sleep_until(until).await {
                        return Ok(Flow::Stop);
                    }
                    tracing::info!("resuming after rate limit");
                }
                Err(err @ StarsError::Db(_)) => return Err(err.into()),
                Err(err) => {
                    self.metrics.add("dropped", 1);
                    tracing::warn!(repo = %repo, error = %err, "dropped push event after oracle error");
                    return Ok(Flow::Continue);
                }
            }
        }
    }

    /// `true` when the deadline passed, `false` on cancellation.
    async fn sleep_until(&self, deadline: OffsetDateTime) -> bool {
        let now = OffsetDateTime::now_utc();
        if deadline <= now {
            return true;
        }
        let wait = (deadline - now).unsigned_abs();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }
}
