//! The hourly event archive: hour stamps, download, and event decoding.
//!
//! Archives are gzip-compressed newline-delimited JSON, one file per UTC
//! hour, published a couple of minutes past the following hour. A 404 means
//! "not published yet", never "gone".

use async_compression::tokio::bufread::GzipDecoder;
use serde::Deserialize;
use thiserror::Error;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio_util::io::StreamReader;

const ARCHIVE_HOST: &str = "https://data.githubarchive.org";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive download failed with status {0}")]
    Status(u16),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("undecodable event: {reason}")]
    Decode { line: String, reason: String },

    #[error("bad hour stamp {0:?}, want YYYY-MM-DD-HH")]
    BadStamp(String),
}

/// One UTC hour, the archive's unit of publication. Formats as
/// `YYYY-MM-DD-HH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HourStamp(OffsetDateTime);

impl HourStamp {
    /// The hour containing `t`.
    pub fn containing(t: OffsetDateTime) -> Self {
        let t = t.to_offset(time::UtcOffset::UTC);
        let date = t.date();
        HourStamp(
            date.with_hms(t.hour(), 0, 0)
                .expect("whole hour is always a valid time")
                .assume_utc(),
        )
    }

    pub fn hours_before_now(hours: i64) -> Self {
        Self::containing(OffsetDateTime::now_utc() - time::Duration::hours(hours))
    }

    pub fn parse(s: &str) -> Result<Self, ArchiveError> {
        let bad = || ArchiveError::BadStamp(s.to_string());
        let (date_part, hour_part) = s.rsplit_once('-').ok_or_else(bad)?;
        let date = Date::parse(date_part, format_description!("[year]-[month]-[day]"))
            .map_err(|_| bad())?;
        let hour: u8 = hour_part.parse().map_err(|_| bad())?;
        let time = date.with_hms(hour, 0, 0).map_err(|_| bad())?;
        Ok(HourStamp(time.assume_utc()))
    }

    pub fn next(self) -> Self {
        HourStamp(self.0 + time::Duration::hours(1))
    }

    pub fn timestamp(self) -> OffsetDateTime {
        self.0
    }

    /// When this hour's archive is expected to be available for download.
    pub fn download_ready_at(self) -> OffsetDateTime {
        self.0 + time::Duration::hours(1) + time::Duration::minutes(2)
    }
}

impl std::fmt::Display for HourStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02}-{:02}",
            self.0.year(),
            self.0.month() as u8,
            self.0.day(),
            self.0.hour()
        )
    }
}

pub fn archive_url(hour: HourStamp) -> String {
    format!("{ARCHIVE_HOST}/{hour}.json.gz")
}

/// Download the archive for `hour`. `Ok(None)` when it is not published yet.
pub async fn download(
    client: &reqwest::Client,
    hour: HourStamp,
) -> Result<Option<EventStream>, ArchiveError> {
    let resp = client.get(archive_url(hour)).send().await?;
    if resp.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if !resp.status().is_success() {
        return Err(ArchiveError::Status(resp.status().as_u16()));
    }

    use futures::TryStreamExt;
    let body = StreamReader::new(resp.bytes_stream().map_err(std::io::Error::other));
    Ok(Some(EventStream::new(body)))
}

/// A decoded timeline event. Only the variants the pipeline dispatches on
/// carry structure; everything else is [`Event::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Push {
        repo: String,
        created_at: OffsetDateTime,
    },
    /// `CreateEvent` with `ref_type=repository`. Branch and tag creations
    /// fall under [`Event::Other`].
    Create {
        repo: String,
        created_at: OffsetDateTime,
    },
    Watch {
        repo: String,
        created_at: OffsetDateTime,
    },
    Fork {
        forkee: String,
        origin: String,
        created_at: OffsetDateTime,
    },
    Public {
        repo: String,
        created_at: OffsetDateTime,
    },
    Other {
        kind: String,
    },
}

impl Event {
    pub fn kind(&self) -> &str {
        match self {
            Event::Push { .. } => "PushEvent",
            Event::Create { .. } => "CreateEvent",
            Event::Watch { .. } => "WatchEvent",
            Event::Fork { .. } => "ForkEvent",
            Event::Public { .. } => "PublicEvent",
            Event::Other { kind } => kind,
        }
    }

    pub fn created_at(&self) -> Option<OffsetDateTime> {
        match self {
            Event::Push { created_at, .. }
            | Event::Create { created_at, .. }
            | Event::Watch { created_at, .. }
            | Event::Fork { created_at, .. }
            | Event::Public { created_at, .. } => Some(*created_at),
            Event::Other { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "type")]
    kind: String,
    created_at: String,
    repo: RawRepo,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct RawRepo {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CreatePayload {
    #[serde(default)]
    ref_type: String,
}

#[derive(Debug, Deserialize)]
struct ForkPayload {
    forkee: Forkee,
}

#[derive(Debug, Deserialize)]
struct Forkee {
    full_name: String,
}

fn parse_event(line: &str) -> Result<Event, ArchiveError> {
    let decode = |reason: String| ArchiveError::Decode {
        line: line.to_string(),
        reason,
    };

    let raw: RawEvent = serde_json::from_str(line).map_err(|e| decode(e.to_string()))?;
    let created_at = OffsetDateTime::parse(
        &raw.created_at,
        &time::format_description::well_known::Rfc3339,
    )
    .map_err(|e| decode(format!("created_at: {e}")))?;

    Ok(match raw.kind.as_str() {
        "PushEvent" => Event::Push {
            repo: raw.repo.name,
            created_at,
        },
        "CreateEvent" => {
            let payload: CreatePayload =
                serde_json::from_value(raw.payload).map_err(|e| decode(e.to_string()))?;
            if payload.ref_type == "repository" {
                Event::Create {
                    repo: raw.repo.name,
                    created_at,
                }
            } else {
                Event::Other { kind: raw.kind }
            }
        }
        "WatchEvent" => Event::Watch {
            repo: raw.repo.name,
            created_at,
        },
        "ForkEvent" => {
            let payload: ForkPayload =
                serde_json::from_value(raw.payload).map_err(|e| decode(e.to_string()))?;
            Event::Fork {
                forkee: payload.forkee.full_name,
                origin: raw.repo.name,
                created_at,
            }
        }
        "PublicEvent" => Event::Public {
            repo: raw.repo.name,
            created_at,
        },
        _ => Event::Other { kind: raw.kind },
    })
}

/// Streaming decoder over a gzipped archive body.
pub struct EventStream {
    lines: Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>,
}

impl EventStream {
    pub fn new(gzipped: impl AsyncRead + Send + Unpin + 'static) -> Self {
        let decoder = GzipDecoder::new(BufReader::new(gzipped));
        let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(decoder);
        EventStream {
            lines: BufReader::new(boxed).lines(),
        }
    }

    /// The next event. A [`ArchiveError::Decode`] error consumes the bad
    /// line; calling again continues with the rest of the archive.
    pub async fn next(&mut self) -> Result<Option<Event>, ArchiveError> {
        loop {
            let Some(line) = self.lines.next_line().await? else {
                return Ok(None);
            };
            if line.trim().is_empty() {
                continue;
            }
            return parse_event(&line).map(Some);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_hour_stamp_round_trip() {
        let h = HourStamp::parse("2016-03-01-13").unwrap();
        assert_eq!(h.to_string(), "2016-03-01-13");
        assert_eq!(h.timestamp(), datetime!(2016-03-01 13:00 UTC));
        assert_eq!(h.next().to_string(), "2016-03-01-14");
        assert_eq!(
            h.download_ready_at(),
            datetime!(2016-03-01 14:02 UTC)
        );
    }

    #[test]
    fn test_hour_stamp_rejects_garbage() {
        for bad in ["", "2016-03-01", "2016-03-01-24", "2016-13-01-10", "nope"] {
            assert!(HourStamp::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_containing_truncates() {
        let h = HourStamp::containing(datetime!(2016-03-01 13:59:59 UTC));
        assert_eq!(h.timestamp(), datetime!(2016-03-01 13:00 UTC));
    }

    #[test]
    fn test_archive_url() {
        let h = HourStamp::parse("2016-03-01-05").unwrap();
        assert_eq!(
            archive_url(h),
            "https://data.githubarchive.org/2016-03-01-05.json.gz"
        );
    }

    #[test]
    fn test_parse_push_event() {
        let line = r#"{"type":"PushEvent","created_at":"2016-03-01T13:00:01Z","repo":{"name":"go-git/go-git"},"payload":{"size":1}}"#;
        assert_eq!(
            parse_event(line).unwrap(),
            Event::Push {
                repo: "go-git/go-git".to_string(),
                created_at: datetime!(2016-03-01 13:00:01 UTC),
            }
        );
    }

    #[test]
    fn test_parse_create_event_ref_types() {
        let repository = r#"{"type":"CreateEvent","created_at":"2016-03-01T13:00:01Z","repo":{"name":"a/b"},"payload":{"ref_type":"repository"}}"#;
        assert!(matches!(
            parse_event(repository).unwrap(),
            Event::Create { .. }
        ));

        let branch = r#"{"type":"CreateEvent","created_at":"2016-03-01T13:00:01Z","repo":{"name":"a/b"},"payload":{"ref_type":"branch","ref":"dev"}}"#;
        assert!(matches!(parse_event(branch).unwrap(), Event::Other { .. }));
    }

    #[test]
    fn test_parse_fork_event() {
        let line = r#"{"type":"ForkEvent","created_at":"2016-03-01T13:00:01Z","repo":{"name":"upstream/repo"},"payload":{"forkee":{"full_name":"alice/fork"}}}"#;
        assert_eq!(
            parse_event(line).unwrap(),
            Event::Fork {
                forkee: "alice/fork".to_string(),
                origin: "upstream/repo".to_string(),
                created_at: datetime!(2016-03-01 13:00:01 UTC),
            }
        );
    }

    #[test]
    fn test_parse_unknown_event() {
        let line = r#"{"type":"GollumEvent","created_at":"2016-03-01T13:00:01Z","repo":{"name":"a/b"},"payload":{"pages":[]}}"#;
        assert_eq!(
            parse_event(line).unwrap(),
            Event::Other {
                kind: "GollumEvent".to_string()
            }
        );
    }

    #[test]
    fn test_parse_malformed_event() {
        assert!(matches!(
            parse_event("{not json"),
            Err(ArchiveError::Decode { .. })
        ));
        // Fork without a forkee is undecodable, not silently dropped.
        let line = r#"{"type":"ForkEvent","created_at":"2016-03-01T13:00:01Z","repo":{"name":"a/b"},"payload":{}}"#;
        assert!(matches!(
            parse_event(line),
            Err(ArchiveError::Decode { .. })
        ));
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write;
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[tokio::test]
    async fn test_event_stream_decodes_archive() {
        let ndjson = concat!(
            r#"{"type":"WatchEvent","created_at":"2016-03-01T13:00:01Z","repo":{"name":"a/b"},"payload":{"action":"started"}}"#,
            "\n",
            r#"{"type":"PushEvent","created_at":"2016-03-01T13:00:02Z","repo":{"name":"c/d"},"payload":{}}"#,
            "\n",
        );
        let mut stream = EventStream::new(std::io::Cursor::new(gzip(ndjson.as_bytes())));

        assert!(matches!(
            stream.next().await.unwrap().unwrap(),
            Event::Watch { .. }
        ));
        assert!(matches!(
            stream.next().await.unwrap().unwrap(),
            Event::Push { .. }
        ));
        assert!(stream.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_event_stream_recovers_after_bad_line() {
        let ndjson = concat!(
            "{broken\n",
            r#"{"type":"WatchEvent","created_at":"2016-03-01T13:00:01Z","repo":{"name":"a/b"},"payload":{}}"#,
            "\n",
        );
        let mut stream = EventStream::new(std::io::Cursor::new(gzip(ndjson.as_bytes())));

        assert!(matches!(
            stream.next().await,
            Err(ArchiveError::Decode { .. })
        ));
        assert!(matches!(
            stream.next().await.unwrap().unwrap(),
            Event::Watch { .. }
        ));
        assert!(stream.next().await.unwrap().is_none());
    }
}
