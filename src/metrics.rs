//! Process counters exported to InfluxDB.
//!
//! Every counter lives in a shared registry; a background task flattens the
//! registry into one line-protocol point per process every few seconds and
//! POSTs it to the configured InfluxDB endpoint. When `INFLUX_ADDR` is not
//! set the registry still collects and is dumped on shutdown.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

const DATABASE: &str = "packvault";
const EXPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Shared counter and gauge registry, cheap to clone.
#[derive(Clone, Default)]
pub struct Metrics {
    counters: Arc<DashMap<String, i64>>,
    gauges: Arc<DashMap<String, String>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, key: &str, delta: i64) {
        *self.counters.entry(key.to_string()).or_insert(0) += delta;
    }

    /// Overwrite a numeric value instead of accumulating, e.g. a depth.
    pub fn record(&self, key: &str, value: i64) {
        self.counters.insert(key.to_string(), value);
    }

    /// Set a string gauge, e.g. the timestamp of the latest processed event.
    pub fn set(&self, key: &str, value: impl Into<String>) {
        self.gauges.insert(key.to_string(), value.into());
    }

    /// One InfluxDB line-protocol point, or `None` while nothing was counted.
    fn line(&self, measurement: &str) -> Option<String> {
        let mut fields: Vec<String> = self
            .counters
            .iter()
            .map(|e| format!("{}={}i", e.key(), e.value()))
            .collect();
        fields.extend(
            self.gauges
                .iter()
                .map(|e| format!("{}=\"{}\"", e.key(), e.value().replace('"', "\\\""))),
        );
        if fields.is_empty() {
            return None;
        }
        fields.sort();
        Some(format!("{} {}", measurement, fields.join(",")))
    }

    /// Human-readable dump of all counters, for the shutdown log line.
    pub fn dump(&self) -> String {
        let mut entries: Vec<String> = self
            .counters
            .iter()
            .map(|e| format!("{}: {}", e.key(), e.value()))
            .collect();
        entries.extend(
            self.gauges
                .iter()
                .map(|e| format!("{}: {}", e.key(), e.value())),
        );
        entries.sort();
        entries.join(", ")
    }
}

/// Start the periodic export task. Creates the database once, then pushes
/// a point every [`EXPORT_INTERVAL`] until cancelled. Push failures are
/// logged and skipped; telemetry must never take the pipeline down.
pub async fn spawn_influx_export(
    metrics: Metrics,
    addr: String,
    process: &'static str,
    cancel: CancellationToken,
) -> Result<(), reqwest::Error> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()?;

    client
        .post(format!("{addr}/query"))
        .query(&[("q", format!("CREATE DATABASE {DATABASE}"))])
        .send()
        .await?
        .error_for_status()?;

    tokio::spawn(async move {
        let write_url = format!("{addr}/write");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(EXPORT_INTERVAL) => {}
            }

            let Some(line) = metrics.line(process) else {
                continue;
            };
            let res = client
                .post(&write_url)
                .query(&[("db", DATABASE), ("precision", "s")])
                .body(line)
                .send()
                .await;
            match res {
                Ok(resp) if !resp.status().is_success() => {
                    tracing::warn!(status = resp.status().as_u16(), "influx write rejected");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "influx write failed");
                }
                Ok(_) => {}
            }
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = Metrics::new();
        m.add("queued", 1);
        m.add("queued", 2);
        m.add("skipped", 1);
        assert_eq!(m.line("drinker").unwrap(), "drinker queued=3i,skipped=1i");
    }

    #[test]
    fn test_empty_registry_has_no_line() {
        let m = Metrics::new();
        assert!(m.line("drinker").is_none());
    }

    #[test]
    fn test_gauges_are_quoted() {
        let m = Metrics::new();
        m.set("latestevent", "2016-03-01 13:30:00 +0000 UTC");
        assert_eq!(
            m.line("drinker").unwrap(),
            "drinker latestevent=\"2016-03-01 13:30:00 +0000 UTC\""
        );
    }
}
