//! JSON report serialization for load test results.
//!
//! Produces a schema-versioned JSON report file with delivery counts,
//! latency statistics, throughput, client failure accounting and the full
//! resolved config, so a run can be compared against or repeated later.

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::loadtest::config::LoadTestConfig;
use crate::loadtest::engine::LoadTestResult;

/// Schema version for the JSON report format.
///
/// Increment when making breaking changes to the report structure.
const SCHEMA_VERSION: &str = "1.0";

/// Top-level JSON report structure.
#[derive(Debug, Serialize)]
pub struct LoadTestReport {
    pub schema_version: String,
    /// RFC 3339 timestamp when the report was generated.
    pub timestamp: String,
    pub run_id: String,
    /// Broker address the run targeted.
    pub target: String,
    /// Wall-clock duration in seconds.
    pub duration_secs: f64,
    /// Full resolved configuration (with CLI and environment overrides applied).
    pub config: LoadTestConfig,
    pub delivery: DeliveryMetrics,
    pub latency: LatencyMetrics,
    pub clients: ClientMetrics,
    /// Client error counts by category.
    pub errors: BTreeMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct DeliveryMetrics {
    pub messages_sent: u64,
    pub publish_attempts: u64,
    pub messages_received_raw: u64,
    pub unique_sent: usize,
    pub unique_received: usize,
    pub unique_lost: usize,
    pub loss_percent: f64,
    /// Repeat deliveries of a payload to the same client.
    pub duplicates: u64,
    /// Extra copies delivered to further subscribers.
    pub fan_out_copies: u64,
    pub unexpected: usize,
    /// Messages received per second.
    pub throughput: f64,
}

/// Latencies in milliseconds.
#[derive(Debug, Serialize)]
pub struct LatencyMetrics {
    pub samples: usize,
    pub average_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Serialize)]
pub struct ClientMetrics {
    pub users: u32,
    pub topics: usize,
    pub connected: usize,
    pub connect_timed_out: usize,
    pub rejected: usize,
    /// Clients whose session could not be opened.
    pub failed: usize,
    /// Client tasks that crashed and contributed no data.
    pub crashed: usize,
}

fn ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

impl LoadTestReport {
    /// Build a report from a finished run.
    pub fn from_result(result: &LoadTestResult, config: &LoadTestConfig, target: &str) -> Self {
        let s = &result.summary;
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            run_id: result.run_id.clone(),
            target: target.to_string(),
            duration_secs: s.duration.as_secs_f64(),
            config: config.clone(),
            delivery: DeliveryMetrics {
                messages_sent: s.total_sent,
                publish_attempts: s.attempted,
                messages_received_raw: s.total_received,
                unique_sent: s.unique_sent,
                unique_received: s.unique_received,
                unique_lost: s.lost,
                loss_percent: s.loss_percent(),
                duplicates: s.duplicates,
                fan_out_copies: s.fan_out,
                unexpected: s.unexpected,
                throughput: s.throughput,
            },
            latency: LatencyMetrics {
                samples: s.latency.count,
                average_ms: ms(s.latency.average),
                min_ms: ms(s.latency.min),
                max_ms: ms(s.latency.max),
                p50_ms: ms(s.latency.p50),
                p95_ms: ms(s.latency.p95),
                p99_ms: ms(s.latency.p99),
            },
            clients: ClientMetrics {
                users: s.users,
                topics: s.topics,
                connected: s.connected_clients,
                connect_timed_out: s.timed_out_clients,
                rejected: s.rejected_clients,
                failed: s.failed_clients,
                crashed: s.lost_clients,
            },
            errors: s
                .errors
                .iter()
                .map(|(category, count)| (category.to_string(), *count))
                .collect(),
        }
    }
}

/// Write a JSON report file into `reports_dir`, creating it if needed.
///
/// The filename is `loadtest-{run_id}-YYYY-MM-DDTHH-MM-SS.json` (hyphens,
/// not colons, for Windows compatibility). Returns the written path.
pub fn write_report(report: &LoadTestReport, reports_dir: &Path) -> Result<PathBuf, std::io::Error> {
    if !reports_dir.exists() {
        std::fs::create_dir_all(reports_dir)?;
    }

    let filename = report_filename(&report.run_id, &chrono::Utc::now());
    let report_path = reports_dir.join(filename);

    let json = serde_json::to_string_pretty(report).map_err(std::io::Error::other)?;
    std::fs::write(&report_path, json)?;

    Ok(report_path)
}

/// Report filename for a run at a given time.
pub fn report_filename(run_id: &str, timestamp: &chrono::DateTime<chrono::Utc>) -> String {
    format!(
        "loadtest-{run_id}-{}.json",
        timestamp.format("%Y-%m-%dT%H-%M-%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::reconcile::{LatencyStats, RunSummary};

    fn test_result() -> LoadTestResult {
        LoadTestResult {
            run_id: "abcd1234".to_string(),
            summary: RunSummary {
                users: 2,
                topics: 5,
                total_sent: 10,
                attempted: 10,
                total_received: 18,
                unique_sent: 10,
                unique_received: 9,
                lost: 1,
                duplicates: 0,
                fan_out: 9,
                unexpected: 0,
                latency: LatencyStats {
                    count: 9,
                    average: Duration::from_millis(5),
                    min: Duration::from_millis(1),
                    max: Duration::from_millis(12),
                    p50: Duration::from_millis(4),
                    p95: Duration::from_millis(11),
                    p99: Duration::from_millis(12),
                },
                duration: Duration::from_millis(2500),
                throughput: 7.2,
                connected_clients: 1,
                timed_out_clients: 0,
                rejected_clients: 1,
                failed_clients: 0,
                lost_clients: 0,
                errors: BTreeMap::from([("connect_rejected", 1), ("publish", 5)]),
            },
            records: Vec::new(),
        }
    }

    #[test]
    fn test_report_fields() {
        let report =
            LoadTestReport::from_result(&test_result(), &LoadTestConfig::default(), "broker:1883");
        assert_eq!(report.schema_version, SCHEMA_VERSION);
        assert_eq!(report.run_id, "abcd1234");
        assert_eq!(report.delivery.unique_lost, 1);
        assert!((report.delivery.loss_percent - 10.0).abs() < 1e-9);
        assert!((report.latency.average_ms - 5.0).abs() < 1e-9);
        assert!((report.duration_secs - 2.5).abs() < 1e-9);
        assert_eq!(report.clients.rejected, 1);
        assert_eq!(report.errors.get("publish"), Some(&5));
    }

    #[test]
    fn test_report_serializes_config_and_metrics() {
        let report =
            LoadTestReport::from_result(&test_result(), &LoadTestConfig::default(), "broker:1883");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["config"]["settings"]["num_users"], 50);
        assert_eq!(json["config"]["broker"]["transport"], "websocket");
        assert_eq!(json["delivery"]["messages_received_raw"], 18);
        assert_eq!(json["delivery"]["duplicates"], 0);
        assert_eq!(json["delivery"]["fan_out_copies"], 9);
        assert_eq!(json["errors"]["connect_rejected"], 1);
    }

    #[test]
    fn test_report_filename_format() {
        let filename = report_filename("abcd1234", &chrono::Utc::now());
        assert!(filename.starts_with("loadtest-abcd1234-"));
        assert!(filename.ends_with(".json"));
        assert!(!filename.contains(':'), "Filename must not contain colons: {filename}");
    }

    #[test]
    fn test_write_report_creates_directory_and_file() {
        let report =
            LoadTestReport::from_result(&test_result(), &LoadTestConfig::default(), "broker:1883");
        let tmp_dir = tempfile::tempdir().expect("should create temp dir");
        let reports_dir = tmp_dir.path().join("reports");
        assert!(!reports_dir.exists());

        let path = write_report(&report, &reports_dir).unwrap();
        assert!(path.exists());
        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(parsed["schema_version"], "1.0");
        assert_eq!(parsed["run_id"], "abcd1234");
    }
}
