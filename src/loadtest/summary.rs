//! Terminal summary of a finished run.
//!
//! [`render_summary`] is a pure function from a [`LoadTestResult`] to a
//! string of dotted metric rows (`name.........: value`), coloured through
//! `colored`, which honours [`colored::control::set_override`] when
//! `--no-color` is active or stdout is piped. [`key_values`] returns the
//! headline figures as plain pairs, in the same order, for logs and tests.

use colored::Colorize;
use std::time::Duration;

use crate::loadtest::engine::LoadTestResult;
use crate::loadtest::reconcile::RunSummary;

/// Width for dotted metric row padding.
const PAD_WIDTH: usize = 32;

/// Headline figures as `(label, value)` pairs.
///
/// Durations are seconds, latency with millisecond precision.
pub fn key_values(summary: &RunSummary) -> Vec<(&'static str, String)> {
    vec![
        ("Users", summary.users.to_string()),
        ("Topics", summary.topics.to_string()),
        ("Messages sent", summary.total_sent.to_string()),
        ("Unique messages received", summary.unique_received.to_string()),
        ("Unique messages lost", summary.lost.to_string()),
        ("Total test duration", format!("{:.2}s", summary.duration.as_secs_f64())),
        ("Average throughput", format!("{:.2} msgs/s", summary.throughput)),
        ("Average latency", secs(summary.latency.average)),
        ("Minimum latency", secs(summary.latency.min)),
        ("Maximum latency", secs(summary.latency.max)),
    ]
}

fn secs(d: Duration) -> String {
    format!("{:.3}s", d.as_secs_f64())
}

fn millis(d: Duration) -> String {
    format!("{:.1}ms", d.as_secs_f64() * 1000.0)
}

/// Render the summary block printed after a run.
///
/// ```text
///   ==== Load test finished ====  run 3f2a9c1e  target ws://mosquitto-auth:9001/mqtt
///
///   Users...........................: 50
///   Topics..........................: 5
///   Messages sent...................: 1000
///   Unique messages received........: 1000
///   Unique messages lost............: 0
///   Total test duration.............: 21.43s
///   Average throughput..............: 233.35 msgs/s
///   Average latency.................: 0.004s
///   Minimum latency.................: 0.001s
///   Maximum latency.................: 0.038s
///   Latency percentiles.............: p50=3.2ms  p95=11.0ms  p99=24.1ms
///   Messages received (raw).........: 5000
///   Fan-out copies..................: 4000
///   Clients connected...............: 50/50
/// ```
pub fn render_summary(result: &LoadTestResult, target: &str) -> String {
    let summary = &result.summary;
    let mut lines = Vec::new();

    lines.push(format!(
        "  {}  run {}  target {}",
        "==== Load test finished ====".bold(),
        result.run_id,
        target
    ));
    lines.push(String::new());

    for (label, value) in key_values(summary) {
        let value = match label {
            "Unique messages lost" if summary.lost > 0 => value.red().to_string(),
            "Unique messages lost" => value.green().to_string(),
            "Average throughput" => value.green().to_string(),
            _ => value,
        };
        lines.push(format_metric_row(label, &value, PAD_WIDTH));
    }

    let latency = &summary.latency;
    let percentiles = format!(
        "p50={}  p95={}  p99={}",
        millis(latency.p50),
        millis(latency.p95),
        millis(latency.p99)
    );
    let percentiles = if latency.p99 < Duration::from_secs(1) {
        percentiles.green().to_string()
    } else {
        percentiles.yellow().to_string()
    };
    lines.push(format_metric_row("Latency percentiles", &percentiles, PAD_WIDTH));
    lines.push(format_metric_row(
        "Messages received (raw)",
        &summary.total_received.to_string(),
        PAD_WIDTH,
    ));
    if summary.fan_out > 0 {
        lines.push(format_metric_row(
            "Fan-out copies",
            &summary.fan_out.to_string(),
            PAD_WIDTH,
        ));
    }
    if summary.duplicates > 0 {
        lines.push(format_metric_row(
            "Duplicate deliveries",
            &summary.duplicates.to_string().yellow().to_string(),
            PAD_WIDTH,
        ));
    }
    if summary.unexpected > 0 {
        lines.push(format_metric_row(
            "Unexpected payloads",
            &summary.unexpected.to_string().yellow().to_string(),
            PAD_WIDTH,
        ));
    }

    let connected = format!("{}/{}", summary.connected_clients, summary.users);
    let connected = if summary.connected_clients as u32 == summary.users {
        connected.green().to_string()
    } else {
        connected.yellow().to_string()
    };
    lines.push(format_metric_row("Clients connected", &connected, PAD_WIDTH));
    if summary.failed_clients > 0 {
        lines.push(format_metric_row(
            "Clients unable to connect",
            &summary.failed_clients.to_string().red().to_string(),
            PAD_WIDTH,
        ));
    }
    if summary.lost_clients > 0 {
        lines.push(format_metric_row(
            "Clients crashed",
            &summary.lost_clients.to_string().red().to_string(),
            PAD_WIDTH,
        ));
    }

    if !summary.errors.is_empty() {
        lines.push(format_metric_row(
            "Client errors",
            &summary.total_errors().to_string().red().to_string(),
            PAD_WIDTH,
        ));
        lines.push(String::new());
        lines.push("  errors:".to_string());
        let mut categories: Vec<_> = summary.errors.iter().collect();
        categories.sort_by(|a, b| b.1.cmp(a.1));
        for (category, count) in categories {
            lines.push(format_metric_row(
                &format!("    {category}"),
                &count.to_string().red().to_string(),
                PAD_WIDTH,
            ));
        }
    }

    lines.join("\n")
}

fn format_metric_row(name: &str, value: &str, pad_width: usize) -> String {
    format!("  {name:.<pad_width$}: {value}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::reconcile::LatencyStats;
    use std::collections::BTreeMap;

    fn setup_no_color() {
        colored::control::set_override(false);
    }

    fn summary() -> RunSummary {
        RunSummary {
            users: 2,
            topics: 5,
            total_sent: 40,
            attempted: 40,
            total_received: 78,
            unique_sent: 40,
            unique_received: 39,
            lost: 1,
            duplicates: 0,
            fan_out: 39,
            unexpected: 0,
            latency: LatencyStats {
                count: 39,
                average: Duration::from_millis(4),
                min: Duration::from_millis(1),
                max: Duration::from_millis(38),
                p50: Duration::from_micros(3200),
                p95: Duration::from_millis(11),
                p99: Duration::from_millis(24),
            },
            duration: Duration::from_millis(21_430),
            throughput: 3.64,
            connected_clients: 2,
            timed_out_clients: 0,
            rejected_clients: 0,
            failed_clients: 0,
            lost_clients: 0,
            errors: BTreeMap::new(),
        }
    }

    fn result(summary: RunSummary) -> LoadTestResult {
        LoadTestResult {
            run_id: "3f2a9c1e".to_string(),
            summary,
            records: Vec::new(),
        }
    }

    #[test]
    fn test_key_values_order_and_format() {
        let kv = key_values(&summary());
        let labels: Vec<_> = kv.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            labels,
            vec![
                "Users",
                "Topics",
                "Messages sent",
                "Unique messages received",
                "Unique messages lost",
                "Total test duration",
                "Average throughput",
                "Average latency",
                "Minimum latency",
                "Maximum latency",
            ]
        );
        assert_eq!(kv[5].1, "21.43s");
        assert_eq!(kv[6].1, "3.64 msgs/s");
        assert_eq!(kv[7].1, "0.004s");
    }

    #[test]
    fn test_render_summary_rows() {
        setup_no_color();
        let output = render_summary(&result(summary()), "ws://localhost:9001/mqtt");
        assert!(output.contains("==== Load test finished ===="));
        assert!(output.contains("3f2a9c1e"));
        assert!(output.contains(&format_metric_row("Users", "2", PAD_WIDTH)), "{output}");
        assert!(output.contains("Unique messages lost"));
        assert!(output.contains("p50=3.2ms"));
        assert!(output.contains(&format_metric_row("Fan-out copies", "39", PAD_WIDTH)));
        assert!(!output.contains("Duplicate deliveries"), "{output}");
        assert!(
            output.contains(&format_metric_row("Clients connected", "2/2", PAD_WIDTH)),
            "{output}"
        );
        assert!(!output.contains("errors:"));
    }

    #[test]
    fn test_render_summary_error_breakdown() {
        setup_no_color();
        let mut s = summary();
        s.errors = BTreeMap::from([("publish", 20), ("connect_rejected", 1)]);
        s.connected_clients = 1;
        let output = render_summary(&result(s), "t");
        assert!(output.contains("errors:"));
        assert!(
            output.contains(&format_metric_row("Client errors", "21", PAD_WIDTH)),
            "{output}"
        );
        let publish = output.find("publish").unwrap();
        let rejected = output.find("connect_rejected").unwrap();
        assert!(publish < rejected, "errors should be sorted by count");
        assert!(output.contains("1/2"));
    }

    #[test]
    fn test_empty_latency_renders_zero() {
        setup_no_color();
        let mut s = summary();
        s.latency = LatencyStats::default();
        let kv = key_values(&s);
        assert_eq!(kv[7].1, "0.000s");
        assert_eq!(kv[9].1, "0.000s");
    }

    #[test]
    fn test_render_summary_redelivery_and_failed_clients() {
        setup_no_color();
        let mut s = summary();
        s.duplicates = 3;
        s.failed_clients = 1;
        let output = render_summary(&result(s), "t");
        assert!(output.contains(&format_metric_row("Duplicate deliveries", "3", PAD_WIDTH)));
        assert!(output.contains(&format_metric_row("Clients unable to connect", "1", PAD_WIDTH)));
    }
}
