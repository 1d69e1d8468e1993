//! Post-run reconciliation of send and receive logs.
//!
//! [`reconcile`] is a pure function of the frozen [`ClientRecord`]s: running
//! it twice over the same records yields the same [`RunSummary`]. Payloads
//! are unique per run, so payload equality pairs a receive with its send
//! regardless of ordering or duplication.
//!
//! Every raw receive falls into exactly one of three buckets:
//! - the first arrival of a payload anywhere (`unique_received`)
//! - a further copy reaching another client (`fan_out`), which is what a
//!   topic with several subscribers is supposed to do
//! - a repeat delivery of a payload to a client that already had it
//!   (`duplicates`), which QoS 0 never asks for

use hdrhistogram::Histogram;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

use crate::loadtest::recorder::{ClientRecord, ConnectOutcome};

/// Run-level facts the logs cannot tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunShape {
    pub users: u32,
    pub topics: usize,
    pub messages_per_user: u32,
    /// First client start to last client completion.
    pub duration: Duration,
    /// Client tasks that died without a record.
    pub lost_clients: usize,
}

impl RunShape {
    pub fn expected_sent(&self) -> u64 {
        u64::from(self.users) * u64::from(self.messages_per_user)
    }
}

/// Latency of every payload that was both sent and received, measured to
/// its first arrival anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatencyStats {
    pub count: usize,
    pub average: Duration,
    pub min: Duration,
    pub max: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
}

impl LatencyStats {
    /// Zero stats when `samples` is empty.
    pub fn from_samples(samples: &[Duration]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }

        let mut histogram = Histogram::<u64>::new(3).expect("3 sigfigs is always valid");
        for sample in samples {
            let _ = histogram.record(sample.as_micros() as u64);
        }
        let quantile = |q: f64| Duration::from_micros(histogram.value_at_quantile(q));

        let total: Duration = samples.iter().sum();
        Self {
            count: samples.len(),
            average: total / samples.len() as u32,
            min: samples.iter().copied().min().unwrap_or_default(),
            max: samples.iter().copied().max().unwrap_or_default(),
            p50: quantile(0.50),
            p95: quantile(0.95),
            p99: quantile(0.99),
        }
    }
}

/// Everything the run measured.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub users: u32,
    pub topics: usize,
    /// `users × messages_per_user`.
    pub total_sent: u64,
    /// Publish attempts actually recorded.
    pub attempted: u64,
    /// Every inbound callback, duplicates included.
    pub total_received: u64,
    pub unique_sent: usize,
    pub unique_received: usize,
    /// Sent payloads nobody received.
    pub lost: usize,
    /// Repeat deliveries of a payload to the same client.
    pub duplicates: u64,
    /// Copies of a payload delivered to clients other than the first.
    pub fan_out: u64,
    /// Received payloads that were never sent in this run.
    pub unexpected: usize,
    pub latency: LatencyStats,
    pub duration: Duration,
    /// `total_received / duration`, zero for a zero duration.
    pub throughput: f64,
    pub connected_clients: usize,
    pub timed_out_clients: usize,
    pub rejected_clients: usize,
    /// Clients whose connector could not open a session.
    pub failed_clients: usize,
    pub lost_clients: usize,
    /// Client error counts by category.
    pub errors: BTreeMap<&'static str, u64>,
}

impl RunSummary {
    pub fn total_errors(&self) -> u64 {
        self.errors.values().sum()
    }

    /// Share of unique sent payloads that were lost, in percent.
    pub fn loss_percent(&self) -> f64 {
        if self.unique_sent == 0 {
            0.0
        } else {
            self.lost as f64 / self.unique_sent as f64 * 100.0
        }
    }
}

/// Reconcile the frozen logs of a finished run.
pub fn reconcile(records: &[ClientRecord], shape: &RunShape) -> RunSummary {
    let mut send_times: HashMap<&str, Instant> = HashMap::new();
    let mut attempted = 0u64;
    for record in records {
        attempted += record.sent.len() as u64;
        for event in &record.sent {
            send_times.entry(event.payload.as_str()).or_insert(event.send_time);
        }
    }

    let mut first_arrival: HashMap<&str, Instant> = HashMap::new();
    let mut unexpected: HashSet<&str> = HashSet::new();
    let mut total_received = 0u64;
    let mut duplicates = 0u64;
    let mut per_client_unique = 0u64;
    for record in records {
        total_received += record.received.len() as u64;
        let mut seen: HashSet<&str> = HashSet::with_capacity(record.received.len());
        for event in &record.received {
            let payload = event.payload.as_str();
            if !seen.insert(payload) {
                duplicates += 1;
            }
            if !send_times.contains_key(payload) {
                unexpected.insert(payload);
            }
            first_arrival
                .entry(payload)
                .and_modify(|t| *t = (*t).min(event.receive_time))
                .or_insert(event.receive_time);
        }
        per_client_unique += seen.len() as u64;
    }

    let latencies: Vec<Duration> = send_times
        .iter()
        .filter_map(|(payload, sent)| {
            first_arrival
                .get(payload)
                .map(|arrived| arrived.saturating_duration_since(*sent))
        })
        .collect();
    let lost = send_times.len() - latencies.len();

    let elapsed_secs = shape.duration.as_secs_f64();
    let throughput = if elapsed_secs > 0.0 {
        total_received as f64 / elapsed_secs
    } else {
        0.0
    };

    let mut errors = BTreeMap::new();
    for err in records.iter().flat_map(|r| &r.errors) {
        *errors.entry(err.error_category()).or_insert(0) += 1;
    }
    let outcomes = |wanted: ConnectOutcome| records.iter().filter(|r| r.connect == wanted).count();

    RunSummary {
        users: shape.users,
        topics: shape.topics,
        total_sent: shape.expected_sent(),
        attempted,
        total_received,
        unique_sent: send_times.len(),
        unique_received: first_arrival.len(),
        lost,
        duplicates,
        fan_out: per_client_unique - first_arrival.len() as u64,
        unexpected: unexpected.len(),
        latency: LatencyStats::from_samples(&latencies),
        duration: shape.duration,
        throughput,
        connected_clients: outcomes(ConnectOutcome::Connected),
        timed_out_clients: outcomes(ConnectOutcome::TimedOut),
        rejected_clients: outcomes(ConnectOutcome::Rejected),
        failed_clients: outcomes(ConnectOutcome::Failed),
        lost_clients: shape.lost_clients,
        errors,
    }
}
