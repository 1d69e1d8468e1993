//! Load test orchestration.
//!
//! [`LoadRunner`] is the top-level entry point that:
//! - Validates the config before anything is spawned
//! - Builds one [`ClientSpec`] per user from the topic layout
//! - Runs every client to completion in a [`ClientPool`]
//! - Reconciles the frozen logs into a [`RunSummary`]
//!
//! There is no run-level cancellation. Each client ends after its own drain
//! window and the run ends when the last client does.

use std::collections::BTreeSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::loadtest::client::{
    ClientCounters, ClientSpec, ClientTimings, PayloadFactory, SimulatedClient,
};
use crate::loadtest::config::{LoadTestConfig, TopicLayout};
use crate::loadtest::display::display_loop;
use crate::loadtest::error::LoadTestError;
use crate::loadtest::pool::{credentials_for, ClientIdSequence, ClientPool};
use crate::loadtest::reconcile::{reconcile, RunShape, RunSummary};
use crate::loadtest::recorder::ClientRecord;
use crate::loadtest::transport::BrokerConnector;

/// Compile-time Send bounds verification for task-transported types.
fn _assert_send<T: Send>() {}
#[allow(dead_code)]
fn _check_send_bounds() {
    _assert_send::<ClientRecord>();
    _assert_send::<SimulatedClient>();
}

/// Outcome of one run.
#[derive(Debug, Clone)]
pub struct LoadTestResult {
    /// Identifier embedded in every client id of the run.
    pub run_id: String,
    pub summary: RunSummary,
    /// Frozen logs of every client that finished.
    pub records: Vec<ClientRecord>,
}

/// Runs one load test against a broker.
pub struct LoadRunner {
    config: LoadTestConfig,
    connector: Arc<dyn BrokerConnector>,
    show_progress: bool,
    no_color: bool,
}

impl LoadRunner {
    pub fn new(config: LoadTestConfig, connector: Arc<dyn BrokerConnector>) -> Self {
        Self {
            config,
            connector,
            show_progress: false,
            no_color: false,
        }
    }

    /// Show the live progress line on stderr.
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Disables colored output.
    pub fn with_no_color(mut self, no_color: bool) -> Self {
        self.no_color = no_color;
        self
    }

    pub fn config(&self) -> &LoadTestConfig {
        &self.config
    }

    /// Number of distinct topics the configured layout uses.
    pub fn topic_count(&self) -> usize {
        match self.config.topics.layout {
            TopicLayout::Shared => self.config.topics.count as usize,
            TopicLayout::Own => self.config.settings.num_users as usize,
        }
    }

    /// One client spec per configured user.
    ///
    /// - shared layout: publish to any shared topic, subscribe to all of them
    /// - own layout: publish to and subscribe to `{prefix}/user{i}`
    pub fn build_specs(&self, ids: &ClientIdSequence) -> Vec<ClientSpec> {
        let shared = self.config.shared_topics();
        (0..self.config.settings.num_users)
            .map(|i| {
                let credentials = credentials_for(i, ids);
                let publish_topics = match self.config.topics.layout {
                    TopicLayout::Shared => shared.clone(),
                    TopicLayout::Own => vec![self.config.own_topic(&credentials.username)],
                };
                let subscribe_topics: BTreeSet<String> = publish_topics.iter().cloned().collect();
                ClientSpec {
                    credentials,
                    publish_topics,
                    subscribe_topics,
                    message_count: self.config.settings.messages_per_user,
                }
            })
            .collect()
    }

    /// Validate the config, run every configured client and reconcile.
    pub async fn run(&self) -> Result<LoadTestResult, LoadTestError> {
        self.config.validate()?;
        let ids = ClientIdSequence::new(new_run_id());
        let specs = self.build_specs(&ids);
        Ok(self
            .run_specs(ids.run_id().to_string(), specs, self.topic_count())
            .await)
    }

    /// Run an explicit set of clients with this runner's timings and payload
    /// shape. The config is validated first, exactly like [`LoadRunner::run`].
    pub async fn run_with_specs(
        &self,
        specs: Vec<ClientSpec>,
    ) -> Result<LoadTestResult, LoadTestError> {
        self.config.validate()?;
        let topics: BTreeSet<&str> = specs
            .iter()
            .flat_map(|s| s.publish_topics.iter().chain(&s.subscribe_topics))
            .map(String::as_str)
            .collect();
        let topic_count = topics.len();
        Ok(self.run_specs(new_run_id(), specs, topic_count).await)
    }

    async fn run_specs(
        &self,
        run_id: String,
        specs: Vec<ClientSpec>,
        topic_count: usize,
    ) -> LoadTestResult {
        let settings = &self.config.settings;
        let users = specs.len() as u32;
        let expected: u64 = specs.iter().map(|s| u64::from(s.message_count)).sum();
        let messages_per_user = specs.first().map_or(0, |s| s.message_count);
        let timings = ClientTimings::from(settings);
        let payloads = PayloadFactory::new(settings.payload_len());
        let counters = ClientCounters::new();

        info!(
            run_id = %run_id,
            users,
            topics = topic_count,
            messages_per_user,
            payload_size = settings.payload_len(),
            "starting load test"
        );

        let display_cancel = CancellationToken::new();
        let display_handle = self.show_progress.then(|| {
            tokio::spawn(display_loop(
                counters.clone(),
                expected,
                users,
                display_cancel.clone(),
                self.no_color,
            ))
        });

        let mut pool = ClientPool::new(self.connector.clone(), counters.clone());
        for spec in specs {
            pool.spawn(SimulatedClient::new(
                spec,
                timings,
                payloads.clone(),
                counters.clone(),
            ));
        }
        debug!(clients = pool.len(), "all clients spawned");

        let outcome = pool.await_completion().await;
        display_cancel.cancel();
        if let Some(handle) = display_handle {
            let _ = handle.await;
        }

        let shape = RunShape {
            users,
            topics: topic_count,
            messages_per_user,
            duration: outcome.finished.duration_since(outcome.started),
            lost_clients: outcome.lost_clients,
        };
        let mut summary = reconcile(&outcome.records, &shape);
        summary.total_sent = expected;

        info!(
            run_id = %run_id,
            sent = summary.total_sent,
            received = summary.unique_received,
            lost = summary.lost,
            duration_secs = summary.duration.as_secs_f64(),
            "load test finished"
        );

        LoadTestResult {
            run_id,
            summary,
            records: outcome.records,
        }
    }
}

/// Short random run identifier.
fn new_run_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::memory::MemoryBroker;

    fn config(users: u32, messages: u32, layout: TopicLayout) -> LoadTestConfig {
        let mut config = LoadTestConfig::default();
        config.settings.num_users = users;
        config.settings.messages_per_user = messages;
        config.settings.payload_size = 8;
        config.settings.timeout_secs = 1;
        config.topics.layout = layout;
        config
    }

    #[test]
    fn test_build_specs_shared_layout() {
        let runner = LoadRunner::new(
            config(2, 3, TopicLayout::Shared),
            Arc::new(MemoryBroker::new()),
        );
        let specs = runner.build_specs(&ClientIdSequence::new("r"));
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].publish_topics.len(), 5);
        assert_eq!(specs[1].subscribe_topics.len(), 5);
        assert_eq!(specs[1].credentials.client_id, "user1-r-1");
        assert_eq!(runner.topic_count(), 5);
    }

    #[test]
    fn test_build_specs_own_layout() {
        let runner = LoadRunner::new(config(3, 1, TopicLayout::Own), Arc::new(MemoryBroker::new()));
        let specs = runner.build_specs(&ClientIdSequence::new("r"));
        assert_eq!(specs[2].publish_topics, vec!["load/topic/user2"]);
        assert!(specs[2].subscribe_topics.contains("load/topic/user2"));
        assert_eq!(runner.topic_count(), 3);
    }

    #[test]
    fn test_run_ids_are_short_and_distinct() {
        let a = new_run_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, new_run_id());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_shared_layout_loses_nothing() {
        let broker = MemoryBroker::new();
        let runner = LoadRunner::new(config(3, 4, TopicLayout::Shared), Arc::new(broker.clone()));
        let result = runner.run().await.unwrap();

        let summary = &result.summary;
        assert_eq!(summary.total_sent, 12);
        assert_eq!(summary.unique_sent, 12);
        assert_eq!(summary.lost, 0);
        // every payload fans out to all three clients
        assert_eq!(summary.total_received, 36);
        assert_eq!(summary.fan_out, 24);
        assert_eq!(summary.duplicates, 0);
        assert_eq!(summary.connected_clients, 3);
        assert!(summary.latency.min > std::time::Duration::ZERO);
        assert_eq!(result.records.len(), 3);
        assert!(result.records[0].client_id.contains(&result.run_id));
        assert_eq!(broker.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_fails_before_spawning() {
        let mut bad = config(2, 1, TopicLayout::Shared);
        bad.settings.payload_size = -1;
        let broker = MemoryBroker::new();
        let runner = LoadRunner::new(bad, Arc::new(broker.clone()));

        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, LoadTestError::ConfigValidation { .. }));
        assert_eq!(broker.stats().published, 0);
    }
}
