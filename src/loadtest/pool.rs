//! Client identities and the task pool that runs clients to completion.
//!
//! Each client runs as an independent task tracked by a
//! [`tokio_util::task::TaskTracker`]. A client's failures stay inside its
//! own record; a client task that panics is logged and contributes nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};

use crate::loadtest::client::{ClientCounters, SimulatedClient};
use crate::loadtest::recorder::ClientRecord;
use crate::loadtest::transport::{BrokerConnector, Credentials};

/// Hands out run-unique client ids, `{username}-{run_id}-{seq}`.
#[derive(Debug)]
pub struct ClientIdSequence {
    run_id: String,
    next: AtomicU64,
}

impl ClientIdSequence {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            next: AtomicU64::new(0),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn next_id(&self, username: &str) -> String {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{username}-{}-{seq}", self.run_id)
    }
}

/// Credentials of client `index`: `user{index}` / `pass{index}`.
pub fn credentials_for(index: u32, ids: &ClientIdSequence) -> Credentials {
    let username = format!("user{index}");
    Credentials {
        client_id: ids.next_id(&username),
        password: format!("pass{index}"),
        username,
    }
}

/// What [`ClientPool::await_completion`] hands back.
#[derive(Debug)]
pub struct PoolOutcome {
    /// Records of every client that finished, in spawn order.
    pub records: Vec<ClientRecord>,
    /// Client tasks that panicked or were aborted.
    pub lost_clients: usize,
    /// When the first client was spawned.
    pub started: Instant,
    /// When the last client finished.
    pub finished: Instant,
}

/// Runs simulated clients as independent tasks.
pub struct ClientPool {
    connector: Arc<dyn BrokerConnector>,
    counters: ClientCounters,
    tracker: TaskTracker,
    handles: Vec<(String, JoinHandle<ClientRecord>)>,
    started: Option<Instant>,
}

impl ClientPool {
    pub fn new(connector: Arc<dyn BrokerConnector>, counters: ClientCounters) -> Self {
        Self {
            connector,
            counters,
            tracker: TaskTracker::new(),
            handles: Vec::new(),
            started: None,
        }
    }

    /// Counters shared by every client spawned into this pool.
    pub fn counters(&self) -> &ClientCounters {
        &self.counters
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Start `client` on its own task.
    pub fn spawn(&mut self, client: SimulatedClient) {
        self.started.get_or_insert_with(Instant::now);
        let client_id = client.client_id().to_string();
        debug!(client = %client_id, "spawning client");
        let handle = self.tracker.spawn(client.run(self.connector.clone()));
        self.handles.push((client_id, handle));
    }

    /// Wait until every client has finished, drain window included.
    pub async fn await_completion(self) -> PoolOutcome {
        self.tracker.close();
        self.tracker.wait().await;
        let finished = Instant::now();

        let mut records = Vec::with_capacity(self.handles.len());
        let mut lost_clients = 0;
        for (client_id, handle) in self.handles {
            match handle.await {
                Ok(record) => records.push(record),
                Err(err) => {
                    error!(client = %client_id, error = %err, "client task failed, its data is discarded");
                    lost_clients += 1;
                },
            }
        }

        PoolOutcome {
            records,
            lost_clients,
            started: self.started.unwrap_or(finished),
            finished,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::client::{ClientSpec, ClientTimings, PayloadFactory};
    use crate::loadtest::config::Settings;
    use crate::loadtest::memory::MemoryBroker;

    #[test]
    fn test_client_ids_are_unique_per_run() {
        let ids = ClientIdSequence::new("abc");
        assert_eq!(ids.next_id("user0"), "user0-abc-0");
        assert_eq!(ids.next_id("user0"), "user0-abc-1");
        assert_eq!(ids.run_id(), "abc");
    }

    #[test]
    fn test_credentials_for() {
        let ids = ClientIdSequence::new("r");
        let creds = credentials_for(3, &ids);
        assert_eq!(creds.username, "user3");
        assert_eq!(creds.password, "pass3");
        assert_eq!(creds.client_id, "user3-r-0");
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_completion_collects_every_client() {
        let broker = Arc::new(MemoryBroker::new());
        let mut pool = ClientPool::new(broker, ClientCounters::new());
        let ids = ClientIdSequence::new("run");
        let settings = Settings {
            timeout_secs: 1,
            ..Settings::default()
        };

        for i in 0..3 {
            let spec = ClientSpec {
                credentials: credentials_for(i, &ids),
                publish_topics: vec!["t".to_string()],
                subscribe_topics: ["t".to_string()].into(),
                message_count: 2,
            };
            pool.spawn(SimulatedClient::new(
                spec,
                ClientTimings::from(&settings),
                PayloadFactory::new(0),
                pool.counters().clone(),
            ));
        }
        assert_eq!(pool.len(), 3);

        let counters = pool.counters().clone();
        let outcome = pool.await_completion().await;
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(outcome.lost_clients, 0);
        assert!(outcome.finished > outcome.started);
        assert_eq!(counters.published(), 6);
        assert_eq!(counters.active.get(), 0);
        // every client sees every message on the shared topic
        for record in &outcome.records {
            assert_eq!(record.received.len(), 6);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_pool_completes() {
        let pool = ClientPool::new(Arc::new(MemoryBroker::new()), ClientCounters::new());
        assert!(pool.is_empty());
        let outcome = pool.await_completion().await;
        assert!(outcome.records.is_empty());
        assert_eq!(outcome.started, outcome.finished);
    }
}
