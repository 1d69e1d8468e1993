//! Simulated MQTT client: one session's connect, subscribe, publish, drain
//! and disconnect lifecycle.
//!
//! A [`SimulatedClient`] walks through [`ClientState`] in order. Phase
//! failures never end the client early: a connect that is not acknowledged
//! in time carries on as if it had been, a refused or failed connect skips
//! subscribing but still runs the publish loop so every failed attempt is
//! counted, and a subscribe timeout goes straight to publishing. Every
//! failure is logged and kept in the client's [`ClientRecord`], including
//! sessions the transport reports lost mid-run.

use rand::prelude::*;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::loadtest::config::Settings;
use crate::loadtest::error::ClientError;
use crate::loadtest::recorder::{ClientRecord, ConnectOutcome, EventLog, ReceivedEvent, SentEvent};
use crate::loadtest::transport::{
    BrokerConnector, BrokerLink, ConnectCode, ConnectOptions, Credentials, SessionListener,
};

/// Lifecycle of a simulated client, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClientState {
    Created,
    Connecting,
    Connected,
    Subscribing,
    Ready,
    Publishing,
    Draining,
    Disconnected,
}

/// Atomic counter tracking the number of clients currently running.
#[derive(Clone, Debug, Default)]
pub struct ActiveClientCounter(Arc<AtomicU32>);

impl ActiveClientCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Live counters shared by every client of a run, read by the progress display.
#[derive(Clone, Debug, Default)]
pub struct ClientCounters {
    pub active: ActiveClientCounter,
    /// Publish attempts so far, successful or not.
    pub published: Arc<AtomicU64>,
}

impl ClientCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Builds run-unique payloads: `{username}_msg{seq}_` followed by filler.
#[derive(Debug, Clone)]
pub struct PayloadFactory {
    filler: Arc<str>,
}

impl PayloadFactory {
    /// `filler_len` bytes of `A` are appended to every payload.
    pub fn new(filler_len: usize) -> Self {
        Self {
            filler: "A".repeat(filler_len).into(),
        }
    }

    pub fn make(&self, username: &str, seq: u32) -> String {
        format!("{username}_msg{seq}_{}", self.filler)
    }
}

/// Per-phase timings of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTimings {
    pub connect_timeout: Duration,
    pub subscribe_timeout: Duration,
    pub settle: Duration,
    /// Inclusive bounds of the random pause between publishes.
    pub publish_delay: (Duration, Duration),
    pub drain: Duration,
    pub keep_alive: Duration,
}

impl From<&Settings> for ClientTimings {
    fn from(settings: &Settings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout(),
            subscribe_timeout: settings.subscribe_timeout(),
            settle: settings.settle_delay(),
            publish_delay: settings.delay_range(),
            drain: settings.drain_window(),
            keep_alive: settings.keep_alive(),
        }
    }
}

/// What one client is, and what it does.
#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub credentials: Credentials,
    /// Topics a publish picks from uniformly.
    pub publish_topics: Vec<String>,
    /// Topics subscribed to before publishing.
    pub subscribe_topics: BTreeSet<String>,
    pub message_count: u32,
}

/// Transport callbacks for one client.
///
/// Connect and subscribe acknowledgments go into watch channels the client
/// task waits on; inbound messages go straight into the receive log.
struct ClientListener {
    client_id: String,
    connack: watch::Sender<Option<ConnectCode>>,
    /// One entry per subscribe acknowledgment, in request order.
    subacks: watch::Sender<Vec<bool>>,
    received: EventLog<ReceivedEvent>,
    /// Failures reported by the transport's own task.
    transport_errors: EventLog<ClientError>,
}

impl SessionListener for ClientListener {
    fn on_connect(&self, code: ConnectCode) {
        self.connack.send_replace(Some(code));
    }

    fn on_subscribe(&self, granted: bool) {
        self.subacks.send_modify(|acks| acks.push(granted));
    }

    fn on_message(&self, topic: &str, payload: &[u8], arrival: Instant) {
        let payload = String::from_utf8_lossy(payload).into_owned();
        debug!(client = %self.client_id, topic, "message received");
        self.received.append(ReceivedEvent {
            topic: topic.to_string(),
            payload,
            receive_time: arrival,
        });
    }

    fn on_connection_lost(&self, reason: &str) {
        warn!(client = %self.client_id, reason, "connection lost");
        self.transport_errors.append(ClientError::Transport {
            message: format!("connection lost: {reason}"),
        });
    }
}

/// One simulated broker client.
pub struct SimulatedClient {
    spec: ClientSpec,
    timings: ClientTimings,
    payloads: PayloadFactory,
    counters: ClientCounters,
    state: ClientState,
    listener: Arc<ClientListener>,
    link: Option<Box<dyn BrokerLink>>,
    sent: EventLog<SentEvent>,
    errors: Vec<ClientError>,
}

impl SimulatedClient {
    pub fn new(
        spec: ClientSpec,
        timings: ClientTimings,
        payloads: PayloadFactory,
        counters: ClientCounters,
    ) -> Self {
        let listener = Arc::new(ClientListener {
            client_id: spec.credentials.client_id.clone(),
            connack: watch::Sender::new(None),
            subacks: watch::Sender::new(Vec::new()),
            received: EventLog::new(),
            transport_errors: EventLog::new(),
        });
        Self {
            spec,
            timings,
            payloads,
            counters,
            state: ClientState::Created,
            listener,
            link: None,
            sent: EventLog::new(),
            errors: Vec::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn username(&self) -> &str {
        &self.spec.credentials.username
    }

    pub fn client_id(&self) -> &str {
        &self.spec.credentials.client_id
    }

    fn transition(&mut self, next: ClientState) {
        debug!(client = %self.client_id(), from = ?self.state, to = ?next, "state change");
        self.state = next;
    }

    fn record_error(&mut self, err: ClientError) {
        warn!(client = %self.client_id(), category = err.error_category(), "{err}");
        self.errors.push(err);
    }

    /// Open the broker session and wait up to the connect timeout for the
    /// acknowledgment.
    ///
    /// On `Err` the session, if one was opened, is kept so the caller can
    /// continue in degraded mode.
    pub async fn connect(&mut self, connector: &dyn BrokerConnector) -> Result<(), ClientError> {
        self.transition(ClientState::Connecting);
        let mut acks = self.listener.connack.subscribe();
        let options = ConnectOptions {
            credentials: self.spec.credentials.clone(),
            keep_alive: self.timings.keep_alive,
        };
        let listener: Arc<dyn SessionListener> = self.listener.clone();
        self.link = Some(connector.connect(options, listener).await?);

        let _ = tokio::time::timeout(self.timings.connect_timeout, acks.wait_for(Option::is_some))
            .await;
        let code = *acks.borrow();
        match code {
            Some(ConnectCode::Accepted) => {
                self.transition(ClientState::Connected);
                Ok(())
            },
            Some(refused) => Err(ClientError::ConnectionRejected {
                code: refused.code(),
                reason: refused.reason().to_string(),
            }),
            None => Err(ClientError::ConnectionTimeout {
                timeout_ms: self.timings.connect_timeout.as_millis() as u64,
            }),
        }
    }

    /// Request one subscription per topic, then wait until every accepted
    /// request is acknowledged or the subscribe timeout passes.
    ///
    /// Requests the transport refuses outright and subscriptions the broker
    /// denies are recorded as errors; only the timeout is returned.
    pub async fn subscribe(&mut self, topics: &[String]) -> Result<(), ClientError> {
        self.transition(ClientState::Subscribing);
        let mut acks = self.listener.subacks.subscribe();
        let already_acked = acks.borrow().len();

        let mut requested = Vec::with_capacity(topics.len());
        for topic in topics {
            let result = match &self.link {
                Some(link) => link.subscribe(topic).await,
                None => Err(ClientError::Subscribe {
                    topic: topic.clone(),
                    message: "no broker session".to_string(),
                }),
            };
            match result {
                Ok(()) => requested.push(topic.clone()),
                Err(err) => self.record_error(err),
            }
        }

        let expected = already_acked + requested.len();
        let complete = tokio::time::timeout(
            self.timings.subscribe_timeout,
            acks.wait_for(|acks| acks.len() >= expected),
        )
        .await
        .is_ok();

        let granted: Vec<bool> = acks.borrow()[already_acked..].to_vec();
        for (topic, _) in requested.iter().zip(&granted).filter(|(_, ok)| !**ok) {
            self.record_error(ClientError::Subscribe {
                topic: topic.clone(),
                message: "subscription refused by broker".to_string(),
            });
        }

        if complete {
            Ok(())
        } else {
            Err(ClientError::SubscribeTimeout {
                acked: granted.len(),
                expected: requested.len(),
                timeout_ms: self.timings.subscribe_timeout.as_millis() as u64,
            })
        }
    }

    /// Record the send, then hand the payload to the transport at QoS 0.
    ///
    /// The send is recorded even when the transport refuses the publish.
    pub async fn publish(&self, topic: &str, payload: String) -> Result<(), ClientError> {
        let bytes = payload.clone().into_bytes();
        self.sent.append(SentEvent {
            topic: topic.to_string(),
            payload,
            send_time: Instant::now(),
        });
        match &self.link {
            Some(link) => link.publish(topic, bytes).await,
            None => Err(ClientError::Publish {
                topic: topic.to_string(),
                message: "no broker session".to_string(),
            }),
        }
    }

    async fn publish_loop(&mut self) {
        self.transition(ClientState::Publishing);
        if self.spec.publish_topics.is_empty() {
            warn!(client = %self.client_id(), "no topics to publish to");
            return;
        }

        let mut rng = rand::rngs::StdRng::from_rng(&mut rand::rng());
        let (min, max) = self.timings.publish_delay;
        let (min_ms, max_ms) = (min.as_millis() as u64, max.as_millis() as u64);
        let mut failed = 0u32;

        for seq in 0..self.spec.message_count {
            let topics = &self.spec.publish_topics;
            let topic = topics[rng.random_range(0..topics.len())].clone();
            let payload = self.payloads.make(self.username(), seq);
            if let Err(err) = self.publish(&topic, payload).await {
                debug!(client = %self.client_id(), error = %err, "publish failed");
                self.errors.push(err);
                failed += 1;
            }
            self.counters.published.fetch_add(1, Ordering::Relaxed);

            let pause = rng.random_range(min_ms..=max_ms);
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }

        if failed > 0 {
            warn!(
                client = %self.client_id(),
                failed,
                attempted = self.spec.message_count,
                "publishes failed"
            );
        }
    }

    async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            if let Err(err) = link.disconnect().await {
                self.record_error(err);
            }
        }
        self.transition(ClientState::Disconnected);
    }

    /// Run the whole lifecycle and return the frozen logs.
    pub async fn run(mut self, connector: Arc<dyn BrokerConnector>) -> ClientRecord {
        self.counters.active.increment();

        let outcome = match self.connect(connector.as_ref()).await {
            Ok(()) => ConnectOutcome::Connected,
            Err(err) => {
                let outcome = match err {
                    ClientError::ConnectionTimeout { .. } => ConnectOutcome::TimedOut,
                    ClientError::ConnectionRejected { .. } => ConnectOutcome::Rejected,
                    _ => ConnectOutcome::Failed,
                };
                self.record_error(err);
                outcome
            },
        };

        if matches!(outcome, ConnectOutcome::Connected | ConnectOutcome::TimedOut) {
            let topics: Vec<String> = self.spec.subscribe_topics.iter().cloned().collect();
            if let Err(err) = self.subscribe(&topics).await {
                self.record_error(err);
            }
            self.transition(ClientState::Ready);
            tokio::time::sleep(self.timings.settle).await;
        }

        self.publish_loop().await;

        self.transition(ClientState::Draining);
        tokio::time::sleep(self.timings.drain).await;
        self.disconnect().await;

        self.counters.active.decrement();
        let mut errors = self.errors;
        errors.extend(self.listener.transport_errors.drain());
        ClientRecord {
            username: self.spec.credentials.username.clone(),
            client_id: self.spec.credentials.client_id.clone(),
            connect: outcome,
            sent: self.sent.drain(),
            received: self.listener.received.drain(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loadtest::auth::{AccessLevel, DenyList};
    use crate::loadtest::memory::MemoryBroker;
    use async_trait::async_trait;

    /// Connector whose broker is unreachable.
    struct Unreachable;

    #[async_trait]
    impl BrokerConnector for Unreachable {
        async fn connect(
            &self,
            _options: ConnectOptions,
            _listener: Arc<dyn SessionListener>,
        ) -> Result<Box<dyn BrokerLink>, ClientError> {
            Err(ClientError::Transport {
                message: "connection refused (os error 111)".to_string(),
            })
        }
    }

    /// In-memory broker whose sessions drop once right after connecting.
    struct Flaky(MemoryBroker);

    #[async_trait]
    impl BrokerConnector for Flaky {
        async fn connect(
            &self,
            options: ConnectOptions,
            listener: Arc<dyn SessionListener>,
        ) -> Result<Box<dyn BrokerLink>, ClientError> {
            let link = self.0.connect(options, listener.clone()).await?;
            listener.on_connection_lost("connection reset by peer");
            Ok(link)
        }
    }

    fn spec(username: &str, topics: &[&str], messages: u32) -> ClientSpec {
        ClientSpec {
            credentials: Credentials {
                username: username.to_string(),
                password: "pw".to_string(),
                client_id: format!("{username}-run-0"),
            },
            publish_topics: topics.iter().map(|t| t.to_string()).collect(),
            subscribe_topics: topics.iter().map(|t| t.to_string()).collect(),
            message_count: messages,
        }
    }

    fn timings() -> ClientTimings {
        ClientTimings {
            connect_timeout: Duration::from_millis(500),
            subscribe_timeout: Duration::from_millis(500),
            settle: Duration::from_millis(50),
            publish_delay: (Duration::from_millis(10), Duration::from_millis(100)),
            drain: Duration::from_secs(1),
            keep_alive: Duration::from_secs(60),
        }
    }

    fn client(spec: ClientSpec) -> SimulatedClient {
        SimulatedClient::new(spec, timings(), PayloadFactory::new(4), ClientCounters::new())
    }

    #[test]
    fn test_payload_factory_format() {
        let payloads = PayloadFactory::new(3);
        assert_eq!(payloads.make("user7", 2), "user7_msg2_AAA");
        assert_eq!(PayloadFactory::new(0).make("user0", 0), "user0_msg0_");
    }

    #[test]
    fn test_timings_from_settings() {
        let t = ClientTimings::from(&Settings::default());
        assert_eq!(t.connect_timeout, Duration::from_secs(5));
        assert_eq!(t.drain, Duration::from_secs(15));
        assert_eq!(t.settle, Duration::from_millis(50));
    }

    #[test]
    fn test_active_counter() {
        let counter = ActiveClientCounter::new();
        counter.increment();
        counter.increment();
        counter.decrement();
        assert_eq!(counter.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_subscribed_client_receives_own_messages() {
        let broker: Arc<dyn BrokerConnector> = Arc::new(MemoryBroker::new());
        let counters = ClientCounters::new();
        let sim = SimulatedClient::new(
            spec("user0", &["t"], 3),
            timings(),
            PayloadFactory::new(2),
            counters.clone(),
        );
        assert_eq!(sim.state(), ClientState::Created);

        let record = sim.run(broker).await;
        assert_eq!(record.connect, ConnectOutcome::Connected);
        assert_eq!(record.sent.len(), 3);
        assert_eq!(record.received.len(), 3);
        assert!(record.errors.is_empty());
        assert_eq!(record.sent[0].payload, "user0_msg0_AA");
        assert!(record.received[0].receive_time > record.sent[0].send_time);
        assert_eq!(counters.published(), 3);
        assert_eq!(counters.active.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_client_still_attempts_every_publish() {
        let broker: Arc<dyn BrokerConnector> =
            Arc::new(MemoryBroker::new().with_authorizer(DenyList::new().deny_user("user0")));
        let record = client(spec("user0", &["t"], 4)).run(broker).await;

        assert_eq!(record.connect, ConnectOutcome::Rejected);
        assert_eq!(record.sent.len(), 4);
        assert!(record.received.is_empty());
        let categories: Vec<_> = record.errors.iter().map(|e| e.error_category()).collect();
        assert_eq!(categories[0], "connect_rejected");
        assert_eq!(categories.iter().filter(|c| **c == "publish").count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_degrades_to_normal_run() {
        let broker: Arc<dyn BrokerConnector> = Arc::new(MemoryBroker::new().without_connack());
        let record = client(spec("user0", &["t"], 2)).run(broker).await;

        assert_eq!(record.connect, ConnectOutcome::TimedOut);
        assert_eq!(record.received.len(), 2);
        assert_eq!(
            record.errors,
            vec![ClientError::ConnectionTimeout { timeout_ms: 500 }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_timeout_still_publishes() {
        let broker: Arc<dyn BrokerConnector> = Arc::new(MemoryBroker::new().without_suback());
        let record = client(spec("user0", &["a", "b"], 2)).run(broker).await;

        assert_eq!(record.sent.len(), 2);
        assert!(matches!(
            record.errors.as_slice(),
            [ClientError::SubscribeTimeout {
                acked: 0,
                expected: 2,
                ..
            }]
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denied_subscription_is_recorded() {
        let broker = MemoryBroker::new()
            .with_authorizer(DenyList::new().deny_topic("b", AccessLevel::Subscribe));
        let mut sim = client(spec("user0", &["a", "b"], 0));
        sim.connect(&broker).await.unwrap();
        assert_eq!(sim.state(), ClientState::Connected);

        let topics = vec!["a".to_string(), "b".to_string()];
        sim.subscribe(&topics).await.unwrap();
        assert_eq!(
            sim.errors,
            vec![ClientError::Subscribe {
                topic: "b".to_string(),
                message: "subscription refused by broker".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_without_session_is_recorded_as_sent() {
        let sim = client(spec("user0", &["t"], 1));
        let err = sim.publish("t", "p".to_string()).await.unwrap_err();
        assert_eq!(err.error_category(), "publish");
        assert_eq!(sim.sent.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_broker_is_a_failure_not_a_rejection() {
        let record = client(spec("user0", &["t"], 3)).run(Arc::new(Unreachable)).await;

        assert_eq!(record.connect, ConnectOutcome::Failed);
        assert_eq!(record.sent.len(), 3);
        let categories: Vec<_> = record.errors.iter().map(|e| e.error_category()).collect();
        assert_eq!(categories[0], "transport");
        assert!(!categories.contains(&"connect_rejected"));
        assert!(!categories.contains(&"subscribe_timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_session_is_recorded() {
        let broker: Arc<dyn BrokerConnector> = Arc::new(Flaky(MemoryBroker::new()));
        let record = client(spec("user0", &["t"], 2)).run(broker).await;

        assert_eq!(record.connect, ConnectOutcome::Connected);
        assert_eq!(record.received.len(), 2);
        assert_eq!(
            record.errors,
            vec![ClientError::Transport {
                message: "connection lost: connection reset by peer".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_disconnect_still_yields_record() {
        let broker: Arc<dyn BrokerConnector> =
            Arc::new(MemoryBroker::new().with_failing_disconnect());
        let counters = ClientCounters::new();
        let sim = SimulatedClient::new(
            spec("user0", &["t"], 3),
            timings(),
            PayloadFactory::new(1),
            counters.clone(),
        );
        let record = sim.run(broker).await;

        assert_eq!(record.sent.len(), 3);
        assert_eq!(record.received.len(), 3);
        assert!(matches!(
            record.errors.as_slice(),
            [ClientError::Disconnect { .. }]
        ));
        assert_eq!(counters.active.get(), 0);
    }
}
