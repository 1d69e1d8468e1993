//! In-process broker used by tests and `run --in-memory`.
//!
//! [`MemoryBroker`] implements [`BrokerConnector`] with QoS 0 semantics:
//! messages are fanned out to every session whose filter matches the topic,
//! publishers included. Each session gets its own delivery task fed through
//! an unbounded channel, so acknowledgments and messages reach the
//! [`SessionListener`] asynchronously and in order, after a configurable
//! delay, much like a network client's event loop.
//!
//! Fault injection:
//! - [`DropPolicy`] drops published messages before fan-out
//! - [`MemoryBroker::with_duplicates`] delivers every Nth message twice
//! - [`MemoryBroker::without_connack`] / [`MemoryBroker::without_suback`]
//!   swallow acknowledgments so clients hit their phase timeouts
//! - an [`Authorizer`] refuses connects and topic access
//! - [`MemoryBroker::with_failing_disconnect`] makes every disconnect fail

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::loadtest::auth::{
    AccessLevel, AclCheckRequest, AllowAll, Authorizer, ConnectAuthRequest,
};
use crate::loadtest::error::ClientError;
use crate::loadtest::transport::{
    BrokerConnector, BrokerLink, ConnectCode, ConnectOptions, Credentials, SessionListener,
};

/// CONNACK code sent when the authorizer refuses a connect.
const NOT_AUTHORIZED: u8 = 5;

/// Which published messages the broker silently loses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DropPolicy {
    /// Deliver everything.
    #[default]
    None,
    /// Drop the Nth, 2Nth, ... published message (counted broker-wide).
    EveryNth(u64),
}

impl DropPolicy {
    fn drops(self, sequence: u64) -> bool {
        match self {
            Self::None => false,
            Self::EveryNth(0) => false,
            Self::EveryNth(n) => sequence % n == 0,
        }
    }
}

/// Broker-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryBrokerStats {
    /// Accepted publish calls.
    pub published: u64,
    /// Messages lost to the drop policy or a publish ACL refusal.
    pub dropped: u64,
    /// Messages queued for delivery, counting each subscriber and duplicate.
    pub delivered: u64,
}

enum Delivery {
    ConnAck(ConnectCode),
    SubAck(bool),
    Message { topic: String, payload: Vec<u8> },
}

struct Queued {
    due: Instant,
    delivery: Delivery,
}

struct Subscription {
    session: u64,
    filter: String,
    tx: mpsc::UnboundedSender<Queued>,
}

struct BrokerState {
    subscriptions: Mutex<Vec<Subscription>>,
    next_session: AtomicU64,
    published: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
}

/// In-memory QoS 0 broker with fault injection.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
    authorizer: Arc<dyn Authorizer>,
    delay: Duration,
    drop_policy: DropPolicy,
    duplicate_every: Option<u64>,
    send_connack: bool,
    send_suback: bool,
    fail_disconnect: bool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// Broker that allows everything and delivers after 1ms.
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                subscriptions: Mutex::new(Vec::new()),
                next_session: AtomicU64::new(0),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
            }),
            authorizer: Arc::new(AllowAll),
            delay: Duration::from_millis(1),
            drop_policy: DropPolicy::None,
            duplicate_every: None,
            send_connack: true,
            send_suback: true,
            fail_disconnect: false,
        }
    }

    /// Delay between a publish (or request) and its delivery.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Deliver every `n`th published message twice.
    pub fn with_duplicates(mut self, n: u64) -> Self {
        self.duplicate_every = (n > 0).then_some(n);
        self
    }

    pub fn with_authorizer(mut self, authorizer: impl Authorizer + 'static) -> Self {
        self.authorizer = Arc::new(authorizer);
        self
    }

    /// Never acknowledge connects.
    pub fn without_connack(mut self) -> Self {
        self.send_connack = false;
        self
    }

    /// Never acknowledge subscriptions.
    pub fn without_suback(mut self) -> Self {
        self.send_suback = false;
        self
    }

    /// Tear sessions down on disconnect but report the disconnect as failed.
    pub fn with_failing_disconnect(mut self) -> Self {
        self.fail_disconnect = true;
        self
    }

    pub fn stats(&self) -> MemoryBrokerStats {
        MemoryBrokerStats {
            published: self.state.published.load(Ordering::Relaxed),
            dropped: self.state.dropped.load(Ordering::Relaxed),
            delivered: self.state.delivered.load(Ordering::Relaxed),
        }
    }

    /// Number of live subscriptions across all sessions.
    pub fn subscription_count(&self) -> usize {
        self.state.subscriptions.lock().len()
    }

    fn fan_out(&self, topic: &str, payload: &[u8]) {
        let sequence = self.state.published.fetch_add(1, Ordering::Relaxed) + 1;
        if self.drop_policy.drops(sequence) {
            self.state.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let copies = match self.duplicate_every {
            Some(n) if sequence % n == 0 => 2,
            _ => 1,
        };

        let due = Instant::now() + self.delay;
        let subscriptions = self.state.subscriptions.lock();
        for sub in subscriptions
            .iter()
            .filter(|s| topic_matches(&s.filter, topic))
        {
            for _ in 0..copies {
                let queued = Queued {
                    due,
                    delivery: Delivery::Message {
                        topic: topic.to_string(),
                        payload: payload.to_vec(),
                    },
                };
                if sub.tx.send(queued).is_ok() {
                    self.state.delivered.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
}

#[async_trait]
impl BrokerConnector for MemoryBroker {
    async fn connect(
        &self,
        options: ConnectOptions,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Box<dyn BrokerLink>, ClientError> {
        let creds = options.credentials;
        let decision = self.authorizer.authorize_connect(&ConnectAuthRequest {
            username: creds.username.clone(),
            password: creds.password.clone(),
            client_id: creds.client_id.clone(),
        });
        let code = if decision.is_allow() {
            ConnectCode::Accepted
        } else {
            ConnectCode::Refused(NOT_AUTHORIZED)
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(deliver(rx, listener));
        if self.send_connack || !code.is_accepted() {
            let _ = tx.send(Queued {
                due: Instant::now() + self.delay,
                delivery: Delivery::ConnAck(code),
            });
        }

        Ok(Box::new(MemoryLink {
            broker: self.clone(),
            session: self.state.next_session.fetch_add(1, Ordering::Relaxed),
            credentials: creds,
            accepted: code.is_accepted(),
            open: AtomicBool::new(true),
            tx,
        }))
    }
}

/// Per-session delivery task: hands queued items to the listener in order.
async fn deliver(mut rx: mpsc::UnboundedReceiver<Queued>, listener: Arc<dyn SessionListener>) {
    while let Some(item) = rx.recv().await {
        tokio::time::sleep_until(item.due).await;
        match item.delivery {
            Delivery::ConnAck(code) => listener.on_connect(code),
            Delivery::SubAck(granted) => listener.on_subscribe(granted),
            Delivery::Message { topic, payload } => {
                listener.on_message(&topic, &payload, Instant::now())
            },
        }
    }
}

struct MemoryLink {
    broker: MemoryBroker,
    session: u64,
    credentials: Credentials,
    accepted: bool,
    open: AtomicBool,
    tx: mpsc::UnboundedSender<Queued>,
}

impl MemoryLink {
    fn usable(&self) -> Result<(), String> {
        if !self.accepted {
            Err("connection refused by broker".to_string())
        } else if !self.open.load(Ordering::Acquire) {
            Err("session closed".to_string())
        } else {
            Ok(())
        }
    }

    fn acl(&self, topic: &str, access: AccessLevel) -> bool {
        self.broker
            .authorizer
            .authorize_topic(&AclCheckRequest {
                username: self.credentials.username.clone(),
                client_id: self.credentials.client_id.clone(),
                topic: topic.to_string(),
                access,
            })
            .is_allow()
    }

    fn unsubscribe_all(&self) {
        self.broker
            .state
            .subscriptions
            .lock()
            .retain(|s| s.session != self.session);
    }
}

#[async_trait]
impl BrokerLink for MemoryLink {
    async fn subscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.usable().map_err(|message| ClientError::Subscribe {
            topic: topic.to_string(),
            message,
        })?;

        let granted = self.acl(topic, AccessLevel::Subscribe);
        if granted {
            self.broker.state.subscriptions.lock().push(Subscription {
                session: self.session,
                filter: topic.to_string(),
                tx: self.tx.clone(),
            });
        }
        if self.broker.send_suback {
            let _ = self.tx.send(Queued {
                due: Instant::now() + self.broker.delay,
                delivery: Delivery::SubAck(granted),
            });
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ClientError> {
        self.usable().map_err(|message| ClientError::Publish {
            topic: topic.to_string(),
            message,
        })?;

        if self.acl(topic, AccessLevel::Write) {
            self.broker.fan_out(topic, &payload);
        } else {
            // Brokers drop unauthorised QoS 0 publishes without telling the client.
            self.broker.state.published.fetch_add(1, Ordering::Relaxed);
            self.broker.state.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Err(ClientError::Disconnect {
                message: "session already closed".to_string(),
            });
        }
        self.unsubscribe_all();
        if self.broker.fail_disconnect {
            return Err(ClientError::Disconnect {
                message: "broker closed the socket before DISCONNECT was sent".to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for MemoryLink {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {},
            (Some(f), Some(t)) if f == t => {},
            (None, None) => return true,
            _ => return false,
        }
    }
}
