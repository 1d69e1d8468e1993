//! Narrow broker-client interface and its `rumqttc` implementation.
//!
//! The engine never talks MQTT itself. It asks a [`BrokerConnector`] for a
//! [`BrokerLink`] and hears back through a [`SessionListener`]:
//!
//! - connect is asynchronous; the outcome arrives via
//!   [`SessionListener::on_connect`] carrying a [`ConnectCode`]
//! - subscribe is asynchronous; acknowledgments arrive via
//!   [`SessionListener::on_subscribe`]
//! - publish is fire-and-forget at QoS 0
//! - inbound messages arrive via [`SessionListener::on_message`], called from
//!   the transport's own event-loop task
//! - losing an established session is reported via
//!   [`SessionListener::on_connection_lost`]; the transport reconnects and
//!   re-issues the session's subscriptions on its own
//!
//! [`MqttConnector`] drives a real broker through `rumqttc`;
//! [`crate::loadtest::memory::MemoryBroker`] is the in-process double.

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS, SubscribeReasonCode,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::loadtest::config::{BrokerSettings, BrokerTransport};
use crate::loadtest::error::ClientError;

/// Pause before polling the event loop again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// How long a disconnect waits for the event loop to flush the packet.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Capacity of the `rumqttc` request queue per client.
const REQUEST_CAPACITY: usize = 64;

/// `rumqttc`'s own packet size limit, kept as the floor.
const MIN_PACKET_SIZE: usize = 10 * 1024;

/// Room for the fixed header, topic name and payload prefix on top of the
/// filler bytes.
const PACKET_HEADROOM: usize = 4 * 1024;

/// Username / password / client id triple presented on connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub client_id: String,
}

/// Everything a connector needs to open one session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub credentials: Credentials,
    pub keep_alive: Duration,
}

/// Connect-result code as carried by an MQTT 3.1.1 CONNACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectCode {
    Accepted,
    /// Non-zero return code.
    Refused(u8),
}

impl ConnectCode {
    pub fn is_accepted(self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Numeric CONNACK return code.
    pub fn code(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::Refused(code) => code,
        }
    }

    /// Human-readable reason for the code.
    pub fn reason(self) -> &'static str {
        match self.code() {
            0 => "connection accepted",
            1 => "unacceptable protocol version",
            2 => "identifier rejected",
            3 => "server unavailable",
            4 => "bad user name or password",
            5 => "not authorized",
            _ => "unknown refusal",
        }
    }
}

impl From<ConnectReturnCode> for ConnectCode {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Success => Self::Accepted,
            ConnectReturnCode::RefusedProtocolVersion => Self::Refused(1),
            ConnectReturnCode::BadClientId => Self::Refused(2),
            ConnectReturnCode::ServiceUnavailable => Self::Refused(3),
            ConnectReturnCode::BadUserNamePassword => Self::Refused(4),
            ConnectReturnCode::NotAuthorized => Self::Refused(5),
        }
    }
}

/// Callbacks a transport invokes on behalf of one session.
///
/// Implementations must be cheap and must not block: they run inside the
/// transport's delivery path.
pub trait SessionListener: Send + Sync {
    /// Connect result.
    fn on_connect(&self, code: ConnectCode);
    /// One acknowledgment per subscribe request; `granted` is `false` when
    /// the broker refused the subscription.
    fn on_subscribe(&self, granted: bool);
    /// Inbound message.
    fn on_message(&self, topic: &str, payload: &[u8], arrival: Instant);
    /// An established session dropped. Messages published to it until the
    /// transport reconnects are gone.
    fn on_connection_lost(&self, reason: &str);
}

/// Opens broker sessions.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Start connecting. Returns as soon as the session exists locally; the
    /// broker's answer is reported through `listener`.
    async fn connect(
        &self,
        options: ConnectOptions,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Box<dyn BrokerLink>, ClientError>;
}

/// An open (or opening) broker session.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Request a QoS 0 subscription. Does not wait for the acknowledgment.
    async fn subscribe(&self, topic: &str) -> Result<(), ClientError>;
    /// Publish at QoS 0. No delivery confirmation is awaited.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ClientError>;
    async fn disconnect(&self) -> Result<(), ClientError>;
}

/// [`BrokerConnector`] backed by `rumqttc`.
#[derive(Debug, Clone)]
pub struct MqttConnector {
    host: String,
    port: u16,
    transport: BrokerTransport,
    ws_path: String,
    max_packet_size: usize,
}

impl MqttConnector {
    /// Connector for `broker`, sized for payloads carrying `payload_len`
    /// filler bytes.
    pub fn new(broker: &BrokerSettings, payload_len: usize) -> Self {
        Self {
            host: broker.host.clone(),
            port: broker.port,
            transport: broker.transport,
            ws_path: broker.ws_path.clone(),
            max_packet_size: packet_limit(payload_len),
        }
    }

    fn mqtt_options(&self, options: &ConnectOptions) -> MqttOptions {
        let creds = &options.credentials;
        let mut mqtt = match self.transport {
            BrokerTransport::Tcp => MqttOptions::new(&creds.client_id, &self.host, self.port),
            BrokerTransport::Websocket => {
                let url = format!("ws://{}:{}{}", self.host, self.port, self.ws_path);
                let mut mqtt = MqttOptions::new(&creds.client_id, url, self.port);
                mqtt.set_transport(rumqttc::Transport::Ws);
                mqtt
            },
        };
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_clean_session(true);
        mqtt.set_credentials(&creds.username, &creds.password);
        // Publishers and subscribers see the same payloads, so one limit
        // covers both directions.
        mqtt.set_max_packet_size(self.max_packet_size, self.max_packet_size);
        mqtt
    }
}

/// Packet size limit for payloads with `payload_len` filler bytes.
pub fn packet_limit(payload_len: usize) -> usize {
    payload_len
        .saturating_add(PACKET_HEADROOM)
        .max(MIN_PACKET_SIZE)
}

/// Subscriptions of one `rumqttc` session and whether they need restoring.
///
/// Sessions are clean, so after a reconnect the broker has forgotten every
/// subscription. The tracker remembers them and swallows the SUBACKs of the
/// re-issued requests so the listener only hears about the ones it asked for.
#[derive(Debug, Default)]
struct SessionTracker {
    topics: Vec<String>,
    established: bool,
    lost: bool,
    resubscribe_acks: usize,
}

impl SessionTracker {
    fn remember(&mut self, topic: &str) {
        self.topics.push(topic.to_string());
    }

    /// An accepted CONNACK arrived. Returns the topics to subscribe again
    /// when this is a reconnect.
    fn connected(&mut self) -> Vec<String> {
        self.established = true;
        if std::mem::take(&mut self.lost) {
            self.topics.clone()
        } else {
            Vec::new()
        }
    }

    /// One re-issued subscribe request went out.
    fn resubscribed(&mut self) {
        self.resubscribe_acks += 1;
    }

    /// Whether a SUBACK belongs to the listener.
    fn forward_suback(&mut self) -> bool {
        if self.resubscribe_acks > 0 {
            self.resubscribe_acks -= 1;
            false
        } else {
            true
        }
    }

    /// The connection failed. Returns `true` when an established session
    /// was lost, `false` while still trying to connect.
    fn connection_lost(&mut self) -> bool {
        let was_established = std::mem::take(&mut self.established);
        if was_established {
            self.lost = true;
            self.resubscribe_acks = 0;
        }
        was_established
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(
        &self,
        options: ConnectOptions,
        listener: Arc<dyn SessionListener>,
    ) -> Result<Box<dyn BrokerLink>, ClientError> {
        let mqtt = self.mqtt_options(&options);
        let (client, eventloop) = AsyncClient::new(mqtt, REQUEST_CAPACITY);
        let cancel = CancellationToken::new();
        let session = Arc::new(Mutex::new(SessionTracker::default()));
        let handle = tokio::spawn(drive_event_loop(
            eventloop,
            EventLoopContext {
                client: client.clone(),
                listener,
                session: session.clone(),
                cancel: cancel.clone(),
                client_id: options.credentials.client_id,
            },
        ));
        Ok(Box::new(MqttLink {
            client,
            session,
            cancel,
            event_loop: Mutex::new(Some(handle)),
        }))
    }
}

/// What the event-loop task shares with its [`MqttLink`].
struct EventLoopContext {
    client: AsyncClient,
    listener: Arc<dyn SessionListener>,
    session: Arc<Mutex<SessionTracker>>,
    cancel: CancellationToken,
    client_id: String,
}

/// Polls one `rumqttc` event loop and forwards what matters to the listener.
///
/// Connection errors other than an explicit refusal are retried after
/// [`RECONNECT_DELAY`]; a refusal ends the loop, as does cancellation or an
/// outgoing DISCONNECT. After a reconnect the session's subscriptions are
/// re-issued.
async fn drive_event_loop(mut eventloop: EventLoop, ctx: EventLoopContext) {
    let EventLoopContext {
        client,
        listener,
        session,
        cancel,
        client_id,
    } = ctx;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                let code = ConnectCode::from(ack.code);
                if code.is_accepted() {
                    let topics = session.lock().connected();
                    if !topics.is_empty() {
                        debug!(client = %client_id, topics = topics.len(), "restoring subscriptions");
                    }
                    for topic in topics {
                        match client.try_subscribe(topic.as_str(), QoS::AtMostOnce) {
                            Ok(()) => session.lock().resubscribed(),
                            Err(err) => {
                                warn!(client = %client_id, topic = %topic, error = %err, "resubscribe failed")
                            },
                        }
                    }
                }
                listener.on_connect(code);
            },
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                if session.lock().forward_suback() {
                    for code in ack.return_codes {
                        listener.on_subscribe(matches!(code, SubscribeReasonCode::Success(_)));
                    }
                }
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                listener.on_message(&publish.topic, &publish.payload, Instant::now());
            },
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!(client = %client_id, "disconnect sent, stopping event loop");
                break;
            },
            Ok(_) => {},
            Err(ConnectionError::ConnectionRefused(code)) => {
                listener.on_connect(ConnectCode::from(code));
                break;
            },
            Err(err) => {
                if session.lock().connection_lost() {
                    listener.on_connection_lost(&err.to_string());
                }
                warn!(client = %client_id, error = %err, "connection error, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {},
                }
            },
        }
    }
}

/// [`BrokerLink`] over a `rumqttc` [`AsyncClient`].
///
/// Requests use the non-blocking `try_*` calls so a stalled or dead event
/// loop turns into an error instead of a hung client.
struct MqttLink {
    client: AsyncClient,
    session: Arc<Mutex<SessionTracker>>,
    cancel: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn subscribe(&self, topic: &str) -> Result<(), ClientError> {
        self.client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| ClientError::Subscribe {
                topic: topic.to_string(),
                message: err.to_string(),
            })?;
        self.session.lock().remember(topic);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ClientError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|err| ClientError::Publish {
                topic: topic.to_string(),
                message: err.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<(), ClientError> {
        let result = self
            .client
            .try_disconnect()
            .map_err(|err| ClientError::Disconnect {
                message: err.to_string(),
            });

        let handle = self.event_loop.lock().take();
        if let Some(handle) = handle {
            if result.is_ok() {
                let _ = tokio::time::timeout(DISCONNECT_GRACE, handle).await;
            }
        }
        self.cancel.cancel();
        result
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
