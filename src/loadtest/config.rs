//! Typed load test configuration.
//!
//! A config is read from TOML (`loadtest.toml`) or from the flat
//! `settings.json` format older test setups used, where keys are upper-case
//! (`NUM_USERS`, `MESSAGES_PER_USER`, `PAYLOAD_SIZE`, `TIMEOUT`). Every field
//! has a default so an empty file is a valid config.
//!
//! # Example TOML
//!
//! ```toml
//! [settings]
//! num_users = 50
//! messages_per_user = 20
//! payload_size = 1024
//! timeout_secs = 15
//!
//! [broker]
//! host = "localhost"
//! port = 1883
//! transport = "tcp"
//!
//! [topics]
//! prefix = "load/topic"
//! count = 5
//! layout = "shared"
//! ```
//!
//! The broker address can be overridden through the `TEST_BROKER_HOST` and
//! `TEST_BROKER_PORT` environment variables, see
//! [`LoadTestConfig::apply_env_overrides`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::loadtest::error::LoadTestError;

/// Environment variable overriding [`BrokerSettings::host`].
pub const BROKER_HOST_ENV: &str = "TEST_BROKER_HOST";

/// Environment variable overriding [`BrokerSettings::port`].
pub const BROKER_PORT_ENV: &str = "TEST_BROKER_PORT";

/// Top-level load test configuration.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct LoadTestConfig {
    /// Client counts, payload shape and per-phase timings.
    #[serde(default)]
    pub settings: Settings,
    /// Where the broker lives and how to reach it.
    #[serde(default)]
    pub broker: BrokerSettings,
    /// Topic naming and how topics are shared between clients.
    #[serde(default)]
    pub topics: TopicSettings,
}

/// Load shape and client lifecycle timings.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    /// Number of simulated clients.
    #[serde(default = "default_num_users", alias = "NUM_USERS")]
    pub num_users: u32,
    /// Messages each client publishes.
    #[serde(default = "default_messages_per_user", alias = "MESSAGES_PER_USER")]
    pub messages_per_user: u32,
    /// Filler bytes appended to every payload. Signed so that a negative
    /// value is reported as a validation error rather than a parse error.
    #[serde(default = "default_payload_size", alias = "PAYLOAD_SIZE")]
    pub payload_size: i64,
    /// Drain window in seconds: how long a client stays connected after its
    /// last publish to collect in-flight messages.
    #[serde(default = "default_timeout_secs", alias = "TIMEOUT")]
    pub timeout_secs: u64,
    /// How long to wait for the connect acknowledgment.
    #[serde(default = "default_phase_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long to wait for all subscribe acknowledgments.
    #[serde(default = "default_phase_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    /// Pause between subscription and the first publish.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
    /// Lower bound of the random pause between two publishes.
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    /// Upper bound of the random pause between two publishes.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// MQTT keep-alive interval.
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_num_users() -> u32 {
    50
}

fn default_messages_per_user() -> u32 {
    20
}

fn default_payload_size() -> i64 {
    1024
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_phase_timeout_ms() -> u64 {
    5000
}

fn default_settle_ms() -> u64 {
    50
}

fn default_min_delay_ms() -> u64 {
    10
}

fn default_max_delay_ms() -> u64 {
    100
}

fn default_keep_alive_secs() -> u64 {
    60
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            num_users: default_num_users(),
            messages_per_user: default_messages_per_user(),
            payload_size: default_payload_size(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_ms: default_phase_timeout_ms(),
            subscribe_timeout_ms: default_phase_timeout_ms(),
            settle_ms: default_settle_ms(),
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

/// How the MQTT connection is carried.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerTransport {
    /// Plain MQTT over TCP.
    Tcp,
    /// MQTT over WebSockets.
    Websocket,
}

/// Broker endpoint.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BrokerSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_transport")]
    pub transport: BrokerTransport,
    /// Request path for the WebSocket transport.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
}

fn default_host() -> String {
    "mosquitto-auth".to_string()
}

fn default_port() -> u16 {
    9001
}

fn default_transport() -> BrokerTransport {
    BrokerTransport::Websocket
}

fn default_ws_path() -> String {
    "/mqtt".to_string()
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: default_transport(),
            ws_path: default_ws_path(),
        }
    }
}

/// How topics are handed out to clients.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TopicLayout {
    /// Every client subscribes to all topics and publishes to a random one.
    Shared,
    /// Every client subscribes to and publishes on a topic of its own.
    Own,
}

/// Topic naming.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TopicSettings {
    /// Topic name prefix; the topic index (or `/user{i}` for
    /// [`TopicLayout::Own`]) is appended.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Number of topics for [`TopicLayout::Shared`].
    #[serde(default = "default_topic_count")]
    pub count: u32,
    #[serde(default = "default_layout")]
    pub layout: TopicLayout,
}

fn default_prefix() -> String {
    "load/topic".to_string()
}

fn default_topic_count() -> u32 {
    5
}

fn default_layout() -> TopicLayout {
    TopicLayout::Shared
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            count: default_topic_count(),
            layout: default_layout(),
        }
    }
}

impl LoadTestConfig {
    /// Parse a TOML string into a validated [`LoadTestConfig`].
    pub fn from_toml(content: &str) -> Result<Self, LoadTestError> {
        let config = Self::parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a flat `settings.json` document into a validated config.
    ///
    /// Only the load-shape keys live in that format; broker and topic
    /// sections take their defaults.
    pub fn from_settings_json(content: &str) -> Result<Self, LoadTestError> {
        let config = Self::parse_settings_json(content)?;
        config.validate()?;
        Ok(config)
    }

    fn parse_toml(content: &str) -> Result<Self, LoadTestError> {
        Ok(toml::from_str(content)?)
    }

    fn parse_settings_json(content: &str) -> Result<Self, LoadTestError> {
        let settings: Settings = serde_json::from_str(content)?;
        Ok(Self {
            settings,
            ..Self::default()
        })
    }

    /// Read a config file without validating it, for callers that apply
    /// overrides first.
    ///
    /// Files ending in `.json` are read as flat settings documents,
    /// everything else as TOML.
    pub fn read(path: &Path) -> Result<Self, LoadTestError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadTestError::ConfigIo {
            source,
            path: path.display().to_string(),
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::parse_settings_json(&content)
        } else {
            Self::parse_toml(&content)
        }
    }

    /// Read and validate a config from a file path.
    pub fn load(path: &Path) -> Result<Self, LoadTestError> {
        let config = Self::read(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `TEST_BROKER_HOST` / `TEST_BROKER_PORT` from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<(), LoadTestError> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply broker overrides using `lookup` to resolve variable names.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), LoadTestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(BROKER_HOST_ENV).filter(|h| !h.trim().is_empty()) {
            self.broker.host = host.trim().to_string();
        }
        if let Some(port) = lookup(BROKER_PORT_ENV) {
            self.broker.port = port.trim().parse().map_err(|_| {
                LoadTestError::validation(format!(
                    "{BROKER_PORT_ENV}={port:?} is not a valid port number"
                ))
            })?;
        }
        Ok(())
    }

    /// Validate that the config is semantically correct.
    ///
    /// Checks:
    /// - `payload_size` is not negative
    /// - at least one user
    /// - at least one topic for the shared layout
    /// - delay bounds are ordered
    /// - broker host is set and port is non-zero
    pub fn validate(&self) -> Result<(), LoadTestError> {
        let s = &self.settings;
        if s.payload_size < 0 {
            return Err(LoadTestError::validation(format!(
                "PAYLOAD_SIZE must be >= 0 (got {})",
                s.payload_size
            )));
        }
        if s.num_users == 0 {
            return Err(LoadTestError::validation("NUM_USERS must be at least 1"));
        }
        if self.topics.layout == TopicLayout::Shared && self.topics.count == 0 {
            return Err(LoadTestError::validation(
                "topics.count must be at least 1 for the shared layout",
            ));
        }
        if s.min_delay_ms > s.max_delay_ms {
            return Err(LoadTestError::validation(format!(
                "min_delay_ms ({}) must not exceed max_delay_ms ({})",
                s.min_delay_ms, s.max_delay_ms
            )));
        }
        if self.broker.host.trim().is_empty() {
            return Err(LoadTestError::validation("broker.host must not be empty"));
        }
        if self.broker.port == 0 {
            return Err(LoadTestError::validation("broker.port must not be 0"));
        }
        Ok(())
    }

    /// Topics of the shared layout, `{prefix}{i}`.
    pub fn shared_topics(&self) -> Vec<String> {
        (0..self.topics.count)
            .map(|i| format!("{}{}", self.topics.prefix, i))
            .collect()
    }

    /// The topic a client owns under [`TopicLayout::Own`].
    pub fn own_topic(&self, username: &str) -> String {
        format!("{}/{}", self.topics.prefix, username)
    }
}

impl Settings {
    /// Payload filler length. Only meaningful after validation.
    pub fn payload_len(&self) -> usize {
        usize::try_from(self.payload_size).unwrap_or(0)
    }

    /// The drain window as a [`Duration`].
    pub fn drain_window(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    /// Inclusive bounds of the pause between publishes.
    pub fn delay_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.min_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}
