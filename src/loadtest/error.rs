//! Error types for the load testing engine.
//!
//! Defines [`LoadTestError`] for configuration errors, which are the only
//! fatal category, and [`ClientError`] for the per-client failures a
//! simulated client records and then works around.

/// Errors that occur during load test configuration parsing, validation, or file I/O.
///
/// Any of these aborts the run before a single client is spawned.
#[derive(Debug, thiserror::Error)]
pub enum LoadTestError {
    /// TOML parse failure -- the config file contains invalid TOML syntax
    /// or does not match the expected schema.
    #[error("Failed to parse config TOML: {source}")]
    ConfigParse {
        #[from]
        source: toml::de::Error,
    },

    /// JSON parse failure for legacy `settings.json` style config files.
    #[error("Failed to parse config JSON: {source}")]
    ConfigJson {
        #[from]
        source: serde_json::Error,
    },

    /// Semantic validation failure -- the config parsed successfully but
    /// contains invalid values (e.g., negative payload size, no topics).
    #[error("Config validation error: {message}")]
    ConfigValidation { message: String },

    /// File I/O failure -- the config file could not be read from disk.
    #[error("Failed to read config file '{path}': {source}")]
    ConfigIo {
        source: std::io::Error,
        path: String,
    },
}

impl LoadTestError {
    /// Shorthand for a [`LoadTestError::ConfigValidation`] error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }
}

/// Failures a single simulated client can run into.
///
/// None of these stop the run. Each is logged, counted under its
/// [`error_category`](ClientError::error_category) and the client carries on
/// in whatever degraded mode still makes sense.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// No connect acknowledgment arrived within the connect timeout.
    #[error("Connect acknowledgment not received within {timeout_ms}ms")]
    ConnectionTimeout { timeout_ms: u64 },

    /// The broker answered the connect request with a refusal code.
    #[error("Connection rejected: {reason} (code {code})")]
    ConnectionRejected { code: u8, reason: String },

    /// Not every subscription was acknowledged within the subscribe timeout.
    #[error("Only {acked}/{expected} subscriptions acknowledged within {timeout_ms}ms")]
    SubscribeTimeout {
        acked: usize,
        expected: usize,
        timeout_ms: u64,
    },

    /// A subscribe request could not be handed to the transport.
    #[error("Subscribe to '{topic}' failed: {message}")]
    Subscribe { topic: String, message: String },

    /// A publish could not be handed to the transport.
    #[error("Publish to '{topic}' failed: {message}")]
    Publish { topic: String, message: String },

    /// The disconnect request failed. Logged and ignored.
    #[error("Disconnect failed: {message}")]
    Disconnect { message: String },

    /// The connection failed outside any single request: the connector
    /// could not open a session, or an established session was lost.
    #[error("Transport error: {message}")]
    Transport { message: String },
}

impl ClientError {
    /// Returns the error category as a static string for metrics classification.
    ///
    /// Categories: `"connect_timeout"`, `"connect_rejected"`,
    /// `"subscribe_timeout"`, `"subscribe"`, `"publish"`, `"disconnect"`,
    /// `"transport"`.
    pub fn error_category(&self) -> &'static str {
        match self {
            Self::ConnectionTimeout { .. } => "connect_timeout",
            Self::ConnectionRejected { .. } => "connect_rejected",
            Self::SubscribeTimeout { .. } => "subscribe_timeout",
            Self::Subscribe { .. } => "subscribe",
            Self::Publish { .. } => "publish",
            Self::Disconnect { .. } => "disconnect",
            Self::Transport { .. } => "transport",
        }
    }
}
