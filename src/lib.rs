//! # mqtt-loadtest
//!
//! Concurrent MQTT load generator. Each simulated client connects with its
//! own credentials, subscribes, publishes uniquely tagged payloads and keeps
//! listening for a drain window; afterwards every send is matched against
//! every receive to report lost messages, delivery latency and throughput.
//!
//! ```no_run
//! use std::sync::Arc;
//! use mqtt_loadtest::loadtest::config::LoadTestConfig;
//! use mqtt_loadtest::loadtest::engine::LoadRunner;
//! use mqtt_loadtest::loadtest::transport::MqttConnector;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = LoadTestConfig::from_toml("[settings]\nnum_users = 10\n")?;
//! let connector = Arc::new(MqttConnector::new(&config.broker, config.settings.payload_len()));
//! let result = LoadRunner::new(config, connector).run().await?;
//! println!("lost {} of {}", result.summary.lost, result.summary.total_sent);
//! # Ok(())
//! # }
//! ```

pub mod loadtest;
