//! Load generation and measurement engine for MQTT brokers.
//!
//! Spawns many independent simulated clients against a broker, records
//! what each one sent and received, and reconciles the logs into loss,
//! latency and throughput figures once every client has finished.

pub mod auth;
pub mod client;
pub mod config;
pub mod display;
pub mod engine;
pub mod error;
pub mod memory;
pub mod pool;
pub mod reconcile;
pub mod recorder;
pub mod report;
pub mod summary;
pub mod transport;
