//! Broker address overrides from the process environment.
//!
//! These tests mutate process-wide environment variables and therefore run
//! serially.

use serial_test::serial;

use mqtt_loadtest::loadtest::config::{LoadTestConfig, BROKER_HOST_ENV, BROKER_PORT_ENV};
use mqtt_loadtest::loadtest::error::LoadTestError;

fn clear() {
    std::env::remove_var(BROKER_HOST_ENV);
    std::env::remove_var(BROKER_PORT_ENV);
}

#[test]
#[serial]
fn env_overrides_replace_broker_address() {
    clear();
    std::env::set_var(BROKER_HOST_ENV, "broker.test");
    std::env::set_var(BROKER_PORT_ENV, "1884");

    let mut config = LoadTestConfig::from_toml("[broker]\nhost = \"from-file\"\n").unwrap();
    config.apply_env_overrides().unwrap();
    clear();

    assert_eq!(config.broker.host, "broker.test");
    assert_eq!(config.broker.port, 1884);
}

#[test]
#[serial]
fn absent_env_keeps_file_values() {
    clear();
    let mut config = LoadTestConfig::from_toml("[broker]\nhost = \"from-file\"\nport = 8883\n").unwrap();
    config.apply_env_overrides().unwrap();

    assert_eq!(config.broker.host, "from-file");
    assert_eq!(config.broker.port, 8883);
}

#[test]
#[serial]
fn invalid_port_is_a_configuration_error() {
    clear();
    std::env::set_var(BROKER_PORT_ENV, "not-a-port");

    let mut config = LoadTestConfig::default();
    let result = config.apply_env_overrides();
    clear();

    assert!(matches!(result, Err(LoadTestError::ConfigValidation { .. })));
}
