//! `mqtt-loadtest run` command implementation.

use anyhow::{Context, Result};
use clap::Args;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use mqtt_loadtest::loadtest::config::{BrokerTransport, LoadTestConfig};
use mqtt_loadtest::loadtest::engine::LoadRunner;
use mqtt_loadtest::loadtest::memory::MemoryBroker;
use mqtt_loadtest::loadtest::report::{write_report, LoadTestReport};
use mqtt_loadtest::loadtest::summary::render_summary;
use mqtt_loadtest::loadtest::transport::{BrokerConnector, MqttConnector};

/// Config files looked for in the working directory, in order.
const DEFAULT_CONFIG_FILES: [&str; 2] = ["loadtest.toml", "settings.json"];

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Path to a TOML config or a flat settings.json
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of simulated clients (overrides config)
    #[arg(long)]
    pub users: Option<u32>,

    /// Messages per client (overrides config)
    #[arg(long)]
    pub messages: Option<u32>,

    /// Payload filler size in bytes (overrides config)
    #[arg(long, allow_negative_numbers = true)]
    pub payload_size: Option<i64>,

    /// Drain window in seconds (overrides config)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Broker host (overrides config and TEST_BROKER_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Broker port (overrides config and TEST_BROKER_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Run against the built-in in-memory broker instead of a real one
    #[arg(long)]
    pub in_memory: bool,

    /// Disable JSON report output
    #[arg(long)]
    pub no_report: bool,

    /// Directory for JSON reports
    #[arg(long, default_value = "reports")]
    pub report_dir: PathBuf,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,
}

/// Execute the `run` command.
///
/// Loads config, applies environment then CLI overrides, runs the load test
/// and prints the summary. Only configuration errors fail the command.
pub async fn execute_run(args: RunArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    config.apply_env_overrides()?;
    apply_overrides(&mut config, &args);
    config.validate()?;

    let (connector, target): (Arc<dyn BrokerConnector>, String) = if args.in_memory {
        (Arc::new(MemoryBroker::new()), "in-memory".to_string())
    } else {
        (
            Arc::new(MqttConnector::new(
                &config.broker,
                config.settings.payload_len(),
            )),
            broker_target(&config),
        )
    };

    let show_progress = std::io::stderr().is_terminal();
    let runner = LoadRunner::new(config, connector)
        .with_progress(show_progress)
        .with_no_color(args.no_color);
    let result = runner.run().await.context("Load test failed")?;

    if args.no_color || !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }
    println!("{}", render_summary(&result, &target));

    if !args.no_report {
        let report = LoadTestReport::from_result(&result, runner.config(), &target);
        match write_report(&report, &args.report_dir) {
            Ok(path) => {
                eprintln!();
                eprintln!("Report written to: {}", path.display());
            },
            Err(e) => {
                // Non-fatal, the run itself completed.
                warn!(error = %e, dir = %args.report_dir.display(), "failed to write report");
            },
        }
    }

    Ok(())
}

/// Read the explicit config, or the first default file present, or defaults.
///
/// Nothing is validated here: environment and CLI overrides may still fix
/// the file's values, so validation happens once all of them are applied.
fn load_config(path: Option<&Path>) -> Result<LoadTestConfig> {
    let path = match path {
        Some(path) => {
            if !path.exists() {
                anyhow::bail!(
                    "Config file not found: {}\nUse `mqtt-loadtest init` to create one.",
                    path.display()
                );
            }
            Some(path.to_path_buf())
        },
        None => DEFAULT_CONFIG_FILES
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.exists()),
    };

    match path {
        Some(path) => {
            info!(path = %path.display(), "loading config");
            LoadTestConfig::read(&path)
                .with_context(|| format!("Failed to load config '{}'", path.display()))
        },
        None => {
            info!("no config file found, using defaults");
            Ok(LoadTestConfig::default())
        },
    }
}

/// Apply CLI flag overrides to a loaded config.
fn apply_overrides(config: &mut LoadTestConfig, args: &RunArgs) {
    if let Some(users) = args.users {
        config.settings.num_users = users;
    }
    if let Some(messages) = args.messages {
        config.settings.messages_per_user = messages;
    }
    if let Some(size) = args.payload_size {
        config.settings.payload_size = size;
    }
    if let Some(timeout) = args.timeout {
        config.settings.timeout_secs = timeout;
    }
    if let Some(host) = &args.host {
        config.broker.host = host.clone();
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
}

/// Human-readable broker address for the summary and report.
fn broker_target(config: &LoadTestConfig) -> String {
    let broker = &config.broker;
    match broker.transport {
        BrokerTransport::Tcp => format!("tcp://{}:{}", broker.host, broker.port),
        BrokerTransport::Websocket => {
            format!("ws://{}:{}{}", broker.host, broker.port, broker.ws_path)
        },
    }
}
