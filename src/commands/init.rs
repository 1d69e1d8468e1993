//! `mqtt-loadtest init` command implementation.

use anyhow::Result;
use std::path::Path;

/// Write a commented starter config to `path`.
pub fn execute_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists: {}\n\
             Use `--force` to overwrite.",
            path.display()
        );
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, default_template())?;
    eprintln!("Created {}", path.display());
    eprintln!("Edit the file, then run `mqtt-loadtest run --config {}`.", path.display());
    Ok(())
}

/// Starter config spelling out every default.
fn default_template() -> &'static str {
    r#"# mqtt-loadtest configuration

[settings]
# Simulated clients, each with credentials user{i} / pass{i}
num_users = 50
# Messages each client publishes
messages_per_user = 20
# Filler bytes appended to every payload
payload_size = 1024
# Seconds each client stays connected after its last publish
timeout_secs = 15
# Phase timeouts; a client carries on when they expire
connect_timeout_ms = 5000
subscribe_timeout_ms = 5000
# Pause between subscribing and the first publish
settle_ms = 50
# Random pause between publishes
min_delay_ms = 10
max_delay_ms = 100
keep_alive_secs = 60

[broker]
# TEST_BROKER_HOST / TEST_BROKER_PORT override these
host = "mosquitto-auth"
port = 9001
# "tcp" or "websocket"
transport = "websocket"
ws_path = "/mqtt"

[topics]
prefix = "load/topic"
# "shared": everyone subscribes to {prefix}0..{prefix}{count-1}
# "own": each client uses {prefix}/user{i}
layout = "shared"
count = 5
"#
}
