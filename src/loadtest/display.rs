//! Live terminal progress for a running load test.
//!
//! A single in-place spinner line showing how many of the expected publishes
//! have been attempted, how many clients are still running, and the elapsed
//! time. The line is refreshed on a fixed tick from the shared
//! [`ClientCounters`], never per message.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::IsTerminal;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::loadtest::client::ClientCounters;

/// How often the progress line is redrawn.
const REFRESH_INTERVAL: Duration = Duration::from_millis(250);

pub struct LiveDisplay {
    status_bar: ProgressBar,
}

impl LiveDisplay {
    /// Create a new live display.
    ///
    /// If `no_color` is true or stderr is not a terminal (piped),
    /// color output is disabled.
    pub fn new(no_color: bool) -> Self {
        let is_terminal = std::io::stderr().is_terminal();
        if no_color || !is_terminal {
            colored::control::set_override(false);
        }

        let status_bar = ProgressBar::new_spinner();
        status_bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {wide_msg}")
                .unwrap()
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        status_bar.enable_steady_tick(Duration::from_millis(100));

        Self { status_bar }
    }

    /// Format the progress line.
    ///
    /// Progress is `published / expected`, capped at 100% and shown as 100%
    /// when nothing is expected.
    pub fn format_status(
        published: u64,
        expected: u64,
        active_clients: u32,
        total_clients: u32,
        elapsed: Duration,
    ) -> String {
        let percent = if expected == 0 {
            100.0
        } else {
            (published as f64 / expected as f64 * 100.0).min(100.0)
        };

        let progress = format!("{percent:.1}%");
        let progress = if percent >= 100.0 {
            progress.green().to_string()
        } else {
            progress.cyan().to_string()
        };

        format!(
            "  progress: {}  |  published: {}/{}  |  clients: {}/{}  |  elapsed: {}s",
            progress,
            published,
            expected,
            active_clients.to_string().green(),
            total_clients,
            elapsed.as_secs()
        )
    }

    pub fn update(&self, message: String) {
        self.status_bar.set_message(message);
    }

    /// Stop the display and clear the spinner.
    pub fn finish(&self) {
        self.status_bar.finish_and_clear();
    }
}

/// Redraw progress until `cancel` fires, then draw the final state once.
pub async fn display_loop(
    counters: ClientCounters,
    expected: u64,
    total_clients: u32,
    cancel: CancellationToken,
    no_color: bool,
) {
    let display = LiveDisplay::new(no_color);
    let start = Instant::now();
    let mut ticker = tokio::time::interval(REFRESH_INTERVAL);

    eprintln!();
    eprintln!("  Running load test...");
    eprintln!();

    loop {
        let stop = tokio::select! {
            _ = ticker.tick() => false,
            _ = cancel.cancelled() => true,
        };
        display.update(LiveDisplay::format_status(
            counters.published(),
            expected,
            counters.active.get(),
            total_clients,
            start.elapsed(),
        ));
        if stop {
            break;
        }
    }

    display.finish();
}
