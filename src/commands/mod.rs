//! CLI subcommands.
//!
//! Provides `run` (execute a load test) and `init` (generate starter config).

mod init;
mod run;

use anyhow::Result;
use clap::Subcommand;
use std::path::PathBuf;

pub use run::RunArgs;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a load test against a broker
    ///
    /// Reads ./loadtest.toml or ./settings.json when no --config is given,
    /// falling back to built-in defaults. Prints a summary and writes a JSON
    /// report to --report-dir.
    Run(RunArgs),

    /// Generate a starter loadtest.toml
    Init {
        /// Where to write the config
        #[arg(long, default_value = "loadtest.toml")]
        path: PathBuf,

        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
}

impl Command {
    /// Execute the selected subcommand.
    pub fn execute(self) -> Result<()> {
        match self {
            Command::Run(args) => {
                let runtime = tokio::runtime::Runtime::new()?;
                runtime.block_on(run::execute_run(args))
            },
            Command::Init { path, force } => init::execute_init(&path, force),
        }
    }
}
