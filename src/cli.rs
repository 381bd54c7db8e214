use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "govwatch")]
#[command(version)]
#[command(about = "Watches governance proposals and executes approved ones exactly once", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Directory holding default.toml and environment overrides
    #[arg(long, global = true, default_value = "config", env = "GOVWATCH_CONFIG_DIR")]
    pub config_dir: PathBuf,
}

impl Cli {
    /// `run` when no subcommand is given
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the long-running agent (default)
    Run,
    /// Run a single sweep, print the report and exit
    Sweep,
    /// Print the execution ledger
    Status,
    /// Load and validate configuration, print a redacted summary
    CheckConfig,
}
