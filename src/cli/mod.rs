//! CLI entry point for Outflow.

pub mod replay;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Outflow CLI
#[derive(Parser, Debug)]
#[command(name = "outflow", version, about = "Replay and inspect model-output streams")]
pub struct Cli {
    /// Config file (defaults to the platform config dir's outflow.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay a recorded provider stream through the engine
    Replay(ReplayArgs),
    /// Print the effective configuration as TOML
    Config,
}

/// Arguments for `outflow replay`.
#[derive(Parser, Debug)]
pub struct ReplayArgs {
    /// JSON lines file, one provider payload per line
    pub events: PathBuf,

    /// User prompt recorded as the run's first message
    #[arg(short, long, default_value = "")]
    pub prompt: String,

    /// Regex to redact from the output (repeatable)
    #[arg(long = "redact", value_name = "PATTERN")]
    pub redact: Vec<String>,

    /// Override the step budget
    #[arg(long)]
    pub max_steps: Option<usize>,

    /// Delay between replayed payloads, in milliseconds
    #[arg(long, default_value_t = 0)]
    pub delay_ms: u64,

    /// Print every chunk as a JSON line instead of rendering text
    #[arg(long)]
    pub json: bool,

    /// Write the transcript to this directory
    #[arg(long, value_name = "DIR")]
    pub save: Option<PathBuf>,
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
