use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::types::{LogLevel, SourceKind};

#[derive(Parser, Debug)]
#[command(
    name = "kb-ingest",
    version,
    about = "Mirror new Google Drive and Slack files into a local knowledge base"
)]
pub struct Cli {
    /// JSON configuration file
    #[arg(long, global = true, env = "KB_INGEST_CONFIG", default_value = "config.json")]
    pub config: PathBuf,

    /// Log level (RUST_LOG overrides)
    #[arg(long, global = true, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    #[command(flatten)]
    pub run: RunArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Poll the configured sources (the default)
    Run,

    /// Show per-source counts, watermarks and the last poll cycle
    Status,

    /// Check that every recorded file is still on disk
    Verify(VerifyArgs),

    /// Delete the state database; everything is fetched again next run
    ResetState(ResetStateArgs),

    /// Forget skip decisions so skipped items are evaluated again
    ResetSkipped(ResetSkippedArgs),
}

/// Flags that override the config file for `run`.
#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Seconds between poll cycles
    #[arg(long)]
    pub poll_interval: Option<u64>,

    /// Run a single cycle per source and exit
    #[arg(long)]
    pub once: bool,

    /// Only poll this source (repeatable)
    #[arg(long = "source", value_enum)]
    pub sources: Vec<SourceKind>,

    /// List and log what would be fetched without writing anything
    #[arg(long)]
    pub dry_run: bool,

    /// Concurrent fetches per source (1-4)
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Disable progress bars
    #[arg(long)]
    pub no_progress_bar: bool,
}

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    /// Also recompute SHA-256 checksums
    #[arg(long)]
    pub checksums: bool,

    /// Forget records whose file is missing or corrupt so they are fetched again
    #[arg(long)]
    pub repair: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ResetStateArgs {
    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

#[derive(Args, Debug, Clone)]
pub struct ResetSkippedArgs {
    /// Only this source (default: all)
    #[arg(long, value_enum)]
    pub source: Option<SourceKind>,
}

impl Cli {
    pub fn effective_command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}
