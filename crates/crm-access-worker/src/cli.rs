use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "crm-access-worker", version)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the outbox dispatcher until interrupted.
    Serve,
    /// Create raw, cache and outbox tables and the notify trigger.
    Migrate,
    /// Rebuild every effective cache from the raw tables.
    Resync,
}
