//! CLI argument parsing via clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Inspect and maintain agentdeck task storage.
#[derive(Debug, Parser)]
#[command(name = "agentdeck", version, long_version = crate::build_info::LONG_VERSION)]
pub struct Args {
    /// Path to config file (default: ./agentdeck.toml or ~/.config/agentdeck/agentdeck.toml).
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Override the storage root.
    #[arg(long = "storage-root", global = true)]
    pub storage_root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List tasks with their status and unread count.
    Tasks,
    /// Print a task's timeline grouped for display.
    Timeline {
        task_id: String,
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
        /// Advance the read watermark to the newest entry afterwards.
        #[arg(long = "mark-read")]
        mark_read: bool,
    },
    /// Mark tasks left running by a previous process as interrupted.
    Recover,
    /// Rebuild normalized entries from raw records.
    Renormalize {
        /// Task to rebuild; every task when omitted.
        task_id: Option<String>,
        /// Rebuild even when entries already carry the current version.
        #[arg(long)]
        force: bool,
    },
    /// Advance a task's read watermark to its newest entry.
    MarkRead { task_id: String },
}
