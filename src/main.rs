//! CLI entry point for agentdeck.

mod build_info;
mod cli;
mod commands;

use agentdeck::config::{load_config, Config};
use agentdeck::error::SessionError;
use agentdeck::storage::FileStore;
use clap::Parser;
use cli::{Args, Command};
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

fn main() {
    let args = Args::parse();

    let loaded = match load_config(args.config.as_deref()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };
    let mut config = loaded.config;
    if let Some(root) = args.storage_root.clone() {
        config.storage.root = root;
    }
    init_tracing(&config.logging.filter);
    debug!(
        version = %build_info::short_version(),
        config = ?loaded.source_path,
        storage_root = %config.storage.root.display(),
        "agentdeck starting"
    );

    match run(&config, args.command) {
        Ok(output) => print!("{output}"),
        Err(e) => {
            error!(error = %e, "command failed");
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}

/// `RUST_LOG` wins; otherwise the resolved config filter applies.
fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run(config: &Config, command: Command) -> Result<String, SessionError> {
    let store = FileStore::open(&config.storage.root)?;
    match command {
        Command::Tasks => commands::list_tasks(&store, config.timeline.cache_limit),
        Command::Timeline {
            task_id,
            json,
            mark_read,
        } => commands::show_timeline(&store, &task_id, json, mark_read),
        Command::Recover => commands::recover(&store),
        Command::Renormalize { task_id, force } => {
            commands::renormalize(&store, task_id.as_deref(), force)
        }
        Command::MarkRead { task_id } => commands::mark_task_read(&store, &task_id),
    }
}
