//! Configuration loading from TOML files and environment variables.
//!
//! Config is loaded in this order of precedence (highest wins):
//! 1. Environment variables (`AGENTDECK_STORAGE_ROOT`, `AGENTDECK_CACHE_LIMIT`,
//!    `AGENTDECK_LOG`)
//! 2. TOML file given via `--config`
//! 3. `./agentdeck.toml` in the current directory
//! 4. `$XDG_CONFIG_HOME/agentdeck/agentdeck.toml` (or `~/.config/...`)
//! 5. Built-in defaults
//!
//! `RUST_LOG`, when set, still wins over `logging.filter`; the binary applies
//! that rule when it installs the subscriber.

use std::path::PathBuf;

mod defaults;
mod env;
mod loader;
mod sources;
mod types;

pub use loader::load_config;
pub use types::{Config, LoadedConfig, LoggingConfig, SessionConfig, StorageConfig, TimelineConfig};

/// Resolve the global config root (`$XDG_CONFIG_HOME`, then `~/.config`).
pub fn config_root_dir() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("XDG_CONFIG_HOME") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".config"))
        .or_else(dirs::config_dir)
}

/// Platform data directory used for the default storage root.
pub fn data_root_dir() -> Option<PathBuf> {
    dirs::data_dir()
}
