//! Default configuration constants.

use std::path::PathBuf;

/// Config file name looked up locally and under the global config root.
pub(super) const CONFIG_FILE_NAME: &str = "agentdeck.toml";
/// Directory name under the platform config/data roots.
pub(super) const APP_DIR_NAME: &str = "agentdeck";
/// Task timelines kept in memory before least-recently-used eviction.
pub(super) const DEFAULT_CACHE_LIMIT: usize = 20;
/// Tracing filter used when neither the environment nor the file sets one.
pub(super) const DEFAULT_LOG_FILTER: &str = "info";
/// Storage root used when no platform data directory can be resolved.
pub(super) const FALLBACK_STORAGE_DIR: &str = ".agentdeck";

/// Default storage root under the given platform data directory.
pub(super) fn default_storage_root(data_root: Option<PathBuf>) -> PathBuf {
    data_root
        .map(|dir| dir.join(APP_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from(FALLBACK_STORAGE_DIR))
}
