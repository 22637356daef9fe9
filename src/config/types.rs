//! Configuration data model.
//!
//! `FileConfig` mirrors the TOML layout with every field optional; `Config`
//! is the resolved form the rest of the crate consumes.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::{BackendKind, InteractionMode};

use super::defaults::{DEFAULT_CACHE_LIMIT, DEFAULT_LOG_FILTER, FALLBACK_STORAGE_DIR};

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub storage: StorageConfig,
    pub timeline: TimelineConfig,
    pub session: SessionConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                root: PathBuf::from(FALLBACK_STORAGE_DIR),
            },
            timeline: TimelineConfig::default(),
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Where raw records, entries and task records live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageConfig {
    pub root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineConfig {
    /// Loaded task timelines before eviction starts.
    pub cache_limit: usize,
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            cache_limit: DEFAULT_CACHE_LIMIT,
        }
    }
}

/// Defaults for new sessions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionConfig {
    pub backend: BackendKind,
    pub mode: InteractionMode,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `tracing-subscriber` filter directive, e.g. `info,agentdeck=debug`.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

/// Resolved config plus where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedConfig {
    pub config: Config,
    /// File the config was read from; `None` when built-in defaults applied.
    pub source_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// File shape
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub(super) struct FileConfig {
    #[serde(default)]
    pub storage: FileStorageConfig,
    #[serde(default)]
    pub timeline: FileTimelineConfig,
    #[serde(default)]
    pub session: FileSessionConfig,
    #[serde(default)]
    pub logging: FileLoggingConfig,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub(super) struct FileStorageConfig {
    pub root: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub(super) struct FileTimelineConfig {
    pub cache_limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub(super) struct FileSessionConfig {
    pub backend: Option<String>,
    pub mode: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub(super) struct FileLoggingConfig {
    pub filter: Option<String>,
}
