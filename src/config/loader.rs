//! Top-level config loading pipeline.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::types::{BackendKind, InteractionMode};

use super::defaults::default_storage_root;
use super::env::apply_env_overrides;
use super::sources::read_config_text_with_sources;
use super::types::FileConfig;
use super::{config_root_dir, data_root_dir, Config, LoadedConfig};

/// Load configuration from disk and environment.
///
/// `path_override` is an explicit config file path (from `--config`).
pub fn load_config(path_override: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    load_config_from_sources(
        path_override,
        |path| std::fs::read_to_string(path),
        |name| std::env::var(name).ok(),
        config_root_dir,
        data_root_dir,
    )
}

pub(super) fn load_config_from_sources<FRead, FEnv, FRoot, FData>(
    path_override: Option<&Path>,
    read_file: FRead,
    env_lookup: FEnv,
    config_root: FRoot,
    data_root: FData,
) -> Result<LoadedConfig, ConfigError>
where
    FRead: Fn(&Path) -> Result<String, std::io::Error>,
    FEnv: Fn(&str) -> Option<String>,
    FRoot: Fn() -> Option<PathBuf>,
    FData: Fn() -> Option<PathBuf>,
{
    let (text, source) = read_config_text_with_sources(path_override, &read_file, &config_root)?;
    let parsed: FileConfig = toml::from_str(&text)?;
    let mut config = resolve(parsed, data_root)?;
    apply_env_overrides(&mut config, &env_lookup)?;
    Ok(LoadedConfig {
        config,
        source_path: source.path().map(Path::to_path_buf),
    })
}

fn resolve<FData>(file: FileConfig, data_root: FData) -> Result<Config, ConfigError>
where
    FData: Fn() -> Option<PathBuf>,
{
    let mut config = Config::default();
    config.storage.root = match file.storage.root {
        Some(root) => root,
        None => default_storage_root(data_root()),
    };
    if let Some(limit) = file.timeline.cache_limit {
        if limit == 0 {
            return Err(ConfigError::Invalid(
                "timeline.cache_limit must be at least 1".into(),
            ));
        }
        config.timeline.cache_limit = limit;
    }
    if let Some(name) = file.session.backend {
        config.session.backend = BackendKind::parse(&name).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "unknown session.backend `{name}` (expected `claude-code` or `opencode`)"
            ))
        })?;
    }
    if let Some(name) = file.session.mode {
        config.session.mode = InteractionMode::parse(&name).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown session.mode `{name}`"))
        })?;
    }
    config.session.model = file
        .session
        .model
        .map(|model| model.trim().to_string())
        .filter(|model| !model.is_empty());
    if let Some(filter) = file.logging.filter {
        config.logging.filter = filter;
    }
    Ok(config)
}
