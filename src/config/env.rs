//! Environment overrides.
//!
//! `AGENTDECK_*` variables win over every file source.

use std::path::PathBuf;

use crate::error::ConfigError;

use super::Config;

pub(super) const ENV_STORAGE_ROOT: &str = "AGENTDECK_STORAGE_ROOT";
pub(super) const ENV_CACHE_LIMIT: &str = "AGENTDECK_CACHE_LIMIT";
pub(super) const ENV_LOG: &str = "AGENTDECK_LOG";

/// Non-empty, trimmed value of an environment variable.
fn non_empty<FEnv>(env_lookup: &FEnv, name: &str) -> Option<String>
where
    FEnv: Fn(&str) -> Option<String>,
{
    env_lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(super) fn apply_env_overrides<FEnv>(config: &mut Config, env_lookup: &FEnv) -> Result<(), ConfigError>
where
    FEnv: Fn(&str) -> Option<String>,
{
    if let Some(root) = non_empty(env_lookup, ENV_STORAGE_ROOT) {
        config.storage.root = PathBuf::from(root);
    }
    if let Some(limit) = non_empty(env_lookup, ENV_CACHE_LIMIT) {
        let parsed = limit.parse::<usize>().map_err(|_| {
            ConfigError::Invalid(format!(
                "invalid {ENV_CACHE_LIMIT} value `{limit}`: expected a positive integer"
            ))
        })?;
        config.timeline.cache_limit = parsed.max(1);
    }
    if let Some(filter) = non_empty(env_lookup, ENV_LOG) {
        config.logging.filter = filter;
    }
    Ok(())
}
