//! Config-file source discovery.
//!
//! Source order: explicit path > local file > global file > built-in defaults.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::defaults::{APP_DIR_NAME, CONFIG_FILE_NAME};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum ConfigSource {
    /// `--config <path>`.
    Explicit(PathBuf),
    /// `./agentdeck.toml`.
    Local(PathBuf),
    /// `$XDG_CONFIG_HOME/agentdeck/agentdeck.toml`.
    Global(PathBuf),
    BuiltInDefaults,
}

impl ConfigSource {
    pub(super) fn path(&self) -> Option<&Path> {
        match self {
            Self::Explicit(path) | Self::Local(path) | Self::Global(path) => Some(path),
            Self::BuiltInDefaults => None,
        }
    }
}

/// Read config text from the highest-precedence available source.
///
/// An explicit path must exist; the implicit locations are optional.
pub(super) fn read_config_text_with_sources<FRead, FRoot>(
    path_override: Option<&Path>,
    read_file: &FRead,
    config_root: &FRoot,
) -> Result<(String, ConfigSource), ConfigError>
where
    FRead: Fn(&Path) -> Result<String, std::io::Error>,
    FRoot: Fn() -> Option<PathBuf>,
{
    if let Some(path) = path_override {
        let text = read_file(path)?;
        return Ok((text, ConfigSource::Explicit(path.to_path_buf())));
    }

    let local = PathBuf::from(CONFIG_FILE_NAME);
    if let Ok(text) = read_file(&local) {
        return Ok((text, ConfigSource::Local(local)));
    }

    if let Some(dir) = config_root() {
        let global = dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME);
        if let Ok(text) = read_file(&global) {
            return Ok((text, ConfigSource::Global(global)));
        }
    }

    Ok((String::new(), ConfigSource::BuiltInDefaults))
}
