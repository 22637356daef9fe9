//! Build metadata surfaced by `agentdeck --version` and the startup log line.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub const GIT_COMMIT: &str = env!("AGENTDECK_BUILD_GIT_HASH");

pub const BUILD_TIMESTAMP: &str = env!("AGENTDECK_BUILD_TIMESTAMP");

/// Multi-line version block for clap's `--version`.
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\ncommit: ",
    env!("AGENTDECK_BUILD_GIT_HASH"),
    "\nbuilt: ",
    env!("AGENTDECK_BUILD_TIMESTAMP")
);

/// One-line form for log fields.
pub fn short_version() -> String {
    format!("{VERSION}+{GIT_COMMIT}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_version_lists_commit_and_build_time() {
        assert!(LONG_VERSION.starts_with(VERSION));
        assert!(LONG_VERSION.contains(&format!("commit: {GIT_COMMIT}")));
        assert!(LONG_VERSION.contains(&format!("built: {BUILD_TIMESTAMP}")));
        assert!(short_version().ends_with(GIT_COMMIT));
    }
}
