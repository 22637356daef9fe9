//! Error taxonomy for the session layer.
//!
//! Errors are grouped by the boundary that produces them: configuration,
//! persistence, permission brokering, backend adapters, and the orchestrator
//! command surface that wraps all of them.

use std::fmt;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors when loading or parsing configuration.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Toml(toml::de::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Toml(e) => write!(f, "toml: {e}"),
            Self::Invalid(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        Self::Toml(e)
    }
}

// ---------------------------------------------------------------------------
// StorageError
// ---------------------------------------------------------------------------

/// Errors from the persistence collaborator.
#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    Json(serde_json::Error),
    /// A raw record arrived with an index that does not advance the task's sequence.
    OutOfOrder {
        task_id: String,
        expected_min: u64,
        got: u64,
    },
    /// A record file exists but its content is unusable.
    Corrupt(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::Json(e) => write!(f, "json: {e}"),
            Self::OutOfOrder {
                task_id,
                expected_min,
                got,
            } => write!(
                f,
                "message index {got} for task {task_id} is out of order (expected >= {expected_min})"
            ),
            Self::Corrupt(msg) => write!(f, "corrupt store: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

// ---------------------------------------------------------------------------
// BrokerError
// ---------------------------------------------------------------------------

/// Errors from the permission/question broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// No live broker slot exists for this session.
    UnknownSession(String),
    /// The request was never issued, already answered, or denied by a stop.
    UnknownRequest {
        session_id: String,
        request_id: String,
    },
    /// A question response was sent to a permission request or vice versa.
    KindMismatch { request_id: String },
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownSession(id) => write!(f, "unknown session `{id}`"),
            Self::UnknownRequest {
                session_id,
                request_id,
            } => write!(
                f,
                "unknown request `{request_id}` for session `{session_id}`"
            ),
            Self::KindMismatch { request_id } => {
                write!(f, "request `{request_id}` has a different kind")
            }
        }
    }
}

impl std::error::Error for BrokerError {}

// ---------------------------------------------------------------------------
// BackendError
// ---------------------------------------------------------------------------

/// Errors raised by backend adapters and the runtimes behind them.
#[derive(Debug)]
pub enum BackendError {
    /// Resume was requested for a runtime session the runtime does not know.
    ResumeNotFound { session_id: String },
    /// The adapter has no live session with this id.
    UnknownSession(String),
    /// The runtime (or its hosting process) could not be reached or started.
    Unavailable(String),
    /// The runtime reported a failure for a request.
    Runtime(String),
    Broker(BrokerError),
    /// The adapter was disposed and no longer accepts work.
    Disposed,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResumeNotFound { session_id } => {
                write!(f, "cannot resume session `{session_id}`: not found")
            }
            Self::UnknownSession(id) => write!(f, "unknown backend session `{id}`"),
            Self::Unavailable(msg) => write!(f, "runtime unavailable: {msg}"),
            Self::Runtime(msg) => write!(f, "runtime error: {msg}"),
            Self::Broker(e) => write!(f, "broker: {e}"),
            Self::Disposed => write!(f, "backend has been disposed"),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<BrokerError> for BackendError {
    fn from(e: BrokerError) -> Self {
        Self::Broker(e)
    }
}

// ---------------------------------------------------------------------------
// SessionError (top level)
// ---------------------------------------------------------------------------

/// Errors returned by orchestrator commands.
#[derive(Debug)]
pub enum SessionError {
    Backend(BackendError),
    Storage(StorageError),
    /// The task already has a live session.
    AlreadyRunning(String),
    /// The task has no live session.
    NotRunning(String),
    /// No adapter is registered for the requested backend.
    BackendNotRegistered(String),
    /// Resume was requested but the task has no recorded runtime session.
    NothingToResume(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "backend: {e}"),
            Self::Storage(e) => write!(f, "storage: {e}"),
            Self::AlreadyRunning(task) => write!(f, "task {task} already has a running session"),
            Self::NotRunning(task) => write!(f, "task {task} has no running session"),
            Self::BackendNotRegistered(kind) => write!(f, "no backend registered for `{kind}`"),
            Self::NothingToResume(task) => write!(f, "task {task} has no session to resume"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<BackendError> for SessionError {
    fn from(e: BackendError) -> Self {
        Self::Backend(e)
    }
}

impl From<StorageError> for SessionError {
    fn from(e: StorageError) -> Self {
        Self::Storage(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let e = ConfigError::from(io_err);
        let s = e.to_string();
        assert!(s.starts_with("io:"), "got: {s}");
        assert!(s.contains("file not found"));
    }

    #[test]
    fn config_error_from_toml() {
        let toml_err: toml::de::Error = toml::from_str::<toml::Value>("x = [unclosed").unwrap_err();
        let e = ConfigError::from(toml_err);
        assert!(e.to_string().starts_with("toml:"));
    }

    #[test]
    fn resume_not_found_names_the_session() {
        let e = BackendError::ResumeNotFound {
            session_id: "ses_missing".into(),
        };
        assert_eq!(e.to_string(), "cannot resume session `ses_missing`: not found");
    }

    #[test]
    fn storage_out_of_order_display() {
        let e = StorageError::OutOfOrder {
            task_id: "t1".into(),
            expected_min: 4,
            got: 2,
        };
        assert_eq!(
            e.to_string(),
            "message index 2 for task t1 is out of order (expected >= 4)"
        );
    }

    #[test]
    fn session_error_wraps_backend_error() {
        let e = SessionError::from(BackendError::from(BrokerError::UnknownRequest {
            session_id: "s".into(),
            request_id: "r".into(),
        }));
        let s = e.to_string();
        assert!(s.starts_with("backend: broker:"), "got: {s}");
        assert!(s.contains("`r`"));
    }
}
