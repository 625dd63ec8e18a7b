//! Error types
//!
//! A single error enum for the lifecycle calls (start/configure/stop) plus
//! the snapshot-store error, which keeps "file not there yet" distinct from
//! "file there but unreadable".

use std::path::PathBuf;
use thiserror::Error;

/// Tapedeck error type
#[derive(Debug, Error)]
pub enum Error {
    /// No local port could be bound
    #[error("Failed to bind proxy listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Bad snapshot path, working directory or mode combination
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An existing snapshot file could not be parsed
    #[error("Corrupt snapshot {}: {reason}", path.display())]
    CorruptSnapshot { path: PathBuf, reason: String },

    /// A live request did not match the next recorded exchange
    #[error(
        "No recorded exchange matches {observed} ({remaining} exchange(s) remaining; next expected: {})",
        expected.as_deref().unwrap_or("<none>")
    )]
    NoMatch {
        observed: String,
        expected: Option<String>,
        remaining: usize,
    },

    /// Forwarding to the real upstream failed
    #[error("Upstream request to {url} failed: {reason}")]
    UpstreamForward { url: String, reason: String },

    /// Lifecycle call made in the wrong state
    #[error("Proxy is not running")]
    NotRunning,

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Short machine-readable name used in HTTP error bodies
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Bind { .. } => "bind_error",
            Error::Configuration(_) => "configuration_error",
            Error::CorruptSnapshot { .. } => "corrupt_snapshot",
            Error::NoMatch { .. } => "no_match",
            Error::UpstreamForward { .. } => "upstream_forward_error",
            Error::NotRunning => "not_running",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<SnapshotError> for Error {
    fn from(err: SnapshotError) -> Self {
        match err {
            SnapshotError::NotFound(path) => {
                Self::Configuration(format!("No snapshot at {}", path.display()))
            }
            SnapshotError::Corrupt { path, reason } => Self::CorruptSnapshot { path, reason },
            SnapshotError::Io(e) => Self::Io(e),
            SnapshotError::Serialization(msg) => Self::Serialization(msg),
        }
    }
}

/// Snapshot store errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The file does not exist; selects record mode
    #[error("Snapshot not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The file exists but cannot be parsed
    #[error("Corrupt snapshot {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, Error>;
