//! Error taxonomy for server definitions, Caddyfiles and supervised processes

use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the library
#[derive(Debug, Error)]
pub enum ServeError {
    /// The definition cannot be written or launched as given
    #[error("Invalid server definition: {0}")]
    InvalidDefinition(String),

    /// A Caddyfile exists but does not follow the grammar
    #[error("Caddyfile parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Filesystem failure
    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Id collision on create/move
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The server binary could not be started
    #[error("Failed to launch server '{id}': {reason}")]
    Launch { id: String, reason: String },

    /// A `host:port` label is not well formed
    #[error("Malformed label '{label}': {reason}")]
    MalformedLabel { label: String, reason: String },

    /// The process is still alive after the forceful termination window
    #[error("Failed to stop server '{id}': {reason}")]
    StopFailed { id: String, reason: String },

    /// No server is configured under this id
    #[error("Unknown server: {0}")]
    UnknownServer(String),

    /// Application configuration is invalid
    #[error("Configuration error: {0}")]
    Config(String),
}

impl ServeError {
    /// Wrap an IO error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    pub(crate) fn launch(id: &str, reason: impl Into<String>) -> Self {
        Self::Launch {
            id: id.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether this error is a missing-file IO error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, ServeError>;
