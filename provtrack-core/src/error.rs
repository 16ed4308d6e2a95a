//! Error types for the Provtrack core library.
//!
//! Uses `thiserror` for public API error types, one enum per concern:
//! event validation, graph recording, writer sinks, snapshot stores and
//! configuration. [`ProvtrackError`] wraps all of them for callers that do
//! not care which layer failed.

use std::path::PathBuf;

use crate::event::NodeId;

/// Top-level error type for the Provtrack core library.
#[derive(Debug, thiserror::Error)]
pub enum ProvtrackError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Tracking error: {0}")]
    Track(#[from] TrackError),

    #[error("Write error: {0}")]
    Write(#[from] WriteError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A node event or one of its parts is malformed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("operation name is empty")]
    EmptyOperation,

    #[error("operation name '{operation}' contains control characters")]
    InvalidOperation { operation: String },

    #[error("parameter name is empty in operation '{operation}'")]
    EmptyParamName { operation: String },

    #[error("parameter '{name}' summary has no type name")]
    EmptySummary { name: String },

    #[error("shape has no dimensions")]
    EmptyShape,
}

/// Errors from the graph assembler (tracker).
#[derive(Debug, thiserror::Error)]
pub enum TrackError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("tracker is not started")]
    NotStarted,

    #[error("node {id} does not exist in the current run")]
    UnknownNode { id: NodeId },

    #[error("edge {from} -> {to} would close a cycle")]
    Cycle { from: NodeId, to: NodeId },

    #[error("run cannot be stopped with non-terminal status '{status}'")]
    InvalidStatus { status: String },

    #[error("writer '{writer}' failed: {source}")]
    Write {
        writer: String,
        #[source]
        source: WriteError,
    },
}

/// Sink-level failures reported by a [`Writer`](crate::writer::Writer).
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("sequence version {sequence_version} of run {run_uid} is already committed")]
    VersionConflict {
        run_uid: String,
        sequence_version: u64,
    },

    #[error("Sink error: {message}")]
    Sink { message: String },
}

/// Errors from a snapshot store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("run not found: {run_uid}")]
    RunNotFound { run_uid: String },

    #[error("run {run_uid} is closed")]
    RunClosed { run_uid: String },

    #[error("snapshot {sequence_version} of run {run_uid} already exists")]
    Conflict {
        run_uid: String,
        sequence_version: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Backend error: {message}")]
    Backend { message: String },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Configuration parse error: {message}")]
    ParseError { message: String },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        ConfigError::ParseError {
            message: err.to_string(),
        }
    }
}

/// Convenience type alias for Provtrack results.
pub type Result<T> = std::result::Result<T, ProvtrackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrackError::UnknownNode { id: NodeId(7) };
        assert_eq!(err.to_string(), "node 7 does not exist in the current run");

        let err = TrackError::Cycle {
            from: NodeId(3),
            to: NodeId(1),
        };
        assert_eq!(err.to_string(), "edge 3 -> 1 would close a cycle");
    }

    #[test]
    fn test_error_conversion() {
        let err: TrackError = ValidationError::EmptyOperation.into();
        assert!(matches!(
            err,
            TrackError::Validation(ValidationError::EmptyOperation)
        ));

        let err: ProvtrackError = TrackError::NotStarted.into();
        assert!(matches!(err, ProvtrackError::Track(TrackError::NotStarted)));
    }

    #[test]
    fn test_store_error_into_write_error() {
        let err: WriteError = StoreError::RunClosed {
            run_uid: "run-1".into(),
        }
        .into();
        assert!(err.to_string().contains("run run-1 is closed"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: StoreError = io_err.into();
        assert!(matches!(err, StoreError::Io(_)));
    }
}
