//! Error types for the sandbox runtime
//!
//! None of these reach the caller of [`CodeSandbox::submit`](crate::CodeSandbox::submit)
//! except [`CapacityError`]; everything else is folded into a well-formed
//! [`ExecutionResult`](super::ExecutionResult) by the aggregator.

use std::time::Duration;
use thiserror::Error;

use super::SubmissionId;

pub use crate::config::ConfigError;

/// Main runtime error type
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Analyzer error: {0}")]
    Analyzer(#[from] analyzer::AnalyzerError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

/// Dataset construction errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DatasetError {
    #[error("Row {row} has {found} cells, expected {expected}")]
    RaggedRow {
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("Duplicate column name: {0}")]
    DuplicateColumn(String),

    #[error("Failed to parse dataset: {0}")]
    Parse(String),

    #[error("Failed to read dataset: {0}")]
    Io(String),
}

/// Infrastructure failures while preparing or supervising a run unit
#[derive(Error, Debug, Clone)]
pub enum SandboxError {
    #[error("Invalid sandbox configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to spawn interpreter '{interpreter}': {reason}")]
    SpawnFailed { interpreter: String, reason: String },

    #[error("Failed to prepare working directory: {0}")]
    WorkingDirectory(String),

    #[error("Failed to encode run payload: {0}")]
    Payload(String),

    #[error("I/O error while supervising run unit: {0}")]
    Io(String),
}

/// Errors turning the harness envelope into artifacts
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("Run unit produced no result envelope")]
    MissingEnvelope,

    #[error("Malformed result envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Figure {index} is not a valid PNG image: {reason}")]
    InvalidFigure { index: usize, reason: String },

    #[error("Figure {index} is {bytes} bytes, limit is {max}")]
    FigureTooLarge {
        index: usize,
        bytes: usize,
        max: usize,
    },
}

/// Explicit rejection when no run unit slot is available
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CapacityError {
    #[error("All {max_concurrent} run units are busy")]
    AtCapacity { max_concurrent: usize },

    #[error("No run unit became available within {waited:?}")]
    QueueTimeout { waited: Duration },

    #[error("Sandbox is shutting down")]
    ShuttingDown,

    #[error("Submission {submission_id} is already in flight")]
    AlreadyInFlight { submission_id: SubmissionId },
}

/// Submission lifecycle errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },
}
