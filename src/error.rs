//! Error types for transfer-engine
//!
//! This module provides the error taxonomy used across the engine:
//! - The crate-wide [`Error`] enum and [`Result`] alias
//! - [`ErrorKind`], the serializable classification stored on failed tasks
//! - [`TaskError`], the `last_error` record kept in task snapshots and history
//! - Sub-enums for the database and archive extraction layers

use crate::types::{TaskId, TaskState};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for transfer-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for transfer-engine
///
/// Each variant carries enough context to produce a human-readable failure reason.
/// Whether an error is worth retrying is decided by [`crate::retry::IsRetryable`].
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "engine.max_concurrent")
        key: Option<String>,
    },

    /// A backend rejected or lost a job
    #[error("{backend} backend error: {message}")]
    Backend {
        /// Backend name (e.g., "transmission", "sabnzbd")
        backend: String,
        /// Message reported by the backend or the adapter
        message: String,
        /// Whether repeating the operation may succeed
        transient: bool,
    },

    /// Network error talking to a backend or remote host
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Disk, quota or similar local resource exhausted
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Insufficient disk space for a transfer
    #[error("insufficient disk space: need {required} bytes, have {available} bytes")]
    InsufficientSpace {
        /// Number of bytes required for the operation
        required: u64,
        /// Number of bytes currently available on disk
        available: u64,
    },

    /// Operation not supported by a backend
    #[error("{backend} does not support {operation}")]
    Unsupported {
        /// Backend name
        backend: String,
        /// The operation that was attempted (e.g., "pause")
        operation: String,
    },

    /// A post-processing stage failed
    #[error("{stage} stage failed: {message}")]
    Processing {
        /// Stage name (e.g., "extract")
        stage: String,
        /// Failure reason
        message: String,
        /// Whether the stage may succeed if run again
        retryable: bool,
    },

    /// Upload to the destination store failed
    #[error("upload failed: {message}")]
    Upload {
        /// Failure reason
        message: String,
        /// Whether repeating the upload may succeed
        transient: bool,
    },

    /// Operation observed a cancellation request
    #[error("operation cancelled")]
    Cancelled,

    /// Task not found in the registry
    #[error("task {0} not found")]
    NotFound(TaskId),

    /// Cannot perform operation in the task's current state
    #[error("cannot {operation} task {id} in state {current_state}")]
    InvalidState {
        /// The task that is in an invalid state for the operation
        id: TaskId,
        /// The operation that was attempted (e.g., "pause", "resume")
        operation: String,
        /// The state that prevents the operation
        current_state: TaskState,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Archive extraction error
    #[error("extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// External tool execution failed (ffprobe, yt-dlp)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Shutdown in progress - not accepting new tasks
    #[error("shutdown in progress: not accepting new tasks")]
    ShuttingDown,
}

impl Error {
    /// Build an [`Error::Unsupported`] for the given backend and operation
    pub fn unsupported(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            backend: backend.into(),
            operation: operation.into(),
        }
    }

    /// Build an [`Error::Backend`]
    pub fn backend(backend: impl Into<String>, message: impl Into<String>, transient: bool) -> Self {
        Self::Backend {
            backend: backend.into(),
            message: message.into(),
            transient,
        }
    }

    /// Build an [`Error::Config`] pointing at a configuration key
    pub fn config(message: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            key: Some(key.into()),
        }
    }

    /// Classify this error for storage on a failed task
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Backend { .. } | Error::Unsupported { .. } => ErrorKind::Backend,
            Error::Network(_) => ErrorKind::Network,
            Error::ResourceExhausted(_) | Error::InsufficientSpace { .. } => {
                ErrorKind::ResourceExhausted
            }
            Error::Processing { .. } | Error::Extraction(_) | Error::ExternalTool(_) => {
                ErrorKind::Processing
            }
            Error::Upload { .. } => ErrorKind::Upload,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded => {
                    ErrorKind::ResourceExhausted
                }
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted => ErrorKind::Network,
                _ => ErrorKind::Internal,
            },
            Error::Config { .. } => ErrorKind::Config,
            Error::NotFound(_)
            | Error::InvalidState { .. }
            | Error::Database(_)
            | Error::Sqlx(_)
            | Error::Serialization(_)
            | Error::ShuttingDown => ErrorKind::Internal,
        }
    }
}

/// Serializable error classification stored on failed tasks and history entries
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The backend rejected, lost or failed the job
    Backend,
    /// Transport-level failure
    Network,
    /// Disk space, quota or similar local limit
    ResourceExhausted,
    /// A post-processing stage failed
    Processing,
    /// The upload dispatcher failed
    Upload,
    /// The task was cancelled
    Cancelled,
    /// Invalid configuration (e.g., backend not configured)
    Config,
    /// Engine-internal failure (database, state bookkeeping)
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::Backend => "backend",
            ErrorKind::Network => "network",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Processing => "processing",
            ErrorKind::Upload => "upload",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Reason recorded on a task that reached `Failed`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    /// Error classification
    pub kind: ErrorKind,
    /// Human-readable failure reason
    pub message: String,
}

impl From<&Error> for TaskError {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Stored row could not be decoded
    #[error("corrupt record {id}: {reason}")]
    CorruptRecord {
        /// Row id
        id: i64,
        /// What failed to decode
        reason: String,
    },
}

/// Archive extraction errors
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// File extension is not a supported archive format
    #[error("unknown archive type for {0}")]
    UnknownFormat(PathBuf),

    /// Archive could not be read or extracted
    #[error("extraction failed for {archive}: {reason}")]
    Failed {
        /// The archive that failed to extract
        archive: PathBuf,
        /// The reason extraction failed
        reason: String,
    },

    /// Wrong or missing password for an encrypted archive
    #[error("wrong password for encrypted archive {archive}")]
    WrongPassword {
        /// The encrypted archive that could not be opened
        archive: PathBuf,
    },

    /// An entry would be written outside the destination directory
    #[error("unsafe entry path {entry} in {archive}")]
    UnsafePath {
        /// The archive containing the entry
        archive: PathBuf,
        /// The offending entry name
        entry: String,
    },
}
