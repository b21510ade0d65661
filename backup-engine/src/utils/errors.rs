//! Error taxonomy for the backup engine.
//!
//! Only configuration errors, a missing top-level source and chain-order
//! violations are fatal to a whole operation. Everything else is either a
//! retryable destination failure or degrades into a [`crate::report::Warning`].

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use thiserror::Error;

/// Integrity failures always carry the identity of the offending entry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("hash mismatch for '{name}': expected {expected}, got {actual}")]
    HashMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("chain order violation in '{entry}': {next} does not follow {previous}")]
    ChainOrderViolation {
        entry: String,
        previous: DateTime<Utc>,
        next: DateTime<Utc>,
    },

    #[error("incremental '{name}' has no owning full backup and is ignored")]
    OrphanedIncremental { name: String },

    #[error("incremental backup at {timestamp} ('{name}') is unreachable: {reason}")]
    UnreachableIncremental {
        timestamp: DateTime<Utc>,
        name: String,
        reason: String,
    },

    #[error("volume '{name}' is not referenced by manifest '{manifest}'")]
    UnreferencedVolume { name: String, manifest: String },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source path is missing: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("Destination error during {operation} of '{name}': {message}")]
    Destination {
        operation: &'static str,
        name: String,
        message: String,
    },

    #[error("Integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("No backup found at or before {0}")]
    NoMatchingBackup(DateTime<Utc>),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Delta-sync error: {0}")]
    DeltaSync(String),

    #[error("Operation aborted")]
    Aborted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Hook error: {0}")]
    Hook(String),

    #[error("Worker task failed: {0}")]
    Task(String),
}

impl EngineError {
    pub fn destination(operation: &'static str, name: impl Into<String>, err: impl std::fmt::Display) -> Self {
        EngineError::Destination {
            operation,
            name: name.into(),
            message: err.to_string(),
        }
    }

    /// Destination failures may be retried by the caller; the engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Destination { .. })
    }

    /// Errors that end the whole operation rather than a single item.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EngineError::Config(_)
                | EngineError::SourceMissing(_)
                | EngineError::Aborted
                | EngineError::Integrity(IntegrityError::ChainOrderViolation { .. })
        )
    }
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            EngineError::Aborted
        } else {
            EngineError::Task(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
