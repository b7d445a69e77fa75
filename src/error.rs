// ⚠️ Error taxonomy for the import pipeline
//
// Row-level problems (bad email, bad checksum, unknown state) are VALUES
// collected in the import outcome. Only the types below travel through `Err`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::record::EmployeeRecord;

// ============================================================================
// ROW-LEVEL ERRORS (never escape a job)
// ============================================================================

/// One field-level violation found in a CSV row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: &str, message: impl Into<String>) -> Self {
        FieldError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// All problems for one row, with its 1-based data row number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    pub row: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    pub errors: Vec<FieldError>,
}

/// Normalizer failures; handled exactly like validation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NormalizationError {
    #[error("unknown state: {0}")]
    UnknownState(String),

    #[error("invalid date: {0}")]
    InvalidDate(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

impl NormalizationError {
    /// Express the failure as a field error for the row report
    pub fn to_field_error(&self) -> FieldError {
        match self {
            NormalizationError::UnknownState(token) => {
                FieldError::new("state", format!("Unknown state '{}'", token))
            }
            NormalizationError::InvalidDate(value) => {
                FieldError::new("start_date", format!("Could not parse date '{}'", value))
            }
            NormalizationError::MissingField(field) => {
                FieldError::new(field, "Required field is empty")
            }
        }
    }
}

// ============================================================================
// REPOSITORY ERRORS
// ============================================================================

/// A row of a batch write that could not be persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedWrite {
    pub natural_key: String,
    pub reason: String,
    /// A create lost the race for its natural key; retry as an update
    #[serde(default)]
    pub conflict: bool,
}

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Another writer created the same natural key first
    #[error("natural key {key} already exists")]
    Conflict { key: String },

    /// Some rows of a batch failed; `committed` rows stay written
    #[error("batch write failed for {} row(s)", .failed.len())]
    Batch {
        failed: Vec<FailedWrite>,
        committed: Vec<EmployeeRecord>,
    },

    /// Strict dirty lookup found nothing to notify
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database connection lock poisoned")]
    LockPoisoned,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

impl RepositoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, RepositoryError::Conflict { .. })
    }
}

// ============================================================================
// COLLABORATOR ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob path: {0}")]
    InvalidPath(String),

    #[error("blob I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Message delivery failure; leaves the records dirty for a later sweep
#[derive(Debug, Error)]
#[error("notification send failed: {0}")]
pub struct SendError(pub String);

// ============================================================================
// JOB-LEVEL ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The uploaded file cannot be opened or read
    #[error("source unavailable: {path}: {reason}")]
    SourceUnavailable { path: PathBuf, reason: String },

    /// Every chunk that had writes failed to persist
    #[error("all {chunks} chunk(s) failed to persist")]
    AllChunksFailed { chunks: usize },

    /// Timeout or explicit cancellation stopped the run between chunks
    #[error("import cancelled after {processed} row(s)")]
    Cancelled { processed: usize },

    #[error("attempt timed out after {0:?}")]
    TimedOut(std::time::Duration),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("worker failed: {0}")]
    Worker(String),
}

impl PipelineError {
    /// Whether another attempt could succeed
    ///
    /// An unreadable source aborts the job immediately.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::SourceUnavailable { .. } | PipelineError::Config(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
