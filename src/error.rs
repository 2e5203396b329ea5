//! Error types shared across the pipeline.
//!
//! Per-image problems are carried as [`JobError`] and always end up as a `JobFailure` entry;
//! only [`Error`] propagates out of a batch operation.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable classification of everything that can go wrong, surfaced in reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    BatchTooLarge,
    InvalidImage,
    RecognizerTimeout,
    RecognizerUnavailable,
    NoDataExtracted,
    SerializationFailure,
}

impl ErrorKind {
    /// Transient kinds are retried by the orchestrator before being recorded.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::RecognizerTimeout | Self::RecognizerUnavailable)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BatchTooLarge => "BatchTooLarge",
            Self::InvalidImage => "InvalidImage",
            Self::RecognizerTimeout => "RecognizerTimeout",
            Self::RecognizerUnavailable => "RecognizerUnavailable",
            Self::NoDataExtracted => "NoDataExtracted",
            Self::SerializationFailure => "SerializationFailure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Schema construction errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("Template defines no columns")]
    Empty,

    #[error("Column {0} has an empty name")]
    EmptyName(usize),

    #[error("Duplicate column name: {0}")]
    DuplicateColumn(String),
}

/// Batch-level errors. These abort the whole operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Batch must contain between 1 and {max} images, got {count}")]
    BatchTooLarge { count: usize, max: usize },

    #[error("Image id {0} appears more than once in the batch")]
    DuplicateImage(String),

    #[error("Invalid template: {0}")]
    Schema(#[from] SchemaError),

    #[error("Invalid template JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Table does not match template: {0}")]
    Serialization(String),

    #[error("Spreadsheet error: {0}")]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),

    #[error("Could not read workbook: {0}")]
    Read(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::BatchTooLarge { .. } => Some(ErrorKind::BatchTooLarge),
            Self::Serialization(_) | Self::Xlsx(_) => Some(ErrorKind::SerializationFailure),
            Self::DuplicateImage(_)
            | Self::Schema(_)
            | Self::Json(_)
            | Self::Read(_)
            | Self::Config(_)
            | Self::Io(_) => None,
        }
    }
}

/// Failure of a single image job.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {detail}")]
pub struct JobError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl JobError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Errors reported by a recognizer backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecognizerError {
    #[error("Unreadable image: {0}")]
    InvalidImage(String),

    #[error("Recognizer timed out: {0}")]
    Timeout(String),

    #[error("Recognizer unavailable: {0}")]
    Unavailable(String),
}

impl From<RecognizerError> for JobError {
    fn from(e: RecognizerError) -> Self {
        match e {
            RecognizerError::InvalidImage(d) => JobError::new(ErrorKind::InvalidImage, d),
            RecognizerError::Timeout(d) => JobError::new(ErrorKind::RecognizerTimeout, d),
            RecognizerError::Unavailable(d) => JobError::new(ErrorKind::RecognizerUnavailable, d),
        }
    }
}
