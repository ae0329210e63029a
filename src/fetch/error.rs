use std::path::PathBuf;

use thiserror::Error;

use crate::retry::RetryAction;
use crate::source::SourceError;
use crate::types::ErrorClass;

/// Typed fetch errors, classified so the poll loop knows whether to skip
/// the item for good, defer it to a later cycle, or stop.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("unsupported file type {extension:?} for {name}")]
    UnsupportedType { name: String, extension: String },

    #[error("{name} is {size} bytes, over the {limit} byte limit")]
    SizeExceeded { name: String, size: u64, limit: u64 },

    #[error("{0} is empty")]
    EmptyFile(String),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Disk error at {path}: {error}")]
    Disk {
        path: PathBuf,
        error: std::io::Error,
    },

    #[error("giving up on {name} after {retries} retries: {last_error}")]
    RetriesExhausted {
        name: String,
        retries: u32,
        last_error: String,
    },
}

impl FetchError {
    pub(crate) fn disk(path: impl Into<PathBuf>, error: std::io::Error) -> Self {
        Self::Disk {
            path: path.into(),
            error,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            FetchError::UnsupportedType { .. }
            | FetchError::SizeExceeded { .. }
            | FetchError::EmptyFile(_) => ErrorClass::Skip,
            FetchError::Source(e) => e.class(),
            FetchError::Disk { .. } => ErrorClass::Fatal,
            FetchError::RetriesExhausted { .. } => ErrorClass::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Classifier for [`retry_with_backoff`](crate::retry::retry_with_backoff).
    pub fn retry_action(&self) -> RetryAction {
        match self {
            FetchError::Source(e) => e.retry_action(),
            _ => RetryAction::Abort,
        }
    }

    /// Short reason persisted with a skip record.
    pub fn skip_reason(&self) -> String {
        match self {
            FetchError::UnsupportedType { extension, .. } => {
                format!("unsupported type {}", extension)
            }
            FetchError::SizeExceeded { size, limit, .. } => {
                format!("size {} exceeds limit {}", size, limit)
            }
            FetchError::EmptyFile(_) => "empty file".to_string(),
            other => other.to_string(),
        }
    }
}
