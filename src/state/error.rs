//! Error types for the state tracking module.

use std::path::PathBuf;

use thiserror::Error;

use crate::types::{ErrorClass, SourceKind};

/// Errors that can occur during state database operations.
#[derive(Error, Debug)]
pub enum StateError {
    /// Failed to open or create the database file.
    #[error("Failed to open database at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    /// Failed to run a database migration.
    #[error("Database migration failed: {0}")]
    Migration(#[from] rusqlite::Error),

    /// A query failed.
    #[error("Database query failed: {0}")]
    Query(String),

    /// Failed to spawn a blocking task.
    #[error("Failed to spawn blocking task: {0}")]
    Spawn(#[from] tokio::task::JoinError),

    /// The database schema version is newer than supported.
    #[error("Database schema version {found} is newer than supported version {expected}")]
    UnsupportedSchemaVersion { found: i32, expected: i32 },

    #[error("Refusing to move {kind} watermark back from {current} to {requested}")]
    WatermarkRegression {
        kind: SourceKind,
        current: String,
        requested: String,
    },

    #[error("Cannot advance {kind} watermark with {count} fetch(es) outstanding")]
    OutstandingFetches { kind: SourceKind, count: usize },

    /// A fetch was reported durable but the file is absent or empty.
    #[error("Fetched file missing or empty: {0}")]
    MissingFile(PathBuf),

    #[error("Another kb-ingest instance owns {kind} (lock: {path})")]
    Locked { kind: SourceKind, path: PathBuf },

    #[error("Lock file error at {path}: {error}")]
    LockFile {
        path: PathBuf,
        error: std::io::Error,
    },
}

impl StateError {
    /// Create a Query error from a rusqlite error.
    pub fn query(source: rusqlite::Error) -> Self {
        Self::Query(source.to_string())
    }

    /// Local state problems always stop the owning loop.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Fatal
    }
}
