use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeelError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    /// Path guard refusal. `reason` is safe to show to a user; `rule` is not.
    #[error("Operation refused: {reason}")]
    ProtectionDenied {
        path: String,
        rule: String,
        reason: String,
    },
    /// Index has not absorbed the latest trim of its source log.
    /// Consumed by `Index::ensure_fresh`, never surfaced to callers.
    #[error("Index for '{project}' is behind (index offset {index_offset}, log offset {log_offset})")]
    StaleIndex {
        project: String,
        index_offset: u64,
        log_offset: u64,
    },
    #[error("Corrupt source {path}: {reason}")]
    CorruptSource { path: String, reason: String },
}

impl KeelError {
    /// Stable machine-readable kind, used in CLI envelopes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RusqliteError(_) => "sqlite",
            Self::IoError(_) => "io",
            Self::JsonError(_) => "json",
            Self::ValidationError(_) => "validation",
            Self::NotFound(_) => "not_found",
            Self::ProtectionDenied { .. } => "protection_denied",
            Self::StaleIndex { .. } => "stale_index",
            Self::CorruptSource { .. } => "corrupt_source",
        }
    }
}
