//! Error types for the lead ledger
//!
//! Errors are classified by who has to act on them:
//! - Validation: the caller sent malformed input (never retried)
//! - NotFound: an explicit lookup referenced a missing row
//! - Storage: the SQLite layer failed (propagated as-is)
//! - Provider: a calendar or text-analysis collaborator failed

use thiserror::Error;

use crate::providers::ProviderError;

/// Failures raised by the SQLite layer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

/// Errors surfaced by every public ledger operation.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid date range: {0}")]
    InvalidRange(String),

    #[error("invalid preferences: {0}")]
    InvalidPreferences(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl LedgerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        LedgerError::Validation(msg.into())
    }

    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        LedgerError::NotFound { kind, id: id.into() }
    }

    /// Returns true for any malformed-input error, including range and
    /// preference errors.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            LedgerError::Validation(_)
                | LedgerError::InvalidRange(_)
                | LedgerError::InvalidPreferences(_)
        )
    }

    /// Returns true if a caller may reasonably retry the same call.
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::Provider(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for LedgerError {
    fn from(err: rusqlite::Error) -> Self {
        LedgerError::Storage(StorageError::Sqlite(err))
    }
}

impl From<r2d2::Error> for LedgerError {
    fn from(err: r2d2::Error) -> Self {
        LedgerError::Storage(StorageError::Pool(err))
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Storage(StorageError::Serialization(err))
    }
}

impl From<validator::ValidationErrors> for LedgerError {
    fn from(err: validator::ValidationErrors) -> Self {
        LedgerError::Validation(err.to_string())
    }
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;
