//! Error types for the convo-sync library.
//!
//! This module provides custom error types using `thiserror` so callers can tell
//! retryable store failures apart from validation problems and missing rows.

use thiserror::Error;

use crate::models::MessageContent;

/// Errors that can occur while resolving, tracking or synchronizing conversations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Thread, message or participant is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// The store or network is unavailable; the operation may be retried
    #[error("Transient failure: {0}")]
    Transient(String),

    /// Input rejected before anything was persisted
    #[error("Validation error: {0}")]
    Validation(String),

    /// The store does not offer the requested server-side operation
    #[error("Operation not supported by store: {0}")]
    Unsupported(String),

    /// Persisting an outbound message failed. The original content is kept so the
    /// caller can offer a retry without losing what the user typed.
    #[error("Send failed: {source}")]
    SendFailed {
        /// Content that was not delivered
        content: MessageContent,
        /// Underlying store failure
        #[source]
        source: Box<SyncError>,
    },

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Connection pool errors
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization errors
    #[error("Binary serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    /// Snapshot cache errors
    #[error("Cache error: {0}")]
    Cache(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// General error with context
    #[error("{0}")]
    Other(String),
}

impl SyncError {
    /// Whether a read path may retry the operation that produced this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Pool(_) => true,
            Self::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Self::SendFailed { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Content that failed to send, if this is a send failure.
    #[must_use]
    pub fn unsent_content(&self) -> Option<&MessageContent> {
        match self {
            Self::SendFailed { content, .. } => Some(content),
            _ => None,
        }
    }
}

/// Convenience type alias for Result with SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

impl From<sled::Error> for SyncError {
    fn from(err: sled::Error) -> Self {
        Self::Cache(err.to_string())
    }
}

impl From<tokio::task::JoinError> for SyncError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Transient(format!("store task failed: {err}"))
    }
}
