//! Core error types for skyaway-core.
//!
//! Lifecycle and claim operations report a specific rejection kind so that
//! transport code can render an appropriate reply. Storage failures are
//! wrapped with the operation that triggered them.

use std::path::PathBuf;
use thiserror::Error;

/// Core error type for skyaway-core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A current event (scheduled or started) already exists.
    #[error("already have a current event")]
    EventExists,

    /// There is no current event to operate on.
    #[error("no current event")]
    EventDoesNotExist,

    /// The event has already been started.
    #[error("the event has already started")]
    EventAlreadyStarted,

    /// The event is scheduled but has not started yet.
    #[error("the event has not started yet")]
    EventNotStarted,

    /// The event record has already been ended.
    #[error("the event has already ended")]
    EventAlreadyEnded,

    /// The user has no participant row in the event.
    #[error("the user is not participating in the event")]
    NotParticipating,

    /// The participant has already claimed their coins.
    #[error("the user has already claimed coins in the event")]
    AlreadyClaimed,

    /// No directory user matches the identifier.
    #[error("no user by that name or id: {0}")]
    UserNotFound(String),

    /// Database-related errors
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether this error is a rejection of the caller's request rather than
    /// a fault of the system.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            CoreError::EventExists
                | CoreError::EventDoesNotExist
                | CoreError::EventAlreadyStarted
                | CoreError::EventNotStarted
                | CoreError::EventAlreadyEnded
                | CoreError::NotParticipating
                | CoreError::AlreadyClaimed
                | CoreError::UserNotFound(_)
                | CoreError::Validation(_)
        )
    }
}

/// Database-specific errors.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// Failed to open database connection
    #[error("Failed to open database at {path}: {source}")]
    OpenFailed {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// A storage operation failed
    #[error("failed to {operation}: {source}")]
    Operation {
        operation: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Migration failed
    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    /// Database is locked
    #[error("Database is locked")]
    Locked,

    /// A thread panicked while holding the database lock
    #[error("Database lock poisoned")]
    Poisoned,

    /// A background store call did not complete
    #[error("storage task failed: {0}")]
    TaskFailed(String),
}

/// Configuration-specific errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {message}")]
    LoadFailed { path: PathBuf, message: String },

    /// Failed to save configuration
    #[error("Failed to save configuration to {path}: {message}")]
    SaveFailed { path: PathBuf, message: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to parse configuration
    #[error("Failed to parse configuration: {0}")]
    ParseFailed(String),
}

/// Validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Invalid value
    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

/// Failure to deliver an announcement.
#[derive(Error, Debug)]
pub enum AnnounceError {
    #[error("announcement channel closed")]
    ChannelClosed,

    #[error("webhook request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("webhook error (HTTP {status}): {body}")]
    Rejected { status: u16, body: String },
}

/// Attaches the failing operation to a raw SQLite error.
pub(crate) trait StorageContext<T> {
    fn during(self, operation: &'static str) -> Result<T>;
}

impl<T> StorageContext<T> for std::result::Result<T, rusqlite::Error> {
    fn during(self, operation: &'static str) -> Result<T> {
        self.map_err(|source| match &source {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::DatabaseBusy
                    || err.code == rusqlite::ErrorCode::DatabaseLocked =>
            {
                CoreError::Database(DatabaseError::Locked)
            }
            _ => CoreError::Database(DatabaseError::Operation { operation, source }),
        })
    }
}

/// Result type alias for CoreError
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejections_are_not_faults() {
        assert!(CoreError::EventExists.is_rejection());
        assert!(CoreError::AlreadyClaimed.is_rejection());
        assert!(!CoreError::Database(DatabaseError::Locked).is_rejection());
    }

    #[test]
    fn storage_context_names_operation() {
        let raw: std::result::Result<(), rusqlite::Error> =
            Err(rusqlite::Error::QueryReturnedNoRows);
        let err = raw.during("insert event").unwrap_err();
        assert!(err.to_string().contains("failed to insert event"));
    }
}
