//! Error types for replay-archiver
//!
//! This module provides the error taxonomy for the library:
//! - Domain-specific error types (Database, Storage, Integrity)
//! - Context information (replay ID, file path, configuration key)
//!
//! A remote "not found" answer is deliberately absent from this module: it is a
//! normal [`FetchOutcome`](crate::types::FetchOutcome), recorded as a tombstone,
//! never an error.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for replay-archiver operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for replay-archiver
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "source.base_url")
        key: Option<String>,
    },

    /// Ledger operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// Blob store operation failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Fetched payload could not be verified
    #[error("integrity error: {0}")]
    Integrity(#[from] IntegrityError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Discovery collaborator failed to report the upper bound of the ID space
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Requested ID range is empty or inverted
    #[error("invalid ID range: start {start} is greater than end {end}")]
    InvalidRange {
        /// First ID of the requested range (inclusive)
        start: u64,
        /// Last ID of the requested range (inclusive)
        end: u64,
    },

    /// Requested record or blob does not exist locally
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,
}

impl Error {
    /// Shorthand for a configuration error tied to a specific key
    pub fn config(key: &str, message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
            key: Some(key.to_string()),
        }
    }

    /// Whether this error means local persistence is unusable (blob store or ledger)
    ///
    /// Storage-class errors are never recorded in the ledger as progress; they halt
    /// processing of the affected ID for the current run.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Database(_) | Error::Io(_)
        )
    }
}

/// Ledger (database) errors
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

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),

    /// Constraint violation (e.g., hash without size)
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
}

/// Blob store errors (disk full, permissions, I/O failures)
#[derive(Debug, Error)]
pub enum StorageError {
    /// Filesystem operation failed for a specific path
    #[error("I/O failure at {path}: {source}")]
    Io {
        /// The path the operation was acting on
        path: PathBuf,
        /// The underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Export destination already exists and will not be overwritten
    #[error("destination {0} already exists")]
    DestinationExists(PathBuf),

    /// Supplied content hash is not a 64-character hex SHA-256 digest
    #[error("invalid content hash: {0}")]
    InvalidHash(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Payload verification errors
#[derive(Debug, Error)]
pub enum IntegrityError {
    /// The remote answered successfully but delivered no bytes
    #[error("payload is empty")]
    EmptyPayload,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_class_covers_ledger_and_blob_failures() {
        let storage = Error::Storage(StorageError::io(
            "/archive/ab/cd/ef.mcpr",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        ));
        let ledger = Error::Database(DatabaseError::QueryFailed("disk I/O error".into()));

        assert!(storage.is_storage());
        assert!(ledger.is_storage());
    }

    #[test]
    fn integrity_and_config_are_not_storage_errors() {
        assert!(!Error::Integrity(IntegrityError::EmptyPayload).is_storage());
        assert!(!Error::config("archive.concurrency", "must be positive").is_storage());
        assert!(!Error::Discovery("listing unavailable".into()).is_storage());
    }

    #[test]
    fn config_helper_records_the_offending_key() {
        match Error::config("source.base_url", "missing {id} placeholder") {
            Error::Config { message, key } => {
                assert_eq!(key.as_deref(), Some("source.base_url"));
                assert!(message.contains("{id}"));
            }
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn storage_io_error_message_names_the_path() {
        let err = StorageError::io(
            "/archive/.tmp/7-abc.part",
            std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"),
        );

        let message = err.to_string();
        assert!(message.contains("/archive/.tmp/7-abc.part"), "{message}");
        assert!(message.contains("no space left"), "{message}");
    }

    #[test]
    fn invalid_range_message_reports_both_bounds() {
        let err = Error::InvalidRange { start: 10, end: 3 };
        assert_eq!(
            err.to_string(),
            "invalid ID range: start 10 is greater than end 3"
        );
    }
}
