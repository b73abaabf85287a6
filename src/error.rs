// src/error.rs

//! Error types shared across the crate
//!
//! Failures are grouped by how far they propagate:
//! - archive level (`EmptyArchive`, `UnsupportedArchive`) abort an ingestion call
//! - title level (`UnextractableTitleId`, `StoreWriteFailure`,
//!   `CatalogServiceUnavailable`) are collected per title and reported
//! - depot level (`UnresolvedKey`) never abort anything

use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum Error {
    /// The archive held neither scripts nor manifest files
    #[error("Archive contains no scripts and no manifest files")]
    EmptyArchive,

    /// Container format could not be recognised or decoded
    #[error("Unsupported archive: {0}")]
    UnsupportedArchive(String),

    /// Script filename does not carry a numeric title ID
    #[error("Cannot extract title ID from script '{0}'")]
    UnextractableTitleId(String),

    /// No decryption key could be found for a depot
    #[error("No decryption key for depot {depot_id} (title {title_id})")]
    UnresolvedKey { title_id: String, depot_id: String },

    /// Writing a store unit failed after all retries
    #[error("Store write for title {title_id} failed after {attempts} attempts: {reason}")]
    StoreWriteFailure {
        title_id: String,
        attempts: u32,
        reason: String,
    },

    /// Catalog service could not be reached or answered with a server error
    #[error("Catalog service unavailable: {0}")]
    CatalogServiceUnavailable(String),

    /// Caller passed a guard for a different title than the bundle it commits
    #[error("Title lock mismatch: holding {held}, committing {requested}")]
    LockMismatch { held: String, requested: String },

    /// I/O failure (store backends, archive reads)
    #[error("I/O error: {0}")]
    IoError(String),

    /// Malformed input (scripts, key tables, catalog payloads)
    #[error("Parse error: {0}")]
    ParseError(String),

    /// HTTP transfer failure
    #[error("Download error: {0}")]
    DownloadError(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFoundError(String),

    /// Component could not be initialised
    #[error("Initialization error: {0}")]
    InitError(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether retrying the same store operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::IoError(_) | Self::DownloadError(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

/// Result alias using the crate error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::IoError("disk full".to_string()).is_transient());
        assert!(Error::DownloadError("reset".to_string()).is_transient());
        assert!(!Error::EmptyArchive.is_transient());
        assert!(!Error::ParseError("bad".to_string()).is_transient());
    }

    #[test]
    fn test_unresolved_key_message() {
        let err = Error::UnresolvedKey {
            title_id: "730".to_string(),
            depot_id: "7302".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "No decryption key for depot 7302 (title 730)"
        );
    }
}
