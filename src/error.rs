//! Error types for elohim-chunks

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Integrity mismatch: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Incomplete file {file_id}: missing chunks {missing:?}")]
    IncompleteFile { file_id: String, missing: Vec<String> },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Expected conditions the ingress/egress layer should catch and act on
    /// (e.g. schedule a fetch).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StorageError::NotFound(_) | StorageError::IncompleteFile { .. })
    }

    /// Broken invariants. These must never be swallowed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StorageError::IntegrityMismatch { .. } | StorageError::InvalidInput(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(StorageError::NotFound("x".into()).is_recoverable());
        assert!(StorageError::IncompleteFile { file_id: "f".into(), missing: vec![] }.is_recoverable());
        assert!(!StorageError::InvalidInput("x".into()).is_recoverable());

        let mismatch = StorageError::IntegrityMismatch {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(mismatch.is_fatal());
        assert!(!mismatch.is_recoverable());
        assert!(!StorageError::NotFound("x".into()).is_fatal());
    }
}
