//! Patch gate error types
//!
//! Structural and safety problems are detected before any filesystem
//! mutation, so they never need a rollback. Backup and restore errors happen
//! around mutation and carry enough context to be surfaced to a user. A
//! rejected `git apply` is reported through `ApplyReport`, not as an error.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for patch gate operations
pub type PatchResult<T> = Result<T, PatchError>;

/// Errors that can occur while validating, snapshotting or applying a patch
#[derive(Error, Debug)]
pub enum PatchError {
    /// Malformed diff, no hunks, missing headers
    #[error("Invalid patch: {message}")]
    Validation { message: String },

    /// Path traversal, limit exceeded, path outside the repository
    #[error("Safety violation: {message}")]
    Safety { message: String },

    /// Snapshot could not be written
    #[error("Backup '{backup_id}' failed: {message}")]
    Backup { backup_id: String, message: String },

    /// Restoring a snapshot failed; the tree may be inconsistent
    #[error("Restore of backup '{backup_id}' failed: {message}")]
    Restore { backup_id: String, message: String },

    /// Backup identifiers must be single path components
    #[error("Invalid backup id: {0}")]
    InvalidBackupId(String),

    /// A path could not be resolved inside the repository
    #[error("Path {path} is outside repository {root}")]
    OutsideRepository { path: PathBuf, root: PathBuf },

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PatchError {
    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a safety violation
    pub fn safety(message: impl Into<String>) -> Self {
        Self::Safety {
            message: message.into(),
        }
    }

    /// Create a backup error
    pub fn backup(backup_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backup {
            backup_id: backup_id.into(),
            message: message.into(),
        }
    }

    /// Create a restore error
    pub fn restore(backup_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Restore {
            backup_id: backup_id.into(),
            message: message.into(),
        }
    }

    /// Whether the tree may be left inconsistent by this error.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Restore { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PatchError::safety("Path traversal detected: ../x");
        assert_eq!(
            err.to_string(),
            "Safety violation: Path traversal detected: ../x"
        );

        let err = PatchError::restore("b-1", "disk full");
        assert!(err.to_string().contains("b-1"));
    }

    #[test]
    fn test_only_restore_is_unrecoverable() {
        assert!(PatchError::restore("b", "x").is_unrecoverable());
        assert!(!PatchError::backup("b", "x").is_unrecoverable());
        let io = PatchError::Io(std::io::Error::other("boom"));
        assert!(!io.is_unrecoverable());
    }
}
