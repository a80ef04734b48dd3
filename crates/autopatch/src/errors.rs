//! Workflow error taxonomy.
//!
//! Every failure a workflow can hit is one [`WorkflowError`] variant. Callers
//! branch on [`ErrorKind`] and [`WorkflowError::requires_restore`] instead of
//! matching message text.
//!
//! | Kind             | Raised before mutation | On failure with a backup |
//! |------------------|------------------------|--------------------------|
//! | Validation       | yes                    | discard it               |
//! | SafetyViolation  | yes                    | discard it               |
//! | Apply            | after `--check` fails  | restore                  |
//! | TestFailure      | no                     | restore                  |
//! | Restore          | no                     | keep it, never retried   |
//! | Model            | any phase              | restore                  |
//! | AlreadyRunning   | yes                    | n/a                      |
//! | NotFound         | yes                    | n/a                      |
//! | Configuration    | yes                    | n/a                      |
//! | Internal         | any phase              | restore                  |

use std::fmt;

use patchgate::PatchError;
use thiserror::Error;

use crate::model::ModelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    SafetyViolation,
    Apply,
    TestFailure,
    Restore,
    Model,
    AlreadyRunning,
    NotFound,
    Configuration,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation => write!(f, "validation"),
            Self::SafetyViolation => write!(f, "safety_violation"),
            Self::Apply => write!(f, "apply"),
            Self::TestFailure => write!(f, "test_failure"),
            Self::Restore => write!(f, "restore"),
            Self::Model => write!(f, "model"),
            Self::AlreadyRunning => write!(f, "already_running"),
            Self::NotFound => write!(f, "not_found"),
            Self::Configuration => write!(f, "configuration"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The model produced no usable diff, or the diff failed validation.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Traversal, trust limit, or a path outside the project root.
    #[error("Safety violation: {0}")]
    SafetyViolation(String),

    #[error("Apply failed: {0}")]
    Apply(String),

    #[error("Tests still failing after {attempts} fix attempts")]
    TestFailure { attempts: u32 },

    /// The original tree could not be put back.
    #[error("Restore of backup '{backup_id}' failed: {message}")]
    Restore { backup_id: String, message: String },

    #[error("Model request failed: {0}")]
    Model(#[from] ModelError),

    #[error("Workflow already running for run {0}")]
    AlreadyRunning(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl WorkflowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::SafetyViolation(_) => ErrorKind::SafetyViolation,
            Self::Apply(_) => ErrorKind::Apply,
            Self::TestFailure { .. } => ErrorKind::TestFailure,
            Self::Restore { .. } => ErrorKind::Restore,
            Self::Model(_) => ErrorKind::Model,
            Self::AlreadyRunning(_) => ErrorKind::AlreadyRunning,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether the working tree may have been mutated when this error was
    /// raised, so a backup (if one exists) must be restored.
    pub fn requires_restore(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Apply | ErrorKind::TestFailure | ErrorKind::Model | ErrorKind::Internal
        )
    }
}

impl From<PatchError> for WorkflowError {
    fn from(err: PatchError) -> Self {
        match err {
            PatchError::Validation { message } => Self::Validation(message),
            PatchError::Safety { message } => Self::SafetyViolation(message),
            e @ PatchError::OutsideRepository { .. } => Self::SafetyViolation(e.to_string()),
            e @ PatchError::InvalidBackupId(_) => Self::Validation(e.to_string()),
            PatchError::Restore { backup_id, message } => Self::Restore { backup_id, message },
            e @ (PatchError::Backup { .. } | PatchError::Io(_) | PatchError::Json(_)) => {
                Self::Internal(e.to_string())
            }
        }
    }
}
