//! Patch Gate
//!
//! Deterministic safety layer between a language model and a git working tree.
//!
//! # Components
//!
//! - [`diff`]: parse unified diffs into file-level hunks, extract diffs from model output
//! - [`glob`]: sensitive-path glob matching
//! - [`validator`]: structural checks, trust limits, path traversal and danger analysis
//! - [`confirmation`]: signed single-use confirmation tokens for dangerous patches
//! - [`backup`]: file snapshots with restore of modified and created files
//! - [`applier`]: two-phase `git apply --check` / `git apply`
//! - [`test_runner`]: run the repository's test command with a timeout
//!
//! # Flow
//!
//! ```text
//! model output ─► extract_unified_diff ─► PatchValidator ─┬─► invalid: reject, tree untouched
//!                                                         ├─► dangerous: confirmation token
//!                                                         └─► BackupManager::backup ─► DiffApplier::apply
//! ```

pub mod applier;
pub mod backup;
pub mod confirmation;
pub mod diff;
pub mod error;
pub mod glob;
pub mod process;
pub mod sandbox;
pub mod test_runner;
pub mod validator;

pub use applier::{ApplyReport, DiffApplier};
pub use backup::{generate_backup_id, validate_backup_id, Backup, BackupManager};
pub use confirmation::{
    Clock, ConfirmationTokens, ManualClock, SystemClock, TokenError, TokenRejection, TOKEN_TTL_MS,
};
pub use diff::{
    extract_unified_diff, is_unsafe_path, parse_unified_diff, touched_paths, FileOperation, Hunk,
};
pub use error::{PatchError, PatchResult};
pub use glob::{GlobError, GlobMatcher};
pub use sandbox::{resolve_repo_path, resolve_within};
pub use test_runner::{CommandTestRunner, TestOutcome, TestRunner};
pub use validator::{
    DangerItem, DangerReason, PatchValidator, TokenBinding, TrustLimits, ValidationResult,
};
