//! Run, step and event records.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    NeedsApproval,
    Completed,
    Failed,
    /// Reserved; nothing cancels a run yet.
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Terminal, or parked until someone approves a diff. A workflow never
    /// drives a run in one of these states again.
    pub fn is_resting(self) -> bool {
        self.is_terminal() || self == Self::NeedsApproval
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Running => write!(f, "running"),
            Self::NeedsApproval => write!(f, "needs_approval"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A single autonomous workflow invocation against one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub goal: String,
    pub repo_path: PathBuf,
    pub status: RunStatus,
    pub fix_attempts: u32,
    pub tests_pass: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Confirmation token minted for a dangerous diff awaiting approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_confirmation: Option<PendingConfirmation>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Run {
    pub fn new(id: impl Into<String>, goal: impl Into<String>, repo_path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            goal: goal.into(),
            repo_path: repo_path.into(),
            status: RunStatus::Queued,
            fix_attempts: 0,
            tests_pass: false,
            backup_id: None,
            error: None,
            pending_confirmation: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// A diff step that needs a confirmation token before it can be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConfirmation {
    pub step_number: u32,
    pub step_kind: StepKind,
    pub token: String,
    /// Human-readable danger items, e.g. `delete: server/config.ts`.
    pub dangers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Plan,
    Implement,
    Test,
    Fix,
    Review,
}

impl StepKind {
    /// Only implement and fix steps carry diffs.
    pub fn carries_diff(self) -> bool {
        matches!(self, Self::Implement | Self::Fix)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plan => write!(f, "plan"),
            Self::Implement => write!(f, "implement"),
            Self::Test => write!(f, "test"),
            Self::Fix => write!(f, "fix"),
            Self::Review => write!(f, "review"),
        }
    }
}

impl std::str::FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plan" => Ok(Self::Plan),
            "implement" => Ok(Self::Implement),
            "test" => Ok(Self::Test),
            "fix" => Ok(Self::Fix),
            "review" => Ok(Self::Review),
            other => Err(format!("unknown step kind: {other}")),
        }
    }
}

/// Artifact produced by one workflow phase. Append-only within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub number: u32,
    pub kind: StepKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Name a diff step for confirmation-token binding.
pub fn diff_name(step_number: u32, kind: StepKind) -> String {
    format!("step-{step_number}-{kind}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: String,
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    pub fn new(run_id: impl Into<String>, kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            kind: kind.into(),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_run_is_queued() {
        let run = Run::new("r1", "add health route", "/tmp/repo");
        assert_eq!(run.status, RunStatus::Queued);
        assert!(!run.is_terminal());
        assert_eq!(run.fix_attempts, 0);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::NeedsApproval.is_terminal());
        assert!(RunStatus::NeedsApproval.is_resting());
        assert!(!RunStatus::Running.is_resting());
    }

    #[test]
    fn test_run_serializes_snake_case_status() {
        let mut run = Run::new("r1", "goal", "/repo");
        run.status = RunStatus::NeedsApproval;
        let json = serde_json::to_value(&run).unwrap();
        assert_eq!(json["status"], "needs_approval");
        assert!(json.get("backup_id").is_none());
    }

    #[test]
    fn test_diff_name_and_kind_parse() {
        assert_eq!(diff_name(2, StepKind::Implement), "step-2-implement");
        assert_eq!("fix".parse::<StepKind>().unwrap(), StepKind::Fix);
        assert!("deploy".parse::<StepKind>().is_err());
        assert!(StepKind::Fix.carries_diff());
        assert!(!StepKind::Plan.carries_diff());
    }
}
