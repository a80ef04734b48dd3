//! Workflow event bus
//!
//! Pub/sub over a Tokio broadcast channel. Publishing never fails because no
//! one is listening; slow subscribers see `Lagged` and skip ahead.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::run::{RunEvent, RunStatus, StepKind};
use crate::state_machine::WorkflowPhase;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    PhaseChanged {
        run_id: String,
        from: WorkflowPhase,
        to: WorkflowPhase,
    },
    StatusChanged {
        run_id: String,
        status: RunStatus,
    },
    StepRecorded {
        run_id: String,
        step_number: u32,
        kind: StepKind,
    },
    /// A dangerous diff is waiting for a confirmation token.
    ApprovalRequired {
        run_id: String,
        step_number: u32,
        diff_name: String,
        token: String,
        dangers: Vec<String>,
    },
    PatchApplied {
        run_id: String,
        step_number: u32,
        files: Vec<String>,
    },
    TestsFinished {
        run_id: String,
        attempt: u32,
        success: bool,
        exit_code: Option<i32>,
    },
    Restored {
        run_id: String,
        backup_id: String,
        success: bool,
    },
}

impl WorkflowEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::PhaseChanged { run_id, .. }
            | Self::StatusChanged { run_id, .. }
            | Self::StepRecorded { run_id, .. }
            | Self::ApprovalRequired { run_id, .. }
            | Self::PatchApplied { run_id, .. }
            | Self::TestsFinished { run_id, .. }
            | Self::Restored { run_id, .. } => run_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::PhaseChanged { .. } => "phase_changed",
            Self::StatusChanged { .. } => "status_changed",
            Self::StepRecorded { .. } => "step_recorded",
            Self::ApprovalRequired { .. } => "approval_required",
            Self::PatchApplied { .. } => "patch_applied",
            Self::TestsFinished { .. } => "tests_finished",
            Self::Restored { .. } => "restored",
        }
    }

    /// Flatten into the persisted event log format.
    pub fn to_run_event(&self) -> RunEvent {
        let message = match self {
            Self::PhaseChanged { from, to, .. } => format!("{from} -> {to}"),
            Self::StatusChanged { status, .. } => status.to_string(),
            Self::StepRecorded {
                step_number, kind, ..
            } => format!("step {step_number} ({kind})"),
            Self::ApprovalRequired {
                diff_name,
                token,
                dangers,
                ..
            } => format!(
                "{diff_name} requires confirmation [{}]; token: {token}",
                dangers.join(", ")
            ),
            Self::PatchApplied {
                step_number, files, ..
            } => format!("step {step_number} applied: {}", files.join(", ")),
            Self::TestsFinished {
                attempt,
                success,
                exit_code,
                ..
            } => format!("attempt {attempt}: success={success} exit_code={exit_code:?}"),
            Self::Restored {
                backup_id, success, ..
            } => format!("backup {backup_id} restored: {success}"),
        };
        RunEvent::new(self.run_id(), self.event_type(), message)
    }
}

pub type SharedEventBus = Arc<EventBus>;

pub struct EventBus {
    sender: broadcast::Sender<WorkflowEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    pub fn publish(&self, event: WorkflowEvent) {
        let event_type = event.event_type();
        match self.sender.send(event) {
            Ok(receivers) => debug!(event_type, receivers, "Event published"),
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
