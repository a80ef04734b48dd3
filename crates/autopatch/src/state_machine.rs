//! Workflow state machine: explicit phases and legal transition guards.
//!
//! The coordinator calls [`WorkflowStateMachine::advance`] between phases.
//! Each call checks the edge against the transition table and records it, so
//! a run's path can be reconstructed from its transition log.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Phases of one autonomous workflow invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowPhase {
    Queued,
    Planning,
    Implementing,
    /// Backing up touched files and running `git apply`.
    Applying,
    Testing,
    /// Requesting a corrective diff after a failed test run.
    Fixing,
    Reviewing,
    /// Parked until a confirmation token is presented.
    NeedsApproval,
    Completed,
    Failed,
}

impl WorkflowPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Queued => "queued",
            Self::Planning => "planning",
            Self::Implementing => "implementing",
            Self::Applying => "applying",
            Self::Testing => "testing",
            Self::Fixing => "fixing",
            Self::Reviewing => "reviewing",
            Self::NeedsApproval => "needs_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Legal transitions:
/// ```text
/// Queued → Planning
/// Planning → Implementing
/// Implementing → Applying | NeedsApproval
/// Applying → Testing | Reviewing
/// Testing → Fixing | Reviewing
/// Fixing → Applying | NeedsApproval
/// Reviewing → Completed
/// any non-terminal → Failed
/// ```
fn is_legal_transition(from: WorkflowPhase, to: WorkflowPhase) -> bool {
    use WorkflowPhase::*;

    if to == Failed && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Queued, Planning)
            | (Planning, Implementing)
            | (Implementing, Applying)
            | (Implementing, NeedsApproval)
            // skip_tests goes straight to review
            | (Applying, Testing)
            | (Applying, Reviewing)
            | (Testing, Fixing)
            | (Testing, Reviewing)
            | (Fixing, Applying)
            | (Fixing, NeedsApproval)
            | (Reviewing, Completed)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: WorkflowPhase,
    pub to: WorkflowPhase,
    /// Fix attempt counter when the transition happened.
    pub attempt: u32,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: WorkflowPhase,
    pub to: WorkflowPhase,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal workflow transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

pub struct WorkflowStateMachine {
    run_id: String,
    current: WorkflowPhase,
    attempt: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl WorkflowStateMachine {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            current: WorkflowPhase::Queued,
            attempt: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> WorkflowPhase {
        self.current
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn set_attempt(&mut self, attempt: u32) {
        self.attempt = attempt;
    }

    pub fn advance(
        &mut self,
        to: WorkflowPhase,
        reason: Option<&str>,
    ) -> Result<(), IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }

        tracing::info!(
            run_id = %self.run_id,
            from = %self.current,
            to = %to,
            attempt = self.attempt,
            reason = reason.unwrap_or(""),
            "Workflow transition"
        );

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            attempt: self.attempt,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(())
    }

    pub fn fail(&mut self, reason: &str) -> Result<(), IllegalTransition> {
        self.advance(WorkflowPhase::Failed, Some(reason))
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// `queued → planning → … → completed (N transitions)`
    pub fn summary(&self) -> String {
        let mut path = vec![WorkflowPhase::Queued.to_string()];
        path.extend(self.transitions.iter().map(|t| t.to.to_string()));
        format!("{} ({} transitions)", path.join(" → "), self.transitions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use WorkflowPhase::*;

    #[test]
    fn test_happy_path() {
        let mut sm = WorkflowStateMachine::new("r1");
        for phase in [Planning, Implementing, Applying, Testing, Reviewing, Completed] {
            sm.advance(phase, None).unwrap();
        }
        assert!(sm.is_terminal());
        assert_eq!(sm.transitions().len(), 6);
    }

    #[test]
    fn test_fix_loop() {
        let mut sm = WorkflowStateMachine::new("r1");
        for phase in [Planning, Implementing, Applying, Testing] {
            sm.advance(phase, None).unwrap();
        }
        for attempt in 1..=2 {
            sm.set_attempt(attempt);
            sm.advance(Fixing, Some("tests failed")).unwrap();
            sm.advance(Applying, None).unwrap();
            sm.advance(Testing, None).unwrap();
        }
        sm.advance(Reviewing, None).unwrap();
        sm.advance(Completed, None).unwrap();
        assert_eq!(sm.transitions()[4].attempt, 1);
        assert_eq!(sm.transitions().len(), 12);
    }

    #[test]
    fn test_skip_tests_path() {
        let mut sm = WorkflowStateMachine::new("r1");
        for phase in [Planning, Implementing, Applying, Reviewing, Completed] {
            sm.advance(phase, None).unwrap();
        }
        assert_eq!(sm.current(), Completed);
    }

    #[test]
    fn test_illegal_transitions() {
        let mut sm = WorkflowStateMachine::new("r1");
        let err = sm.advance(Testing, None).unwrap_err();
        assert_eq!(err.from, Queued);
        assert_eq!(err.to, Testing);

        sm.advance(Planning, None).unwrap();
        assert!(sm.advance(Reviewing, None).is_err());
        assert!(sm.advance(Completed, None).is_err());
    }

    #[test]
    fn test_fail_from_any_non_terminal() {
        for start in [Planning, Implementing, Applying, Testing, Fixing, Reviewing, NeedsApproval] {
            assert!(is_legal_transition(start, Failed), "{start} → failed");
        }
        assert!(!is_legal_transition(Completed, Failed));
        assert!(!is_legal_transition(Failed, Failed));
    }

    #[test]
    fn test_approval_is_not_terminal() {
        let mut sm = WorkflowStateMachine::new("r1");
        sm.advance(Planning, None).unwrap();
        sm.advance(Implementing, None).unwrap();
        sm.advance(NeedsApproval, Some("sensitive path")).unwrap();
        assert_eq!(sm.current(), NeedsApproval);
        assert!(!sm.is_terminal());
        assert!(sm.summary().starts_with("queued → planning → implementing → needs_approval"));
    }
}
