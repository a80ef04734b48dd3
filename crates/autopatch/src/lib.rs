//! Autopatch
//!
//! Drives a language model through Plan → Implement → Apply → Test → Fix →
//! Review against a git repository. Every patch goes through the `patchgate`
//! safety layer: validated, snapshotted, checked with `git apply --check`,
//! applied, and restored when the workflow gives up.
//!
//! - [`coordinator`]: the workflow driver and the manual apply/revert operations
//! - [`state_machine`]: legal phase transitions
//! - [`model`]: OpenAI-compatible chat backend (plain and SSE streaming)
//! - [`store`]: run, step and event persistence
//! - [`events`]: broadcast bus for progress events
//! - [`config`]: TOML + environment configuration

pub mod config;
pub mod coordinator;
pub mod errors;
pub mod events;
pub mod model;
pub mod prompts;
pub mod run;
pub mod state_machine;
pub mod store;

pub use config::{ModelConfig, WorkflowConfig, MAX_FIX_ATTEMPTS};
pub use coordinator::{ApplyOutcome, RevertOutcome, WorkflowCoordinator, WorkflowRequest};
pub use errors::{ErrorKind, WorkflowError};
pub use events::{EventBus, SharedEventBus, WorkflowEvent};
pub use model::{ChatMessage, ModelBackend, ModelError, OpenAiCompatibleBackend, Role};
pub use run::{PendingConfirmation, Run, RunEvent, RunStatus, Step, StepKind};
pub use state_machine::{WorkflowPhase, WorkflowStateMachine};
pub use store::{JsonRunStore, MemoryRunStore, RunStore, StoreError};
