//! Workflow coordinator: Plan → Implement → Apply → Test ⇄ Fix → Review.
//!
//! One [`WorkflowCoordinator`] is built per process and shared behind an
//! `Arc`. It owns every collaborator a run needs (model, store, test runner,
//! validator, applier, token service, event bus) plus the set of run ids
//! currently executing, so no two workflows ever drive the same run.
//!
//! ```text
//! Queued → Planning → Implementing ─┬─► Applying → Testing ─► Reviewing → Completed
//!                                   │      ▲          │
//!                                   │      └─ Fixing ◄┘ (restore original first)
//!                                   └─► NeedsApproval (dangerous diff, token minted)
//!
//! any phase ──► Failed (restore the original tree if the error may have touched it)
//! ```
//!
//! Each phase handler returns `Result<Transition, WorkflowError>`; the driver
//! matches on it to advance, park, complete, or restore-and-fail.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use patchgate::glob::compile_all;
use patchgate::{
    extract_unified_diff, generate_backup_id, resolve_repo_path, validate_backup_id,
    BackupManager, ConfirmationTokens, DiffApplier, GlobMatcher, PatchError, PatchValidator,
    TestOutcome, TestRunner, TokenBinding, ValidationResult,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkflowConfig;
use crate::errors::{ErrorKind, WorkflowError};
use crate::events::{EventBus, SharedEventBus, WorkflowEvent};
use crate::model::{collect_text, ChatMessage, ModelBackend, ModelError};
use crate::prompts::{self, RepoContext};
use crate::run::{diff_name, PendingConfirmation, Run, RunStatus, Step, StepKind};
use crate::state_machine::{WorkflowPhase, WorkflowStateMachine};
use crate::store::{RunStore, StoreError};

/// Input for one autonomous workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub run_id: String,
    pub goal: String,
    /// Absolute, or relative to the configured project root.
    pub repo_path: PathBuf,
    #[serde(default)]
    pub skip_tests: bool,
}

impl WorkflowRequest {
    /// Request with a fresh run id.
    pub fn new(goal: impl Into<String>, repo_path: impl Into<PathBuf>) -> Self {
        Self {
            run_id: format!("run-{}", uuid::Uuid::new_v4().simple()),
            goal: goal.into(),
            repo_path: repo_path.into(),
            skip_tests: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    #[serde(default)]
    pub modified_files: Vec<String>,
}

impl ApplyOutcome {
    fn rejected(error: impl Into<String>, validation: Option<ValidationResult>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            validation,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What the driver does after a phase handler returns.
#[derive(Debug)]
enum Transition {
    Next(WorkflowPhase),
    AwaitApproval(PendingConfirmation),
    Complete,
}

/// A validated diff waiting to be applied.
#[derive(Debug, Clone)]
struct StagedDiff {
    step_number: u32,
    diff: String,
    files: Vec<String>,
}

/// Mutable state threaded through the phases of one run.
struct RunContext {
    run: Run,
    sm: WorkflowStateMachine,
    repo: PathBuf,
    backups: BackupManager,
    skip_tests: bool,
    plan: String,
    staged: Option<StagedDiff>,
    applied_diff: String,
    last_test: Option<TestOutcome>,
    test_runs: u32,
    steps_recorded: u32,
}

/// Removes a run id from the running set when dropped.
struct RunGuard {
    running: Arc<Mutex<HashSet<String>>>,
    run_id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(&self.run_id);
        debug!(run_id = %self.run_id, "Run guard released");
    }
}

pub struct WorkflowCoordinator {
    config: WorkflowConfig,
    model: Arc<dyn ModelBackend>,
    store: Arc<dyn RunStore>,
    test_runner: Arc<dyn TestRunner>,
    tokens: Arc<ConfirmationTokens>,
    validator: PatchValidator,
    applier: DiffApplier,
    /// Files matching these are never inlined into a prompt.
    sensitive: Vec<GlobMatcher>,
    events: SharedEventBus,
    running: Arc<Mutex<HashSet<String>>>,
}

impl WorkflowCoordinator {
    pub fn new(
        config: WorkflowConfig,
        model: Arc<dyn ModelBackend>,
        store: Arc<dyn RunStore>,
        test_runner: Arc<dyn TestRunner>,
    ) -> Self {
        let tokens = Arc::new(match &config.token_secret {
            Some(secret) => ConfirmationTokens::new(secret.as_bytes().to_vec()),
            None => ConfirmationTokens::with_random_secret(),
        });
        let validator = PatchValidator::new(config.limits.clone()).with_tokens(tokens.clone());
        let applier = DiffApplier::new(config.git_timeout());
        let sensitive = compile_all(&config.limits.sensitive_path_globs);
        Self {
            config,
            model,
            store,
            test_runner,
            tokens,
            validator,
            applier,
            sensitive,
            events: EventBus::new().shared(),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Replace the token service (shared secret across processes, test clocks).
    pub fn with_tokens(mut self, tokens: Arc<ConfirmationTokens>) -> Self {
        self.validator = PatchValidator::new(self.config.limits.clone()).with_tokens(tokens.clone());
        self.tokens = tokens;
        self
    }

    pub fn with_event_bus(mut self, events: SharedEventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    pub fn tokens(&self) -> &Arc<ConfirmationTokens> {
        &self.tokens
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn is_workflow_running(&self, run_id: &str) -> bool {
        self.running
            .lock()
            .map(|r| r.contains(run_id))
            .unwrap_or(false)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<Option<Run>, WorkflowError> {
        self.store
            .get_run(run_id)
            .await
            .map_err(|e| WorkflowError::Internal(e.to_string()))
    }

    pub async fn steps(&self, run_id: &str) -> Result<Vec<Step>, WorkflowError> {
        self.store
            .steps(run_id)
            .await
            .map_err(|e| WorkflowError::Internal(e.to_string()))
    }

    /// Run a workflow to completion (or approval) on the current task.
    ///
    /// `Err` is returned only when the run could not start; failures during
    /// the run are reported through the returned run's status and error.
    /// A run id that already finished or awaits approval cannot be reused.
    pub async fn run_auto_workflow(&self, req: WorkflowRequest) -> Result<Run, WorkflowError> {
        let guard = self.acquire(&req.run_id)?;
        let repo = self.prepare(&req)?;
        self.ensure_restartable(&req.run_id).await?;
        Ok(self.execute(req, repo, guard).await)
    }

    /// Start a workflow in the background. The run id is claimed before the
    /// first await, so a second call for the same id fails immediately.
    pub async fn spawn_auto_workflow(
        self: &Arc<Self>,
        req: WorkflowRequest,
    ) -> Result<JoinHandle<Run>, WorkflowError> {
        let guard = self.acquire(&req.run_id)?;
        let repo = self.prepare(&req)?;
        self.ensure_restartable(&req.run_id).await?;
        let this = Arc::clone(self);
        Ok(tokio::spawn(async move { this.execute(req, repo, guard).await }))
    }

    /// Validate a diff against a repository under the project root.
    pub fn validate_diff(
        &self,
        diff: &str,
        repo_path: &Path,
        binding: Option<TokenBinding<'_>>,
    ) -> Result<ValidationResult, WorkflowError> {
        let repo = resolve_repo_path(&self.config.project_root, repo_path)?;
        Ok(self.validator.validate(diff, &repo, binding))
    }

    /// Apply a stored implement/fix step outside the autonomous loop, e.g.
    /// after a user approved a dangerous diff.
    pub async fn apply_diff_with_backup(
        &self,
        run_id: &str,
        step_number: u32,
        step_kind: StepKind,
        confirmation_token: Option<&str>,
    ) -> Result<ApplyOutcome, WorkflowError> {
        let _guard = self.acquire(run_id)?;

        let mut run = self
            .get_run(run_id)
            .await?
            .ok_or_else(|| WorkflowError::NotFound(format!("run {run_id}")))?;
        let step = self
            .store
            .get_step(run_id, step_number)
            .await
            .map_err(|e| WorkflowError::Internal(e.to_string()))?
            .ok_or_else(|| WorkflowError::NotFound(format!("step {step_number} of run {run_id}")))?;
        if step.kind != step_kind || !step_kind.carries_diff() {
            return Ok(ApplyOutcome::rejected(
                format!("Step {step_number} is a {} step, not {step_kind}", step.kind),
                None,
            ));
        }

        let repo = resolve_repo_path(&self.config.project_root, &run.repo_path)?;
        let validation = self.validator.validate(&step.content, &repo, None);
        if !validation.valid {
            let error = validation.errors.join("; ");
            return Ok(ApplyOutcome::rejected(error, Some(validation)));
        }

        if validation.requires_confirmation {
            let name = diff_name(step_number, step_kind);
            let Some(token) = confirmation_token else {
                return Ok(ApplyOutcome::rejected(
                    "Confirmation required for dangerous changes",
                    Some(validation),
                ));
            };
            if !self.tokens.validate(token, run_id, &name) {
                return Ok(ApplyOutcome::rejected(
                    "Invalid or expired confirmation token",
                    Some(validation),
                ));
            }
        }

        let backups = BackupManager::new(&repo, &self.config.backup_dir);
        let backup_id = generate_backup_id(run_id);
        backups.backup_for_run(&validation.touched_paths(), &backup_id, run_id)?;

        let report = self.applier.apply(&step.content, &repo).await;
        if !report.success {
            let error = report.error.unwrap_or_else(|| "Patch apply failed".into());
            match backups.restore(&backup_id) {
                Ok(_) => {
                    if let Err(e) = backups.cleanup(&backup_id) {
                        warn!(backup_id = %backup_id, error = %e, "Backup cleanup failed");
                    }
                }
                Err(e) => error!(backup_id = %backup_id, error = %e, "Restore after failed apply failed"),
            }
            return Ok(ApplyOutcome {
                success: false,
                backup_id: None,
                error: Some(error),
                validation: Some(validation),
                modified_files: report.modified_files,
            });
        }

        run.backup_id = Some(backup_id.clone());
        let approved = run
            .pending_confirmation
            .as_ref()
            .is_some_and(|p| p.step_number == step_number && p.step_kind == step_kind);
        if approved && run.status == RunStatus::NeedsApproval {
            run.pending_confirmation = None;
            run.status = RunStatus::Completed;
            info!(run_id, step_number, "Approved diff applied; tests were not run");
            self.emit(WorkflowEvent::StatusChanged {
                run_id: run_id.to_string(),
                status: RunStatus::Completed,
            })
            .await;
        }
        self.persist(&mut run).await;
        self.emit(WorkflowEvent::PatchApplied {
            run_id: run_id.to_string(),
            step_number,
            files: report.modified_files.clone(),
        })
        .await;

        Ok(ApplyOutcome {
            success: true,
            backup_id: Some(backup_id),
            error: None,
            validation: Some(validation),
            modified_files: report.modified_files,
        })
    }

    /// Restore a backup taken by this coordinator and delete it.
    ///
    /// The owning run is locked for the duration and stops referring to the
    /// backup once it is gone.
    pub async fn revert_diff(&self, backup_id: &str) -> RevertOutcome {
        match self.revert_inner(backup_id).await {
            Ok(()) => RevertOutcome {
                success: true,
                error: None,
            },
            Err(e) => {
                warn!(backup_id = %backup_id, error = %e, "Revert failed");
                RevertOutcome {
                    success: false,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn revert_inner(&self, backup_id: &str) -> Result<(), WorkflowError> {
        validate_backup_id(backup_id)?;
        let lookup = BackupManager::new(&self.config.project_root, &self.config.backup_dir);
        let manifest = lookup
            .load_manifest(backup_id)?
            .ok_or_else(|| WorkflowError::NotFound(format!("backup {backup_id}")))?;
        let _guard = match manifest.run_id.as_deref() {
            Some(run_id) => Some(self.acquire(run_id)?),
            None => None,
        };
        let repo_root = manifest
            .repo_root
            .ok_or_else(|| WorkflowError::Validation(format!("backup {backup_id} has no repository")))?;
        let repo = resolve_repo_path(&self.config.project_root, &repo_root)?;

        let backups = BackupManager::new(repo, &self.config.backup_dir);
        if !backups.restore(backup_id)? {
            return Err(WorkflowError::NotFound(format!("backup {backup_id}")));
        }
        backups.cleanup(backup_id)?;
        info!(backup_id = %backup_id, "Backup reverted");

        if let Some(run_id) = manifest.run_id.as_deref() {
            if let Some(mut run) = self.get_run(run_id).await? {
                if run.backup_id.as_deref() == Some(backup_id) {
                    run.backup_id = None;
                    self.persist(&mut run).await;
                }
            }
        }
        Ok(())
    }

    // ── Driver ────────────────────────────────────────────────────────────

    fn acquire(&self, run_id: &str) -> Result<RunGuard, WorkflowError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.insert(run_id.to_string()) {
            return Err(WorkflowError::AlreadyRunning(run_id.to_string()));
        }
        Ok(RunGuard {
            running: Arc::clone(&self.running),
            run_id: run_id.to_string(),
        })
    }

    fn prepare(&self, req: &WorkflowRequest) -> Result<PathBuf, WorkflowError> {
        validate_backup_id(&req.run_id)
            .map_err(|_| WorkflowError::Validation(format!("invalid run id: {}", req.run_id)))?;
        if req.goal.trim().is_empty() {
            return Err(WorkflowError::Validation("goal is empty".into()));
        }
        Ok(resolve_repo_path(&self.config.project_root, &req.repo_path)?)
    }

    /// Refuse to re-drive a stored run that finished or is parked for approval.
    /// Interrupted runs (still `queued` or `running` in the store) restart.
    async fn ensure_restartable(&self, run_id: &str) -> Result<(), WorkflowError> {
        match self.store.get_run(run_id).await {
            Ok(Some(stored)) if stored.status.is_resting() => Err(WorkflowError::Validation(
                format!("run {run_id} is already {}", stored.status),
            )),
            Ok(Some(stored)) => {
                warn!(
                    run_id,
                    status = %stored.status,
                    stale_backup = ?stored.backup_id,
                    "Restarting interrupted run"
                );
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                warn!(run_id, error = %e, "Could not check for an existing run");
                Ok(())
            }
        }
    }

    async fn execute(&self, req: WorkflowRequest, repo: PathBuf, _guard: RunGuard) -> Run {
        let mut run = Run::new(&req.run_id, &req.goal, &repo);
        run.status = RunStatus::Running;
        match self.store.create_run(&run).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => self.persist(&mut run).await,
            Err(e) => warn!(run_id = %run.id, error = %e, "Could not record run"),
        }
        self.emit(WorkflowEvent::StatusChanged {
            run_id: run.id.clone(),
            status: RunStatus::Running,
        })
        .await;
        info!(
            run_id = %run.id,
            repo = %repo.display(),
            skip_tests = req.skip_tests,
            prompt_version = prompts::PROMPT_VERSION,
            "Workflow started"
        );

        let mut ctx = RunContext {
            sm: WorkflowStateMachine::new(&run.id),
            backups: BackupManager::new(&repo, &self.config.backup_dir),
            run,
            repo,
            skip_tests: req.skip_tests,
            plan: String::new(),
            staged: None,
            applied_diff: String::new(),
            last_test: None,
            test_runs: 0,
            steps_recorded: 0,
        };

        let mut phase = WorkflowPhase::Planning;
        loop {
            if let Err(e) = self.enter(&mut ctx, phase).await {
                self.fail(&mut ctx, WorkflowError::Internal(e.to_string())).await;
                break;
            }

            let outcome = match phase {
                WorkflowPhase::Planning => self.plan(&mut ctx).await,
                WorkflowPhase::Implementing => self.implement(&mut ctx).await,
                WorkflowPhase::Applying => self.apply(&mut ctx).await,
                WorkflowPhase::Testing => self.test(&mut ctx).await,
                WorkflowPhase::Fixing => self.fix(&mut ctx).await,
                WorkflowPhase::Reviewing => self.review(&mut ctx).await,
                other => Err(WorkflowError::Internal(format!("no handler for phase {other}"))),
            };

            match outcome {
                Ok(Transition::Next(next)) => phase = next,
                Ok(Transition::AwaitApproval(pending)) => {
                    self.park(&mut ctx, pending).await;
                    break;
                }
                Ok(Transition::Complete) => {
                    self.complete(&mut ctx).await;
                    break;
                }
                Err(e) => {
                    self.fail(&mut ctx, e).await;
                    break;
                }
            }
        }

        info!(
            run_id = %ctx.run.id,
            status = %ctx.run.status,
            fix_attempts = ctx.run.fix_attempts,
            tests_pass = ctx.run.tests_pass,
            transitions = ctx.sm.transitions().len(),
            path = %ctx.sm.summary(),
            "Workflow finished"
        );
        ctx.run
    }

    async fn enter(
        &self,
        ctx: &mut RunContext,
        to: WorkflowPhase,
    ) -> Result<(), crate::state_machine::IllegalTransition> {
        let from = ctx.sm.current();
        ctx.sm.advance(to, None)?;
        self.emit(WorkflowEvent::PhaseChanged {
            run_id: ctx.run.id.clone(),
            from,
            to,
        })
        .await;
        Ok(())
    }

    // ── Phase handlers ────────────────────────────────────────────────────

    async fn plan(&self, ctx: &mut RunContext) -> Result<Transition, WorkflowError> {
        let repo_ctx = RepoContext::gather(&ctx.repo, &ctx.run.goal, &self.sensitive);
        let plan = self
            .ask_model(&prompts::plan_messages(&ctx.run.goal, &repo_ctx))
            .await?;
        self.record_step(ctx, StepKind::Plan, &plan).await;
        ctx.plan = plan;
        Ok(Transition::Next(WorkflowPhase::Implementing))
    }

    async fn implement(&self, ctx: &mut RunContext) -> Result<Transition, WorkflowError> {
        let hint = format!("{}\n{}", ctx.run.goal, ctx.plan);
        let repo_ctx = RepoContext::gather(&ctx.repo, &hint, &self.sensitive);
        let reply = self
            .ask_model(&prompts::implement_messages(&ctx.run.goal, &ctx.plan, &repo_ctx))
            .await?;
        self.stage_diff(ctx, StepKind::Implement, &reply).await
    }

    async fn apply(&self, ctx: &mut RunContext) -> Result<Transition, WorkflowError> {
        let staged = ctx
            .staged
            .take()
            .ok_or_else(|| WorkflowError::Internal("no diff staged for apply".into()))?;

        match ctx.run.backup_id.clone() {
            None => {
                let backup_id = generate_backup_id(&ctx.run.id);
                ctx.backups
                    .backup_for_run(&staged.files, &backup_id, &ctx.run.id)?;
                ctx.run.backup_id = Some(backup_id);
                self.persist(&mut ctx.run).await;
            }
            Some(backup_id) => {
                ctx.backups.extend(&backup_id, &staged.files)?;
            }
        }

        let report = self.applier.apply(&staged.diff, &ctx.repo).await;
        if !report.success {
            return Err(WorkflowError::Apply(
                report.error.unwrap_or_else(|| "git apply failed".into()),
            ));
        }

        self.emit(WorkflowEvent::PatchApplied {
            run_id: ctx.run.id.clone(),
            step_number: staged.step_number,
            files: report.modified_files,
        })
        .await;
        ctx.applied_diff = staged.diff;

        if ctx.skip_tests {
            Ok(Transition::Next(WorkflowPhase::Reviewing))
        } else {
            Ok(Transition::Next(WorkflowPhase::Testing))
        }
    }

    async fn test(&self, ctx: &mut RunContext) -> Result<Transition, WorkflowError> {
        ctx.test_runs += 1;
        let outcome = self.test_runner.run(&ctx.repo).await;

        let summary = format!(
            "attempt {} exit_code={:?} duration_ms={} success={}\n{}",
            ctx.test_runs, outcome.exit_code, outcome.duration_ms, outcome.success, outcome.output
        );
        self.record_step(ctx, StepKind::Test, &summary).await;
        self.emit(WorkflowEvent::TestsFinished {
            run_id: ctx.run.id.clone(),
            attempt: ctx.test_runs,
            success: outcome.success,
            exit_code: outcome.exit_code,
        })
        .await;

        let passed = outcome.success;
        ctx.last_test = Some(outcome);
        if passed {
            ctx.run.tests_pass = true;
            self.persist(&mut ctx.run).await;
            return Ok(Transition::Next(WorkflowPhase::Reviewing));
        }

        ctx.run.fix_attempts += 1;
        ctx.sm.set_attempt(ctx.run.fix_attempts);
        self.persist(&mut ctx.run).await;

        if ctx.test_runs >= self.config.max_fix_attempts {
            return Err(WorkflowError::TestFailure {
                attempts: ctx.run.fix_attempts,
            });
        }

        // Fix diffs are generated against the pre-implementation tree.
        self.restore_original(ctx)?;
        Ok(Transition::Next(WorkflowPhase::Fixing))
    }

    async fn fix(&self, ctx: &mut RunContext) -> Result<Transition, WorkflowError> {
        let test_output = ctx
            .last_test
            .as_ref()
            .map(|t| t.output.as_str())
            .unwrap_or_default();
        let hint = format!("{}\n{}\n{}", ctx.plan, ctx.applied_diff, test_output);
        let repo_ctx = RepoContext::gather(&ctx.repo, &hint, &self.sensitive);
        let messages = prompts::fix_messages(
            &ctx.run.goal,
            &ctx.plan,
            &ctx.applied_diff,
            test_output,
            ctx.run.fix_attempts,
            &repo_ctx,
        );
        let reply = self.ask_model(&messages).await?;
        self.stage_diff(ctx, StepKind::Fix, &reply).await
    }

    async fn review(&self, ctx: &mut RunContext) -> Result<Transition, WorkflowError> {
        let test_summary = match (&ctx.last_test, ctx.skip_tests) {
            (_, true) => "Tests skipped.".to_string(),
            (Some(t), false) => format!(
                "Passed after {} run(s); exit code {:?}.",
                ctx.test_runs, t.exit_code
            ),
            (None, false) => "No test results.".to_string(),
        };
        let messages = prompts::review_messages(&ctx.run.goal, &ctx.applied_diff, &test_summary);
        let review = match self.ask_model(&messages).await {
            Ok(text) => text,
            Err(e) => {
                warn!(run_id = %ctx.run.id, error = %e, "Review unavailable");
                format!("Review unavailable: {e}")
            }
        };
        self.record_step(ctx, StepKind::Review, &review).await;
        Ok(Transition::Complete)
    }

    // ── Shared steps ──────────────────────────────────────────────────────

    /// Extract, record and validate a diff from a model reply.
    async fn stage_diff(
        &self,
        ctx: &mut RunContext,
        kind: StepKind,
        reply: &str,
    ) -> Result<Transition, WorkflowError> {
        let diff = extract_unified_diff(reply).ok_or_else(|| {
            WorkflowError::Validation("Model reply contained no unified diff".into())
        })?;
        let step = self.record_step(ctx, kind, &diff).await;
        let name = diff_name(step.number, kind);

        let validation = self.validator.validate(
            &diff,
            &ctx.repo,
            Some(TokenBinding::new(&ctx.run.id, &name)),
        );
        if !validation.valid {
            return Err(rejection(&validation));
        }

        if validation.requires_confirmation {
            let token = validation.confirmation_token.clone().ok_or_else(|| {
                WorkflowError::Internal("dangerous diff but no confirmation token issued".into())
            })?;
            let dangers = validation
                .danger_summary
                .iter()
                .map(|d| match &d.pattern {
                    Some(p) => format!("{}: {} ({p})", d.reason, d.file),
                    None => format!("{}: {}", d.reason, d.file),
                })
                .collect();
            return Ok(Transition::AwaitApproval(PendingConfirmation {
                step_number: step.number,
                step_kind: kind,
                token,
                dangers,
            }));
        }

        ctx.staged = Some(StagedDiff {
            step_number: step.number,
            files: validation.touched_paths(),
            diff,
        });
        Ok(Transition::Next(WorkflowPhase::Applying))
    }

    async fn ask_model(&self, messages: &[ChatMessage]) -> Result<String, WorkflowError> {
        let stream = self.model.chat_stream(messages).await?;
        let text = collect_text(stream).await?;
        if text.trim().is_empty() {
            return Err(ModelError::EmptyResponse.into());
        }
        Ok(text)
    }

    fn restore_original(&self, ctx: &RunContext) -> Result<(), WorkflowError> {
        let backup_id = ctx
            .run
            .backup_id
            .as_deref()
            .ok_or_else(|| WorkflowError::Internal("no backup to restore".into()))?;
        match ctx.backups.restore(backup_id) {
            Ok(true) => Ok(()),
            Ok(false) => Err(restore_failure(
                backup_id,
                PatchError::restore(backup_id, "manifest missing"),
            )),
            Err(e) => Err(restore_failure(backup_id, e)),
        }
    }

    async fn record_step(&self, ctx: &mut RunContext, kind: StepKind, content: &str) -> Step {
        ctx.steps_recorded += 1;
        let step = match self.store.append_step(&ctx.run.id, kind, content).await {
            Ok(step) => step,
            Err(e) => {
                warn!(run_id = %ctx.run.id, error = %e, "Could not record step");
                Step {
                    number: ctx.steps_recorded,
                    kind,
                    content: content.to_string(),
                    created_at: chrono::Utc::now(),
                }
            }
        };
        self.emit(WorkflowEvent::StepRecorded {
            run_id: ctx.run.id.clone(),
            step_number: step.number,
            kind,
        })
        .await;
        step
    }

    // ── Terminal handling ─────────────────────────────────────────────────

    async fn park(&self, ctx: &mut RunContext, pending: PendingConfirmation) {
        if let Err(e) = ctx.sm.advance(WorkflowPhase::NeedsApproval, Some("confirmation required")) {
            self.fail(ctx, WorkflowError::Internal(e.to_string())).await;
            return;
        }

        // A fix awaiting approval starts from the restored original tree, so
        // the run's snapshot is no longer needed.
        if let Some(backup_id) = ctx.run.backup_id.take() {
            if let Err(e) = ctx.backups.cleanup(&backup_id) {
                warn!(backup_id = %backup_id, error = %e, "Backup cleanup failed");
            }
        }

        let event = WorkflowEvent::ApprovalRequired {
            run_id: ctx.run.id.clone(),
            step_number: pending.step_number,
            diff_name: diff_name(pending.step_number, pending.step_kind),
            token: pending.token.clone(),
            dangers: pending.dangers.clone(),
        };
        info!(
            run_id = %ctx.run.id,
            step = pending.step_number,
            dangers = ?pending.dangers,
            "Diff requires confirmation"
        );
        ctx.run.status = RunStatus::NeedsApproval;
        ctx.run.pending_confirmation = Some(pending);
        self.persist(&mut ctx.run).await;
        self.emit(event).await;
        self.emit(WorkflowEvent::StatusChanged {
            run_id: ctx.run.id.clone(),
            status: RunStatus::NeedsApproval,
        })
        .await;
    }

    async fn complete(&self, ctx: &mut RunContext) {
        if let Err(e) = ctx.sm.advance(WorkflowPhase::Completed, None) {
            self.fail(ctx, WorkflowError::Internal(e.to_string())).await;
            return;
        }
        if let Some(backup_id) = ctx.run.backup_id.take() {
            if let Err(e) = ctx.backups.cleanup(&backup_id) {
                warn!(backup_id = %backup_id, error = %e, "Backup cleanup failed");
            }
        }
        ctx.run.status = RunStatus::Completed;
        self.persist(&mut ctx.run).await;
        self.emit(WorkflowEvent::StatusChanged {
            run_id: ctx.run.id.clone(),
            status: RunStatus::Completed,
        })
        .await;
    }

    async fn fail(&self, ctx: &mut RunContext, err: WorkflowError) {
        let mut message = err.to_string();
        warn!(
            run_id = %ctx.run.id,
            kind = %err.kind(),
            requires_restore = err.requires_restore(),
            attempt = ctx.sm.attempt(),
            error = %message,
            "Workflow failed"
        );

        if let Some(backup_id) = ctx.run.backup_id.clone() {
            if err.kind() == ErrorKind::Restore {
                // Retrying would hit the same failure; keep the snapshot for
                // manual recovery.
                error!(
                    run_id = %ctx.run.id,
                    backup_id = %backup_id,
                    "Tree may be inconsistent; backup kept for manual revert"
                );
            } else if err.requires_restore() {
                let restored = ctx.backups.restore(&backup_id);
                let success = matches!(restored, Ok(true));
                match restored {
                    Ok(true) => self.discard_backup(ctx, &backup_id),
                    Ok(false) => {
                        error!(run_id = %ctx.run.id, backup_id = %backup_id, "Restore failed: manifest missing");
                        message.push_str(&format!("; restore of {backup_id} failed: manifest missing"));
                    }
                    Err(e) => {
                        let e = restore_failure(&backup_id, e);
                        error!(run_id = %ctx.run.id, backup_id = %backup_id, error = %e, "Restore failed");
                        message.push_str(&format!("; {e}"));
                    }
                }
                self.emit(WorkflowEvent::Restored {
                    run_id: ctx.run.id.clone(),
                    backup_id,
                    success,
                })
                .await;
            } else {
                // Rejected before anything was applied over the original tree.
                self.discard_backup(ctx, &backup_id);
            }
        }

        if !ctx.sm.is_terminal() {
            if let Err(e) = ctx.sm.fail(&message) {
                debug!(error = %e, "State machine already terminal");
            }
        }
        ctx.run.status = RunStatus::Failed;
        ctx.run.error = Some(message);
        self.persist(&mut ctx.run).await;
        self.emit(WorkflowEvent::StatusChanged {
            run_id: ctx.run.id.clone(),
            status: RunStatus::Failed,
        })
        .await;
    }

    fn discard_backup(&self, ctx: &mut RunContext, backup_id: &str) {
        if let Err(e) = ctx.backups.cleanup(backup_id) {
            warn!(backup_id = %backup_id, error = %e, "Backup cleanup failed");
        }
        ctx.run.backup_id = None;
    }

    async fn persist(&self, run: &mut Run) {
        run.touch();
        if let Err(e) = self.store.update_run(run).await {
            warn!(run_id = %run.id, error = %e, "Could not persist run");
        }
    }

    async fn emit(&self, event: WorkflowEvent) {
        if let Err(e) = self.store.append_event(event.to_run_event()).await {
            debug!(error = %e, "Could not persist event");
        }
        self.events.publish(event);
    }
}

/// Report any error from restoring `backup_id` as a restore failure, so the
/// run keeps the snapshot instead of retrying it.
fn restore_failure(backup_id: &str, err: PatchError) -> WorkflowError {
    if err.is_unrecoverable() {
        err.into()
    } else {
        WorkflowError::Restore {
            backup_id: backup_id.to_string(),
            message: err.to_string(),
        }
    }
}

/// Map a failed validation to the matching error kind.
fn rejection(validation: &ValidationResult) -> WorkflowError {
    let message = validation.errors.join("; ");
    let unsafe_patch = validation
        .errors
        .iter()
        .any(|e| e.starts_with("Path traversal") || e.starts_with("Too many"));
    if unsafe_patch {
        WorkflowError::SafetyViolation(message)
    } else {
        WorkflowError::Validation(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryRunStore;
    use async_trait::async_trait;

    struct Silent;

    #[async_trait]
    impl ModelBackend for Silent {
        async fn chat(&self, _messages: &[ChatMessage]) -> Result<String, ModelError> {
            Err(ModelError::EmptyResponse)
        }
    }

    struct AlwaysPass;

    #[async_trait]
    impl TestRunner for AlwaysPass {
        async fn run(&self, _repo: &Path) -> TestOutcome {
            TestOutcome {
                success: true,
                ..Default::default()
            }
        }
    }

    fn coordinator(project: &Path) -> WorkflowCoordinator {
        let config = WorkflowConfig {
            project_root: project.to_path_buf(),
            backup_dir: project.join(".backups"),
            ..Default::default()
        };
        WorkflowCoordinator::new(
            config,
            Arc::new(Silent),
            Arc::new(MemoryRunStore::new()),
            Arc::new(AlwaysPass),
        )
    }

    #[test]
    fn test_guard_released_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let c = coordinator(tmp.path());
        let guard = c.acquire("r1").unwrap();
        assert!(c.is_workflow_running("r1"));
        assert!(matches!(c.acquire("r1"), Err(WorkflowError::AlreadyRunning(_))));
        drop(guard);
        assert!(!c.is_workflow_running("r1"));
    }

    #[tokio::test]
    async fn test_repo_outside_project_root_rejected() {
        let project = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let c = coordinator(project.path());
        let req = WorkflowRequest::new("do something", elsewhere.path());
        let err = c.run_auto_workflow(req.clone()).await.unwrap_err();
        assert_eq!(err.kind(), crate::errors::ErrorKind::SafetyViolation);
        assert!(!c.is_workflow_running(&req.run_id));
    }

    #[tokio::test]
    async fn test_model_failure_fails_run_without_backup() {
        let project = tempfile::tempdir().unwrap();
        let c = coordinator(project.path());
        let run = c
            .run_auto_workflow(WorkflowRequest::new("goal", "."))
            .await
            .unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.unwrap().contains("empty response"));
        assert!(run.backup_id.is_none());
    }

    #[tokio::test]
    async fn test_revert_waits_for_owning_run() {
        let project = tempfile::tempdir().unwrap();
        let c = coordinator(project.path());
        std::fs::write(project.path().join("a.txt"), "original").unwrap();
        let backups = BackupManager::new(project.path(), project.path().join(".backups"));
        backups
            .backup_for_run(&["a.txt".to_string()], "r1-backup", "r1")
            .unwrap();
        std::fs::write(project.path().join("a.txt"), "patched").unwrap();

        let guard = c.acquire("r1").unwrap();
        let busy = c.revert_diff("r1-backup").await;
        assert!(!busy.success);
        assert!(busy.error.unwrap().contains("already running"));
        assert_eq!(std::fs::read_to_string(project.path().join("a.txt")).unwrap(), "patched");

        drop(guard);
        let done = c.revert_diff("r1-backup").await;
        assert!(done.success, "{:?}", done.error);
        assert_eq!(std::fs::read_to_string(project.path().join("a.txt")).unwrap(), "original");
        assert!(!c.is_workflow_running("r1"));
    }

    #[test]
    fn test_restore_errors_always_surface_as_restore() {
        let io = restore_failure("b1", PatchError::Io(std::io::Error::other("disk gone")));
        assert_eq!(io.kind(), ErrorKind::Restore);
        assert!(!io.requires_restore());
        assert!(io.to_string().contains("disk gone"));

        let copy = restore_failure("b1", PatchError::restore("b1", "a.txt: denied"));
        assert!(matches!(copy, WorkflowError::Restore { ref message, .. } if message == "a.txt: denied"));
    }

    #[test]
    fn test_rejection_classification() {
        let traversal = ValidationResult {
            errors: vec!["Path traversal detected: ../x".into()],
            ..Default::default()
        };
        assert!(matches!(rejection(&traversal), WorkflowError::SafetyViolation(_)));
        let missing = ValidationResult {
            errors: vec!["Cannot modify non-existent file: a".into()],
            ..Default::default()
        };
        assert!(matches!(rejection(&missing), WorkflowError::Validation(_)));
    }
}
