//! Run engine: turns a plan into gated, audited, resumable step executions.
//!
//! Every run carries two locks. The state lock guards the [`Run`] itself and
//! is held only for short, non-tool sections. The driver lock is held for the
//! whole of a drive so two steps of one run never execute concurrently; status
//! queries, `pause` and `stop` stay available while a step is in flight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use gantry_tools::{
    AllowRule, ApprovalDecision, ApprovalRequest, ApprovalScope, ArtifactStore, AuditLogger,
    AuditRecord, AuditResult, Execution, FailureKind, Outcome, PolicyContext, PolicyDecision,
    PolicyExplanation, PolicyMode, ProcessPoll, ProcessStatus, ProcessSupervisor, Tier,
    ToolCallRequest, ToolDefinition, ToolExecutor, ToolFilter, ToolId, ToolOutput, ToolRegistry,
    WorkspaceBoundary, format_poll,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::EngineError;
use crate::run::{PauseReason, PlannedStep, Run, RunState, StepStatus};
use crate::store::RunStore;

const AUDIT_SUMMARY_CHARS: usize = 512;

/// Engine knobs derived from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub workspace_id: String,
    pub boundary: WorkspaceBoundary,
    pub mode: PolicyMode,
    pub allow_shell: bool,
    pub allow_network: bool,
    pub exec_allowlist: Vec<AllowRule>,
    pub max_step_attempts: u32,
    pub poll_interval: Duration,
}

impl EngineSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            workspace_id: config.workspace.id.clone(),
            boundary: config.boundary(),
            mode: config.policy.mode,
            allow_shell: config.policy.allow_shell,
            allow_network: config.policy.allow_network,
            exec_allowlist: config.policy.exec_allowlist.clone(),
            max_step_attempts: config.engine.max_step_attempts,
            poll_interval: Duration::from_millis(config.process.poll_interval_ms),
        }
    }
}

/// Collaborators the engine is assembled from.
pub struct EngineParts<E> {
    pub registry: ToolRegistry,
    pub executor: E,
    pub supervisor: ProcessSupervisor,
    pub audit: AuditLogger,
    pub artifacts: ArtifactStore,
    pub store: RunStore,
    pub settings: EngineSettings,
}

/// How far a drive goes before handing control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drive {
    /// Until the next gate or the end of the plan.
    Continue,
    /// Exactly one step, then pause.
    Single,
}

/// Accepted keys for [`RunEngine::edit`].
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepEdit {
    pub intent: Option<String>,
    pub tool_id: Option<String>,
    pub arguments: Option<serde_json::Value>,
    pub declared_tier: Option<Tier>,
}

struct RunSlot {
    run: Mutex<Run>,
    driver: Mutex<()>,
}

impl RunSlot {
    fn new(run: Run) -> Arc<Self> {
        Arc::new(Self {
            run: Mutex::new(run),
            driver: Mutex::new(()),
        })
    }
}

struct Inner<E> {
    registry: ToolRegistry,
    executor: E,
    supervisor: ProcessSupervisor,
    audit: AuditLogger,
    artifacts: ArtifactStore,
    store: RunStore,
    settings: EngineSettings,
    runs: std::sync::Mutex<HashMap<String, Arc<RunSlot>>>,
    cancel: CancellationToken,
}

/// A step that passed the policy gate and is about to execute.
struct Dispatch {
    run_id: String,
    index: usize,
    step_id: String,
    attempt: u32,
    tool: ToolDefinition,
    call: ToolCallRequest,
    decision: PolicyDecision,
}

enum StepOutcome {
    Done(ToolOutput),
    Failed {
        kind: FailureKind,
        message: String,
        output: Option<String>,
    },
}

impl StepOutcome {
    fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::Failed {
            kind,
            message: message.into(),
            output: None,
        }
    }
}

enum Gate {
    Stop,
    Dispatch(Box<Dispatch>),
}

#[derive(PartialEq, Eq)]
enum Flow {
    Next,
    Stop,
}

pub struct RunEngine<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for RunEngine<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: ToolExecutor> RunEngine<E> {
    #[must_use]
    pub fn new(parts: EngineParts<E>) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: parts.registry,
                executor: parts.executor,
                supervisor: parts.supervisor,
                audit: parts.audit,
                artifacts: parts.artifacts,
                store: parts.store,
                settings: parts.settings,
                runs: std::sync::Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ToolRegistry {
        &self.inner.registry
    }

    #[must_use]
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.inner.supervisor
    }

    #[must_use]
    pub fn artifacts(&self) -> &ArtifactStore {
        &self.inner.artifacts
    }

    #[must_use]
    pub fn audit(&self) -> &AuditLogger {
        &self.inner.audit
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Cancelled on shutdown; in-flight drives return without settling their
    /// step so the run is picked up as interrupted next time.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    /// Create a run in `IDLE`.
    ///
    /// # Errors
    ///
    /// Returns an error if the run cannot be persisted.
    pub async fn create_run(&self, goal: &str) -> Result<Run, EngineError> {
        let run = Run::new(goal, &self.inner.settings.workspace_id, self.inner.settings.mode);
        self.inner.store.save(&run).await?;
        tracing::info!(run_id = %run.id, goal, "run created");
        let snapshot = run.clone();
        self.insert(run);
        Ok(snapshot)
    }

    /// Accept the initial plan: `IDLE`/`PLANNING` to `RUNNING`.
    ///
    /// Every tool must resolve; on failure the run stays in `PLANNING` with no
    /// steps added.
    ///
    /// # Errors
    ///
    /// `InvalidPlan` listing every unresolvable step, `TerminalRun` for a
    /// finished run, `InvalidTransition` once the run has started.
    pub async fn submit_plan(
        &self,
        run_id: &str,
        steps: Vec<PlannedStep>,
    ) -> Result<Run, EngineError> {
        let slot = self.slot(run_id)?;
        let mut run = slot.run.lock().await;
        ensure_open(&run)?;
        if !matches!(run.state, RunState::Idle | RunState::Planning) {
            return Err(EngineError::InvalidTransition {
                action: "submit a new plan",
                state: run.state,
            });
        }
        run.set_state(RunState::Planning);
        match self.validate(&steps) {
            Ok(resolved) => {
                let ids = run.push_steps(resolved);
                tracing::info!(run_id, steps = ids.len(), "plan accepted");
                run.set_state(RunState::Running);
                self.inner.store.save(&run).await?;
                Ok(run.clone())
            }
            Err(e) => {
                run.record(format!("plan rejected: {e}"));
                self.inner.store.save(&run).await?;
                Err(e)
            }
        }
    }

    /// Append steps to a live run. Before a plan exists this is the same as
    /// [`RunEngine::submit_plan`].
    ///
    /// # Errors
    ///
    /// `TerminalRun` once the run has finished, `InvalidPlan` when a tool does
    /// not resolve.
    pub async fn add_steps(
        &self,
        run_id: &str,
        steps: Vec<PlannedStep>,
    ) -> Result<Vec<String>, EngineError> {
        let slot = self.slot(run_id)?;
        let mut run = slot.run.lock().await;
        ensure_open(&run)?;
        if matches!(run.state, RunState::Idle | RunState::Planning) {
            drop(run);
            let run = self.submit_plan(run_id, steps).await?;
            return Ok(run.plan.iter().map(|s| s.id.clone()).collect());
        }
        let resolved = self.validate(&steps)?;
        let ids = run.push_steps(resolved);
        tracing::info!(run_id, added = ids.len(), "steps appended");
        self.inner.store.save(&run).await?;
        Ok(ids)
    }

    fn validate(
        &self,
        steps: &[PlannedStep],
    ) -> Result<Vec<(PlannedStep, ToolId, Tier)>, EngineError> {
        if steps.is_empty() {
            return Err(EngineError::InvalidPlan("plan has no steps".into()));
        }
        let mut resolved = Vec::with_capacity(steps.len());
        let mut problems = Vec::new();
        for (i, step) in steps.iter().enumerate() {
            match self.inner.registry.resolve(&step.tool_id) {
                Ok(tool) => resolved.push((step.clone(), tool.id.clone(), tool.tier())),
                Err(e) => problems.push(format!("step {} ({}): {e}", i + 1, step.tool_id)),
            }
        }
        if problems.is_empty() {
            Ok(resolved)
        } else {
            Err(EngineError::InvalidPlan(problems.join("; ")))
        }
    }

    /// `continue` / `resume`: run steps until the next gate or plan end.
    ///
    /// # Errors
    ///
    /// See [`RunEngine::drive`].
    pub async fn continue_run(&self, run_id: &str) -> Result<Run, EngineError> {
        self.drive(run_id, Drive::Continue).await
    }

    /// `next`: execute exactly one step, then pause.
    ///
    /// # Errors
    ///
    /// See [`RunEngine::drive`].
    pub async fn step_once(&self, run_id: &str) -> Result<Run, EngineError> {
        self.drive(run_id, Drive::Single).await
    }

    /// Put the run in `RUNNING` and execute steps sequentially.
    ///
    /// Returns when the run pauses, finishes, or the engine shuts down. The
    /// blocking step is always re-evaluated against the current policy.
    ///
    /// # Errors
    ///
    /// `Busy` when another drive holds the run, `TerminalRun` for a finished
    /// run, `InvalidTransition` before a plan was accepted.
    pub async fn drive(&self, run_id: &str, mode: Drive) -> Result<Run, EngineError> {
        let slot = self.slot(run_id)?;
        let Ok(_driver) = slot.driver.try_lock() else {
            return Err(EngineError::Busy(run_id.to_owned()));
        };
        {
            let mut run = slot.run.lock().await;
            ensure_open(&run)?;
            match run.state {
                RunState::Running | RunState::Paused => {
                    // A policy denial is re-checked under the current mode and grants.
                    if let Some(PauseReason::PolicyDenied { step_id, .. }) = run.pause_reason.clone()
                        && let Some(index) = run.step_index(&step_id)
                        && run.plan[index].status == StepStatus::Failed
                    {
                        run.plan[index].reset();
                        run.record(format!("step {step_id}: re-evaluating denied step"));
                    }
                    run.set_state(RunState::Running);
                    self.inner.store.save(&run).await?;
                }
                state => {
                    return Err(EngineError::InvalidTransition {
                        action: "execute steps",
                        state,
                    });
                }
            }
        }

        while !self.inner.cancel.is_cancelled() {
            let dispatch = match self.gate(&slot).await? {
                Gate::Stop => break,
                Gate::Dispatch(d) => d,
            };
            let started = Instant::now();
            let Some(outcome) = self.execute(&slot, &dispatch).await else {
                tracing::info!(
                    run_id,
                    step_id = %dispatch.step_id,
                    "engine shutting down, step left in flight"
                );
                break;
            };
            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            if self.settle(&slot, &dispatch, outcome, elapsed, mode).await? == Flow::Stop {
                break;
            }
        }

        Ok(slot.run.lock().await.clone())
    }

    /// Pick the next step and run it through the policy gate.
    async fn gate(&self, slot: &RunSlot) -> Result<Gate, EngineError> {
        let mut run = slot.run.lock().await;
        if run.state != RunState::Running {
            return Ok(Gate::Stop);
        }
        let Some(index) = run.next_actionable() else {
            run.set_state(RunState::Completed);
            tracing::info!(run_id = %run.id, "run completed");
            self.inner.store.save(&run).await?;
            return Ok(Gate::Stop);
        };

        let step = &run.plan[index];
        match step.status {
            StepStatus::Failed => {
                let failure = step.failure.clone();
                let reason = PauseReason::StepFailed {
                    step_id: step.id.clone(),
                    kind: failure.as_ref().map_or(FailureKind::InternalError, |f| f.kind),
                    detail: failure.map(|f| f.message).unwrap_or_default(),
                };
                run.pause(reason);
                self.inner.store.save(&run).await?;
                return Ok(Gate::Stop);
            }
            StepStatus::Running => {
                return Err(EngineError::Internal(format!(
                    "step {} is already running",
                    step.id
                )));
            }
            _ => {}
        }

        let run_id = run.id.clone();
        let step_id = step.id.clone();
        let declared = step.declared_tier;
        let arguments = step.arguments.clone();
        let tool = match self.inner.registry.resolve(&step.tool_id.to_string()) {
            Ok(tool) => tool.clone(),
            Err(e) => {
                let tool_id = step.tool_id.clone();
                let message = e.to_string();
                run.plan[index].fail(FailureKind::InternalError, &message);
                let record = AuditRecord::new(
                    &run_id,
                    &step_id,
                    &tool_id,
                    &arguments,
                    None,
                    AuditResult::Failed {
                        kind: FailureKind::InternalError,
                        message: message.clone(),
                    },
                );
                self.audit_into(&mut run, &record).await;
                run.pause(PauseReason::StepFailed {
                    step_id,
                    kind: FailureKind::InternalError,
                    detail: message,
                });
                self.inner.store.save(&run).await?;
                return Ok(Gate::Stop);
            }
        };

        let ctx = self.policy_context(run.approvals.session_grants());
        let decision = gantry_tools::evaluate(&tool, &arguments, declared, run.mode, &ctx);
        let call = ToolCallRequest::new(tool.id.clone(), arguments.clone(), &run_id, &step_id);
        run.plan[index].tier = decision.effective_tier;
        run.plan[index].decision = Some(decision.clone());

        match decision.outcome {
            Outcome::Deny => {
                let kind = decision.failure_kind().unwrap_or(FailureKind::PolicyDenied);
                tracing::warn!(
                    run_id = %run_id,
                    step_id = %step_id,
                    tool_id = %tool.id,
                    rule = %decision.matched_rule,
                    "tool call denied: {}",
                    decision.reason
                );
                run.plan[index].fail(kind, &decision.reason);
                let record = AuditRecord::new(
                    &run_id,
                    &step_id,
                    &tool.id,
                    &arguments,
                    Some(decision.clone()),
                    AuditResult::Denied {
                        kind,
                        reason: decision.reason.clone(),
                    },
                );
                self.audit_into(&mut run, &record).await;
                run.pause(PauseReason::PolicyDenied {
                    step_id,
                    kind,
                    detail: decision.reason,
                });
                self.inner.store.save(&run).await?;
                return Ok(Gate::Stop);
            }
            Outcome::RequireApproval => {
                if run.approvals.take_once(&call, decision.effective_tier) {
                    run.record(format!("step {step_id}: one-time approval consumed"));
                } else {
                    let request = run.approvals.request(call, decision.effective_tier);
                    let record = AuditRecord::new(
                        &run_id,
                        &step_id,
                        &tool.id,
                        &arguments,
                        Some(decision),
                        AuditResult::ApprovalRequired {
                            approval_id: request.id.clone(),
                        },
                    );
                    self.audit_into(&mut run, &record).await;
                    run.pause(PauseReason::ApprovalRequired {
                        step_id,
                        approval_id: request.id,
                    });
                    self.inner.store.save(&run).await?;
                    return Ok(Gate::Stop);
                }
            }
            Outcome::Allow => {}
        }

        let step = &mut run.plan[index];
        step.status = StepStatus::Running;
        step.attempts += 1;
        step.started_at = Some(Utc::now());
        step.finished_at = None;
        step.failure = None;
        step.stalled = false;
        let attempt = step.attempts;
        run.record(format!("step {step_id} started (attempt {attempt})"));
        self.inner.store.save(&run).await?;
        tracing::info!(
            run_id = %run_id,
            step_id = %step_id,
            tool_id = %tool.id,
            attempt,
            rule = %decision.matched_rule,
            "dispatching step"
        );

        Ok(Gate::Dispatch(Box::new(Dispatch {
            run_id,
            index,
            step_id,
            attempt,
            tool,
            call,
            decision,
        })))
    }

    /// Run the tool without holding the state lock. `None` on shutdown.
    async fn execute(&self, slot: &RunSlot, d: &Dispatch) -> Option<StepOutcome> {
        let result = tokio::select! {
            () = self.inner.cancel.cancelled() => return None,
            result = self.inner.executor.execute_tool_call(&d.call) => result,
        };
        match result {
            Ok(Some(output)) => {
                if d.tool.execution == Execution::Background
                    && let Some(process_id) = output.process_id.clone()
                {
                    return self.observe(slot, d, &process_id).await;
                }
                if output.success {
                    Some(StepOutcome::Done(output))
                } else {
                    Some(StepOutcome::Failed {
                        kind: FailureKind::ToolFailed,
                        message: first_line(&output.summary),
                        output: Some(output.summary),
                    })
                }
            }
            Ok(None) => Some(StepOutcome::failed(
                FailureKind::InternalError,
                format!("no executor handles {}", d.tool.id),
            )),
            Err(e) => Some(StepOutcome::failed(e.failure_kind(), e.to_string())),
        }
    }

    /// Poll a background process until it exits. Only the poll loop waits;
    /// the run stays responsive to status, pause and stop.
    async fn observe(&self, slot: &RunSlot, d: &Dispatch, process_id: &str) -> Option<StepOutcome> {
        {
            let mut run = slot.run.lock().await;
            if let Some(step) = run.plan.get_mut(d.index) {
                step.result_ref = Some(process_id.to_owned());
            }
            run.record(format!("step {} started process {process_id}", d.step_id));
            self.save_quietly(&run).await;
        }

        let mut stalled = false;
        loop {
            tokio::select! {
                () = self.inner.cancel.cancelled() => return None,
                () = tokio::time::sleep(self.inner.settings.poll_interval) => {}
            }
            let poll = match self.inner.supervisor.poll(process_id) {
                Ok(poll) => poll,
                Err(e) => return Some(StepOutcome::failed(FailureKind::InternalError, e.to_string())),
            };
            if !poll.running {
                return Some(process_outcome(&poll, stalled));
            }

            let mut run = slot.run.lock().await;
            if !owns_step(&run, d) {
                // Stopped or cancelled underneath us.
                drop(run);
                let _ = self.inner.supervisor.kill(process_id, false).await;
                return Some(StepOutcome::failed(
                    FailureKind::OperatorCancelled,
                    "step cancelled while its process was running",
                ));
            }
            if poll.stalled != stalled {
                stalled = poll.stalled;
                run.plan[d.index].stalled = stalled;
                if stalled {
                    tracing::warn!(
                        run_id = %d.run_id,
                        step_id = %d.step_id,
                        process_id,
                        "no output within the quiet window, process possibly hung"
                    );
                    run.record(format!("step {}: process {process_id} possibly hung", d.step_id));
                } else {
                    run.record(format!("step {}: process {process_id} output resumed", d.step_id));
                }
                self.save_quietly(&run).await;
            }
        }
    }

    /// Record the outcome of a dispatched step and decide whether to go on.
    async fn settle(
        &self,
        slot: &RunSlot,
        d: &Dispatch,
        outcome: StepOutcome,
        duration_ms: u64,
        mode: Drive,
    ) -> Result<Flow, EngineError> {
        let mut run = slot.run.lock().await;
        if !owns_step(&run, d) {
            tracing::info!(
                run_id = %d.run_id,
                step_id = %d.step_id,
                "step outcome discarded, step was cancelled"
            );
            return Ok(Flow::Stop);
        }

        match outcome {
            StepOutcome::Done(output) => {
                let artifact_ids = self.register_artifacts(&mut run, d, &output.artifacts).await;
                let step = &mut run.plan[d.index];
                step.status = StepStatus::Done;
                step.finished_at = Some(Utc::now());
                step.result_ref = output
                    .process_id
                    .clone()
                    .or_else(|| artifact_ids.first().cloned());
                step.artifacts.clone_from(&artifact_ids);
                step.output = Some(output.summary.clone());
                tracing::info!(
                    run_id = %d.run_id,
                    step_id = %d.step_id,
                    tool_id = %d.tool.id,
                    duration_ms,
                    "step done"
                );
                let record = AuditRecord::new(
                    &d.run_id,
                    &d.step_id,
                    &d.tool.id,
                    &d.call.arguments,
                    Some(d.decision.clone()),
                    AuditResult::Success {
                        summary: brief(&output.summary),
                    },
                )
                .duration_ms(duration_ms)
                .artifacts(artifact_ids);
                self.audit_into(&mut run, &record).await;
                run.record(format!("step {} done", d.step_id));
            }
            StepOutcome::Failed {
                kind,
                message,
                output,
            } => {
                let step = &mut run.plan[d.index];
                step.fail(kind, &message);
                step.output = output;
                let attempts = step.attempts;
                tracing::warn!(
                    run_id = %d.run_id,
                    step_id = %d.step_id,
                    tool_id = %d.tool.id,
                    kind = %kind,
                    attempts,
                    "step failed: {message}"
                );
                let record = AuditRecord::new(
                    &d.run_id,
                    &d.step_id,
                    &d.tool.id,
                    &d.call.arguments,
                    Some(d.decision.clone()),
                    AuditResult::Failed {
                        kind,
                        message: message.clone(),
                    },
                )
                .duration_ms(duration_ms);
                self.audit_into(&mut run, &record).await;

                if attempts >= self.inner.settings.max_step_attempts {
                    run.record(format!(
                        "step {} failed after {attempts} attempt(s): {kind}",
                        d.step_id
                    ));
                    run.set_state(RunState::Failed);
                    tracing::warn!(run_id = %d.run_id, "run failed, step attempts exhausted");
                } else if run.state == RunState::Running {
                    run.pause(PauseReason::StepFailed {
                        step_id: d.step_id.clone(),
                        kind,
                        detail: message,
                    });
                }
            }
        }

        let mut flow = Flow::Stop;
        if run.state == RunState::Running {
            if run.all_settled() {
                run.set_state(RunState::Completed);
                tracing::info!(run_id = %d.run_id, "run completed");
            } else if mode == Drive::Single {
                run.pause(PauseReason::ManualStep);
            } else {
                flow = Flow::Next;
            }
        }
        self.inner.store.save(&run).await?;
        Ok(flow)
    }

    async fn register_artifacts(
        &self,
        run: &mut Run,
        d: &Dispatch,
        paths: &[std::path::PathBuf],
    ) -> Vec<String> {
        let mut ids = Vec::with_capacity(paths.len());
        for path in paths {
            match self
                .inner
                .artifacts
                .register(path, &d.run_id, &d.step_id, &d.tool.id)
                .await
            {
                Ok(artifact) => ids.push(artifact.id),
                Err(e) => {
                    tracing::warn!(
                        run_id = %d.run_id,
                        step_id = %d.step_id,
                        path = %path.display(),
                        "{}: {e}; the tool effect stands, audit trail degraded",
                        FailureKind::ArtifactWriteFailed
                    );
                    run.degraded_audit = true;
                    run.record(format!(
                        "{} for {}: {e}",
                        FailureKind::ArtifactWriteFailed,
                        path.display()
                    ));
                }
            }
        }
        ids
    }

    /// Write an audit record; failure marks the run degraded instead of
    /// undoing anything.
    async fn audit_into(&self, run: &mut Run, record: &AuditRecord) {
        if let Err(e) = self.inner.audit.log(record).await {
            tracing::warn!(
                run_id = %record.run_id,
                step_id = %record.step_id,
                "audit write failed, audit trail degraded: {e}"
            );
            run.degraded_audit = true;
            run.record(format!("audit write failed for step {}: {e}", record.step_id));
        }
    }

    async fn save_quietly(&self, run: &Run) {
        if let Err(e) = self.inner.store.save(run).await {
            tracing::warn!(run_id = %run.id, "failed to persist run: {e}");
        }
    }

    fn policy_context(&self, approvals: std::collections::BTreeSet<(ToolId, Tier)>) -> PolicyContext {
        let settings = &self.inner.settings;
        let mut ctx = PolicyContext::new(settings.boundary.clone()).with_approvals(approvals);
        ctx.allow_shell = settings.allow_shell;
        ctx.allow_network = settings.allow_network;
        ctx.exec_allowlist.clone_from(&settings.exec_allowlist);
        ctx
    }

    /// `RUNNING` to `PAUSED`. Pausing a paused run is a no-op. A step already
    /// in flight finishes and is recorded.
    ///
    /// # Errors
    ///
    /// `TerminalRun` for a finished run, `InvalidTransition` before a plan.
    pub async fn pause(&self, run_id: &str) -> Result<Run, EngineError> {
        let slot = self.slot(run_id)?;
        let mut run = slot.run.lock().await;
        ensure_open(&run)?;
        match run.state {
            RunState::Running => {
                run.pause(PauseReason::Operator);
                self.inner.store.save(&run).await?;
                tracing::info!(run_id, "run paused by operator");
            }
            RunState::Paused => {}
            state => {
                return Err(EngineError::InvalidTransition {
                    action: "pause",
                    state,
                });
            }
        }
        Ok(run.clone())
    }

    /// Terminate the run. Live processes are killed before their steps are
    /// marked `FAILED(OperatorCancelled)`. Stopping a stopped run is a no-op.
    ///
    /// # Errors
    ///
    /// `TerminalRun` when the run already completed, failed or was archived.
    pub async fn stop(&self, run_id: &str) -> Result<Run, EngineError> {
        let slot = self.slot(run_id)?;
        let mut run = slot.run.lock().await;
        if run.state == RunState::Stopped {
            return Ok(run.clone());
        }
        ensure_open(&run)?;

        self.inner.supervisor.kill_run(run_id).await;
        let running: Vec<usize> = run
            .plan
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status == StepStatus::Running)
            .map(|(i, _)| i)
            .collect();
        for index in running {
            let step = &mut run.plan[index];
            step.fail(FailureKind::OperatorCancelled, "run stopped by operator");
            let record = AuditRecord::new(
                run_id,
                &step.id,
                &step.tool_id,
                &step.arguments,
                step.decision.clone(),
                AuditResult::Failed {
                    kind: FailureKind::OperatorCancelled,
                    message: "run stopped by operator".into(),
                },
            );
            self.audit_into(&mut run, &record).await;
        }
        run.set_state(RunState::Stopped);
        self.inner.store.save(&run).await?;
        tracing::info!(run_id, "run stopped");
        Ok(run.clone())
    }

    /// Mark a pending or failed step `SKIPPED`. The run stays paused, or
    /// completes when nothing else is left.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless the run is paused, `StepNotFound` for an
    /// unknown step or one that is not pending or failed.
    pub async fn skip(&self, run_id: &str, step: &str) -> Result<Run, EngineError> {
        let slot = self.slot(run_id)?;
        let mut run = slot.run.lock().await;
        ensure_paused(&run, "skip a step")?;
        let index = step_index(&run, step)?;
        let status = run.plan[index].status;
        if !matches!(status, StepStatus::Pending | StepStatus::Failed) {
            return Err(EngineError::StepNotFound(format!(
                "{step} is {status}, only pending or failed steps can be skipped"
            )));
        }
        let step_id = run.plan[index].id.clone();
        let target = &mut run.plan[index];
        target.status = StepStatus::Skipped;
        target.finished_at = Some(Utc::now());
        run.record(format!("step {step_id} skipped by operator"));
        if run.all_settled() {
            run.set_state(RunState::Completed);
        }
        self.inner.store.save(&run).await?;
        Ok(run.clone())
    }

    /// Reset a failed step to `PENDING` and continue from it.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` unless paused or when attempts are exhausted, plus
    /// anything [`RunEngine::drive`] returns.
    pub async fn retry(&self, run_id: &str, step: &str) -> Result<Run, EngineError> {
        let slot = self.slot(run_id)?;
        {
            let mut run = slot.run.lock().await;
            ensure_paused(&run, "retry a step")?;
            let index = step_index(&run, step)?;
            let target = &run.plan[index];
            if !matches!(target.status, StepStatus::Failed | StepStatus::Pending) {
                return Err(EngineError::StepNotFound(format!(
                    "{step} is {}, only failed or pending steps can be retried",
                    target.status
                )));
            }
            if target.attempts >= self.inner.settings.max_step_attempts {
                return Err(EngineError::InvalidTransition {
                    action: "retry a step with no attempts left",
                    state: run.state,
                });
            }
            let step_id = target.id.clone();
            run.plan[index].reset();
            run.record(format!("step {step_id} reset for retry"));
            self.inner.store.save(&run).await?;
        }
        self.drive(run_id, Drive::Continue).await
    }

    /// Change a pending step. Tool changes are re-validated and the tier is
    /// recomputed; the change is audited.
    ///
    /// # Errors
    ///
    /// `Busy` while the run is executing, `StepNotFound` unless the step is
    /// pending, `InvalidPlan` for a malformed patch or tool.
    pub async fn edit(
        &self,
        run_id: &str,
        step: &str,
        patch: serde_json::Value,
    ) -> Result<Run, EngineError> {
        let edit: StepEdit = serde_json::from_value(patch.clone())
            .map_err(|e| EngineError::InvalidPlan(format!("step edit: {e}")))?;
        let slot = self.slot(run_id)?;
        let Ok(_driver) = slot.driver.try_lock() else {
            return Err(EngineError::Busy(run_id.to_owned()));
        };
        let mut run = slot.run.lock().await;
        ensure_open(&run)?;
        let index = step_index(&run, step)?;
        if run.plan[index].status != StepStatus::Pending {
            return Err(EngineError::StepNotFound(format!(
                "{step} is {}, only pending steps can be edited",
                run.plan[index].status
            )));
        }

        let tool = match &edit.tool_id {
            Some(name) => self
                .inner
                .registry
                .resolve(name)
                .map_err(|e| EngineError::InvalidPlan(format!("{name}: {e}")))?,
            None => self.inner.registry.resolve(&run.plan[index].tool_id.to_string())?,
        };
        let tool_id = tool.id.clone();
        let tool_tier = tool.tier();

        let target = &mut run.plan[index];
        if let Some(intent) = edit.intent {
            target.intent = intent;
        }
        if let Some(arguments) = edit.arguments {
            target.arguments = arguments;
        }
        if let Some(tier) = edit.declared_tier {
            target.declared_tier = tier;
        }
        target.tool_id = tool_id;
        target.tier = Tier::effective(target.declared_tier, tool_tier);
        target.decision = None;

        let step_id = target.id.clone();
        let record = AuditRecord::new(
            run_id,
            &step_id,
            &target.tool_id,
            &target.arguments,
            None,
            AuditResult::Edited {
                change: gantry_tools::sanitize::sanitize_arguments(&patch),
            },
        );
        self.audit_into(&mut run, &record).await;
        run.record(format!("step {step_id} edited by operator"));
        tracing::info!(run_id, step_id = %step_id, "step edited");
        self.inner.store.save(&run).await?;
        Ok(run.clone())
    }

    /// Resolve a pending approval as granted. The run stays paused until the
    /// operator resumes it.
    ///
    /// # Errors
    ///
    /// `Approval` for unknown or already-resolved requests.
    pub async fn approve(
        &self,
        run_id: &str,
        approval_id: &str,
        scope: ApprovalScope,
    ) -> Result<ApprovalRequest, EngineError> {
        let slot = self.slot(run_id)?;
        let mut run = slot.run.lock().await;
        ensure_open(&run)?;
        let request = run
            .approvals
            .resolve(approval_id, ApprovalDecision::Approve, scope)?;
        run.record(format!("approval {approval_id} granted ({scope})"));
        self.inner.store.save(&run).await?;
        Ok(request)
    }

    /// Resolve a pending approval as refused; the blocked step fails with
    /// `PolicyDenied`.
    ///
    /// # Errors
    ///
    /// `Approval` for unknown or already-resolved requests.
    pub async fn deny(&self, run_id: &str, approval_id: &str) -> Result<ApprovalRequest, EngineError> {
        let slot = self.slot(run_id)?;
        let mut run = slot.run.lock().await;
        ensure_open(&run)?;
        let request =
            run.approvals
                .resolve(approval_id, ApprovalDecision::Deny, ApprovalScope::Once)?;
        run.record(format!("approval {approval_id} denied"));

        let step_id = request.tool_call.step_id.clone();
        if let Some(index) = run.plan.iter().position(|s| s.id == step_id)
            && run.plan[index].status == StepStatus::Pending
        {
            let reason = format!("operator denied approval {approval_id}");
            let step = &mut run.plan[index];
            step.fail(FailureKind::PolicyDenied, &reason);
            let record = AuditRecord::new(
                run_id,
                &step_id,
                &request.tool_call.tool_id,
                &request.tool_call.arguments,
                step.decision.clone(),
                AuditResult::Denied {
                    kind: FailureKind::PolicyDenied,
                    reason: reason.clone(),
                },
            );
            self.audit_into(&mut run, &record).await;
            if run.state == RunState::Paused {
                run.pause(PauseReason::PolicyDenied {
                    step_id,
                    kind: FailureKind::PolicyDenied,
                    detail: reason,
                });
            }
        }
        self.inner.store.save(&run).await?;
        Ok(request)
    }

    /// Pending approval requests of a run.
    ///
    /// # Errors
    ///
    /// `RunNotFound` for a run not attached to this engine.
    pub async fn pending_approvals(&self, run_id: &str) -> Result<Vec<ApprovalRequest>, EngineError> {
        let slot = self.slot(run_id)?;
        let run = slot.run.lock().await;
        Ok(run.approvals.pending().cloned().collect())
    }

    /// Switch policy mode. Every switch revokes all approvals of the run.
    ///
    /// # Errors
    ///
    /// `TerminalRun` for a finished run.
    pub async fn set_mode(&self, run_id: &str, mode: PolicyMode) -> Result<usize, EngineError> {
        let slot = self.slot(run_id)?;
        let mut run = slot.run.lock().await;
        ensure_open(&run)?;
        let previous = run.mode;
        run.mode = mode;
        let revoked = run.approvals.revoke_all();
        run.record(format!(
            "policy mode {previous} -> {mode}, {revoked} approval(s) revoked"
        ));
        tracing::info!(run_id, from = %previous, to = %mode, revoked, "policy mode switched");
        self.inner.store.save(&run).await?;
        Ok(revoked)
    }

    /// Drop all session and once approvals of a run.
    ///
    /// # Errors
    ///
    /// `RunNotFound` for a run not attached to this engine, `TerminalRun` for
    /// a finished run.
    pub async fn revoke(&self, run_id: &str) -> Result<usize, EngineError> {
        let slot = self.slot(run_id)?;
        let mut run = slot.run.lock().await;
        ensure_open(&run)?;
        let revoked = run.approvals.revoke_all();
        run.record(format!("{revoked} approval(s) revoked by operator"));
        self.inner.store.save(&run).await?;
        Ok(revoked)
    }

    /// Current state of an attached run.
    ///
    /// # Errors
    ///
    /// `RunNotFound` for a run not attached to this engine.
    pub async fn snapshot(&self, run_id: &str) -> Result<Run, EngineError> {
        let slot = self.slot(run_id)?;
        let run = slot.run.lock().await;
        Ok(run.clone())
    }

    /// Load a persisted run into this engine.
    ///
    /// A step left `RUNNING` by a previous process is failed as `Interrupted`
    /// and the run is parked in `PAUSED`. Nothing executes until the operator
    /// resumes.
    ///
    /// # Errors
    ///
    /// `RunNotFound` when no such run was persisted.
    pub async fn attach(&self, run_id: &str) -> Result<Run, EngineError> {
        if let Ok(slot) = self.slot(run_id) {
            return Ok(slot.run.lock().await.clone());
        }
        let mut run = self
            .inner
            .store
            .load(run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_owned()))?;

        if run.is_incomplete() {
            let interrupted: Vec<usize> = run
                .plan
                .iter()
                .enumerate()
                .filter(|(_, s)| s.status == StepStatus::Running)
                .map(|(i, _)| i)
                .collect();
            for index in interrupted {
                let step = &mut run.plan[index];
                step.fail(
                    FailureKind::Interrupted,
                    "owning process exited while the step was running",
                );
                let record = AuditRecord::new(
                    run_id,
                    &step.id,
                    &step.tool_id,
                    &step.arguments,
                    step.decision.clone(),
                    AuditResult::Failed {
                        kind: FailureKind::Interrupted,
                        message: "owning process exited while the step was running".into(),
                    },
                );
                self.audit_into(&mut run, &record).await;
            }
            if matches!(run.state, RunState::Running | RunState::Paused) {
                run.pause(PauseReason::Interrupted);
            }
            self.inner.store.save(&run).await?;
            tracing::info!(run_id, state = %run.state, "run attached");
        }

        let snapshot = run.clone();
        self.insert(run);
        Ok(snapshot)
    }

    /// Set an incomplete run aside without executing it.
    ///
    /// # Errors
    ///
    /// `Busy` while the run is executing, `TerminalRun` if already finished.
    pub async fn archive(&self, run_id: &str) -> Result<Run, EngineError> {
        let slot = match self.slot(run_id) {
            Ok(slot) => slot,
            Err(_) => {
                self.attach(run_id).await?;
                self.slot(run_id)?
            }
        };
        let Ok(_driver) = slot.driver.try_lock() else {
            return Err(EngineError::Busy(run_id.to_owned()));
        };
        let mut run = slot.run.lock().await;
        ensure_open(&run)?;
        run.set_state(RunState::Archived);
        self.inner.store.save(&run).await?;
        tracing::info!(run_id, "run archived");
        Ok(run.clone())
    }

    /// Persisted runs in a non-terminal state that are not attached here.
    ///
    /// # Errors
    ///
    /// Returns an error if the run store cannot be listed.
    pub async fn incomplete_runs(&self) -> Result<Vec<Run>, EngineError> {
        let attached: Vec<String> = self
            .inner
            .runs
            .lock()
            .map(|runs| runs.keys().cloned().collect())
            .unwrap_or_default();
        Ok(self
            .inner
            .store
            .incomplete()
            .await?
            .into_iter()
            .filter(|r| !attached.contains(&r.id))
            .collect())
    }

    /// Dry-run the policy for a call. With a run, its mode and session
    /// approvals apply; without one, the configured default mode.
    ///
    /// # Errors
    ///
    /// `Registry` when the tool does not resolve.
    pub async fn explain(
        &self,
        run_id: Option<&str>,
        tool: &str,
        arguments: &serde_json::Value,
        declared_tier: Tier,
    ) -> Result<PolicyExplanation, EngineError> {
        let definition = self.inner.registry.resolve(tool)?;
        let (mode, grants) = self.policy_view(run_id).await?;
        let ctx = self.policy_context(grants);
        Ok(gantry_tools::explain(
            definition,
            arguments,
            declared_tier,
            mode,
            &ctx,
        ))
    }

    /// Active policy as operator text.
    ///
    /// # Errors
    ///
    /// `RunNotFound` for an unknown run id.
    pub async fn render_policy(&self, run_id: Option<&str>) -> Result<String, EngineError> {
        let (mode, grants) = self.policy_view(run_id).await?;
        Ok(gantry_tools::render_policy(mode, &self.policy_context(grants)))
    }

    async fn policy_view(
        &self,
        run_id: Option<&str>,
    ) -> Result<(PolicyMode, std::collections::BTreeSet<(ToolId, Tier)>), EngineError> {
        match run_id {
            Some(id) => {
                let slot = self.slot(id)?;
                let run = slot.run.lock().await;
                Ok((run.mode, run.approvals.session_grants()))
            }
            None => Ok((self.inner.settings.mode, std::collections::BTreeSet::new())),
        }
    }

    #[must_use]
    pub fn tools(&self, filter: &ToolFilter) -> String {
        self.inner.registry.format_inventory(filter)
    }

    /// # Errors
    ///
    /// `Process` for an unknown process id.
    pub fn poll_process(&self, process_id: &str) -> Result<ProcessPoll, EngineError> {
        Ok(self.inner.supervisor.poll(process_id)?)
    }

    /// Kill a supervised process. Killing an exited process is a no-op.
    ///
    /// # Errors
    ///
    /// `Process` for an unknown process id.
    pub async fn kill_process(&self, process_id: &str, force: bool) -> Result<ProcessPoll, EngineError> {
        Ok(self.inner.supervisor.kill(process_id, force).await?)
    }

    fn insert(&self, run: Run) {
        if let Ok(mut runs) = self.inner.runs.lock() {
            runs.insert(run.id.clone(), RunSlot::new(run));
        }
    }

    fn slot(&self, run_id: &str) -> Result<Arc<RunSlot>, EngineError> {
        self.inner
            .runs
            .lock()
            .map_err(|_| EngineError::Internal("run table poisoned".into()))?
            .get(run_id)
            .cloned()
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_owned()))
    }
}

fn ensure_open(run: &Run) -> Result<(), EngineError> {
    if run.is_terminal() {
        return Err(EngineError::TerminalRun {
            run_id: run.id.clone(),
            state: run.state,
        });
    }
    Ok(())
}

fn ensure_paused(run: &Run, action: &'static str) -> Result<(), EngineError> {
    ensure_open(run)?;
    if run.state != RunState::Paused {
        return Err(EngineError::InvalidTransition {
            action,
            state: run.state,
        });
    }
    Ok(())
}

fn step_index(run: &Run, key: &str) -> Result<usize, EngineError> {
    run.step_index(key)
        .ok_or_else(|| EngineError::StepNotFound(key.to_owned()))
}

/// The dispatched attempt is still the live one.
fn owns_step(run: &Run, d: &Dispatch) -> bool {
    !run.is_terminal()
        && run.plan.get(d.index).is_some_and(|s| {
            s.id == d.step_id && s.status == StepStatus::Running && s.attempts == d.attempt
        })
}

fn process_outcome(poll: &ProcessPoll, stalled: bool) -> StepOutcome {
    let summary = format_poll(poll);
    if poll.timed_out {
        return StepOutcome::Failed {
            kind: FailureKind::ProcessTimeout,
            message: format!("process {} exceeded its timeout", poll.process_id),
            output: Some(summary),
        };
    }
    if poll.status == ProcessStatus::Killed {
        let kind = if stalled {
            FailureKind::ProcessStalled
        } else {
            FailureKind::OperatorCancelled
        };
        return StepOutcome::Failed {
            kind,
            message: format!("process {} was killed", poll.process_id),
            output: Some(summary),
        };
    }
    match poll.exit_code {
        Some(0) => StepOutcome::Done(ToolOutput {
            summary,
            success: true,
            process_id: Some(poll.process_id.clone()),
            exit_code: Some(0),
            ..ToolOutput::default()
        }),
        code => StepOutcome::Failed {
            kind: FailureKind::ToolFailed,
            message: match code {
                Some(code) => format!("process {} exited with code {code}", poll.process_id),
                None => format!("process {} ended without an exit code", poll.process_id),
            },
            output: Some(summary),
        },
    }
}

fn first_line(text: &str) -> String {
    brief(text.lines().find(|l| !l.trim().is_empty()).unwrap_or("tool reported failure"))
}

fn brief(text: &str) -> String {
    if text.chars().count() <= AUDIT_SUMMARY_CHARS {
        return text.to_owned();
    }
    let mut out: String = text.chars().take(AUDIT_SUMMARY_CHARS).collect();
    out.push_str("...");
    out
}
