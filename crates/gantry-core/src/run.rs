//! Run and step model. Only the engine mutates these.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use gantry_tools::{
    ApprovalManager, FailureKind, PolicyDecision, PolicyMode, Tier, ToolId,
};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Idle,
    Planning,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
    /// Incomplete run set aside by the operator.
    Archived,
}

impl RunState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Stopped | Self::Archived
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Planning => "PLANNING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Stopped => "STOPPED",
            Self::Archived => "ARCHIVED",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Done or skipped: nothing left to do for this step.
    #[must_use]
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Done | Self::Skipped)
    }

    #[must_use]
    pub fn marker(self) -> &'static str {
        match self {
            Self::Pending => "[ ]",
            Self::Running => "[>]",
            Self::Done => "[x]",
            Self::Failed => "[!]",
            Self::Skipped => "[-]",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// A step as proposed by the model, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub intent: String,
    pub tool_id: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default)]
    pub declared_tier: Tier,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanDocument {
    Steps(Vec<PlannedStep>),
    Wrapped { steps: Vec<PlannedStep> },
}

/// Parse a plan given either as a JSON array of steps or as `{"steps": [...]}`.
///
/// # Errors
///
/// `InvalidPlan` when the document does not match either shape or is empty.
pub fn parse_plan(json: &str) -> Result<Vec<PlannedStep>, EngineError> {
    let doc: PlanDocument =
        serde_json::from_str(json).map_err(|e| EngineError::InvalidPlan(e.to_string()))?;
    let steps = match doc {
        PlanDocument::Steps(steps) | PlanDocument::Wrapped { steps } => steps,
    };
    if steps.is_empty() {
        return Err(EngineError::InvalidPlan("plan has no steps".into()));
    }
    Ok(steps)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub intent: String,
    /// Always provider-qualified once accepted.
    pub tool_id: ToolId,
    pub arguments: serde_json::Value,
    pub declared_tier: Tier,
    /// Effective tier from the latest evaluation.
    pub tier: Tier,
    pub status: StepStatus,
    /// Process id for background steps, first artifact id otherwise.
    #[serde(default)]
    pub result_ref: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub failure: Option<StepFailure>,
    #[serde(default)]
    pub decision: Option<PolicyDecision>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub stalled: bool,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    fn new(id: String, planned: PlannedStep, tool_id: ToolId, tier: Tier) -> Self {
        let arguments = if planned.arguments.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            planned.arguments
        };
        Self {
            id,
            intent: planned.intent,
            tool_id,
            arguments,
            declared_tier: planned.declared_tier,
            tier,
            status: StepStatus::Pending,
            result_ref: None,
            output: None,
            failure: None,
            decision: None,
            attempts: 0,
            artifacts: Vec::new(),
            stalled: false,
            started_at: None,
            finished_at: None,
        }
    }

    pub(crate) fn fail(&mut self, kind: FailureKind, message: impl Into<String>) {
        self.status = StepStatus::Failed;
        self.failure = Some(StepFailure {
            kind,
            message: message.into(),
        });
        self.finished_at = Some(Utc::now());
    }

    /// Back to `Pending` for another evaluation; attempts are kept.
    pub(crate) fn reset(&mut self) {
        self.status = StepStatus::Pending;
        self.failure = None;
        self.output = None;
        self.result_ref = None;
        self.stalled = false;
        self.started_at = None;
        self.finished_at = None;
    }
}

/// Why a run is not advancing on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum PauseReason {
    Operator,
    /// `next` executed one step.
    ManualStep,
    ApprovalRequired { step_id: String, approval_id: String },
    PolicyDenied { step_id: String, kind: FailureKind, detail: String },
    StepFailed { step_id: String, kind: FailureKind, detail: String },
    /// Re-attached after the owning process went away.
    Interrupted,
}

impl fmt::Display for PauseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operator => f.write_str("paused by operator"),
            Self::ManualStep => f.write_str("manual step executed"),
            Self::ApprovalRequired {
                step_id,
                approval_id,
            } => write!(f, "step {step_id} awaits approval {approval_id}"),
            Self::PolicyDenied {
                step_id,
                kind,
                detail,
            } => write!(f, "step {step_id} denied ({kind}): {detail}"),
            Self::StepFailed {
                step_id,
                kind,
                detail,
            } => write!(f, "step {step_id} failed ({kind}): {detail}"),
            Self::Interrupted => f.write_str("interrupted by a previous shutdown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub event: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub goal: String,
    pub workspace_id: String,
    pub state: RunState,
    pub plan: Vec<Step>,
    pub mode: PolicyMode,
    #[serde(default)]
    pub approvals: ApprovalManager,
    #[serde(default)]
    pub pause_reason: Option<PauseReason>,
    /// An audit or artifact write failed after a tool had already run.
    #[serde(default)]
    pub degraded_audit: bool,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    next_step: u32,
}

impl Run {
    #[must_use]
    pub fn new(goal: impl Into<String>, workspace_id: impl Into<String>, mode: PolicyMode) -> Self {
        let now = Utc::now();
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        let mut run = Self {
            id: format!("run-{}", &uuid[..8]),
            goal: goal.into(),
            workspace_id: workspace_id.into(),
            state: RunState::Idle,
            plan: Vec::new(),
            mode,
            approvals: ApprovalManager::new(),
            pause_reason: None,
            degraded_audit: false,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            next_step: 0,
        };
        run.record("run created");
        run
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Non-terminal: surfaced on startup, never resumed automatically.
    #[must_use]
    pub fn is_incomplete(&self) -> bool {
        !self.is_terminal()
    }

    pub(crate) fn record(&mut self, event: impl Into<String>) {
        let now = Utc::now();
        self.updated_at = now;
        self.history.push(HistoryEntry {
            at: now,
            event: event.into(),
        });
    }

    pub(crate) fn set_state(&mut self, state: RunState) {
        if self.state != state {
            let event = format!("{} -> {}", self.state, state);
            self.state = state;
            self.record(event);
        }
        if state != RunState::Paused {
            self.pause_reason = None;
        }
    }

    pub(crate) fn pause(&mut self, reason: PauseReason) {
        self.record(format!("paused: {reason}"));
        self.set_state(RunState::Paused);
        self.pause_reason = Some(reason);
    }

    /// Append validated steps. `resolved` pairs each planned step with its
    /// qualified tool id and tool tier.
    pub(crate) fn push_steps(&mut self, steps: Vec<(PlannedStep, ToolId, Tier)>) -> Vec<String> {
        let mut ids = Vec::with_capacity(steps.len());
        for (planned, tool_id, tool_tier) in steps {
            self.next_step += 1;
            let id = format!("s{}", self.next_step);
            let tier = Tier::effective(planned.declared_tier, tool_tier);
            ids.push(id.clone());
            self.plan.push(Step::new(id, planned, tool_id, tier));
        }
        self.record(format!("{} step(s) added", ids.len()));
        ids
    }

    /// Look up a step by id (`s3`) or 1-based position (`3`).
    #[must_use]
    pub fn step_index(&self, key: &str) -> Option<usize> {
        let key = key.trim();
        if let Some(i) = self.plan.iter().position(|s| s.id == key) {
            return Some(i);
        }
        key.parse::<usize>()
            .ok()
            .filter(|n| (1..=self.plan.len()).contains(n))
            .map(|n| n - 1)
    }

    #[must_use]
    pub fn step(&self, key: &str) -> Option<&Step> {
        self.step_index(key).map(|i| &self.plan[i])
    }

    /// First step that is neither done nor skipped.
    #[must_use]
    pub fn next_actionable(&self) -> Option<usize> {
        self.plan.iter().position(|s| !s.status.is_settled())
    }

    #[must_use]
    pub fn all_settled(&self) -> bool {
        !self.plan.is_empty() && self.plan.iter().all(|s| s.status.is_settled())
    }

    #[must_use]
    pub fn count(&self, status: StepStatus) -> usize {
        self.plan.iter().filter(|s| s.status == status).count()
    }
}
