//! Operator-facing views of a run: status line, step list and the full
//! Markdown / JSON report.

use std::fmt::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use gantry_tools::{ApprovalRequest, PolicyMode};
use serde::Serialize;

use crate::run::{PauseReason, Run, RunState, Step, StepStatus};

const OUTPUT_PREVIEW_CHARS: usize = 800;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StepCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub done: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StepCounts {
    #[must_use]
    pub fn of(run: &Run) -> Self {
        Self {
            total: run.plan.len(),
            pending: run.count(StepStatus::Pending),
            running: run.count(StepStatus::Running),
            done: run.count(StepStatus::Done),
            failed: run.count(StepStatus::Failed),
            skipped: run.count(StepStatus::Skipped),
        }
    }
}

/// Machine-readable report. Field names are stable.
#[derive(Debug, Serialize)]
pub struct RunReport<'a> {
    pub run_id: &'a str,
    pub goal: &'a str,
    pub workspace_id: &'a str,
    pub state: RunState,
    pub mode: PolicyMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub duration_secs: i64,
    pub pause_reason: Option<&'a PauseReason>,
    pub degraded_audit: bool,
    pub counts: StepCounts,
    pub approvals: &'a [ApprovalRequest],
    pub plan: &'a [Step],
    pub next_actions: Vec<String>,
}

impl<'a> RunReport<'a> {
    #[must_use]
    pub fn new(run: &'a Run) -> Self {
        Self {
            run_id: &run.id,
            goal: &run.goal,
            workspace_id: &run.workspace_id,
            state: run.state,
            mode: run.mode,
            created_at: run.created_at,
            updated_at: run.updated_at,
            duration_secs: (run.updated_at - run.created_at).num_seconds(),
            pause_reason: run.pause_reason.as_ref(),
            degraded_audit: run.degraded_audit,
            counts: StepCounts::of(run),
            approvals: run.approvals.requests(),
            plan: &run.plan,
            next_actions: next_actions(run),
        }
    }
}

/// One line for `run status`.
#[must_use]
pub fn status_line(run: &Run) -> String {
    let counts = StepCounts::of(run);
    let mut line = format!(
        "{} [{}] mode={} steps {}/{} done",
        run.id,
        run.state,
        run.mode,
        counts.done + counts.skipped,
        counts.total
    );
    if counts.failed > 0 {
        let _ = write!(line, ", {} failed", counts.failed);
    }
    if let Some(reason) = &run.pause_reason {
        let _ = write!(line, " ({reason})");
    }
    if run.degraded_audit {
        line.push_str(" [audit degraded]");
    }
    line
}

/// Plan with status markers for `run steps`.
#[must_use]
pub fn render_steps(run: &Run) -> String {
    if run.plan.is_empty() {
        return "no plan yet".into();
    }
    let mut out = String::new();
    for step in &run.plan {
        let _ = write!(
            out,
            "{} {} {} ({}) {}",
            step.status.marker(),
            step.id,
            step.tool_id,
            step.tier,
            step.intent
        );
        if let Some(failure) = &step.failure {
            let _ = write!(out, " -- {failure}");
        }
        if step.stalled {
            out.push_str(" -- possibly hung");
        }
        out.push('\n');
    }
    out.pop();
    out
}

/// Suggested operator commands for the run's current state.
#[must_use]
pub fn next_actions(run: &Run) -> Vec<String> {
    match run.state {
        RunState::Idle | RunState::Planning => vec!["run plan <file.json>".into()],
        RunState::Running => vec!["run status".into(), "run pause".into(), "run stop".into()],
        RunState::Paused => match &run.pause_reason {
            Some(PauseReason::ApprovalRequired { approval_id, .. }) => vec![
                format!("approve {approval_id} [once|session]"),
                format!("deny {approval_id}"),
                "run resume (after approving)".into(),
            ],
            Some(
                PauseReason::PolicyDenied { step_id, .. }
                | PauseReason::StepFailed { step_id, .. },
            ) => vec![
                "policy explain <tool> <json>".into(),
                format!("run edit {step_id} <json>"),
                format!("run retry {step_id}"),
                format!("run skip {step_id}"),
                "run stop".into(),
            ],
            _ => vec![
                "run continue".into(),
                "run next".into(),
                "run stop".into(),
            ],
        },
        RunState::Completed => vec!["artifact list".into(), "run report".into()],
        RunState::Failed => vec![
            "run report".into(),
            "run start <refined goal> --plan <file.json>".into(),
        ],
        RunState::Stopped | RunState::Archived => {
            vec!["run start <goal> --plan <file.json>".into()]
        }
    }
}

/// Full Markdown report.
#[must_use]
pub fn render_markdown(run: &Run) -> String {
    let report = RunReport::new(run);
    let mut md = String::new();
    let _ = writeln!(md, "# Run report: {}\n", run.id);
    md.push_str("## Metadata\n\n");
    let _ = writeln!(md, "- **Goal**: {}", run.goal);
    let _ = writeln!(md, "- **State**: {}", run.state);
    let _ = writeln!(md, "- **Mode**: {}", run.mode);
    let _ = writeln!(md, "- **Workspace**: {}", run.workspace_id);
    let _ = writeln!(md, "- **Created**: {}", run.created_at.to_rfc3339());
    let _ = writeln!(md, "- **Updated**: {}", run.updated_at.to_rfc3339());
    let _ = writeln!(md, "- **Duration**: {}s", report.duration_secs);
    if let Some(reason) = &run.pause_reason {
        let _ = writeln!(md, "- **Paused**: {reason}");
    }
    if run.degraded_audit {
        md.push_str(
            "- **Warning**: an audit or artifact write failed after a tool ran; \
             the audit trail for this run is incomplete\n",
        );
    }

    if !report.approvals.is_empty() {
        md.push_str("\n## Approvals\n\n");
        for req in report.approvals {
            let _ = writeln!(
                md,
                "- `{}` {} {} for {} `{}` ({})",
                req.id,
                req.status,
                req.scope,
                req.tool_call.step_id,
                req.tool_call.tool_id,
                req.tier
            );
        }
    }

    md.push_str("\n## Plan\n\n");
    if run.plan.is_empty() {
        md.push_str("No plan submitted.\n");
    }
    for step in &run.plan {
        let _ = writeln!(
            md,
            "- `{}` **{}** `{}` ({}): {}",
            step.status.marker(),
            step.id,
            step.tool_id,
            step.tier,
            step.intent
        );
    }

    md.push_str("\n## Step log\n");
    for step in run.plan.iter().filter(|s| s.attempts > 0 || s.decision.is_some()) {
        write_step(&mut md, step);
    }

    let failed: Vec<&Step> = run.plan.iter().filter(|s| s.failure.is_some()).collect();
    if !failed.is_empty() {
        md.push_str("\n## Errors\n\n");
        for step in failed {
            if let Some(failure) = &step.failure {
                let _ = writeln!(md, "- **{}**: {failure}", step.id);
            }
        }
    }

    md.push_str("\n## Next actions\n\n");
    for action in &report.next_actions {
        let _ = writeln!(md, "- `{action}`");
    }
    md
}

fn write_step(md: &mut String, step: &Step) {
    let _ = writeln!(md, "\n### {} {}\n", step.id, step.intent);
    let _ = writeln!(md, "- **Status**: {}", step.status);
    let _ = writeln!(md, "- **Tool**: `{}`", step.tool_id);
    let _ = writeln!(md, "- **Attempts**: {}", step.attempts);
    if let Some(decision) = &step.decision {
        let _ = writeln!(md, "- **Decision**: {decision}");
    }
    if let (Some(start), Some(end)) = (step.started_at, step.finished_at) {
        let _ = writeln!(md, "- **Duration**: {}ms", (end - start).num_milliseconds());
    }
    if let Some(result_ref) = &step.result_ref {
        let _ = writeln!(md, "- **Result**: `{result_ref}`");
    }
    if !step.artifacts.is_empty() {
        let _ = writeln!(md, "- **Artifacts**: {}", step.artifacts.join(", "));
    }
    if let Some(failure) = &step.failure {
        let _ = writeln!(md, "- **Error**: {failure}");
    }
    if let Some(output) = &step.output {
        let preview: String = output.chars().take(OUTPUT_PREVIEW_CHARS).collect();
        let _ = writeln!(md, "\n```\n{}\n```", preview.trim_end());
    }
}

/// Pretty JSON form of [`RunReport`].
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn render_json(run: &Run) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&RunReport::new(run))
}

/// Write `<run_id>.md` and `<run_id>.json` under `dir`.
///
/// # Errors
///
/// Returns an error if the directory or either file cannot be written.
pub async fn write_report(run: &Run, dir: &Path) -> std::io::Result<(PathBuf, PathBuf)> {
    tokio::fs::create_dir_all(dir).await?;
    let md_path = dir.join(format!("{}.md", run.id));
    let json_path = dir.join(format!("{}.json", run.id));
    tokio::fs::write(&md_path, render_markdown(run)).await?;
    let json = render_json(run).map_err(std::io::Error::other)?;
    tokio::fs::write(&json_path, json).await?;
    Ok((md_path, json_path))
}

#[cfg(test)]
mod tests {
    use gantry_tools::{FailureKind, Tier, ToolId};

    use super::*;
    use crate::run::PlannedStep;

    fn sample() -> Run {
        let mut run = Run::new("tidy the repo", "ws", PolicyMode::Guide);
        let planned = |intent: &str| PlannedStep {
            intent: intent.into(),
            tool_id: "fs_list_dir".into(),
            arguments: serde_json::Value::Null,
            declared_tier: Tier::READ,
        };
        run.push_steps(vec![
            (planned("look around"), ToolId::new("builtin", "fs_list_dir"), Tier::READ),
            (planned("write notes"), ToolId::new("builtin", "fs_write_text"), Tier::WRITE),
        ]);
        run.set_state(RunState::Running);
        run.plan[0].status = StepStatus::Done;
        run.plan[0].attempts = 1;
        run.plan[0].output = Some("src/\nCargo.toml".into());
        run.plan[1].attempts = 1;
        run.plan[1].fail(FailureKind::ToolFailed, "disk full");
        run.pause(PauseReason::StepFailed {
            step_id: "s2".into(),
            kind: FailureKind::ToolFailed,
            detail: "disk full".into(),
        });
        run
    }

    #[test]
    fn status_line_summarises() {
        let line = status_line(&sample());
        assert!(line.contains("[PAUSED]"));
        assert!(line.contains("steps 1/2 done"));
        assert!(line.contains("1 failed"));
        assert!(line.contains("step s2 failed"));
    }

    #[test]
    fn steps_show_markers_and_failures() {
        let text = render_steps(&sample());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("[x] s1 builtin:fs_list_dir"));
        assert!(lines[1].starts_with("[!] s2"));
        assert!(lines[1].contains("ToolFailed: disk full"));
    }

    #[test]
    fn markdown_has_all_sections() {
        let md = render_markdown(&sample());
        for heading in ["## Metadata", "## Plan", "## Step log", "## Errors", "## Next actions"] {
            assert!(md.contains(heading), "missing {heading}");
        }
        assert!(md.contains("run retry s2"));
        assert!(md.contains("Cargo.toml"));
    }

    #[test]
    fn degraded_audit_is_flagged() {
        let mut run = sample();
        run.degraded_audit = true;
        assert!(render_markdown(&run).contains("audit trail for this run is incomplete"));
        assert!(status_line(&run).contains("[audit degraded]"));
    }

    #[test]
    fn json_report_fields() {
        let json: serde_json::Value = serde_json::from_str(&render_json(&sample()).unwrap()).unwrap();
        assert_eq!(json["state"], "PAUSED");
        assert_eq!(json["counts"]["failed"], 1);
        assert_eq!(json["plan"][1]["failure"]["kind"], "tool_failed");
        assert!(json["next_actions"].as_array().unwrap().len() > 1);
    }

    #[test]
    fn approval_pause_suggests_approve() {
        let mut run = Run::new("g", "ws", PolicyMode::Guide);
        run.set_state(RunState::Running);
        run.pause(PauseReason::ApprovalRequired {
            step_id: "s1".into(),
            approval_id: "apr-1".into(),
        });
        let actions = next_actions(&run);
        assert_eq!(actions[0], "approve apr-1 [once|session]");
    }

    #[tokio::test]
    async fn report_files_written() {
        let dir = tempfile::tempdir().unwrap();
        let run = sample();
        let (md, json) = write_report(&run, dir.path()).await.unwrap();
        assert!(md.exists());
        assert!(json.ends_with(format!("{}.json", run.id)));
    }
}
