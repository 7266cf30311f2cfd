//! Operator console: executes parsed commands against a [`RunEngine`].
//!
//! Commands that execute steps do not block the console. They come back as a
//! [`Job`] the caller spawns, so `run pause`, `run stop` and status queries
//! stay responsive while a step is in flight.

use std::fmt::Write;
use std::path::PathBuf;

use anyhow::Context;
use gantry_tools::{ToolExecutor, ToolFilter, format_kill, format_poll};

use crate::command::{self, Command, HELP};
use crate::engine::{Drive, RunEngine};
use crate::report;
use crate::run::{Run, parse_plan};

const HISTORY_TAIL: usize = 10;
const INSPECT_OUTPUT_CHARS: usize = 400;

/// Step execution handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub run_id: String,
    pub action: JobAction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobAction {
    Drive(Drive),
    Retry(String),
}

impl Job {
    fn drive(run_id: &str, mode: Drive) -> Self {
        Self {
            run_id: run_id.to_owned(),
            action: JobAction::Drive(mode),
        }
    }

    /// Execute the job and describe where the run ended up.
    pub async fn run<E: ToolExecutor>(self, engine: &RunEngine<E>) -> String {
        let result = match &self.action {
            JobAction::Drive(mode) => engine.drive(&self.run_id, *mode).await,
            JobAction::Retry(step) => engine.retry(&self.run_id, step).await,
        };
        match result {
            Ok(run) => describe(&run),
            Err(e) => format!("error: {e}"),
        }
    }
}

/// What the console prints, plus optional follow-up work.
#[derive(Debug, Default)]
pub struct Response {
    pub text: String,
    pub job: Option<Job>,
    pub exit: bool,
}

impl Response {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    fn with_job(text: impl Into<String>, job: Job) -> Self {
        Self {
            text: text.into(),
            job: Some(job),
            exit: false,
        }
    }
}

pub struct Console<E> {
    engine: RunEngine<E>,
    current: Option<String>,
    reports_dir: PathBuf,
}

impl<E: ToolExecutor> Console<E> {
    #[must_use]
    pub fn new(engine: RunEngine<E>, reports_dir: PathBuf) -> Self {
        Self {
            engine,
            current: None,
            reports_dir,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &RunEngine<E> {
        &self.engine
    }

    /// Run the console is currently focused on.
    #[must_use]
    pub fn current_run(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Parse and execute one line. Errors are rendered into the response.
    pub async fn handle(&mut self, line: &str) -> Response {
        let cmd = match command::parse(line) {
            Ok(cmd) => cmd,
            Err(command::CommandError::Empty) => return Response::default(),
            Err(e) => return Response::text(format!("error: {e}")),
        };
        tracing::debug!(?cmd, "operator command");
        match self.execute(cmd).await {
            Ok(response) => response,
            Err(e) => Response::text(format!("error: {e:#}")),
        }
    }

    async fn execute(&mut self, cmd: Command) -> anyhow::Result<Response> {
        match cmd {
            Command::RunStart { goal, plan } => self.start(&goal, plan).await,
            Command::RunPlan(file) => self.plan(file).await,
            Command::RunStatus => self.status().await,
            Command::RunSteps => {
                let run = self.engine.snapshot(self.require_run()?).await?;
                Ok(Response::text(report::render_steps(&run)))
            }
            Command::RunPause => {
                let run = self.engine.pause(self.require_run()?).await?;
                Ok(Response::text(describe(&run)))
            }
            Command::RunResume | Command::RunContinue => {
                let run_id = self.require_run()?;
                Ok(Response::with_job(
                    format!("continuing {run_id}"),
                    Job::drive(run_id, Drive::Continue),
                ))
            }
            Command::RunNext => {
                let run_id = self.require_run()?;
                Ok(Response::with_job(
                    format!("executing next step of {run_id}"),
                    Job::drive(run_id, Drive::Single),
                ))
            }
            Command::RunSkip(step) => {
                let run = self.engine.skip(self.require_run()?, &step).await?;
                Ok(Response::text(describe(&run)))
            }
            Command::RunRetry(step) => {
                let run_id = self.require_run()?.to_owned();
                Ok(Response::with_job(
                    format!("retrying step {step} of {run_id}"),
                    Job {
                        run_id,
                        action: JobAction::Retry(step),
                    },
                ))
            }
            Command::RunStop => {
                let run = self.engine.stop(self.require_run()?).await?;
                Ok(Response::text(describe(&run)))
            }
            Command::RunEdit { step, patch } => {
                let run = self.engine.edit(self.require_run()?, &step, patch).await?;
                Ok(Response::text(report::render_steps(&run)))
            }
            Command::RunInspect => {
                let run = self.engine.snapshot(self.require_run()?).await?;
                Ok(Response::text(inspect(&run)))
            }
            Command::RunArchive(id) => {
                let run = self.engine.archive(&id).await?;
                if self.current.as_deref() == Some(id.as_str()) {
                    self.current = None;
                }
                Ok(Response::text(report::status_line(&run)))
            }
            Command::RunAttach(id) => {
                let run = self.engine.attach(&id).await?;
                self.current = Some(run.id.clone());
                Ok(Response::text(describe(&run)))
            }
            Command::RunReport => {
                let run = self.engine.snapshot(self.require_run()?).await?;
                let (md, json) = report::write_report(&run, &self.reports_dir)
                    .await
                    .context("failed to write run report")?;
                Ok(Response::text(format!(
                    "report written:\n  {}\n  {}",
                    md.display(),
                    json.display()
                )))
            }
            Command::PolicyShow => Ok(Response::text(
                self.engine.render_policy(self.current.as_deref()).await?,
            )),
            Command::PolicyExplain {
                tool,
                arguments,
                tier,
            } => {
                let explanation = self
                    .engine
                    .explain(self.current.as_deref(), &tool, &arguments, tier)
                    .await?;
                Ok(Response::text(explanation.to_string()))
            }
            Command::PolicyMode(mode) => {
                let run_id = self.require_run()?;
                let revoked = self.engine.set_mode(run_id, mode).await?;
                Ok(Response::text(format!(
                    "policy mode set to {mode}; {revoked} approval(s) revoked"
                )))
            }
            Command::Approve { id, scope } => {
                let request = self.engine.approve(self.require_run()?, &id, scope).await?;
                Ok(Response::text(format!(
                    "{request}\nuse 'run resume' to continue"
                )))
            }
            Command::Deny(id) => {
                let request = self.engine.deny(self.require_run()?, &id).await?;
                Ok(Response::text(request.to_string()))
            }
            Command::Approvals => {
                let pending = self.engine.pending_approvals(self.require_run()?).await?;
                if pending.is_empty() {
                    return Ok(Response::text("no pending approvals"));
                }
                let lines: Vec<String> = pending.iter().map(ToString::to_string).collect();
                Ok(Response::text(lines.join("\n")))
            }
            Command::Revoke => {
                let revoked = self.engine.revoke(self.require_run()?).await?;
                Ok(Response::text(format!("{revoked} approval(s) revoked")))
            }
            Command::ArtifactList => Ok(Response::text(self.artifact_list().await)),
            Command::ArtifactOpen(id) => {
                let opened = self.engine.artifacts().open_artifact(&id).await?;
                let a = &opened.artifact;
                let mut out = format!(
                    "{} {} ({} bytes, {})\nblake3 {}",
                    a.id,
                    a.path.display(),
                    a.size,
                    a.mime_type,
                    a.hash
                );
                for p in &a.produced_by {
                    let _ = write!(
                        out,
                        "\nproduced by {} step {} via {} at {}",
                        p.run_id,
                        p.step_id,
                        p.tool_id,
                        p.path.display()
                    );
                }
                match &opened.location {
                    Some(path) if path != &a.path => {
                        let _ = write!(out, "\nintact copy at {}", path.display());
                    }
                    Some(_) => {}
                    None => out.push_str(
                        "\nwarning: every registered copy is missing or changed since registration",
                    ),
                }
                Ok(Response::text(out))
            }
            Command::ProcessPoll(id) => {
                let poll = self.engine.poll_process(&id)?;
                Ok(Response::text(format_poll(&poll)))
            }
            Command::ProcessKill { id, force } => {
                let was_running = self.engine.poll_process(&id)?.running;
                let poll = self.engine.kill_process(&id, force).await?;
                Ok(Response::text(format_kill(&poll, was_running)))
            }
            Command::Tools => Ok(Response::text(self.engine.tools(&ToolFilter::default()))),
            Command::Help => Ok(Response::text(HELP)),
            Command::Exit => Ok(Response {
                exit: true,
                ..Response::default()
            }),
        }
    }

    async fn start(&mut self, goal: &str, plan: Option<PathBuf>) -> anyhow::Result<Response> {
        // Read the plan first so a missing file does not leave an empty run behind.
        let steps = match plan {
            Some(path) => Some(read_plan(&path).await?),
            None => None,
        };
        let run = self.engine.create_run(goal).await?;
        self.current = Some(run.id.clone());
        let Some(steps) = steps else {
            return Ok(Response::text(format!(
                "{}\nsubmit steps with 'run plan <file.json>'",
                report::status_line(&run)
            )));
        };
        let run = self.engine.submit_plan(&run.id, steps).await?;
        Ok(Response::with_job(
            format!("{}\n{}", report::status_line(&run), report::render_steps(&run)),
            Job::drive(&run.id, Drive::Continue),
        ))
    }

    async fn plan(&mut self, file: PathBuf) -> anyhow::Result<Response> {
        let run_id = self.require_run()?.to_owned();
        let steps = read_plan(&file).await?;
        let before = self.engine.snapshot(&run_id).await?.state;
        let ids = self.engine.add_steps(&run_id, steps).await?;
        let text = format!("added steps {}", ids.join(", "));
        if matches!(before, crate::run::RunState::Idle | crate::run::RunState::Planning) {
            Ok(Response::with_job(text, Job::drive(&run_id, Drive::Continue)))
        } else {
            Ok(Response::text(text))
        }
    }

    async fn status(&self) -> anyhow::Result<Response> {
        if let Some(run_id) = &self.current {
            let run = self.engine.snapshot(run_id).await?;
            return Ok(Response::text(describe(&run)));
        }
        let incomplete = self.engine.incomplete_runs().await?;
        if incomplete.is_empty() {
            return Ok(Response::text("no active run; start one with 'run start <goal>'"));
        }
        let mut out = String::from("no active run; incomplete runs on disk:");
        for run in &incomplete {
            let _ = write!(out, "\n  {} [{}] {}", run.id, run.state, run.goal);
        }
        out.push_str("\nuse 'run attach <id>' or 'run archive <id>'");
        Ok(Response::text(out))
    }

    async fn artifact_list(&self) -> String {
        let artifacts = self.engine.artifacts().list().await;
        let artifacts: Vec<_> = match &self.current {
            Some(run_id) => artifacts
                .into_iter()
                .filter(|a| a.produced_by.iter().any(|p| &p.run_id == run_id))
                .collect(),
            None => artifacts,
        };
        if artifacts.is_empty() {
            return "no artifacts".into();
        }
        let mut out = String::new();
        for a in &artifacts {
            let _ = writeln!(out, "{} {} ({} bytes, {})", a.id, a.path.display(), a.size, a.mime_type);
        }
        out.pop();
        out
    }

    fn require_run(&self) -> anyhow::Result<&str> {
        self.current
            .as_deref()
            .context("no active run; use 'run start <goal>' or 'run attach <id>'")
    }
}

async fn read_plan(path: &std::path::Path) -> anyhow::Result<Vec<crate::run::PlannedStep>> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read plan {}", path.display()))?;
    Ok(parse_plan(&json)?)
}

/// Status line plus the suggested next commands.
fn describe(run: &Run) -> String {
    let mut out = report::status_line(run);
    let actions = report::next_actions(run);
    if !actions.is_empty() {
        let _ = write!(out, "\nnext: {}", actions.join(" | "));
    }
    out
}

fn inspect(run: &Run) -> String {
    let mut out = describe(run);
    let _ = write!(out, "\ngoal: {}\n\n{}", run.goal, report::render_steps(run));
    for step in &run.plan {
        if let Some(result) = &step.result_ref {
            let _ = write!(out, "\n{} result: {result}", step.id);
        }
        if let Some(output) = &step.output {
            let preview: String = output.chars().take(INSPECT_OUTPUT_CHARS).collect();
            let _ = write!(out, "\n{} output:\n{preview}", step.id);
        }
    }
    let pending: Vec<String> = run.approvals.pending().map(ToString::to_string).collect();
    if !pending.is_empty() {
        let _ = write!(out, "\n\npending approvals:\n{}", pending.join("\n"));
    }
    let skip = run.history.len().saturating_sub(HISTORY_TAIL);
    if !run.history.is_empty() {
        out.push_str("\n\nhistory:");
        for entry in &run.history[skip..] {
            let _ = write!(out, "\n  {} {}", entry.at.format("%H:%M:%S"), entry.event);
        }
    }
    out
}
