use std::fmt::Write;
use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::boundary::WorkspaceBoundary;
use crate::definition::{RiskLevel, ToolDefinition, ToolRisk, schema_of};
use crate::executor::{
    ToolCallRequest, ToolError, ToolExecutor, ToolOutput, deserialize_params, truncate_tool_output,
};
use crate::process::{ProcessPoll, ProcessStatus, ProcessSupervisor};
use crate::provider::{BUILTIN, is_builtin};
use crate::tool_id::ToolId;

#[derive(Debug, Deserialize, JsonSchema)]
struct CommandParams {
    /// Shell command, run through `bash -c`
    command: String,
    /// Working directory, relative to the workspace root
    #[serde(default = "default_cwd")]
    cwd: String,
    /// Override of the default timeout in seconds
    timeout_secs: Option<u64>,
}

fn default_cwd() -> String {
    ".".into()
}

#[derive(Debug, Deserialize, JsonSchema)]
struct PollParams {
    /// Id returned by `shell_start`
    process_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct KillParams {
    /// Id returned by `shell_start`
    process_id: String,
    /// Skip graceful termination
    #[serde(default)]
    force: bool,
}

/// Shell tools backed by the process supervisor.
///
/// `shell_run` waits for completion; `shell_start` returns a process id that
/// is observed with `shell_poll` and stopped with `shell_kill`.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    supervisor: ProcessSupervisor,
    boundary: WorkspaceBoundary,
}

impl ShellExecutor {
    #[must_use]
    pub fn new(supervisor: ProcessSupervisor, boundary: WorkspaceBoundary) -> Self {
        Self {
            supervisor,
            boundary,
        }
    }

    #[must_use]
    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    async fn run(&self, call: &ToolCallRequest, params: CommandParams) -> Result<ToolOutput, ToolError> {
        let cwd = self.boundary.resolve(&params.cwd)?;
        let timeout = params.timeout_secs.map(Duration::from_secs);
        let handle =
            self.supervisor
                .start(&params.command, &cwd, timeout, &call.run_id, &call.step_id)?;
        let poll = self.supervisor.wait(&handle.process_id).await?;
        if poll.timed_out {
            let timeout_secs = timeout
                .unwrap_or(self.supervisor.settings().default_timeout)
                .as_secs();
            return Err(ToolError::Timeout { timeout_secs });
        }
        Ok(ToolOutput {
            summary: truncate_tool_output(&format_run(&params.command, &poll)),
            success: poll.exit_code == Some(0),
            exit_code: poll.exit_code,
            ..ToolOutput::default()
        })
    }

    fn start(&self, call: &ToolCallRequest, params: &CommandParams) -> Result<ToolOutput, ToolError> {
        let cwd = self.boundary.resolve(&params.cwd)?;
        let handle = self.supervisor.start(
            &params.command,
            &cwd,
            params.timeout_secs.map(Duration::from_secs),
            &call.run_id,
            &call.step_id,
        )?;
        Ok(ToolOutput {
            summary: format!("started {} (pid {:?}): {}", handle.process_id, handle.pid, handle.command),
            success: true,
            process_id: Some(handle.process_id),
            ..ToolOutput::default()
        })
    }

    fn poll(&self, params: &PollParams) -> Result<ToolOutput, ToolError> {
        let poll = self.supervisor.poll(&params.process_id)?;
        Ok(ToolOutput {
            summary: format_poll(&poll),
            success: true,
            exit_code: poll.exit_code,
            ..ToolOutput::default()
        })
    }

    async fn kill(&self, params: &KillParams) -> Result<ToolOutput, ToolError> {
        let was_running = self.supervisor.poll(&params.process_id)?.running;
        let poll = self.supervisor.kill(&params.process_id, params.force).await?;
        Ok(ToolOutput {
            summary: format_kill(&poll, was_running),
            success: true,
            exit_code: poll.exit_code,
            ..ToolOutput::default()
        })
    }
}

fn format_run(command: &str, poll: &ProcessPoll) -> String {
    let mut out = format!("$ {command}\n");
    out.push_str(&poll.stdout_tail);
    if !poll.stderr_tail.is_empty() {
        if !out.ends_with('\n') {
            out.push('\n');
        }
        let _ = write!(out, "[stderr] {}", poll.stderr_tail);
    }
    if !out.ends_with('\n') {
        out.push('\n');
    }
    match poll.exit_code {
        Some(code) => {
            let _ = write!(out, "[exit code {code}]");
        }
        None => out.push_str("[terminated by signal]"),
    }
    out
}

/// Poll snapshot with both tails, for the operator and the model.
#[must_use]
pub fn format_poll(poll: &ProcessPoll) -> String {
    let mut out = poll.to_string();
    if !poll.stdout_tail.is_empty() {
        let _ = write!(out, "\n--- stdout (tail) ---\n{}", poll.stdout_tail);
    }
    if !poll.stderr_tail.is_empty() {
        let _ = write!(out, "\n--- stderr (tail) ---\n{}", poll.stderr_tail);
    }
    out
}

/// Operator text for a kill; a process that was already gone is reported as
/// such rather than as freshly killed.
#[must_use]
pub fn format_kill(poll: &ProcessPoll, was_running: bool) -> String {
    if !was_running {
        return format!("{} already {}", poll.process_id, poll.status);
    }
    match poll.status {
        ProcessStatus::Killed => format!("killed {poll}"),
        _ => format!("{} exited before the kill landed: {poll}", poll.process_id),
    }
}

impl ToolExecutor for ShellExecutor {
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                ToolId::new(BUILTIN, "shell_run"),
                "Run a shell command to completion and return its output",
                ToolRisk::Declared(RiskLevel::Exec),
            )
            .mutating()
            .shell()
            .path_params(&["cwd"])
            .schema(schema_of::<CommandParams>()),
            ToolDefinition::new(
                ToolId::new(BUILTIN, "shell_start"),
                "Start a long-running shell command in the background",
                ToolRisk::Declared(RiskLevel::Exec),
            )
            .mutating()
            .shell()
            .background()
            .path_params(&["cwd"])
            .schema(schema_of::<CommandParams>()),
            ToolDefinition::new(
                ToolId::new(BUILTIN, "shell_poll"),
                "Report status and output tail of a background process",
                ToolRisk::Declared(RiskLevel::Read),
            )
            .schema(schema_of::<PollParams>()),
            ToolDefinition::new(
                ToolId::new(BUILTIN, "shell_kill"),
                "Terminate a background process",
                ToolRisk::Declared(RiskLevel::Write),
            )
            .mutating()
            .schema(schema_of::<KillParams>()),
        ]
    }

    async fn execute_tool_call(
        &self,
        call: &ToolCallRequest,
    ) -> Result<Option<ToolOutput>, ToolError> {
        if !is_builtin(&call.tool_id) {
            return Ok(None);
        }
        let output = match call.tool_id.name() {
            "shell_run" => self.run(call, deserialize_params(&call.arguments)?).await?,
            "shell_start" => self.start(call, &deserialize_params(&call.arguments)?)?,
            "shell_poll" => self.poll(&deserialize_params(&call.arguments)?)?,
            "shell_kill" => self.kill(&deserialize_params(&call.arguments)?).await?,
            _ => return Ok(None),
        };
        Ok(Some(output))
    }
}
