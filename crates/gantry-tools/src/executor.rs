use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::boundary::BoundaryViolation;
use crate::definition::ToolDefinition;
use crate::failure::FailureKind;
use crate::process::ProcessError;
use crate::tool_id::ToolId;

/// One tool invocation, created by the run engine per step attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub tool_id: ToolId,
    pub arguments: serde_json::Value,
    pub step_id: String,
    pub run_id: String,
}

impl ToolCallRequest {
    #[must_use]
    pub fn new(
        tool_id: ToolId,
        arguments: serde_json::Value,
        run_id: impl Into<String>,
        step_id: impl Into<String>,
    ) -> Self {
        Self {
            tool_id,
            arguments,
            step_id: step_id.into(),
            run_id: run_id.into(),
        }
    }
}

/// Structured result from tool execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub summary: String,
    /// `false` when the tool ran but reported failure (e.g. non-zero exit).
    pub success: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<PathBuf>,
    /// Set by background tools; the engine polls this process until exit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl ToolOutput {
    #[must_use]
    pub fn ok(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            success: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_artifact(mut self, path: PathBuf) -> Self {
        self.artifacts.push(path);
        self
    }
}

impl fmt::Display for ToolOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary)
    }
}

pub const MAX_TOOL_OUTPUT_CHARS: usize = 30_000;

/// Truncate tool output that exceeds `MAX_TOOL_OUTPUT_CHARS` using head+tail split.
#[must_use]
pub fn truncate_tool_output(output: &str) -> String {
    if output.len() <= MAX_TOOL_OUTPUT_CHARS {
        return output.to_string();
    }

    let half = MAX_TOOL_OUTPUT_CHARS / 2;
    let mut head_end = half;
    while !output.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = output.len() - half;
    while !output.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let head = &output[..head_end];
    let tail = &output[tail_start..];
    let truncated = tail_start - head_end;

    format!("{head}\n\n... [truncated {truncated} chars] ...\n\n{tail}")
}

/// Errors that can occur during tool execution.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error(transparent)]
    Boundary(#[from] BoundaryViolation),

    #[error("command timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("invalid tool parameters: {message}")]
    InvalidParams { message: String },

    #[error("no executor handles tool {0}")]
    Unsupported(ToolId),

    #[error("http request failed: {0}")]
    Http(String),

    #[error("remote tool failed: {0}")]
    Remote(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("execution failed: {0}")]
    Execution(#[from] std::io::Error),
}

impl ToolError {
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Boundary(_) => FailureKind::PathEscapesWorkspace,
            Self::Timeout { .. } => FailureKind::ProcessTimeout,
            Self::Unsupported(_) => FailureKind::InternalError,
            Self::InvalidParams { .. }
            | Self::Http(_)
            | Self::Remote(_)
            | Self::Process(_)
            | Self::Execution(_) => FailureKind::ToolFailed,
        }
    }
}

/// Deserialize tool call arguments into a typed struct.
///
/// # Errors
///
/// Returns `ToolError::InvalidParams` when deserialization fails.
pub fn deserialize_params<T: serde::de::DeserializeOwned>(
    arguments: &serde_json::Value,
) -> Result<T, ToolError> {
    let value = if arguments.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        arguments.clone()
    };
    serde_json::from_value(value).map_err(|e| ToolError::InvalidParams {
        message: e.to_string(),
    })
}

/// Async trait for tool execution backends.
pub trait ToolExecutor: Send + Sync {
    /// Return tool definitions this executor can handle.
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![]
    }

    /// Execute a structured tool call. Returns `None` if `tool_id` is not handled.
    fn execute_tool_call(
        &self,
        _call: &ToolCallRequest,
    ) -> impl Future<Output = Result<Option<ToolOutput>, ToolError>> + Send {
        std::future::ready(Ok(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_output_display() {
        let output = ToolOutput::ok("$ echo hello\nhello");
        assert_eq!(output.to_string(), "$ echo hello\nhello");
        assert!(output.success);
    }

    #[test]
    fn tool_error_timeout_display() {
        let err = ToolError::Timeout { timeout_secs: 30 };
        assert_eq!(err.to_string(), "command timed out after 30s");
        assert_eq!(err.failure_kind(), FailureKind::ProcessTimeout);
    }

    #[test]
    fn boundary_error_maps_to_path_escape() {
        let err = ToolError::from(BoundaryViolation::OutsideRoots {
            path: PathBuf::from("/etc"),
        });
        assert_eq!(err.failure_kind(), FailureKind::PathEscapesWorkspace);
        assert!(err.to_string().contains("/etc"));
    }

    #[test]
    fn deserialize_params_valid() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct P {
            name: String,
            count: u32,
        }
        let p: P = deserialize_params(&serde_json::json!({"name": "test", "count": 42})).unwrap();
        assert_eq!(
            p,
            P {
                name: "test".to_owned(),
                count: 42
            }
        );
    }

    #[test]
    fn deserialize_params_missing_required_field() {
        #[derive(Debug, serde::Deserialize)]
        struct P {
            #[allow(dead_code)]
            name: String,
        }
        let err = deserialize_params::<P>(&serde_json::json!({})).unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));
    }

    #[test]
    fn deserialize_params_null_is_empty_object() {
        #[derive(Debug, serde::Deserialize, PartialEq)]
        struct P {
            name: Option<String>,
        }
        let p: P = deserialize_params(&serde_json::Value::Null).unwrap();
        assert_eq!(p, P { name: None });
    }

    #[test]
    fn truncate_tool_output_short_passthrough() {
        assert_eq!(truncate_tool_output("hello world"), "hello world");
    }

    #[test]
    fn truncate_tool_output_long_split() {
        let long = "x".repeat(MAX_TOOL_OUTPUT_CHARS + 1000);
        let result = truncate_tool_output(&long);
        assert!(result.contains("truncated"));
        assert!(result.len() < long.len());
    }

    #[derive(Debug)]
    struct DefaultExecutor;
    impl ToolExecutor for DefaultExecutor {}

    #[tokio::test]
    async fn execute_tool_call_default_returns_none() {
        let exec = DefaultExecutor;
        let call = ToolCallRequest::new(
            ToolId::parse("anything"),
            serde_json::Value::Null,
            "run",
            "step",
        );
        let result = exec.execute_tool_call(&call).await.unwrap();
        assert!(result.is_none());
    }
}
