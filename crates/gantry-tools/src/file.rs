use std::fmt::Write;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::boundary::WorkspaceBoundary;
use crate::definition::{RiskLevel, ToolDefinition, ToolRisk, schema_of};
use crate::executor::{
    ToolCallRequest, ToolError, ToolExecutor, ToolOutput, deserialize_params, truncate_tool_output,
};
use crate::provider::is_builtin;
use crate::tool_id::ToolId;

const MAX_LISTING: usize = 500;

#[derive(Debug, Deserialize, JsonSchema)]
struct ListDirParams {
    /// Directory to list, relative to the workspace root
    #[serde(default = "default_dir")]
    path: String,
}

fn default_dir() -> String {
    ".".into()
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ReadTextParams {
    /// File to read
    path: String,
    /// First line to return (0-based)
    offset: Option<usize>,
    /// Maximum number of lines
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct WriteTextParams {
    /// File to write; parent directories are created
    path: String,
    /// Text content
    content: String,
    /// Append instead of replacing
    #[serde(default)]
    append: bool,
}

/// Workspace file operations. Every path is re-resolved against the
/// boundary at execution time.
#[derive(Debug, Clone)]
pub struct FileExecutor {
    boundary: WorkspaceBoundary,
}

impl FileExecutor {
    #[must_use]
    pub fn new(boundary: WorkspaceBoundary) -> Self {
        Self { boundary }
    }

    async fn list_dir(&self, params: ListDirParams) -> Result<ToolOutput, ToolError> {
        let dir = self.boundary.resolve(&params.path)?;
        let mut reader = tokio::fs::read_dir(&dir).await?;
        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            entries.push(if is_dir { format!("{name}/") } else { name });
        }
        entries.sort();
        let total = entries.len();
        let mut summary = entries
            .into_iter()
            .take(MAX_LISTING)
            .collect::<Vec<_>>()
            .join("\n");
        if total > MAX_LISTING {
            let _ = write!(summary, "\n... {} more entries", total - MAX_LISTING);
        }
        if summary.is_empty() {
            summary = "(empty directory)".into();
        }
        Ok(ToolOutput::ok(summary))
    }

    async fn read_text(&self, params: ReadTextParams) -> Result<ToolOutput, ToolError> {
        let path = self.boundary.resolve(&params.path)?;
        let content = tokio::fs::read_to_string(&path).await?;
        let offset = params.offset.unwrap_or(0);
        let limit = params.limit.unwrap_or(usize::MAX);
        let selected: Vec<String> = content
            .lines()
            .skip(offset)
            .take(limit)
            .enumerate()
            .map(|(i, line)| format!("{:>4}\t{line}", offset + i + 1))
            .collect();
        Ok(ToolOutput::ok(truncate_tool_output(&selected.join("\n"))))
    }

    async fn write_text(&self, params: WriteTextParams) -> Result<ToolOutput, ToolError> {
        let path = self.boundary.resolve(&params.path)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        if params.append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(params.content.as_bytes()).await?;
            file.flush().await?;
        } else {
            tokio::fs::write(&path, &params.content).await?;
        }
        let verb = if params.append { "Appended" } else { "Wrote" };
        Ok(ToolOutput::ok(format!(
            "{verb} {} bytes to {}",
            params.content.len(),
            params.path
        ))
        .with_artifact(path))
    }
}

impl ToolExecutor for FileExecutor {
    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition::new(
                ToolId::new(crate::provider::BUILTIN, "fs_list_dir"),
                "List entries of a workspace directory",
                ToolRisk::Declared(RiskLevel::Read),
            )
            .path_params(&["path"])
            .schema(schema_of::<ListDirParams>()),
            ToolDefinition::new(
                ToolId::new(crate::provider::BUILTIN, "fs_read_text"),
                "Read a text file with line numbers",
                ToolRisk::Declared(RiskLevel::Read),
            )
            .path_params(&["path"])
            .schema(schema_of::<ReadTextParams>()),
            ToolDefinition::new(
                ToolId::new(crate::provider::BUILTIN, "fs_write_text"),
                "Write or append text to a workspace file",
                ToolRisk::Declared(RiskLevel::Write),
            )
            .mutating()
            .artifacts()
            .path_params(&["path"])
            .schema(schema_of::<WriteTextParams>()),
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
            "fs_list_dir" => self.list_dir(deserialize_params(&call.arguments)?).await?,
            "fs_read_text" => self.read_text(deserialize_params(&call.arguments)?).await?,
            "fs_write_text" => self.write_text(deserialize_params(&call.arguments)?).await?,
            _ => return Ok(None),
        };
        Ok(Some(output))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn executor(dir: &std::path::Path) -> FileExecutor {
        FileExecutor::new(WorkspaceBoundary::new(dir, &[], &[]))
    }

    fn call(name: &str, args: serde_json::Value) -> ToolCallRequest {
        ToolCallRequest::new(ToolId::new("builtin", name), args, "r", "s")
    }

    #[tokio::test]
    async fn write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let out = exec
            .execute_tool_call(&call(
                "fs_write_text",
                json!({"path": "notes/a.txt", "content": "one\ntwo\nthree"}),
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.artifacts.len(), 1);
        assert!(out.artifacts[0].ends_with("notes/a.txt"));

        let read = exec
            .execute_tool_call(&call(
                "fs_read_text",
                json!({"path": "notes/a.txt", "offset": 1, "limit": 1}),
            ))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.summary, "   2\ttwo");
    }

    #[tokio::test]
    async fn append_mode() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        for chunk in ["a", "b"] {
            exec.execute_tool_call(&call(
                "fs_write_text",
                json!({"path": "log.txt", "content": chunk, "append": true}),
            ))
            .await
            .unwrap();
        }
        assert_eq!(
            std::fs::read_to_string(dir.path().join("log.txt")).unwrap(),
            "ab"
        );
    }

    #[tokio::test]
    async fn list_dir_marks_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        let exec = executor(dir.path());
        let out = exec
            .execute_tool_call(&call("fs_list_dir", json!({})))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.summary, "Cargo.toml\nsrc/");
    }

    #[tokio::test]
    async fn escape_rejected_at_execution() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let err = exec
            .execute_tool_call(&call("fs_read_text", json!({"path": "../../etc/passwd"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Boundary(_)));
    }

    #[tokio::test]
    async fn write_creates_nested_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        exec.execute_tool_call(&call(
            "fs_write_text",
            json!({"path": "deep/er/new.txt", "content": "fresh"}),
        ))
        .await
        .unwrap()
        .unwrap();
        let written = dir.path().join("deep/er/new.txt");
        assert!(written.is_file());
        assert_eq!(std::fs::read_to_string(written).unwrap(), "fresh");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn write_through_dangling_link_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let target = outside.path().join("escaped.txt");
        std::os::unix::fs::symlink(&target, dir.path().join("link")).unwrap();
        let exec = executor(dir.path());
        let err = exec
            .execute_tool_call(&call(
                "fs_write_text",
                json!({"path": "link", "content": "nope"}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Boundary(_)));
        assert!(!target.exists());
    }

    #[tokio::test]
    async fn missing_param_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let err = exec
            .execute_tool_call(&call("fs_write_text", json!({"path": "a.txt"})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn foreign_tools_not_handled() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(dir.path());
        let other = ToolCallRequest::new(
            ToolId::new("mcp", "fs_read_text"),
            json!({"path": "a"}),
            "r",
            "s",
        );
        assert!(exec.execute_tool_call(&other).await.unwrap().is_none());
        assert!(
            exec.execute_tool_call(&call("shell_run", json!({})))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn definitions_carry_schema_and_paths() {
        let dir = tempfile::tempdir().unwrap();
        let defs = executor(dir.path()).tool_definitions();
        assert_eq!(defs.len(), 3);
        let write = defs.iter().find(|d| d.id.name() == "fs_write_text").unwrap();
        assert!(write.mutates);
        assert!(write.emits_artifacts);
        assert_eq!(write.path_params, vec!["path"]);
        assert!(write.input_schema["properties"]["content"].is_object());
    }
}
