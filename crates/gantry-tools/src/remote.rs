//! Invocation of manifest-provider tools over the transport each provider
//! declares: an HTTP endpoint or a local command.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::config::ProviderConfig;
use crate::executor::{ToolCallRequest, ToolError, ToolExecutor, ToolOutput, truncate_tool_output};

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const ERROR_EXCERPT_CHARS: usize = 300;

#[derive(Debug, Clone)]
enum Transport {
    Http(Url),
    Command(Vec<String>),
}

#[derive(Debug, Clone)]
struct Endpoint {
    transport: Transport,
    timeout: Duration,
}

/// Reply body shared by both transports.
#[derive(Debug, Deserialize)]
struct RemoteReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    content: serde_json::Value,
    #[serde(default)]
    error: serde_json::Value,
}

impl RemoteReply {
    fn into_output(self) -> ToolOutput {
        let content = text_of(&self.content);
        let summary = if self.success {
            content
        } else {
            match text_of(&self.error) {
                e if !e.is_empty() => e,
                _ if !content.is_empty() => content,
                _ => "remote tool reported failure".to_owned(),
            }
        };
        ToolOutput {
            summary: truncate_tool_output(&summary),
            success: self.success,
            ..ToolOutput::default()
        }
    }
}

fn text_of(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_reply(body: &[u8]) -> Result<RemoteReply, ToolError> {
    serde_json::from_slice(body).map_err(|e| {
        ToolError::Remote(format!(
            "invalid reply ({e}): {}",
            excerpt(&String::from_utf8_lossy(body))
        ))
    })
}

fn excerpt(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= ERROR_EXCERPT_CHARS {
        return text.to_owned();
    }
    let mut out: String = text.chars().take(ERROR_EXCERPT_CHARS).collect();
    out.push_str("...");
    out
}

/// `{base}/tools/{name}`, with `name` percent-encoded as one segment.
fn tool_url(base: &Url, name: &str) -> Result<Url, ToolError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| ToolError::Remote(format!("cannot append a path to {base}")))?
        .pop_if_empty()
        .push("tools")
        .push(name);
    Ok(url)
}

/// Runs tools of manifest providers that configure a `url` or `command`.
///
/// Calls for any other provider fall through with `Ok(None)`.
#[derive(Debug)]
pub struct RemoteExecutor {
    client: reqwest::Client,
    endpoints: HashMap<String, Endpoint>,
    cwd: PathBuf,
}

impl RemoteExecutor {
    /// Command transports run in `cwd`. A provider with an unparsable `url`
    /// is logged and left without a transport.
    #[must_use]
    pub fn from_configs(configs: &[ProviderConfig], cwd: &Path) -> Self {
        let mut endpoints = HashMap::new();
        for config in configs {
            let transport = match (&config.url, config.command.as_slice()) {
                (Some(raw), _) => match Url::parse(raw) {
                    Ok(url) => Transport::Http(url),
                    Err(e) => {
                        tracing::warn!(provider = %config.id, url = %raw, "invalid provider url: {e}");
                        continue;
                    }
                },
                (None, []) => continue,
                (None, argv) => Transport::Command(argv.to_vec()),
            };
            let timeout = Duration::from_secs(config.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS));
            endpoints.insert(config.id.clone(), Endpoint { transport, timeout });
        }
        Self {
            client: reqwest::Client::new(),
            endpoints,
            cwd: cwd.to_path_buf(),
        }
    }

    /// Whether tools of `provider` can be invoked.
    #[must_use]
    pub fn handles(&self, provider: &str) -> bool {
        self.endpoints.contains_key(provider)
    }

    async fn invoke_http(
        &self,
        base: &Url,
        timeout: Duration,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Result<RemoteReply, ToolError> {
        let url = tool_url(base, name)?;
        let body = json!({ "arguments": arguments }).to_string();
        let resp = self
            .client
            .post(url)
            .timeout(timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| ToolError::Http(e.to_string()))?;
        let status = resp.status();
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| ToolError::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(ToolError::Http(format!(
                "HTTP {status}: {}",
                excerpt(&String::from_utf8_lossy(&bytes))
            )));
        }
        parse_reply(&bytes)
    }

    async fn invoke_command(
        &self,
        argv: &[String],
        timeout: Duration,
        name: &str,
        arguments: &serde_json::Value,
    ) -> Result<RemoteReply, ToolError> {
        let Some((program, rest)) = argv.split_first() else {
            return Err(ToolError::Remote("provider command is empty".into()));
        };
        let payload = json!({ "tool": name, "arguments": arguments }).to_string();
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(rest)
            .args(["--invoke", name, "--args", &payload])
            .current_dir(&self.cwd)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| ToolError::Timeout {
                timeout_secs: timeout.as_secs(),
            })??;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                String::from_utf8_lossy(&output.stdout).into_owned()
            } else {
                stderr.into_owned()
            };
            return Err(ToolError::Remote(format!(
                "{program} exited with {}: {}",
                output.status,
                excerpt(&detail)
            )));
        }
        parse_reply(String::from_utf8_lossy(&output.stdout).trim().as_bytes())
    }
}

impl ToolExecutor for RemoteExecutor {
    async fn execute_tool_call(
        &self,
        call: &ToolCallRequest,
    ) -> Result<Option<ToolOutput>, ToolError> {
        let Some(endpoint) = call
            .tool_id
            .provider()
            .and_then(|p| self.endpoints.get(p))
        else {
            return Ok(None);
        };
        let name = call.tool_id.name();
        let arguments = if call.arguments.is_null() {
            json!({})
        } else {
            call.arguments.clone()
        };
        let reply = match &endpoint.transport {
            Transport::Http(base) => {
                self.invoke_http(base, endpoint.timeout, name, &arguments)
                    .await?
            }
            Transport::Command(argv) => {
                self.invoke_command(argv, endpoint.timeout, name, &arguments)
                    .await?
            }
        };
        tracing::debug!(tool_id = %call.tool_id, success = reply.success, "remote tool invoked");
        Ok(Some(reply.into_output()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::tool_id::ToolId;

    const STUB: &str = r#"#!/bin/sh
[ "$1" = "--invoke" ] || exit 64
printf '%s' "$4" > last_args.json
case "$2" in
  echo) echo '{"success": true, "content": "pong"}' ;;
  refuse) echo '{"success": false, "error": "bad input"}' ;;
  crash) echo 'boom' >&2; exit 2 ;;
  garbage) echo 'not json' ;;
  slow) sleep 5 ;;
esac
"#;

    fn stub(dir: &Path, timeout_secs: Option<u64>) -> RemoteExecutor {
        let script = dir.join("stub.sh");
        std::fs::write(&script, STUB).unwrap();
        let config = ProviderConfig {
            id: "ext".into(),
            manifest: PathBuf::from("ext.json"),
            command: vec!["sh".into(), script.display().to_string()],
            timeout_secs,
            ..ProviderConfig::default()
        };
        RemoteExecutor::from_configs(&[config], dir)
    }

    fn call(id: &str, arguments: serde_json::Value) -> ToolCallRequest {
        ToolCallRequest::new(ToolId::parse(id), arguments, "r", "s")
    }

    #[tokio::test]
    async fn command_transport_passes_tool_and_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let exec = stub(dir.path(), None);
        let out = exec
            .execute_tool_call(&call("ext:echo", json!({"q": "ping"})))
            .await
            .unwrap()
            .unwrap();
        assert!(out.success);
        assert_eq!(out.summary, "pong");

        let sent: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("last_args.json")).unwrap())
                .unwrap();
        assert_eq!(sent, json!({"tool": "echo", "arguments": {"q": "ping"}}));
    }

    #[tokio::test]
    async fn reported_failure_keeps_error_text() {
        let dir = tempfile::tempdir().unwrap();
        let exec = stub(dir.path(), None);
        let out = exec
            .execute_tool_call(&call("ext:refuse", serde_json::Value::Null))
            .await
            .unwrap()
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.summary, "bad input");
    }

    #[tokio::test]
    async fn nonzero_exit_and_bad_reply_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let exec = stub(dir.path(), None);
        let err = exec
            .execute_tool_call(&call("ext:crash", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(&err, ToolError::Remote(m) if m.contains("boom")));

        let err = exec
            .execute_tool_call(&call("ext:garbage", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(&err, ToolError::Remote(m) if m.contains("not json")));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let exec = stub(dir.path(), Some(1));
        let err = exec
            .execute_tool_call(&call("ext:slow", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { timeout_secs: 1 }));
    }

    #[tokio::test]
    async fn other_providers_fall_through() {
        let dir = tempfile::tempdir().unwrap();
        let exec = stub(dir.path(), None);
        assert!(exec.handles("ext"));
        assert!(!exec.handles("github"));
        for id in ["github:search", "fs_read_text", "builtin:shell_run"] {
            assert!(exec.execute_tool_call(&call(id, json!({}))).await.unwrap().is_none());
        }
    }

    #[test]
    fn providers_without_transport_are_not_handled() {
        let configs = [
            ProviderConfig {
                id: "listed".into(),
                ..ProviderConfig::default()
            },
            ProviderConfig {
                id: "broken".into(),
                url: Some("not a url".into()),
                ..ProviderConfig::default()
            },
        ];
        let exec = RemoteExecutor::from_configs(&configs, Path::new("."));
        assert!(!exec.handles("listed"));
        assert!(!exec.handles("broken"));
    }

    #[test]
    fn tool_url_appends_encoded_segment() {
        let base = Url::parse("http://127.0.0.1:8080/mcp/").unwrap();
        assert_eq!(
            tool_url(&base, "search").unwrap().as_str(),
            "http://127.0.0.1:8080/mcp/tools/search"
        );
        assert_eq!(
            tool_url(&base, "a b").unwrap().as_str(),
            "http://127.0.0.1:8080/mcp/tools/a%20b"
        );
    }

    #[test]
    fn reply_without_error_falls_back_to_content() {
        let reply = parse_reply(br#"{"success": false, "content": {"code": 7}}"#).unwrap();
        assert_eq!(reply.into_output().summary, r#"{"code":7}"#);
    }
}
