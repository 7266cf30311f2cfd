use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::policy::{AllowRule, PolicyMode};

fn default_true() -> bool {
    true
}

/// `[policy]` section: mode, capability switches and workspace roots.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub mode: PolicyMode,
    #[serde(default)]
    pub allow_shell: bool,
    #[serde(default)]
    pub allow_network: bool,
    /// Extra roots besides the workspace root.
    #[serde(default)]
    pub allowed_roots: Vec<PathBuf>,
    #[serde(default)]
    pub denied_roots: Vec<PathBuf>,
    #[serde(default)]
    pub exec_allowlist: Vec<AllowRule>,
    /// Treat any provider that fails to load as fatal.
    #[serde(default)]
    pub strict_metadata: bool,
    /// Providers that must load even without `strict_metadata`.
    #[serde(default)]
    pub require_providers: Vec<String>,
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_quiet_window_secs() -> u64 {
    30
}

fn default_grace_period_secs() -> u64 {
    5
}

fn default_tail_bytes() -> usize {
    8192
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_retention_secs() -> u64 {
    900
}

/// `[process]` section for the process supervisor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessConfig {
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Seconds without output before a running process is reported stalled.
    #[serde(default = "default_quiet_window_secs")]
    pub quiet_window_secs: u64,
    /// Seconds between SIGTERM and force kill.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_tail_bytes")]
    pub tail_bytes: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Seconds a finished process stays pollable before it is forgotten.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            quiet_window_secs: default_quiet_window_secs(),
            grace_period_secs: default_grace_period_secs(),
            tail_bytes: default_tail_bytes(),
            poll_interval_ms: default_poll_interval_ms(),
            retention_secs: default_retention_secs(),
        }
    }
}

fn default_audit_destination() -> String {
    "audit.jsonl".into()
}

/// `[audit]` section. `destination` is `stdout` or a file path relative to
/// the state directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_audit_destination")]
    pub destination: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            destination: default_audit_destination(),
        }
    }
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

/// `[artifacts]` section. A relative `dir` lives under the state directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactsConfig {
    #[serde(default = "default_artifacts_dir")]
    pub dir: PathBuf,
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        Self {
            dir: default_artifacts_dir(),
        }
    }
}

fn default_web_timeout() -> u64 {
    15
}

fn default_max_body_bytes() -> usize {
    1_048_576
}

/// `[web]` section for the `web_fetch` tool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebConfig {
    #[serde(default = "default_web_timeout")]
    pub timeout: u64,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            timeout: default_web_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

/// `[[providers]]` entry: an external provider described by a JSON manifest.
///
/// Its tools are invoked over `url` (`POST {url}/tools/{name}`) or by running
/// `command` with `--invoke <name> --args <json>`. With neither set the tools
/// are listed but cannot run.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProviderConfig {
    pub id: String,
    pub manifest: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Per-call timeout; 30 seconds when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}
