use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use gantry_tools::{
    ArtifactsConfig, AuditConfig, PolicyConfig, ProcessConfig, ProviderConfig, WebConfig,
};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub workspace: WorkspaceConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub process: ProcessConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub artifacts: ArtifactsConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

fn default_workspace_id() -> String {
    "default".into()
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".gantry")
}

/// `[workspace]`: the root every run is confined to and where state lives.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkspaceConfig {
    #[serde(default = "default_workspace_id")]
    pub id: String,
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Runs, process registry, audit log and artifacts. Relative to `root`.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            id: default_workspace_id(),
            root: default_root(),
            state_dir: default_state_dir(),
        }
    }
}

fn default_max_step_attempts() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Attempts per step, the first one included.
    #[serde(default = "default_max_step_attempts")]
    pub max_step_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: default_max_step_attempts(),
        }
    }
}
