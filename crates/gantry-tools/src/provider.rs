//! Tool providers: where registry entries come from at startup.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::config::{PolicyConfig, ProviderConfig};
use crate::definition::{Execution, RiskLevel, ToolDefinition, ToolRisk};
use crate::executor::ToolExecutor;
use crate::registry::{RegistryError, ToolRegistry};
use crate::tool_id::ToolId;

/// Provider id of the tools compiled into this crate.
pub const BUILTIN: &str = "builtin";

/// True for `builtin:*` ids and for bare names, which builtin executors
/// accept as their own.
#[must_use]
pub fn is_builtin(id: &ToolId) -> bool {
    id.provider().is_none_or(|p| p == BUILTIN)
}

/// Source of tool definitions registered once at startup.
pub trait ToolProvider: Send + Sync {
    fn id(&self) -> &str;

    /// Advertised definitions.
    ///
    /// # Errors
    ///
    /// `RegistryError::ProviderUnavailable` when the provider cannot be reached
    /// or its metadata cannot be read.
    fn definitions(&self) -> Result<Vec<ToolDefinition>, RegistryError>;
}

/// Definitions of the builtin executors.
#[derive(Debug, Clone)]
pub struct BuiltinProvider {
    definitions: Vec<ToolDefinition>,
}

impl BuiltinProvider {
    #[must_use]
    pub fn from_executor(executor: &impl ToolExecutor) -> Self {
        Self {
            definitions: executor.tool_definitions(),
        }
    }
}

impl ToolProvider for BuiltinProvider {
    fn id(&self) -> &str {
        BUILTIN
    }

    fn definitions(&self) -> Result<Vec<ToolDefinition>, RegistryError> {
        Ok(self.definitions.clone())
    }
}

/// One entry of a provider manifest, in the loose shape MCP-style servers
/// advertise: only `name` is required.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestTool {
    name: String,
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    risk: Option<String>,
    #[serde(default)]
    mutates: bool,
    #[serde(default)]
    requires_network: bool,
    #[serde(default)]
    requires_shell: bool,
    #[serde(default)]
    path_params: Vec<String>,
    #[serde(default)]
    emits_artifacts: bool,
    #[serde(default)]
    background: bool,
    #[serde(default, alias = "input_schema")]
    input_schema: serde_json::Value,
}

fn parse_risk(raw: Option<&str>) -> ToolRisk {
    match raw.map(str::to_ascii_lowercase).as_deref() {
        Some("read") => ToolRisk::Declared(RiskLevel::Read),
        Some("write") => ToolRisk::Declared(RiskLevel::Write),
        Some("exec") => ToolRisk::Declared(RiskLevel::Exec),
        _ => ToolRisk::Unknown,
    }
}

impl ManifestTool {
    fn into_definition(self, provider: &str) -> ToolDefinition {
        let id = match self.server {
            Some(server) => ToolId::with_server(provider, server, self.name),
            None => ToolId::new(provider, self.name),
        };
        ToolDefinition {
            id,
            description: self.description,
            risk: parse_risk(self.risk.as_deref()),
            mutates: self.mutates,
            requires_network: self.requires_network,
            requires_shell: self.requires_shell,
            path_params: self.path_params,
            emits_artifacts: self.emits_artifacts,
            execution: if self.background {
                Execution::Background
            } else {
                Execution::Sync
            },
            input_schema: self.input_schema,
        }
    }
}

/// Provider described by a JSON manifest file: an array of tool entries.
///
/// A missing or unrecognised `risk` becomes [`ToolRisk::Unknown`].
#[derive(Debug, Clone)]
pub struct ManifestProvider {
    id: String,
    path: PathBuf,
}

impl ManifestProvider {
    #[must_use]
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    /// Relative manifest paths resolve against `base_dir`.
    #[must_use]
    pub fn from_config(config: &ProviderConfig, base_dir: &Path) -> Self {
        Self::new(config.id.clone(), base_dir.join(&config.manifest))
    }

    fn unavailable(&self, message: impl Into<String>) -> RegistryError {
        RegistryError::ProviderUnavailable {
            provider: self.id.clone(),
            message: message.into(),
        }
    }
}

impl ToolProvider for ManifestProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn definitions(&self) -> Result<Vec<ToolDefinition>, RegistryError> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| self.unavailable(format!("{}: {e}", self.path.display())))?;
        let tools: Vec<ManifestTool> = serde_json::from_str(&content)
            .map_err(|e| self.unavailable(format!("invalid manifest: {e}")))?;
        Ok(tools
            .into_iter()
            .map(|t| t.into_definition(&self.id))
            .collect())
    }
}

/// Register every provider's definitions.
///
/// Unavailable providers are reported and skipped, unless
/// `strict_metadata` is set or the provider is listed in
/// `require_providers`. Returns the ids of skipped providers.
///
/// # Errors
///
/// `ProviderUnavailable` for a required provider that failed,
/// `DuplicateTool` when a provider advertises the same tool twice.
pub fn register_providers(
    registry: &mut ToolRegistry,
    providers: &[&dyn ToolProvider],
    policy: &PolicyConfig,
) -> Result<Vec<String>, RegistryError> {
    let mut skipped = Vec::new();
    for provider in providers {
        let id = provider.id();
        match provider.definitions() {
            Ok(defs) => {
                let count = defs.len();
                for def in defs {
                    registry.register(id, def)?;
                }
                tracing::info!(provider = id, tools = count, "provider registered");
            }
            Err(e) if policy.strict_metadata || policy.require_providers.iter().any(|p| p == id) => {
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(provider = id, error = %e, "provider unavailable, continuing without it");
                skipped.push(id.to_owned());
            }
        }
    }
    for (name, ids) in registry.collisions() {
        let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
        tracing::info!(name, candidates = %ids.join(", "), "tool name needs qualification");
    }
    Ok(skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Tier;

    const MANIFEST: &str = r#"[
        {"name": "search", "server": "github", "description": "Search code", "risk": "read"},
        {"name": "deploy", "risk": "EXEC", "mutates": true, "background": true},
        {"name": "mystery", "inputSchema": {"type": "object"}}
    ]"#;

    fn write_manifest(dir: &Path, content: &str) -> PathBuf {
        let path = dir.join("tools.json");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn builtin_matches_bare_and_builtin() {
        assert!(is_builtin(&ToolId::parse("shell_run")));
        assert!(is_builtin(&ToolId::parse("builtin:shell_run")));
        assert!(!is_builtin(&ToolId::parse("mcp:shell_run")));
    }

    #[test]
    fn manifest_parses_loose_entries() {
        let dir = tempfile::tempdir().unwrap();
        let provider = ManifestProvider::new("mcp", write_manifest(dir.path(), MANIFEST));
        let defs = provider.definitions().unwrap();
        assert_eq!(defs.len(), 3);

        assert_eq!(defs[0].id.to_string(), "mcp:github:search");
        assert_eq!(defs[0].risk, ToolRisk::Declared(RiskLevel::Read));

        assert_eq!(defs[1].risk, ToolRisk::Declared(RiskLevel::Exec));
        assert_eq!(defs[1].execution, Execution::Background);

        assert_eq!(defs[2].risk, ToolRisk::Unknown);
        assert_eq!(defs[2].tier(), Tier::EXEC);
        assert_eq!(defs[2].input_schema["type"], "object");
    }

    #[test]
    fn missing_manifest_is_unavailable() {
        let provider = ManifestProvider::new("mcp", "/nonexistent/tools.json");
        assert!(matches!(
            provider.definitions(),
            Err(RegistryError::ProviderUnavailable { .. })
        ));
    }

    #[test]
    fn unavailable_provider_skipped_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let good = ManifestProvider::new("good", write_manifest(dir.path(), MANIFEST));
        let bad = ManifestProvider::new("bad", dir.path().join("missing.json"));
        let mut registry = ToolRegistry::new();
        let skipped =
            register_providers(&mut registry, &[&good, &bad], &PolicyConfig::default()).unwrap();
        assert_eq!(skipped, vec!["bad"]);
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn required_provider_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let bad = ManifestProvider::new("bad", dir.path().join("missing.json"));
        let policy = PolicyConfig {
            require_providers: vec!["bad".into()],
            ..PolicyConfig::default()
        };
        let mut registry = ToolRegistry::new();
        assert!(register_providers(&mut registry, &[&bad], &policy).is_err());

        let strict = PolicyConfig {
            strict_metadata: true,
            ..PolicyConfig::default()
        };
        assert!(register_providers(&mut registry, &[&bad], &strict).is_err());
    }

    #[test]
    fn duplicate_in_one_provider_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let dup = ManifestProvider::new(
            "mcp",
            write_manifest(dir.path(), r#"[{"name": "a"}, {"name": "a"}]"#),
        );
        let mut registry = ToolRegistry::new();
        let err = register_providers(&mut registry, &[&dup], &PolicyConfig::default()).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateTool { .. }));
    }
}
