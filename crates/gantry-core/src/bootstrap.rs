//! Application bootstrap: config resolution, tool and engine construction.

use std::path::{Path, PathBuf};

use anyhow::Context;
use gantry_tools::{
    ArtifactStore, AuditLogger, BuiltinProvider, CompositeExecutor, FileExecutor,
    ManifestProvider, ProcessSupervisor, RemoteExecutor, ShellExecutor, SupervisorSettings,
    ToolProvider, ToolRegistry, WebExecutor, register_providers,
};

use crate::config::{Config, resolve_config_path};
use crate::engine::{EngineParts, EngineSettings, RunEngine};
use crate::store::RunStore;

/// Every executor the engine dispatches to: the builtin file, shell and web
/// tools, then manifest providers with a configured transport.
pub type BuiltinTools = CompositeExecutor<
    FileExecutor,
    CompositeExecutor<ShellExecutor, CompositeExecutor<WebExecutor, RemoteExecutor>>,
>;

const PROCESS_REGISTRY: &str = "processes.json";

pub struct AppBuilder {
    config: Config,
    config_path: PathBuf,
}

impl AppBuilder {
    /// Resolve and load the config file, then validate it.
    ///
    /// # Errors
    ///
    /// Returns an error if the config cannot be parsed or is invalid.
    pub fn load(cli_config: Option<&Path>) -> anyhow::Result<Self> {
        let config_path = resolve_config_path(cli_config);
        let config = Config::load(&config_path)?;
        config.validate()?;
        Ok(Self {
            config,
            config_path,
        })
    }

    #[must_use]
    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            config_path: PathBuf::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Assemble the engine: supervisor (reaping orphans of an earlier
    /// process), executors, registry, audit sink, artifact registry and run
    /// store.
    ///
    /// # Errors
    ///
    /// Returns an error if a required provider is unavailable or a state
    /// file cannot be opened.
    pub async fn build_engine(&self) -> anyhow::Result<RunEngine<BuiltinTools>> {
        let config = &self.config;
        let state_dir = config.state_dir();
        tokio::fs::create_dir_all(&state_dir)
            .await
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;

        let supervisor = ProcessSupervisor::new(SupervisorSettings::from_config(
            &config.process,
            Some(state_dir.join(PROCESS_REGISTRY)),
        ));
        let reaped = supervisor.reap_orphans();
        if !reaped.is_empty() {
            tracing::warn!(count = reaped.len(), "terminated processes left by a previous session");
        }

        let boundary = config.boundary();
        let executor = CompositeExecutor::new(
            FileExecutor::new(boundary.clone()),
            CompositeExecutor::new(
                ShellExecutor::new(supervisor.clone(), boundary),
                CompositeExecutor::new(
                    WebExecutor::new(&config.web),
                    RemoteExecutor::from_configs(&config.providers, &config.workspace_root()),
                ),
            ),
        );

        let registry = build_registry(config, &executor)?;
        let audit = AuditLogger::from_config(&config.audit, &state_dir)
            .await
            .context("failed to open audit log")?;
        let artifacts = ArtifactStore::open(config.artifacts_dir())
            .await
            .context("failed to open artifact registry")?;
        let store = RunStore::new(&state_dir);

        let engine = RunEngine::new(EngineParts {
            registry,
            executor,
            supervisor,
            audit,
            artifacts,
            store,
            settings: EngineSettings::from_config(config),
        });

        for run in engine.incomplete_runs().await? {
            tracing::warn!(
                run_id = %run.id,
                state = %run.state,
                goal = %run.goal,
                "incomplete run found, use 'run attach' or 'run archive'"
            );
        }
        Ok(engine)
    }

    /// `<state_dir>/reports`, where `run report` writes.
    #[must_use]
    pub fn reports_dir(&self) -> PathBuf {
        self.config.state_dir().join("reports")
    }
}

/// Builtin tools first, then every configured manifest provider.
///
/// # Errors
///
/// Returns an error for a required provider that failed or a duplicate tool.
pub fn build_registry(config: &Config, executor: &BuiltinTools) -> anyhow::Result<ToolRegistry> {
    let builtin = BuiltinProvider::from_executor(executor);
    let base_dir = config.workspace_root();
    let manifests: Vec<ManifestProvider> = config
        .providers
        .iter()
        .map(|p| ManifestProvider::from_config(p, &base_dir))
        .collect();

    let mut providers: Vec<&dyn ToolProvider> = vec![&builtin];
    providers.extend(manifests.iter().map(|m| m as &dyn ToolProvider));

    let mut registry = ToolRegistry::new();
    let skipped = register_providers(&mut registry, &providers, &config.policy)?;
    tracing::info!(
        tools = registry.len(),
        skipped = skipped.len(),
        "tool registry ready"
    );
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use gantry_tools::{ProviderConfig, ToolFilter};

    use super::*;

    fn config_in(root: &Path) -> Config {
        let mut config = Config::default();
        config.workspace.root = root.to_path_buf();
        config.audit.destination = "audit.jsonl".into();
        config
    }

    #[tokio::test]
    async fn builds_engine_with_state_layout() {
        let root = tempfile::tempdir().unwrap();
        let app = AppBuilder::from_config(config_in(root.path()));
        let engine = app.build_engine().await.unwrap();

        assert!(engine.registry().resolve("fs_read_text").is_ok());
        assert!(engine.registry().resolve("builtin:web_fetch").is_ok());
        assert!(root.path().join(".gantry").is_dir());
        assert_eq!(app.reports_dir(), root.path().join(".gantry").join("reports"));
    }

    #[tokio::test]
    async fn manifest_providers_join_the_registry() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(
            root.path().join("mcp.json"),
            r#"[{"name": "search", "risk": "read"}, {"name": "mystery"}]"#,
        )
        .unwrap();
        let mut config = config_in(root.path());
        config.providers.push(ProviderConfig {
            id: "github".into(),
            manifest: "mcp.json".into(),
            ..ProviderConfig::default()
        });
        let app = AppBuilder::from_config(config);
        let engine = app.build_engine().await.unwrap();

        assert!(engine.registry().resolve("github:search").is_ok());
        let unknown = engine.tools(&ToolFilter {
            unknown_risk: true,
            ..ToolFilter::default()
        });
        assert!(unknown.contains("github:mystery"));
    }

    #[tokio::test]
    async fn missing_optional_manifest_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        let mut config = config_in(root.path());
        config.providers.push(ProviderConfig {
            id: "offline".into(),
            manifest: "nope.json".into(),
            ..ProviderConfig::default()
        });
        let app = AppBuilder::from_config(config);
        let engine = app.build_engine().await.unwrap();
        assert!(engine.registry().resolve("offline:anything").is_err());
    }

    #[tokio::test]
    async fn missing_required_manifest_fails() {
        let root = tempfile::tempdir().unwrap();
        let mut config = config_in(root.path());
        config.providers.push(ProviderConfig {
            id: "offline".into(),
            manifest: "nope.json".into(),
            ..ProviderConfig::default()
        });
        config.policy.require_providers.push("offline".into());
        let app = AppBuilder::from_config(config);
        assert!(app.build_engine().await.is_err());
    }
}
