mod env;
mod types;


pub use types::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use gantry_tools::WorkspaceBoundary;

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to sensible defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str::<Self>(&content).context("failed to parse config file")?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject values that would make the engine unusable.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first offending field.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.process.default_timeout_secs == 0 {
            bail!("process.default_timeout_secs must be greater than zero");
        }
        if self.process.tail_bytes == 0 {
            bail!("process.tail_bytes must be greater than zero");
        }
        if self.process.poll_interval_ms == 0 {
            bail!("process.poll_interval_ms must be greater than zero");
        }
        if self.engine.max_step_attempts == 0 {
            bail!("engine.max_step_attempts must be greater than zero");
        }
        if self.web.timeout == 0 {
            bail!("web.timeout must be greater than zero");
        }
        let state_dir = self.state_dir();
        if state_dir.is_file() {
            bail!("workspace.state_dir {} is a file", state_dir.display());
        }
        let mut seen = std::collections::HashSet::new();
        for provider in &self.providers {
            if provider.id == gantry_tools::BUILTIN {
                bail!("provider id '{}' is reserved", provider.id);
            }
            if !seen.insert(provider.id.as_str()) {
                bail!("provider '{}' configured twice", provider.id);
            }
        }
        Ok(())
    }

    /// Workspace root with `~` expanded.
    #[must_use]
    pub fn workspace_root(&self) -> PathBuf {
        let root = &self.workspace.root;
        if let Ok(rest) = root.strip_prefix("~")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(rest);
        }
        root.clone()
    }

    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.workspace_root().join(&self.workspace.state_dir)
    }

    #[must_use]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.state_dir().join(&self.artifacts.dir)
    }

    #[must_use]
    pub fn boundary(&self) -> WorkspaceBoundary {
        WorkspaceBoundary::new(
            &self.workspace_root(),
            &self.policy.allowed_roots,
            &self.policy.denied_roots,
        )
    }
}

/// Priority: `--config` > `GANTRY_CONFIG` > `gantry.toml`.
#[must_use]
pub fn resolve_config_path(cli: Option<&Path>) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("GANTRY_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("gantry.toml")
}
