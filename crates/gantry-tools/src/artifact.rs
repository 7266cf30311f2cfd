//! Content-addressed artifact registry persisted as `manifest.json`.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::tool_id::ToolId;

const MANIFEST: &str = "manifest.json";

#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("failed to write artifact manifest {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("artifact not found: {0}")]
    NotFound(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt artifact manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Who produced an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub run_id: String,
    pub step_id: String,
    pub tool_id: ToolId,
    pub path: PathBuf,
    pub registered_at: DateTime<Utc>,
}

impl Provenance {
    fn same_origin(&self, other: &Self) -> bool {
        self.run_id == other.run_id
            && self.step_id == other.step_id
            && self.tool_id == other.tool_id
            && self.path == other.path
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,
    pub path: PathBuf,
    pub hash: String,
    pub size: u64,
    pub mime_type: String,
    pub produced_by: Vec<Provenance>,
    pub created_at: DateTime<Utc>,
}

/// Result of [`ArtifactStore::open`].
#[derive(Debug, Clone)]
pub struct OpenedArtifact {
    pub artifact: Artifact,
    /// First registered path whose file still hashes to the recorded value.
    pub location: Option<PathBuf>,
    /// `location` is set.
    pub intact: bool,
}

impl Artifact {
    /// The first registered path followed by each distinct producer path.
    #[must_use]
    pub fn paths(&self) -> Vec<&Path> {
        let mut paths = vec![self.path.as_path()];
        for link in &self.produced_by {
            if !paths.contains(&link.path.as_path()) {
                paths.push(&link.path);
            }
        }
        paths
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    artifacts: Vec<Artifact>,
}

#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    manifest: Mutex<Manifest>,
}

impl ArtifactStore {
    /// Load or create the registry under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing manifest cannot be read or parsed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, ArtifactError> {
        let dir = dir.into();
        let path = dir.join(MANIFEST);
        let manifest = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Manifest::default(),
            Err(source) => return Err(ArtifactError::Io { path, source }),
        };
        Ok(Self {
            dir,
            manifest: Mutex::new(manifest),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Register the file at `path` as produced by the given step.
    ///
    /// Identical content maps to one artifact; a new producer only adds a
    /// provenance link, and repeating the same producer changes nothing.
    ///
    /// # Errors
    ///
    /// `Io` when the file cannot be read, `WriteFailed` when the manifest
    /// cannot be persisted.
    pub async fn register(
        &self,
        path: &Path,
        run_id: &str,
        step_id: &str,
        tool_id: &ToolId,
    ) -> Result<Artifact, ArtifactError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ArtifactError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let hash = blake3::hash(&bytes).to_hex().to_string();
        let now = Utc::now();
        let link = Provenance {
            run_id: run_id.to_owned(),
            step_id: step_id.to_owned(),
            tool_id: tool_id.clone(),
            path: path.to_path_buf(),
            registered_at: now,
        };

        let mut manifest = self.manifest.lock().await;
        let artifact = if let Some(existing) = manifest.artifacts.iter_mut().find(|a| a.hash == hash)
        {
            if existing.produced_by.iter().any(|p| p.same_origin(&link)) {
                return Ok(existing.clone());
            }
            existing.produced_by.push(link);
            tracing::debug!(artifact_id = %existing.id, "artifact provenance linked");
            existing.clone()
        } else {
            let artifact = Artifact {
                id: format!("art-{}", &hash[..16]),
                path: path.to_path_buf(),
                size: bytes.len() as u64,
                mime_type: guess_mime(path).to_owned(),
                hash,
                produced_by: vec![link],
                created_at: now,
            };
            tracing::info!(
                artifact_id = %artifact.id,
                run_id,
                step_id,
                path = %path.display(),
                size = artifact.size,
                "artifact registered"
            );
            manifest.artifacts.push(artifact.clone());
            artifact
        };
        self.persist(&manifest).await?;
        Ok(artifact)
    }

    pub async fn list(&self) -> Vec<Artifact> {
        self.manifest.lock().await.artifacts.clone()
    }

    pub async fn get(&self, id: &str) -> Option<Artifact> {
        self.manifest
            .lock()
            .await
            .artifacts
            .iter()
            .find(|a| a.id == id)
            .cloned()
    }

    /// Look up an artifact and find a registered path whose file still
    /// matches the recorded hash.
    ///
    /// Deduplicated content is reachable through any producer's path, so a
    /// later change to one copy does not hide the others.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    pub async fn open_artifact(&self, id: &str) -> Result<OpenedArtifact, ArtifactError> {
        let artifact = self
            .get(id)
            .await
            .ok_or_else(|| ArtifactError::NotFound(id.to_owned()))?;
        let mut location = None;
        for path in artifact.paths() {
            if let Ok(bytes) = tokio::fs::read(path).await
                && blake3::hash(&bytes).to_hex().as_str() == artifact.hash
            {
                location = Some(path.to_path_buf());
                break;
            }
        }
        if location.is_none() {
            tracing::warn!(artifact_id = %artifact.id, "no registered copy matches the recorded hash");
        }
        Ok(OpenedArtifact {
            intact: location.is_some(),
            location,
            artifact,
        })
    }

    async fn persist(&self, manifest: &Manifest) -> Result<(), ArtifactError> {
        let path = self.dir.join(MANIFEST);
        let write_err = |source| ArtifactError::WriteFailed {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(write_err)?;
        let json = serde_json::to_vec_pretty(manifest)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(write_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(write_err)?;
        Ok(())
    }
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "log" => "text/plain",
        "md" => "text/markdown",
        "json" => "application/json",
        "toml" => "application/toml",
        "yaml" | "yml" => "application/yaml",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "js" => "text/javascript",
        "rs" => "text/x-rust",
        "py" => "text/x-python",
        "sh" => "application/x-sh",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        _ => "application/octet-stream",
    }
}
