//! Run persistence: one JSON document per run under `<state_dir>/runs/`.

use std::path::{Path, PathBuf};

use crate::run::Run;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("run store io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt run file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid run id {0:?}")]
    InvalidId(String),
}

const MAX_RUN_ID_LEN: usize = 64;

/// `run-` followed by ASCII alphanumerics, `-` or `_`. Anything else could
/// name a file outside the runs directory.
#[must_use]
pub fn is_valid_run_id(run_id: &str) -> bool {
    run_id.len() <= MAX_RUN_ID_LEN
        && run_id.strip_prefix("run-").is_some_and(|rest| {
            !rest.is_empty()
                && rest
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        })
}

#[derive(Debug, Clone)]
pub struct RunStore {
    dir: PathBuf,
}

impl RunStore {
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("runs"),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, run_id: &str) -> Result<PathBuf, StoreError> {
        if !is_valid_run_id(run_id) {
            return Err(StoreError::InvalidId(run_id.to_owned()));
        }
        Ok(self.dir.join(format!("{run_id}.json")))
    }

    /// Write the run atomically (temp file, then rename).
    ///
    /// # Errors
    ///
    /// `InvalidId` for a malformed run id, `Io` when the file cannot be
    /// written.
    pub async fn save(&self, run: &Run) -> Result<(), StoreError> {
        let path = self.path_for(&run.id)?;
        let io_err = |source| StoreError::Io {
            path: path.clone(),
            source,
        };
        tokio::fs::create_dir_all(&self.dir).await.map_err(io_err)?;
        let json = serde_json::to_vec_pretty(run).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        tracing::trace!(run_id = %run.id, state = %run.state, "run saved");
        Ok(())
    }

    /// Load a run by id; `Ok(None)` when no file exists or the id is
    /// malformed.
    ///
    /// # Errors
    ///
    /// `Io` on read failure, `Corrupt` when the file does not parse.
    pub async fn load(&self, run_id: &str) -> Result<Option<Run>, StoreError> {
        let Ok(path) = self.path_for(run_id) else {
            tracing::debug!(run_id, "ignoring malformed run id");
            return Ok(None);
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)
                .map(Some)
                .map_err(|source| StoreError::Corrupt { path, source }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }

    /// All readable runs, oldest first. Unreadable files are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the directory exists but cannot be listed.
    pub async fn list(&self) -> Result<Vec<Run>, StoreError> {
        let mut reader = match tokio::fs::read_dir(&self.dir).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };
        let mut runs = Vec::new();
        while let Some(entry) = reader.next_entry().await.map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = tokio::fs::read_to_string(&path)
                .await
                .ok()
                .and_then(|content| serde_json::from_str::<Run>(&content).ok());
            match parsed {
                Some(run) if is_valid_run_id(&run.id) => runs.push(run),
                Some(run) => {
                    tracing::warn!(path = %path.display(), run_id = %run.id, "skipping run with malformed id");
                }
                None => tracing::warn!(path = %path.display(), "skipping unreadable run file"),
            }
        }
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    /// Runs left in a non-terminal state by an earlier process.
    ///
    /// # Errors
    ///
    /// See [`RunStore::list`].
    pub async fn incomplete(&self) -> Result<Vec<Run>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(Run::is_incomplete)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use gantry_tools::PolicyMode;

    use super::*;
    use crate::run::RunState;

    #[tokio::test]
    async fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        let run = Run::new("ship it", "ws", PolicyMode::Guide);
        store.save(&run).await.unwrap();

        let loaded = store.load(&run.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, run.id);
        assert_eq!(loaded.goal, "ship it");
        assert!(!dir.path().join("runs").join(format!("{}.json.tmp", run.id)).exists());
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        assert!(store.load("run-nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn malformed_ids_never_touch_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        std::fs::create_dir_all(store.dir()).unwrap();
        let mut planted = Run::new("elsewhere", "ws", PolicyMode::Guide);
        planted.id = "run-planted".into();
        std::fs::write(
            dir.path().join("secret.json"),
            serde_json::to_string(&planted).unwrap(),
        )
        .unwrap();

        for id in ["../secret", "run-../../secret", "run-a/b", "/tmp/x", "run-", ""] {
            assert!(store.load(id).await.unwrap().is_none(), "{id}");
        }

        let mut escaping = Run::new("g", "ws", PolicyMode::Guide);
        escaping.id = "run-../../escaped".into();
        assert!(matches!(
            store.save(&escaping).await,
            Err(StoreError::InvalidId(_))
        ));
        assert!(!dir.path().join("escaped.json").exists());

        let mut renamed = Run::new("g", "ws", PolicyMode::Guide);
        renamed.id = "../../reports/x".into();
        std::fs::write(
            store.dir().join("run-renamed.json"),
            serde_json::to_string(&renamed).unwrap(),
        )
        .unwrap();
        assert!(store.list().await.unwrap().is_empty());
    }

    #[test]
    fn generated_ids_are_valid() {
        let run = Run::new("g", "ws", PolicyMode::Guide);
        assert!(is_valid_run_id(&run.id));
        assert!(is_valid_run_id("run-legacy_id-2"));
        assert!(!is_valid_run_id("run-x.json"));
        assert!(!is_valid_run_id(&format!("run-{}", "a".repeat(64))));
    }

    #[tokio::test]
    async fn corrupt_file_reported_on_load_skipped_on_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        std::fs::create_dir_all(store.dir()).unwrap();
        std::fs::write(store.dir().join("run-bad.json"), "{not json").unwrap();
        assert!(matches!(
            store.load("run-bad").await,
            Err(StoreError::Corrupt { .. })
        ));

        let good = Run::new("g", "ws", PolicyMode::Guide);
        store.save(&good).await.unwrap();
        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn incomplete_filters_terminal_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());

        let mut running = Run::new("a", "ws", PolicyMode::Guide);
        running.set_state(RunState::Running);
        let mut done = Run::new("b", "ws", PolicyMode::Guide);
        done.set_state(RunState::Completed);
        let mut archived = Run::new("c", "ws", PolicyMode::Guide);
        archived.set_state(RunState::Archived);
        for run in [&running, &done, &archived] {
            store.save(run).await.unwrap();
        }

        let incomplete = store.incomplete().await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, running.id);
    }

    #[tokio::test]
    async fn list_without_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(&dir.path().join("nothing"));
        assert!(store.list().await.unwrap().is_empty());
    }
}
