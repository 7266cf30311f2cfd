use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::config::AuditConfig;
use crate::failure::FailureKind;
use crate::policy::PolicyDecision;
use crate::sanitize::sanitize_arguments;
use crate::tool_id::ToolId;

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("failed to open audit log {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write audit record: {0}")]
    Write(#[from] std::io::Error),

    #[error("failed to serialize audit record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One line of the audit trail. Field names are stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub run_id: String,
    pub step_id: String,
    pub tool_id: ToolId,
    pub arguments: serde_json::Value,
    pub decision: Option<PolicyDecision>,
    pub result: AuditResult,
    pub duration_ms: u64,
    pub artifact_refs: Vec<String>,
}

impl AuditRecord {
    /// Build a record; `arguments` are sanitized here so callers cannot forget.
    #[must_use]
    pub fn new(
        run_id: &str,
        step_id: &str,
        tool_id: &ToolId,
        arguments: &serde_json::Value,
        decision: Option<PolicyDecision>,
        result: AuditResult,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            run_id: run_id.to_owned(),
            step_id: step_id.to_owned(),
            tool_id: tool_id.clone(),
            arguments: sanitize_arguments(arguments),
            decision,
            result,
            duration_ms: 0,
            artifact_refs: Vec::new(),
        }
    }

    #[must_use]
    pub fn duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }

    #[must_use]
    pub fn artifacts(mut self, refs: Vec<String>) -> Self {
        self.artifact_refs = refs;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditResult {
    Success { summary: String },
    Denied { kind: FailureKind, reason: String },
    ApprovalRequired { approval_id: String },
    Failed { kind: FailureKind, message: String },
    /// Operator changed a pending step.
    Edited { change: serde_json::Value },
}

#[derive(Debug)]
enum AuditDestination {
    Disabled,
    Stdout,
    File(tokio::sync::Mutex<tokio::fs::File>),
    Memory(tokio::sync::Mutex<Vec<AuditRecord>>),
}

/// Append-only audit sink: JSON lines to a file or through `tracing`.
#[derive(Debug)]
pub struct AuditLogger {
    destination: AuditDestination,
}

impl AuditLogger {
    /// Create a new `AuditLogger` from config. Relative file destinations
    /// resolve against `base_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if a file destination cannot be opened.
    pub async fn from_config(config: &AuditConfig, base_dir: &Path) -> Result<Self, AuditError> {
        if !config.enabled {
            return Ok(Self {
                destination: AuditDestination::Disabled,
            });
        }
        let destination = if config.destination == "stdout" {
            AuditDestination::Stdout
        } else {
            let path = base_dir.join(&config.destination);
            let open_err = |source| AuditError::Open {
                path: path.display().to_string(),
                source,
            };
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(open_err)?;
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(open_err)?;
            AuditDestination::File(tokio::sync::Mutex::new(file))
        };

        Ok(Self { destination })
    }

    /// In-memory sink, inspected with [`AuditLogger::records`].
    #[must_use]
    pub fn memory() -> Self {
        Self {
            destination: AuditDestination::Memory(tokio::sync::Mutex::new(Vec::new())),
        }
    }

    /// Append one record.
    ///
    /// # Errors
    ///
    /// Returns an error when the record cannot be serialized or written; the
    /// caller decides how to surface a degraded audit trail.
    pub async fn log(&self, record: &AuditRecord) -> Result<(), AuditError> {
        match &self.destination {
            AuditDestination::Disabled => Ok(()),
            AuditDestination::Stdout => {
                let json = serde_json::to_string(record)?;
                tracing::info!(target: "audit", "{json}");
                Ok(())
            }
            AuditDestination::File(file) => {
                let mut line = serde_json::to_string(record)?;
                line.push('\n');
                let mut f = file.lock().await;
                f.write_all(line.as_bytes()).await?;
                f.flush().await?;
                Ok(())
            }
            AuditDestination::Memory(records) => {
                records.lock().await.push(record.clone());
                Ok(())
            }
        }
    }

    /// Records captured by a memory sink; empty for other destinations.
    pub async fn records(&self) -> Vec<AuditRecord> {
        match &self.destination {
            AuditDestination::Memory(records) => records.lock().await.clone(),
            _ => Vec::new(),
        }
    }
}
