use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a step or tool call ended in failure.
///
/// Recorded on failed steps and in audit records so the operator can see
/// the exact class of failure without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PathEscapesWorkspace,
    PolicyDenied,
    ProcessTimeout,
    ProcessStalled,
    ArtifactWriteFailed,
    OperatorCancelled,
    ToolFailed,
    Interrupted,
    InternalError,
}

impl FailureKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PathEscapesWorkspace => "PathEscapesWorkspace",
            Self::PolicyDenied => "PolicyDenied",
            Self::ProcessTimeout => "ProcessTimeout",
            Self::ProcessStalled => "ProcessStalled",
            Self::ArtifactWriteFailed => "ArtifactWriteFailed",
            Self::OperatorCancelled => "OperatorCancelled",
            Self::ToolFailed => "ToolFailed",
            Self::Interrupted => "Interrupted",
            Self::InternalError => "InternalError",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
