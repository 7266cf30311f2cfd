use crate::run::RunState;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("run {run_id} is {state} and accepts no further changes")]
    TerminalRun { run_id: String, state: RunState },

    #[error("run not found: {0}")]
    RunNotFound(String),

    #[error("cannot {action} while run is {state}")]
    InvalidTransition { action: &'static str, state: RunState },

    #[error("step not found: {0}")]
    StepNotFound(String),

    #[error("run {0} is already executing a step")]
    Busy(String),

    #[error(transparent)]
    Registry(#[from] gantry_tools::RegistryError),

    #[error(transparent)]
    Approval(#[from] gantry_tools::ApprovalError),

    #[error(transparent)]
    Process(#[from] gantry_tools::ProcessError),

    #[error(transparent)]
    Artifact(#[from] gantry_tools::ArtifactError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}
