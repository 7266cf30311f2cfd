//! Tool policy gateway and execution backends: registry, policy evaluation,
//! approvals, workspace boundary, process supervision, audit and artifacts.

pub mod approval;
pub mod artifact;
pub mod audit;
pub mod boundary;
pub mod composite;
pub mod config;
pub mod definition;
pub mod executor;
pub mod failure;
pub mod file;
pub mod policy;
pub mod process;
pub mod provider;
pub mod registry;
pub mod remote;
pub mod sanitize;
pub mod shell;
pub mod tool_id;
pub mod web;

pub use approval::{
    ApprovalDecision, ApprovalError, ApprovalManager, ApprovalRequest, ApprovalScope,
    ApprovalStatus,
};
pub use artifact::{Artifact, ArtifactError, ArtifactStore, OpenedArtifact, Provenance};
pub use audit::{AuditError, AuditLogger, AuditRecord, AuditResult};
pub use boundary::{BoundaryViolation, WorkspaceBoundary};
pub use composite::CompositeExecutor;
pub use config::{
    ArtifactsConfig, AuditConfig, PolicyConfig, ProcessConfig, ProviderConfig, WebConfig,
};
pub use definition::{Execution, RiskLevel, Tier, ToolDefinition, ToolRisk};
pub use executor::{
    MAX_TOOL_OUTPUT_CHARS, ToolCallRequest, ToolError, ToolExecutor, ToolOutput,
    truncate_tool_output,
};
pub use failure::FailureKind;
pub use file::FileExecutor;
pub use policy::{
    AllowRule, MatchedRule, Outcome, PolicyContext, PolicyDecision, PolicyExplanation,
    PolicyMode, evaluate, explain, render_policy,
};
pub use process::{
    PidRecord, ProcessError, ProcessHandle, ProcessPoll, ProcessStatus, ProcessSupervisor,
    SupervisorSettings,
};
pub use provider::{
    BUILTIN, BuiltinProvider, ManifestProvider, ToolProvider, is_builtin, register_providers,
};
pub use registry::{RegistryError, ToolFilter, ToolRegistry};
pub use remote::RemoteExecutor;
pub use shell::{ShellExecutor, format_kill, format_poll};
pub use tool_id::ToolId;
pub use web::WebExecutor;
