use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tool_id::ToolId;

/// JSON Schema of a parameter struct, as stored in `ToolDefinition::input_schema`.
#[must_use]
pub fn schema_of<T: schemars::JsonSchema>() -> serde_json::Value {
    serde_json::to_value(schemars::schema_for!(T)).unwrap_or_default()
}

/// Declared capability class of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Read,
    Write,
    Exec,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Exec => "exec",
        })
    }
}

/// Risk classification as advertised by the provider.
///
/// Providers that publish loose or missing metadata produce `Unknown`;
/// strict mode rejects those explicitly instead of guessing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "level", rename_all = "snake_case")]
pub enum ToolRisk {
    Declared(RiskLevel),
    Unknown,
}

impl ToolRisk {
    #[must_use]
    pub fn level(self) -> Option<RiskLevel> {
        match self {
            Self::Declared(level) => Some(level),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for ToolRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Declared(level) => level.fmt(f),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Integer risk tier that is actually policy-checked.
///
/// 0 = read/local, 1 = workspace write, 2 = exec/shell, 3 = network.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Tier(pub u8);

impl Tier {
    pub const READ: Self = Self(0);
    pub const WRITE: Self = Self(1);
    pub const EXEC: Self = Self(2);
    pub const NETWORK: Self = Self(3);

    /// `max(declared, tool)`: tool risk always takes precedence over a lower plan tier.
    #[must_use]
    pub fn effective(declared: Self, tool: Self) -> Self {
        declared.max(tool)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {}", self.0)
    }
}

/// How the engine dispatches a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Execution {
    /// Runs to completion inside the dispatch call.
    #[default]
    Sync,
    /// Returns a process handle; completion is observed through polling.
    Background,
}

/// Immutable tool metadata registered by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub id: ToolId,
    #[serde(default)]
    pub description: String,
    pub risk: ToolRisk,
    #[serde(default)]
    pub mutates: bool,
    #[serde(default)]
    pub requires_network: bool,
    #[serde(default)]
    pub requires_shell: bool,
    #[serde(default)]
    pub path_params: Vec<String>,
    #[serde(default)]
    pub emits_artifacts: bool,
    #[serde(default)]
    pub execution: Execution,
    #[serde(default)]
    pub input_schema: serde_json::Value,
}

impl ToolDefinition {
    /// Read-only definition; adjust with the builder methods.
    #[must_use]
    pub fn new(id: ToolId, description: impl Into<String>, risk: ToolRisk) -> Self {
        Self {
            id,
            description: description.into(),
            risk,
            mutates: false,
            requires_network: false,
            requires_shell: false,
            path_params: Vec::new(),
            emits_artifacts: false,
            execution: Execution::Sync,
            input_schema: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn mutating(mut self) -> Self {
        self.mutates = true;
        self
    }

    #[must_use]
    pub fn network(mut self) -> Self {
        self.requires_network = true;
        self
    }

    #[must_use]
    pub fn shell(mut self) -> Self {
        self.requires_shell = true;
        self
    }

    #[must_use]
    pub fn background(mut self) -> Self {
        self.execution = Execution::Background;
        self
    }

    #[must_use]
    pub fn artifacts(mut self) -> Self {
        self.emits_artifacts = true;
        self
    }

    #[must_use]
    pub fn path_params(mut self, params: &[&str]) -> Self {
        self.path_params = params.iter().map(|p| (*p).to_owned()).collect();
        self
    }

    #[must_use]
    pub fn schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Tier implied by the tool's own metadata, before any plan escalation.
    #[must_use]
    pub fn tier(&self) -> Tier {
        if self.requires_network {
            return Tier::NETWORK;
        }
        if self.requires_shell {
            return Tier::EXEC;
        }
        match self.risk {
            ToolRisk::Declared(RiskLevel::Read) => Tier::READ,
            ToolRisk::Declared(RiskLevel::Write) => Tier::WRITE,
            ToolRisk::Declared(RiskLevel::Exec) | ToolRisk::Unknown => Tier::EXEC,
        }
    }

    /// Whether the tool asks for shell or exec capability.
    #[must_use]
    pub fn wants_exec(&self) -> bool {
        self.requires_shell || self.risk == ToolRisk::Declared(RiskLevel::Exec)
    }
}
