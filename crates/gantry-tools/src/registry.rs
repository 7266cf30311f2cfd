use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Write;

use crate::definition::{RiskLevel, ToolDefinition, ToolRisk};
use crate::tool_id::ToolId;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("tool {id} already registered by provider {provider}")]
    DuplicateTool { provider: String, id: String },

    #[error("tool name '{name}' is ambiguous, use a qualified name: {}", candidates.join(", "))]
    AmbiguousTool {
        name: String,
        candidates: Vec<String>,
    },

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("provider {provider} unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },
}

/// Inventory filter for [`ToolRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct ToolFilter {
    pub provider: Option<String>,
    pub risk: Option<RiskLevel>,
    pub unknown_risk: bool,
}

impl ToolFilter {
    fn matches(&self, def: &ToolDefinition) -> bool {
        if let Some(ref provider) = self.provider
            && def.id.provider() != Some(provider.as_str())
        {
            return false;
        }
        if let Some(level) = self.risk
            && def.risk != ToolRisk::Declared(level)
        {
            return false;
        }
        !self.unknown_risk || def.risk == ToolRisk::Unknown
    }
}

/// Process-wide tool table. Populated once at startup, read-only afterwards.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<ToolId, ToolDefinition>,
    by_name: HashMap<String, Vec<ToolId>>,
    providers: BTreeSet<String>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition under `provider_id`.
    ///
    /// The stored id is always qualified by the registering provider.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::DuplicateTool` if the qualified id already exists.
    pub fn register(
        &mut self,
        provider_id: &str,
        mut def: ToolDefinition,
    ) -> Result<(), RegistryError> {
        if def.id.provider() != Some(provider_id) {
            def.id = def.id.qualify(provider_id);
        }
        if self.tools.contains_key(&def.id) {
            return Err(RegistryError::DuplicateTool {
                provider: provider_id.to_owned(),
                id: def.id.to_string(),
            });
        }
        tracing::debug!(tool_id = %def.id, risk = %def.risk, "tool registered");
        self.providers.insert(provider_id.to_owned());
        self.by_name
            .entry(def.id.name().to_owned())
            .or_default()
            .push(def.id.clone());
        self.tools.insert(def.id.clone(), def);
        Ok(())
    }

    /// Resolve a qualified id or a bare name.
    ///
    /// # Errors
    ///
    /// `UnknownTool` when nothing matches, `AmbiguousTool` when a bare name
    /// matches tools from more than one provider.
    pub fn resolve(&self, name: &str) -> Result<&ToolDefinition, RegistryError> {
        let id = ToolId::parse(name);
        if id.is_qualified() {
            return self
                .tools
                .get(&id)
                .ok_or_else(|| RegistryError::UnknownTool(name.to_owned()));
        }
        match self.by_name.get(id.name()).map(Vec::as_slice) {
            Some([only]) => self
                .tools
                .get(only)
                .ok_or_else(|| RegistryError::UnknownTool(name.to_owned())),
            Some(many) if !many.is_empty() => {
                let mut candidates: Vec<String> = many.iter().map(ToString::to_string).collect();
                candidates.sort();
                Err(RegistryError::AmbiguousTool {
                    name: name.to_owned(),
                    candidates,
                })
            }
            _ => Err(RegistryError::UnknownTool(name.to_owned())),
        }
    }

    #[must_use]
    pub fn list(&self, filter: &ToolFilter) -> Vec<&ToolDefinition> {
        self.tools.values().filter(|d| filter.matches(d)).collect()
    }

    #[must_use]
    pub fn providers(&self) -> Vec<&str> {
        self.providers.iter().map(String::as_str).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Bare names registered by more than one provider.
    #[must_use]
    pub fn collisions(&self) -> BTreeMap<&str, Vec<&ToolId>> {
        self.by_name
            .iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(name, ids)| (name.as_str(), ids.iter().collect()))
            .collect()
    }

    /// Human-readable inventory, grouped by provider.
    #[must_use]
    pub fn format_inventory(&self, filter: &ToolFilter) -> String {
        let mut out = String::new();
        let mut current: Option<&str> = None;
        for def in self.list(filter) {
            let provider = def.id.provider().unwrap_or("-");
            if current != Some(provider) {
                let _ = writeln!(out, "[{provider}]");
                current = Some(provider);
            }
            format_tool(&mut out, def);
        }
        if out.is_empty() {
            out.push_str("no tools registered\n");
        }
        out
    }
}

fn format_tool(out: &mut String, def: &ToolDefinition) {
    let mut flags = Vec::new();
    if def.mutates {
        flags.push("mutates");
    }
    if def.requires_shell {
        flags.push("shell");
    }
    if def.requires_network {
        flags.push("network");
    }
    if def.emits_artifacts {
        flags.push("artifacts");
    }
    let _ = write!(out, "  {} ({}, {})", def.id, def.risk, def.tier());
    if !flags.is_empty() {
        let _ = write!(out, " [{}]", flags.join(","));
    }
    out.push('\n');
    if !def.description.is_empty() {
        let _ = writeln!(out, "    {}", def.description);
    }
    format_schema_params(out, &def.input_schema);
}

fn format_schema_params(out: &mut String, schema: &serde_json::Value) {
    let Some(serde_json::Value::Object(props)) = schema.get("properties") else {
        return;
    };
    let required: Vec<&str> = schema
        .get("required")
        .and_then(|v| v.as_array())
        .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    for (name, prop) in props {
        let ty = prop
            .get("type")
            .and_then(|t| {
                t.as_str()
                    .or_else(|| t.as_array()?.iter().filter_map(|v| v.as_str()).find(|v| *v != "null"))
            })
            .unwrap_or("string");
        let req = if required.contains(&name.as_str()) {
            "required"
        } else {
            "optional"
        };
        let _ = writeln!(out, "    - {name} ({ty}, {req})");
    }
}
