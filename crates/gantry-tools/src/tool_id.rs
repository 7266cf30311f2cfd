use std::fmt;

use serde::{Deserialize, Serialize};

/// Tool identity with provider provenance.
///
/// Qualified forms are `provider:tool` and `provider:server:tool`. A bare
/// `tool` is unqualified and must be resolved through the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ToolId {
    provider: Option<String>,
    server: Option<String>,
    name: String,
}

impl ToolId {
    #[must_use]
    pub fn new(provider: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            server: None,
            name: name.into(),
        }
    }

    #[must_use]
    pub fn with_server(
        provider: impl Into<String>,
        server: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            provider: Some(provider.into()),
            server: Some(server.into()),
            name: name.into(),
        }
    }

    /// Parse either a qualified or a bare tool identifier.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        let mut parts = raw.splitn(3, ':');
        let first = parts.next().unwrap_or_default();
        match (parts.next(), parts.next()) {
            (Some(name), None) if !first.is_empty() && !name.is_empty() => {
                Self::new(first, name)
            }
            (Some(server), Some(name)) if !first.is_empty() && !name.is_empty() => {
                Self::with_server(first, server, name)
            }
            _ => Self {
                provider: None,
                server: None,
                name: raw.to_owned(),
            },
        }
    }

    #[must_use]
    pub fn provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    #[must_use]
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_qualified(&self) -> bool {
        self.provider.is_some()
    }

    /// Same tool name, re-homed under `provider`.
    #[must_use]
    pub fn qualify(&self, provider: &str) -> Self {
        Self {
            provider: Some(provider.to_owned()),
            server: self.server.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.provider, &self.server) {
            (Some(p), Some(s)) => write!(f, "{p}:{s}:{}", self.name),
            (Some(p), None) => write!(f, "{p}:{}", self.name),
            _ => f.write_str(&self.name),
        }
    }
}

impl From<ToolId> for String {
    fn from(id: ToolId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for ToolId {
    type Error = std::convert::Infallible;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ok(Self::parse(&value))
    }
}
