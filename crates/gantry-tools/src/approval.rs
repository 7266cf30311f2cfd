//! Operator approvals for calls that policy gates behind `require_approval`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::Tier;
use crate::executor::ToolCallRequest;
use crate::tool_id::ToolId;

#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    #[error("approval {id} already resolved as {status}")]
    AlreadyResolved { id: String, status: ApprovalStatus },

    #[error("approval not found: {0}")]
    NotFound(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalScope {
    #[default]
    Once,
    Session,
}

impl fmt::Display for ApprovalScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Once => "once",
            Self::Session => "session",
        })
    }
}

impl FromStr for ApprovalScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(Self::Once),
            "session" => Ok(Self::Session),
            other => Err(format!("unknown approval scope '{other}' (expected once or session)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub tool_call: ToolCallRequest,
    pub tier: Tier,
    pub scope: ApprovalScope,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }
}

impl fmt::Display for ApprovalRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] step {} {} ({})",
            self.id, self.status, self.tool_call.step_id, self.tool_call.tool_id, self.tier
        )
    }
}

/// Approval bound to one exact call, consumed on first use.
#[derive(Debug, Clone, PartialEq)]
struct OnceGrant {
    step_id: String,
    tool_id: ToolId,
    tier: Tier,
    arguments: serde_json::Value,
}

impl OnceGrant {
    fn covers(&self, call: &ToolCallRequest, tier: Tier) -> bool {
        self.step_id == call.step_id
            && self.tool_id == call.tool_id
            && self.tier == tier
            && self.arguments == call.arguments
    }
}

/// Per-run approval state.
///
/// Request history is persisted with the run. Grants are not: a restarted
/// process begins with no active approvals and the operator must confirm
/// again.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalManager {
    requests: Vec<ApprovalRequest>,
    #[serde(default)]
    next_id: u64,
    #[serde(skip)]
    session: BTreeSet<(ToolId, Tier)>,
    #[serde(skip)]
    once: Vec<OnceGrant>,
}

impl ApprovalManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a pending request for `call`.
    ///
    /// A still-pending request for the same step, tool and tier is returned
    /// instead of opening a duplicate.
    pub fn request(&mut self, call: ToolCallRequest, tier: Tier) -> ApprovalRequest {
        if let Some(existing) = self.requests.iter().find(|r| {
            r.is_pending()
                && r.tier == tier
                && r.tool_call.step_id == call.step_id
                && r.tool_call.tool_id == call.tool_id
                && r.tool_call.arguments == call.arguments
        }) {
            return existing.clone();
        }
        self.next_id += 1;
        let req = ApprovalRequest {
            id: format!("apr-{}", self.next_id),
            tool_call: call,
            tier,
            scope: ApprovalScope::Once,
            status: ApprovalStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        };
        tracing::info!(
            approval_id = %req.id,
            run_id = %req.tool_call.run_id,
            step_id = %req.tool_call.step_id,
            tool_id = %req.tool_call.tool_id,
            tier = req.tier.0,
            "approval requested"
        );
        self.requests.push(req.clone());
        req
    }

    /// Resolve a pending request. Each request resolves exactly once.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id, `AlreadyResolved` when the request is no
    /// longer pending.
    pub fn resolve(
        &mut self,
        id: &str,
        decision: ApprovalDecision,
        scope: ApprovalScope,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let req = self
            .requests
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| ApprovalError::NotFound(id.to_owned()))?;
        if !req.is_pending() {
            return Err(ApprovalError::AlreadyResolved {
                id: id.to_owned(),
                status: req.status,
            });
        }
        req.resolved_at = Some(Utc::now());
        req.scope = scope;
        match decision {
            ApprovalDecision::Approve => {
                req.status = ApprovalStatus::Approved;
                match scope {
                    ApprovalScope::Session => {
                        self.session
                            .insert((req.tool_call.tool_id.clone(), req.tier));
                    }
                    ApprovalScope::Once => self.once.push(OnceGrant {
                        step_id: req.tool_call.step_id.clone(),
                        tool_id: req.tool_call.tool_id.clone(),
                        tier: req.tier,
                        arguments: req.tool_call.arguments.clone(),
                    }),
                }
            }
            ApprovalDecision::Deny => req.status = ApprovalStatus::Denied,
        }
        tracing::info!(
            approval_id = %req.id,
            status = %req.status,
            scope = %req.scope,
            "approval resolved"
        );
        Ok(req.clone())
    }

    #[must_use]
    pub fn is_session_approved(&self, tool_id: &ToolId, tier: Tier) -> bool {
        self.session.contains(&(tool_id.clone(), tier))
    }

    /// Snapshot of session grants for the policy context.
    #[must_use]
    pub fn session_grants(&self) -> BTreeSet<(ToolId, Tier)> {
        self.session.clone()
    }

    /// Consume a once-grant covering exactly this call, if any.
    pub fn take_once(&mut self, call: &ToolCallRequest, tier: Tier) -> bool {
        if let Some(pos) = self.once.iter().position(|g| g.covers(call, tier)) {
            self.once.remove(pos);
            true
        } else {
            false
        }
    }

    /// Drop every session and once grant. Returns how many were revoked.
    pub fn revoke_all(&mut self) -> usize {
        let n = self.session.len() + self.once.len();
        self.session.clear();
        self.once.clear();
        if n > 0 {
            tracing::info!(revoked = n, "approvals revoked");
        }
        n
    }

    pub fn pending(&self) -> impl Iterator<Item = &ApprovalRequest> {
        self.requests.iter().filter(|r| r.is_pending())
    }

    #[must_use]
    pub fn requests(&self) -> &[ApprovalRequest] {
        &self.requests
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ApprovalRequest> {
        self.requests.iter().find(|r| r.id == id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn call(step: &str, path: &str) -> ToolCallRequest {
        ToolCallRequest::new(
            ToolId::new("builtin", "fs_write_text"),
            json!({"path": path}),
            "run-1",
            step,
        )
    }

    #[test]
    fn request_starts_pending() {
        let mut mgr = ApprovalManager::new();
        let req = mgr.request(call("s1", "a.txt"), Tier::WRITE);
        assert_eq!(req.status, ApprovalStatus::Pending);
        assert_eq!(mgr.pending().count(), 1);
    }

    #[test]
    fn duplicate_request_reuses_pending() {
        let mut mgr = ApprovalManager::new();
        let a = mgr.request(call("s1", "a.txt"), Tier::WRITE);
        let b = mgr.request(call("s1", "a.txt"), Tier::WRITE);
        assert_eq!(a.id, b.id);
        assert_eq!(mgr.requests().len(), 1);
    }

    #[test]
    fn resolve_exactly_once() {
        let mut mgr = ApprovalManager::new();
        let req = mgr.request(call("s1", "a.txt"), Tier::WRITE);
        mgr.resolve(&req.id, ApprovalDecision::Approve, ApprovalScope::Once)
            .unwrap();
        let err = mgr
            .resolve(&req.id, ApprovalDecision::Deny, ApprovalScope::Once)
            .unwrap_err();
        assert!(matches!(
            err,
            ApprovalError::AlreadyResolved {
                status: ApprovalStatus::Approved,
                ..
            }
        ));
    }

    #[test]
    fn resolve_unknown_id() {
        let mut mgr = ApprovalManager::new();
        assert!(matches!(
            mgr.resolve("apr-9", ApprovalDecision::Approve, ApprovalScope::Once),
            Err(ApprovalError::NotFound(_))
        ));
    }

    #[test]
    fn once_grant_consumed_on_use() {
        let mut mgr = ApprovalManager::new();
        let c = call("s1", "a.txt");
        let req = mgr.request(c.clone(), Tier::WRITE);
        mgr.resolve(&req.id, ApprovalDecision::Approve, ApprovalScope::Once)
            .unwrap();
        assert!(!mgr.is_session_approved(&c.tool_id, Tier::WRITE));
        assert!(mgr.take_once(&c, Tier::WRITE));
        assert!(!mgr.take_once(&c, Tier::WRITE));
    }

    #[test]
    fn once_grant_bound_to_arguments_and_tier() {
        let mut mgr = ApprovalManager::new();
        let c = call("s1", "a.txt");
        let req = mgr.request(c.clone(), Tier::WRITE);
        mgr.resolve(&req.id, ApprovalDecision::Approve, ApprovalScope::Once)
            .unwrap();
        assert!(!mgr.take_once(&call("s1", "b.txt"), Tier::WRITE));
        assert!(!mgr.take_once(&c, Tier::EXEC));
        assert!(!mgr.take_once(&call("s2", "a.txt"), Tier::WRITE));
    }

    #[test]
    fn session_grant_covers_tool_and_tier() {
        let mut mgr = ApprovalManager::new();
        let c = call("s1", "a.txt");
        let req = mgr.request(c.clone(), Tier::WRITE);
        mgr.resolve(&req.id, ApprovalDecision::Approve, ApprovalScope::Session)
            .unwrap();
        assert!(mgr.is_session_approved(&c.tool_id, Tier::WRITE));
        assert!(!mgr.is_session_approved(&c.tool_id, Tier::EXEC));
        assert_eq!(mgr.session_grants().len(), 1);
    }

    #[test]
    fn deny_records_no_grant() {
        let mut mgr = ApprovalManager::new();
        let c = call("s1", "a.txt");
        let req = mgr.request(c.clone(), Tier::WRITE);
        mgr.resolve(&req.id, ApprovalDecision::Deny, ApprovalScope::Session)
            .unwrap();
        assert!(!mgr.is_session_approved(&c.tool_id, Tier::WRITE));
    }

    #[test]
    fn revoke_all_clears_grants() {
        let mut mgr = ApprovalManager::new();
        let c = call("s1", "a.txt");
        let req = mgr.request(c.clone(), Tier::WRITE);
        mgr.resolve(&req.id, ApprovalDecision::Approve, ApprovalScope::Session)
            .unwrap();
        assert_eq!(mgr.revoke_all(), 1);
        assert!(!mgr.is_session_approved(&c.tool_id, Tier::WRITE));
    }

    #[test]
    fn restored_manager_has_no_grants() {
        let mut mgr = ApprovalManager::new();
        let c = call("s1", "a.txt");
        let req = mgr.request(c.clone(), Tier::WRITE);
        mgr.resolve(&req.id, ApprovalDecision::Approve, ApprovalScope::Session)
            .unwrap();
        let json = serde_json::to_string(&mgr).unwrap();
        let restored: ApprovalManager = serde_json::from_str(&json).unwrap();
        assert!(!restored.is_session_approved(&c.tool_id, Tier::WRITE));
        assert_eq!(restored.requests().len(), 1);
        let mut restored = restored;
        let next = restored.request(call("s2", "b.txt"), Tier::WRITE);
        assert_eq!(next.id, "apr-2");
    }

    #[test]
    fn scope_parse() {
        assert_eq!("SESSION".parse::<ApprovalScope>().unwrap(), ApprovalScope::Session);
        assert!("forever".parse::<ApprovalScope>().is_err());
    }
}
