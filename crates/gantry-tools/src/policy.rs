//! Policy evaluation: (tool, arguments, mode, context) → decision.
//!
//! [`evaluate`] and [`explain`] share one code path; `explain` only keeps the
//! trace that `evaluate` discards.

use std::collections::BTreeSet;
use std::fmt::{self, Write};
use std::str::FromStr;

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::boundary::WorkspaceBoundary;
use crate::definition::{Tier, ToolDefinition, ToolRisk};
use crate::failure::FailureKind;
use crate::tool_id::ToolId;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
    #[default]
    Guide,
    Commander,
    Strict,
}

impl PolicyMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guide => "guide",
            Self::Commander => "commander",
            Self::Strict => "strict",
        }
    }
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PolicyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "guide" => Ok(Self::Guide),
            "commander" => Ok(Self::Commander),
            "strict" => Ok(Self::Strict),
            other => Err(format!(
                "unknown policy mode '{other}' (expected guide, commander or strict)"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Allow,
    Deny,
    RequireApproval,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::RequireApproval => "require_approval",
        })
    }
}

/// The rule that produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchedRule {
    PathEscapesWorkspace,
    NetworkDisabled,
    ShellDisabled,
    UnknownRisk,
    ReadOnly,
    ExecAllowlist,
    ModeApproval,
    SessionApproval,
}

impl MatchedRule {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PathEscapesWorkspace => "path-escapes-workspace",
            Self::NetworkDisabled => "network-disabled",
            Self::ShellDisabled => "shell-disabled",
            Self::UnknownRisk => "unknown-risk",
            Self::ReadOnly => "read-only",
            Self::ExecAllowlist => "exec-allowlist",
            Self::ModeApproval => "mode-approval",
            Self::SessionApproval => "session-approval",
        }
    }
}

impl fmt::Display for MatchedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub outcome: Outcome,
    pub effective_tier: Tier,
    pub reason: String,
    pub matched_rule: MatchedRule,
}

impl PolicyDecision {
    fn new(
        outcome: Outcome,
        effective_tier: Tier,
        matched_rule: MatchedRule,
        reason: String,
    ) -> Self {
        Self {
            outcome,
            effective_tier,
            reason,
            matched_rule,
        }
    }

    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.outcome == Outcome::Allow
    }

    /// Failure class for a denied call, `None` otherwise.
    #[must_use]
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match (self.outcome, self.matched_rule) {
            (Outcome::Deny, MatchedRule::PathEscapesWorkspace) => {
                Some(FailureKind::PathEscapesWorkspace)
            }
            (Outcome::Deny, _) => Some(FailureKind::PolicyDenied),
            _ => None,
        }
    }
}

impl fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}, rule {}): {}",
            self.outcome, self.effective_tier, self.matched_rule, self.reason
        )
    }
}

/// Commander-mode allowlist entry: glob on the tool id, optional glob on the
/// `command` argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowRule {
    pub tool: String,
    #[serde(default)]
    pub command: Option<String>,
}

impl AllowRule {
    fn matches(&self, id: &ToolId, args: &serde_json::Value) -> bool {
        let Ok(tool_pat) = Pattern::new(&self.tool) else {
            return false;
        };
        if !tool_pat.matches(&id.to_string()) && !tool_pat.matches(id.name()) {
            return false;
        }
        let Some(ref command) = self.command else {
            return true;
        };
        let Some(actual) = args.get("command").and_then(serde_json::Value::as_str) else {
            return false;
        };
        Pattern::new(command).is_ok_and(|p| p.matches(actual.trim()))
    }
}

impl fmt::Display for AllowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.command {
            Some(cmd) => write!(f, "{} (command: {cmd})", self.tool),
            None => f.write_str(&self.tool),
        }
    }
}

/// Everything the evaluator reads besides the tool and its arguments.
///
/// Passed explicitly per call; concurrent runs each carry their own.
#[derive(Debug, Clone)]
pub struct PolicyContext {
    pub boundary: WorkspaceBoundary,
    pub allow_shell: bool,
    pub allow_network: bool,
    pub exec_allowlist: Vec<AllowRule>,
    pub active_approvals: BTreeSet<(ToolId, Tier)>,
}

impl PolicyContext {
    #[must_use]
    pub fn new(boundary: WorkspaceBoundary) -> Self {
        Self {
            boundary,
            allow_shell: false,
            allow_network: false,
            exec_allowlist: Vec::new(),
            active_approvals: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn with_approvals(mut self, approvals: BTreeSet<(ToolId, Tier)>) -> Self {
        self.active_approvals = approvals;
        self
    }
}

/// One evaluated check in an explanation trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCheck {
    pub check: String,
    pub fired: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyExplanation {
    pub decision: PolicyDecision,
    pub trace: Vec<PolicyCheck>,
}

impl fmt::Display for PolicyExplanation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, check) in self.trace.iter().enumerate() {
            let mark = if check.fired { "*" } else { "-" };
            writeln!(f, "{}. [{mark}] {}: {}", i + 1, check.check, check.detail)?;
        }
        write!(f, "=> {}", self.decision)
    }
}

trait Trace {
    fn record(&mut self, check: &str, fired: bool, detail: impl FnOnce() -> String);
}

struct NoTrace;

impl Trace for NoTrace {
    fn record(&mut self, _: &str, _: bool, _: impl FnOnce() -> String) {}
}

impl Trace for Vec<PolicyCheck> {
    fn record(&mut self, check: &str, fired: bool, detail: impl FnOnce() -> String) {
        self.push(PolicyCheck {
            check: check.to_owned(),
            fired,
            detail: detail(),
        });
    }
}

/// Decide whether `tool` may run with `args`.
///
/// Deterministic for a given filesystem state: no clock, no randomness, no
/// side effects.
#[must_use]
pub fn evaluate(
    tool: &ToolDefinition,
    args: &serde_json::Value,
    declared_tier: Tier,
    mode: PolicyMode,
    ctx: &PolicyContext,
) -> PolicyDecision {
    decide(tool, args, declared_tier, mode, ctx, &mut NoTrace)
}

/// [`evaluate`] plus the ordered list of checks that led to the decision.
#[must_use]
pub fn explain(
    tool: &ToolDefinition,
    args: &serde_json::Value,
    declared_tier: Tier,
    mode: PolicyMode,
    ctx: &PolicyContext,
) -> PolicyExplanation {
    let mut trace = Vec::new();
    let decision = decide(tool, args, declared_tier, mode, ctx, &mut trace);
    PolicyExplanation { decision, trace }
}

fn decide(
    tool: &ToolDefinition,
    args: &serde_json::Value,
    declared_tier: Tier,
    mode: PolicyMode,
    ctx: &PolicyContext,
    trace: &mut impl Trace,
) -> PolicyDecision {
    let tier = Tier::effective(declared_tier, tool.tier());
    trace.record("effective-tier", false, || {
        format!("max(declared {declared_tier}, tool {}) = {tier}", tool.tier())
    });

    for raw in path_arguments(tool, args) {
        if let Err(violation) = ctx.boundary.resolve(raw) {
            trace.record(MatchedRule::PathEscapesWorkspace.as_str(), true, || {
                violation.to_string()
            });
            return PolicyDecision::new(
                Outcome::Deny,
                tier,
                MatchedRule::PathEscapesWorkspace,
                format!("PathEscapesWorkspace: {violation}"),
            );
        }
    }
    trace.record(MatchedRule::PathEscapesWorkspace.as_str(), false, || {
        if tool.path_params.is_empty() {
            "no path parameters".to_owned()
        } else {
            format!("paths inside workspace ({})", tool.path_params.join(", "))
        }
    });

    let network_blocked = tool.requires_network && !ctx.allow_network;
    trace.record(MatchedRule::NetworkDisabled.as_str(), network_blocked, || {
        format!(
            "requires_network={}, allow_network={}",
            tool.requires_network, ctx.allow_network
        )
    });
    if network_blocked {
        return PolicyDecision::new(
            Outcome::Deny,
            tier,
            MatchedRule::NetworkDisabled,
            format!("{} requires network access and allow_network is off", tool.id),
        );
    }

    let shell_blocked = tool.mutates && tool.wants_exec() && !ctx.allow_shell;
    trace.record(MatchedRule::ShellDisabled.as_str(), shell_blocked, || {
        format!(
            "mutates={}, exec={}, allow_shell={}",
            tool.mutates,
            tool.wants_exec(),
            ctx.allow_shell
        )
    });
    if shell_blocked {
        return PolicyDecision::new(
            Outcome::Deny,
            tier,
            MatchedRule::ShellDisabled,
            format!("{} requests shell execution and allow_shell is off", tool.id),
        );
    }

    let unknown_rejected = mode == PolicyMode::Strict && tool.risk == ToolRisk::Unknown;
    trace.record(MatchedRule::UnknownRisk.as_str(), unknown_rejected, || {
        format!("mode={mode}, risk={}", tool.risk)
    });
    if unknown_rejected {
        return PolicyDecision::new(
            Outcome::Deny,
            tier,
            MatchedRule::UnknownRisk,
            format!("{} has no declared risk metadata; strict mode refuses to guess", tool.id),
        );
    }

    let by_mode = mode_table(tool, args, tier, mode, ctx);
    trace.record(by_mode.matched_rule.as_str(), true, || {
        format!("mode {mode}: {}", by_mode.reason)
    });
    if by_mode.outcome != Outcome::RequireApproval {
        return by_mode;
    }

    let session = ctx.active_approvals.contains(&(tool.id.clone(), tier));
    trace.record(MatchedRule::SessionApproval.as_str(), session, || {
        if session {
            format!("session approval active for {} at {tier}", tool.id)
        } else {
            "no matching session approval".to_owned()
        }
    });
    if session {
        return PolicyDecision::new(
            Outcome::Allow,
            tier,
            MatchedRule::SessionApproval,
            format!("session approval for {} at {tier}", tool.id),
        );
    }
    by_mode
}

fn mode_table(
    tool: &ToolDefinition,
    args: &serde_json::Value,
    tier: Tier,
    mode: PolicyMode,
    ctx: &PolicyContext,
) -> PolicyDecision {
    if tier == Tier::READ {
        return PolicyDecision::new(
            Outcome::Allow,
            tier,
            MatchedRule::ReadOnly,
            "read-only call".to_owned(),
        );
    }
    if mode == PolicyMode::Commander
        && tier == Tier::EXEC
        && let Some(rule) = ctx.exec_allowlist.iter().find(|r| r.matches(&tool.id, args))
    {
        return PolicyDecision::new(
            Outcome::Allow,
            tier,
            MatchedRule::ExecAllowlist,
            format!("allowlisted by {rule}"),
        );
    }
    PolicyDecision::new(
        Outcome::RequireApproval,
        tier,
        MatchedRule::ModeApproval,
        format!("{tier} requires operator approval in {mode} mode"),
    )
}

/// String values of the declared path parameters; arrays contribute each element.
fn path_arguments<'a>(
    tool: &'a ToolDefinition,
    args: &'a serde_json::Value,
) -> impl Iterator<Item = &'a str> {
    tool.path_params
        .iter()
        .filter_map(|name| args.get(name))
        .flat_map(|value| match value {
            serde_json::Value::String(s) => vec![s.as_str()],
            serde_json::Value::Array(items) => {
                items.iter().filter_map(serde_json::Value::as_str).collect()
            }
            _ => Vec::new(),
        })
}

/// Operator-facing summary of the active policy.
#[must_use]
pub fn render_policy(mode: PolicyMode, ctx: &PolicyContext) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "mode: {mode}");
    let _ = writeln!(out, "allow_shell: {}", ctx.allow_shell);
    let _ = writeln!(out, "allow_network: {}", ctx.allow_network);
    let _ = writeln!(out, "workspace: {}", ctx.boundary.root().display());
    out.push_str("allowed roots:\n");
    for root in ctx.boundary.allowed_roots() {
        let _ = writeln!(out, "  {}", root.display());
    }
    if !ctx.boundary.denied_roots().is_empty() {
        out.push_str("denied roots:\n");
        for root in ctx.boundary.denied_roots() {
            let _ = writeln!(out, "  {}", root.display());
        }
    }
    if ctx.exec_allowlist.is_empty() {
        out.push_str("exec allowlist: (empty)\n");
    } else {
        out.push_str("exec allowlist:\n");
        for rule in &ctx.exec_allowlist {
            let _ = writeln!(out, "  {rule}");
        }
    }
    if ctx.active_approvals.is_empty() {
        out.push_str("session approvals: none\n");
    } else {
        out.push_str("session approvals:\n");
        for (id, tier) in &ctx.active_approvals {
            let _ = writeln!(out, "  {id} @ {tier}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::definition::RiskLevel;

    fn ctx(root: &Path) -> PolicyContext {
        PolicyContext::new(WorkspaceBoundary::new(root, &[], &[]))
    }

    fn list_dir() -> ToolDefinition {
        ToolDefinition::new(
            ToolId::new("builtin", "fs_list_dir"),
            "",
            ToolRisk::Declared(RiskLevel::Read),
        )
        .path_params(&["path"])
    }

    fn write_text() -> ToolDefinition {
        ToolDefinition::new(
            ToolId::new("builtin", "fs_write_text"),
            "",
            ToolRisk::Declared(RiskLevel::Write),
        )
        .mutating()
        .path_params(&["path"])
    }

    fn shell_run() -> ToolDefinition {
        ToolDefinition::new(
            ToolId::new("builtin", "shell_run"),
            "",
            ToolRisk::Declared(RiskLevel::Exec),
        )
        .mutating()
        .shell()
        .path_params(&["cwd"])
    }

    fn fetch() -> ToolDefinition {
        ToolDefinition::new(
            ToolId::new("builtin", "web_fetch"),
            "",
            ToolRisk::Declared(RiskLevel::Read),
        )
        .network()
    }

    #[test]
    fn strict_read_inside_workspace_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let d = evaluate(
            &list_dir(),
            &json!({"path": "."}),
            Tier::READ,
            PolicyMode::Strict,
            &ctx(dir.path()),
        );
        assert!(d.is_allowed());
        assert_eq!(d.matched_rule, MatchedRule::ReadOnly);
    }

    #[test]
    fn guide_write_requires_approval() {
        let dir = tempfile::tempdir().unwrap();
        let d = evaluate(
            &write_text(),
            &json!({"path": "out.txt", "content": "x"}),
            Tier::READ,
            PolicyMode::Guide,
            &ctx(dir.path()),
        );
        assert_eq!(d.outcome, Outcome::RequireApproval);
        assert_eq!(d.effective_tier, Tier::WRITE);
    }

    #[test]
    fn path_escape_denied_before_mode() {
        let dir = tempfile::tempdir().unwrap();
        let d = evaluate(
            &list_dir(),
            &json!({"path": "/etc"}),
            Tier::READ,
            PolicyMode::Guide,
            &ctx(dir.path()),
        );
        assert_eq!(d.outcome, Outcome::Deny);
        assert_eq!(d.matched_rule, MatchedRule::PathEscapesWorkspace);
        assert_eq!(d.failure_kind(), Some(FailureKind::PathEscapesWorkspace));
    }

    #[test]
    fn path_array_argument_checked() {
        let dir = tempfile::tempdir().unwrap();
        let tool = list_dir();
        let d = evaluate(
            &tool,
            &json!({"path": ["a.txt", "../b.txt"]}),
            Tier::READ,
            PolicyMode::Guide,
            &ctx(dir.path()),
        );
        assert_eq!(d.outcome, Outcome::Deny);
    }

    #[test]
    fn network_disabled_denies() {
        let dir = tempfile::tempdir().unwrap();
        let d = evaluate(
            &fetch(),
            &json!({"url": "https://example.com"}),
            Tier::READ,
            PolicyMode::Commander,
            &ctx(dir.path()),
        );
        assert_eq!(d.outcome, Outcome::Deny);
        assert_eq!(d.matched_rule, MatchedRule::NetworkDisabled);
        assert_eq!(d.failure_kind(), Some(FailureKind::PolicyDenied));
    }

    #[test]
    fn network_allowed_still_needs_approval() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path());
        c.allow_network = true;
        c.exec_allowlist.push(AllowRule {
            tool: "*".into(),
            command: None,
        });
        let d = evaluate(&fetch(), &json!({}), Tier::READ, PolicyMode::Commander, &c);
        assert_eq!(d.outcome, Outcome::RequireApproval);
        assert_eq!(d.effective_tier, Tier::NETWORK);
    }

    #[test]
    fn shell_disabled_denies_mutating_exec() {
        let dir = tempfile::tempdir().unwrap();
        let d = evaluate(
            &shell_run(),
            &json!({"command": "ls"}),
            Tier::READ,
            PolicyMode::Commander,
            &ctx(dir.path()),
        );
        assert_eq!(d.outcome, Outcome::Deny);
        assert_eq!(d.matched_rule, MatchedRule::ShellDisabled);
    }

    #[test]
    fn commander_allowlist_allows_exec() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path());
        c.allow_shell = true;
        c.exec_allowlist.push(AllowRule {
            tool: "shell_run".into(),
            command: Some("cargo *".into()),
        });
        let allowed = evaluate(
            &shell_run(),
            &json!({"command": "cargo test"}),
            Tier::READ,
            PolicyMode::Commander,
            &c,
        );
        assert_eq!(allowed.outcome, Outcome::Allow);
        assert_eq!(allowed.matched_rule, MatchedRule::ExecAllowlist);

        let gated = evaluate(
            &shell_run(),
            &json!({"command": "rm -rf target"}),
            Tier::READ,
            PolicyMode::Commander,
            &c,
        );
        assert_eq!(gated.outcome, Outcome::RequireApproval);

        let guide = evaluate(
            &shell_run(),
            &json!({"command": "cargo test"}),
            Tier::READ,
            PolicyMode::Guide,
            &c,
        );
        assert_eq!(guide.outcome, Outcome::RequireApproval);
    }

    #[test]
    fn strict_rejects_unknown_risk() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ToolDefinition::new(ToolId::new("mcp", "navigate"), "", ToolRisk::Unknown);
        let strict = evaluate(&tool, &json!({}), Tier::READ, PolicyMode::Strict, &ctx(dir.path()));
        assert_eq!(strict.outcome, Outcome::Deny);
        assert_eq!(strict.matched_rule, MatchedRule::UnknownRisk);

        let guide = evaluate(&tool, &json!({}), Tier::READ, PolicyMode::Guide, &ctx(dir.path()));
        assert_eq!(guide.outcome, Outcome::RequireApproval);
        assert_eq!(guide.effective_tier, Tier::EXEC);
    }

    #[test]
    fn declared_tier_escalates_read_tool() {
        let dir = tempfile::tempdir().unwrap();
        let d = evaluate(
            &list_dir(),
            &json!({"path": "."}),
            Tier::WRITE,
            PolicyMode::Guide,
            &ctx(dir.path()),
        );
        assert_eq!(d.effective_tier, Tier::WRITE);
        assert_eq!(d.outcome, Outcome::RequireApproval);
    }

    #[test]
    fn session_approval_matches_tool_and_tier() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_text();
        let approvals = BTreeSet::from([(tool.id.clone(), Tier::WRITE)]);
        let c = ctx(dir.path()).with_approvals(approvals);
        let args = json!({"path": "out.txt"});

        let same = evaluate(&tool, &args, Tier::READ, PolicyMode::Guide, &c);
        assert_eq!(same.outcome, Outcome::Allow);
        assert_eq!(same.matched_rule, MatchedRule::SessionApproval);

        let higher = evaluate(&tool, &args, Tier::EXEC, PolicyMode::Guide, &c);
        assert_eq!(higher.outcome, Outcome::RequireApproval);
    }

    #[test]
    fn session_approval_does_not_override_deny() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_text();
        let approvals = BTreeSet::from([(tool.id.clone(), Tier::WRITE)]);
        let c = ctx(dir.path()).with_approvals(approvals);
        let d = evaluate(
            &tool,
            &json!({"path": "../escape.txt"}),
            Tier::READ,
            PolicyMode::Guide,
            &c,
        );
        assert_eq!(d.outcome, Outcome::Deny);
    }

    #[test]
    fn explain_matches_evaluate() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path());
        let args = json!({"path": "notes.md"});
        let decision = evaluate(&write_text(), &args, Tier::READ, PolicyMode::Strict, &c);
        let explanation = explain(&write_text(), &args, Tier::READ, PolicyMode::Strict, &c);
        assert_eq!(explanation.decision, decision);
        let names: Vec<&str> = explanation.trace.iter().map(|c| c.check.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "effective-tier",
                "path-escapes-workspace",
                "network-disabled",
                "shell-disabled",
                "unknown-risk",
                "mode-approval",
                "session-approval",
            ]
        );
        let text = explanation.to_string();
        assert!(text.contains("=> require_approval"));
    }

    #[test]
    fn explain_stops_at_first_deny() {
        let dir = tempfile::tempdir().unwrap();
        let explanation = explain(
            &fetch(),
            &json!({}),
            Tier::READ,
            PolicyMode::Guide,
            &ctx(dir.path()),
        );
        let last = explanation.trace.last().unwrap();
        assert_eq!(last.check, "network-disabled");
        assert!(last.fired);
    }

    #[test]
    fn mode_parse_and_display() {
        assert_eq!("Commander".parse::<PolicyMode>().unwrap(), PolicyMode::Commander);
        assert!("yolo".parse::<PolicyMode>().is_err());
        assert_eq!(PolicyMode::Strict.to_string(), "strict");
    }

    #[test]
    fn render_policy_lists_roots_and_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path());
        c.exec_allowlist.push(AllowRule {
            tool: "shell_run".into(),
            command: Some("make *".into()),
        });
        let text = render_policy(PolicyMode::Commander, &c);
        assert!(text.contains("mode: commander"));
        assert!(text.contains("shell_run (command: make *)"));
        assert!(text.contains("session approvals: none"));
    }

    fn any_mode() -> impl Strategy<Value = PolicyMode> {
        prop_oneof![
            Just(PolicyMode::Guide),
            Just(PolicyMode::Commander),
            Just(PolicyMode::Strict),
        ]
    }

    fn any_tool() -> impl Strategy<Value = ToolDefinition> {
        prop_oneof![
            Just(list_dir()),
            Just(write_text()),
            Just(shell_run().path_params(&["path"])),
        ]
    }

    proptest! {
        #[test]
        fn escaping_paths_denied_in_every_mode(
            mode in any_mode(),
            tool in any_tool(),
            name in "[a-z]{1,8}",
            depth in 1usize..4,
            absolute in any::<bool>(),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let mut c = ctx(dir.path());
            c.allow_shell = true;
            let path = if absolute {
                format!("/gantry-outside-{name}/{name}.txt")
            } else {
                format!("{}{name}.txt", "../".repeat(depth))
            };
            let d = evaluate(&tool, &json!({"path": path}), Tier::READ, mode, &c);
            prop_assert_eq!(d.outcome, Outcome::Deny);
            prop_assert_eq!(d.matched_rule, MatchedRule::PathEscapesWorkspace);
        }

        #[test]
        fn evaluate_is_pure(
            mode in any_mode(),
            tool in any_tool(),
            path in "[a-z./]{0,16}",
            declared in 0u8..4,
            allow_shell in any::<bool>(),
        ) {
            let dir = tempfile::tempdir().unwrap();
            let mut c = ctx(dir.path());
            c.allow_shell = allow_shell;
            let args = json!({"path": path, "command": "ls"});
            let first = evaluate(&tool, &args, Tier(declared), mode, &c);
            let second = evaluate(&tool, &args, Tier(declared), mode, &c);
            prop_assert_eq!(&first, &second);
            let explained = explain(&tool, &args, Tier(declared), mode, &c);
            prop_assert_eq!(explained.decision, first);
        }
    }
}
