//! Operator command parser. A leading `/` is accepted and ignored.

use std::path::PathBuf;

use gantry_tools::{ApprovalScope, PolicyMode, Tier};

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    RunStart { goal: String, plan: Option<PathBuf> },
    RunPlan(PathBuf),
    RunStatus,
    RunSteps,
    RunPause,
    RunResume,
    RunSkip(String),
    RunRetry(String),
    RunStop,
    RunNext,
    RunContinue,
    RunEdit { step: String, patch: serde_json::Value },
    RunInspect,
    RunArchive(String),
    RunAttach(String),
    RunReport,
    PolicyShow,
    PolicyExplain {
        tool: String,
        arguments: serde_json::Value,
        tier: Tier,
    },
    PolicyMode(PolicyMode),
    Approve { id: String, scope: ApprovalScope },
    Deny(String),
    Approvals,
    Revoke,
    ArtifactList,
    ArtifactOpen(String),
    ProcessPoll(String),
    ProcessKill { id: String, force: bool },
    Tools,
    Help,
    Exit,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("empty command")]
    Empty,

    #[error("unknown command '{0}', try 'help'")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid JSON: {0}")]
    Json(String),

    #[error("{0}")]
    Invalid(String),
}

pub const HELP: &str = "\
run start <goal> [--plan <file.json>]   create a run, optionally with a plan
run plan <file.json>                    submit or append steps
run status | steps | inspect | report   show the current run
run pause | resume | continue | next    control execution
run skip <n> | retry <n>                settle or re-run a step
run edit <n> <json>                     change a pending step (intent, tool_id, arguments, declared_tier)
run stop                                stop the run, killing its processes
run attach <id> | archive <id>          pick up or set aside an incomplete run
policy show | mode <guide|commander|strict>
policy explain <tool> <json> [tier]     dry-run the policy for a call
approve <id> [once|session] | deny <id> | approvals | revoke
artifact list | open <id>
process poll <id> | kill <id> [--force]
tools | help | exit";

/// Parse one operator line.
///
/// # Errors
///
/// Returns a [`CommandError`] describing what is wrong with the line.
pub fn parse(line: &str) -> Result<Command, CommandError> {
    let line = line.trim();
    let line = line.strip_prefix('/').unwrap_or(line);
    let (head, rest) = split_word(line);
    match head {
        "" => Err(CommandError::Empty),
        "run" => parse_run(rest),
        "policy" => parse_policy(rest),
        "approve" => {
            let parts: Vec<&str> = rest.split_whitespace().collect();
            match parts.as_slice() {
                [id] => Ok(Command::Approve {
                    id: (*id).to_owned(),
                    scope: ApprovalScope::Once,
                }),
                [id, scope] => Ok(Command::Approve {
                    id: (*id).to_owned(),
                    scope: scope.parse().map_err(CommandError::Invalid)?,
                }),
                _ => Err(CommandError::Usage("approve <id> [once|session]")),
            }
        }
        "deny" => one_arg(rest, "deny <id>").map(Command::Deny),
        "approvals" => Ok(Command::Approvals),
        "revoke" => Ok(Command::Revoke),
        "artifact" | "artifacts" => {
            let (sub, arg) = split_word(rest);
            match sub {
                "list" | "" => Ok(Command::ArtifactList),
                "open" => one_arg(arg, "artifact open <id>").map(Command::ArtifactOpen),
                _ => Err(CommandError::Usage("artifact list | open <id>")),
            }
        }
        "process" => parse_process(rest),
        "tools" => Ok(Command::Tools),
        "help" | "?" => Ok(Command::Help),
        "exit" | "quit" => Ok(Command::Exit),
        other => Err(CommandError::Unknown(other.to_owned())),
    }
}

fn parse_run(rest: &str) -> Result<Command, CommandError> {
    let (sub, arg) = split_word(rest);
    match sub {
        "start" => {
            let (goal, plan) = match arg.split_once("--plan") {
                Some((goal, file)) => {
                    let file = file.trim();
                    if file.is_empty() {
                        return Err(CommandError::Usage("run start <goal> [--plan <file.json>]"));
                    }
                    (goal.trim(), Some(PathBuf::from(file)))
                }
                None => (arg, None),
            };
            if goal.is_empty() {
                return Err(CommandError::Usage("run start <goal> [--plan <file.json>]"));
            }
            Ok(Command::RunStart {
                goal: goal.to_owned(),
                plan,
            })
        }
        "plan" => one_arg(arg, "run plan <file.json>").map(|p| Command::RunPlan(p.into())),
        "status" => Ok(Command::RunStatus),
        "steps" => Ok(Command::RunSteps),
        "pause" => Ok(Command::RunPause),
        "resume" => Ok(Command::RunResume),
        "continue" => Ok(Command::RunContinue),
        "next" => Ok(Command::RunNext),
        "stop" => Ok(Command::RunStop),
        "skip" => one_arg(arg, "run skip <n>").map(Command::RunSkip),
        "retry" => one_arg(arg, "run retry <n>").map(Command::RunRetry),
        "edit" => {
            let (step, json) = split_word(arg);
            if step.is_empty() || json.is_empty() {
                return Err(CommandError::Usage("run edit <n> <json>"));
            }
            let patch = parse_json(json)?;
            if !patch.is_object() {
                return Err(CommandError::Json("step edit must be a JSON object".into()));
            }
            Ok(Command::RunEdit {
                step: step.to_owned(),
                patch,
            })
        }
        "inspect" => Ok(Command::RunInspect),
        "archive" => one_arg(arg, "run archive <id>").map(Command::RunArchive),
        "attach" => one_arg(arg, "run attach <id>").map(Command::RunAttach),
        "report" => Ok(Command::RunReport),
        _ => Err(CommandError::Usage(
            "run start|plan|status|steps|pause|resume|skip|retry|stop|next|continue|edit|inspect|archive|attach|report",
        )),
    }
}

fn parse_policy(rest: &str) -> Result<Command, CommandError> {
    let (sub, arg) = split_word(rest);
    match sub {
        "show" | "" => Ok(Command::PolicyShow),
        "mode" => {
            let mode = one_arg(arg, "policy mode <guide|commander|strict>")?;
            mode.parse().map(Command::PolicyMode).map_err(CommandError::Invalid)
        }
        "explain" => {
            let (tool, tail) = split_word(arg);
            if tool.is_empty() {
                return Err(CommandError::Usage("policy explain <tool> <json> [tier]"));
            }
            let (arguments, tier) = parse_json_and_tier(tail)?;
            Ok(Command::PolicyExplain {
                tool: tool.to_owned(),
                arguments,
                tier,
            })
        }
        _ => Err(CommandError::Usage("policy show | explain <tool> <json> [tier] | mode <mode>")),
    }
}

fn parse_process(rest: &str) -> Result<Command, CommandError> {
    let parts: Vec<&str> = rest.split_whitespace().collect();
    match parts.as_slice() {
        ["poll", id] => Ok(Command::ProcessPoll((*id).to_owned())),
        ["kill", id] => Ok(Command::ProcessKill {
            id: (*id).to_owned(),
            force: false,
        }),
        ["kill", id, "--force"] | ["kill", "--force", id] => Ok(Command::ProcessKill {
            id: (*id).to_owned(),
            force: true,
        }),
        _ => Err(CommandError::Usage("process poll <id> | kill <id> [--force]")),
    }
}

/// `<json>` or `<json> <tier>`; an empty tail means no arguments.
fn parse_json_and_tier(tail: &str) -> Result<(serde_json::Value, Tier), CommandError> {
    let tail = tail.trim();
    if tail.is_empty() {
        return Ok((serde_json::json!({}), Tier::READ));
    }
    if let Ok(value) = serde_json::from_str(tail) {
        return Ok((value, Tier::READ));
    }
    let Some((json, tier)) = tail.rsplit_once(char::is_whitespace) else {
        return parse_json(tail).map(|v| (v, Tier::READ));
    };
    let tier = tier
        .trim()
        .parse::<u8>()
        .map_err(|_| CommandError::Invalid(format!("tier must be 0-3, got '{tier}'")))?;
    if tier > Tier::NETWORK.0 {
        return Err(CommandError::Invalid(format!("tier must be 0-3, got {tier}")));
    }
    Ok((parse_json(json)?, Tier(tier)))
}

fn parse_json(text: &str) -> Result<serde_json::Value, CommandError> {
    serde_json::from_str(text.trim()).map_err(|e| CommandError::Json(e.to_string()))
}

fn split_word(text: &str) -> (&str, &str) {
    let text = text.trim();
    match text.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (text, ""),
    }
}

fn one_arg(arg: &str, usage: &'static str) -> Result<String, CommandError> {
    let mut parts = arg.split_whitespace();
    match (parts.next(), parts.next()) {
        (Some(value), None) => Ok(value.to_owned()),
        _ => Err(CommandError::Usage(usage)),
    }
}
