//! Argument sanitization for audit records.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

const SECRET_PREFIXES: &[&str] = &[
    "sk-",
    "sk_live_",
    "sk_test_",
    "AKIA",
    "ghp_",
    "gho_",
    "github_pat_",
    "-----BEGIN",
    "xoxb-",
    "xoxp-",
    "AIza",
    "glpat-",
    "hf_",
    "npm_",
];

const SECRET_KEY_PARTS: &[&str] = &[
    "token",
    "password",
    "passwd",
    "secret",
    "api_key",
    "apikey",
    "authorization",
    "credential",
    "private_key",
];

pub const REDACTED: &str = "[REDACTED]";

/// Strings longer than this are cut in audit records.
pub const MAX_AUDIT_STRING: usize = 2048;

static SECRET_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = SECRET_PREFIXES
        .iter()
        .map(|p| regex::escape(p))
        .collect::<Vec<_>>()
        .join("|");
    let full = format!("(?:{pattern})[^\\s\"'`,;{{}}\\[\\]]*");
    Regex::new(&full).expect("secret redaction regex is valid")
});

/// Replace tokens starting with a known secret prefix by `[REDACTED]`.
#[must_use]
pub fn redact_secrets(text: &str) -> Cow<'_, str> {
    if !SECRET_PREFIXES.iter().any(|p| text.contains(p)) {
        return Cow::Borrowed(text);
    }
    SECRET_REGEX.replace_all(text, REDACTED)
}

fn is_secret_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    SECRET_KEY_PARTS.iter().any(|part| key.contains(part))
}

fn truncate(text: &str) -> Cow<'_, str> {
    if text.len() <= MAX_AUDIT_STRING {
        return Cow::Borrowed(text);
    }
    let mut end = MAX_AUDIT_STRING;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    Cow::Owned(format!(
        "{}... [{} bytes truncated]",
        &text[..end],
        text.len() - end
    ))
}

/// Copy of tool arguments safe to persist in the audit log.
///
/// Values under secret-looking keys are replaced wholesale; other strings
/// have secret-prefixed tokens redacted and are truncated.
#[must_use]
pub fn sanitize_arguments(value: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let clean = if is_secret_key(k) && !v.is_null() {
                        Value::String(REDACTED.to_owned())
                    } else {
                        sanitize_arguments(v)
                    };
                    (k.clone(), clean)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_arguments).collect()),
        Value::String(s) => {
            let redacted = redact_secrets(s);
            Value::String(truncate(&redacted).into_owned())
        }
        other => other.clone(),
    }
}
