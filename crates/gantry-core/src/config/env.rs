use std::path::PathBuf;

use super::Config;

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_workspace();
        self.apply_env_overrides_policy();
        self.apply_env_overrides_runtime();
    }

    fn apply_env_overrides_workspace(&mut self) {
        if let Ok(v) = std::env::var("GANTRY_WORKSPACE_ID") {
            self.workspace.id = v;
        }
        if let Ok(v) = std::env::var("GANTRY_WORKSPACE_ROOT") {
            self.workspace.root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GANTRY_STATE_DIR") {
            self.workspace.state_dir = PathBuf::from(v);
        }
    }

    fn apply_env_overrides_policy(&mut self) {
        if let Ok(v) = std::env::var("GANTRY_POLICY_MODE") {
            match v.parse() {
                Ok(mode) => self.policy.mode = mode,
                Err(e) => tracing::warn!("ignoring invalid GANTRY_POLICY_MODE value: {e}"),
            }
        }
        if let Ok(v) = std::env::var("GANTRY_ALLOW_SHELL") {
            if let Ok(allow) = v.parse::<bool>() {
                self.policy.allow_shell = allow;
            } else {
                tracing::warn!("ignoring invalid GANTRY_ALLOW_SHELL value: {v}");
            }
        }
        if let Ok(v) = std::env::var("GANTRY_ALLOW_NETWORK") {
            if let Ok(allow) = v.parse::<bool>() {
                self.policy.allow_network = allow;
            } else {
                tracing::warn!("ignoring invalid GANTRY_ALLOW_NETWORK value: {v}");
            }
        }
        if let Ok(v) = std::env::var("GANTRY_ALLOWED_ROOTS") {
            self.policy.allowed_roots = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
        if let Ok(v) = std::env::var("GANTRY_STRICT_METADATA")
            && let Ok(strict) = v.parse::<bool>()
        {
            self.policy.strict_metadata = strict;
        }
    }

    fn apply_env_overrides_runtime(&mut self) {
        if let Ok(v) = std::env::var("GANTRY_AUDIT_ENABLED")
            && let Ok(enabled) = v.parse::<bool>()
        {
            self.audit.enabled = enabled;
        }
        if let Ok(v) = std::env::var("GANTRY_AUDIT_DESTINATION") {
            self.audit.destination = v;
        }
        if let Ok(v) = std::env::var("GANTRY_PROCESS_TIMEOUT") {
            if let Ok(secs) = v.parse::<u64>() {
                self.process.default_timeout_secs = secs;
            } else {
                tracing::warn!("ignoring invalid GANTRY_PROCESS_TIMEOUT value: {v}");
            }
        }
        if let Ok(v) = std::env::var("GANTRY_PROCESS_QUIET_WINDOW") {
            if let Ok(secs) = v.parse::<u64>() {
                self.process.quiet_window_secs = secs;
            } else {
                tracing::warn!("ignoring invalid GANTRY_PROCESS_QUIET_WINDOW value: {v}");
            }
        }
        if let Ok(v) = std::env::var("GANTRY_MAX_STEP_ATTEMPTS") {
            if let Ok(n) = v.parse::<u32>() {
                self.engine.max_step_attempts = n;
            } else {
                tracing::warn!("ignoring invalid GANTRY_MAX_STEP_ATTEMPTS value: {v}");
            }
        }
        if let Ok(v) = std::env::var("GANTRY_WEB_TIMEOUT")
            && let Ok(secs) = v.parse::<u64>()
        {
            self.web.timeout = secs;
        }
    }
}
