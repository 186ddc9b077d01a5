//! Provider selection -- the precedence chain that decides which Provider
//! name to use for a given invocation.
//!
//! Highest priority first: `--force-task-provider` CLI flag, then per-unit
//! frontmatter override, then CLI `--default-provider`, then the
//! `CHOO_PROVIDER` env var, then config file, then the built-in default
//! `claude-code`.
//!
//! `--force-task-provider` only reroutes task-execution and review-fix
//! invocations. Any other AI-adjacent call the system makes (synthesizing a
//! branch name, resolving a merge conflict) always uses the
//! default-provider chain, ignoring the force override -- see
//! [`InvocationKind`].

pub const BUILTIN_DEFAULT_PROVIDER: &str = "claude-code";

/// What kind of call a provider resolution is for. Only `TaskExecution` and
/// `ReviewFix` are eligible for `--force-task-provider` rerouting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    TaskExecution,
    ReviewFix,
    MergeConflictResolution,
    BranchNaming,
}

impl InvocationKind {
    fn force_eligible(self) -> bool {
        matches!(self, InvocationKind::TaskExecution | InvocationKind::ReviewFix)
    }
}

/// All inputs to the provider selection chain. `env_lookup` is injected so
/// tests don't have to mutate real process environment.
#[derive(Debug, Clone, Default)]
pub struct ProviderSelector {
    pub force_task_provider: Option<String>,
    pub unit_frontmatter_override: Option<String>,
    pub cli_default_provider: Option<String>,
    pub env_provider: Option<String>,
    pub config_file_provider: Option<String>,
}

impl ProviderSelector {
    /// Build a selector reading the env layer from the process environment
    /// (`CHOO_PROVIDER`).
    pub fn with_process_env(mut self) -> Self {
        self.env_provider = std::env::var("CHOO_PROVIDER").ok();
        self
    }

    /// Resolve the provider name to use for `kind`.
    pub fn resolve(&self, kind: InvocationKind) -> &str {
        if kind.force_eligible() {
            if let Some(forced) = &self.force_task_provider {
                return forced;
            }
            if let Some(unit_override) = &self.unit_frontmatter_override {
                return unit_override;
            }
        }
        if let Some(cli_default) = &self.cli_default_provider {
            return cli_default;
        }
        if let Some(env) = &self.env_provider {
            return env;
        }
        if let Some(config) = &self.config_file_provider {
            return config;
        }
        BUILTIN_DEFAULT_PROVIDER
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_builtin_when_nothing_set() {
        let selector = ProviderSelector::default();
        assert_eq!(selector.resolve(InvocationKind::TaskExecution), BUILTIN_DEFAULT_PROVIDER);
    }

    #[test]
    fn config_file_beats_builtin_default() {
        let selector = ProviderSelector {
            config_file_provider: Some("codex".to_string()),
            ..Default::default()
        };
        assert_eq!(selector.resolve(InvocationKind::TaskExecution), "codex");
    }

    #[test]
    fn env_beats_config_file() {
        let selector = ProviderSelector {
            config_file_provider: Some("codex".to_string()),
            env_provider: Some("claude-code".to_string()),
            ..Default::default()
        };
        assert_eq!(selector.resolve(InvocationKind::TaskExecution), "claude-code");
    }

    #[test]
    fn cli_default_beats_env() {
        let selector = ProviderSelector {
            env_provider: Some("codex".to_string()),
            cli_default_provider: Some("claude-code".to_string()),
            ..Default::default()
        };
        assert_eq!(selector.resolve(InvocationKind::TaskExecution), "claude-code");
    }

    #[test]
    fn unit_frontmatter_beats_cli_default_for_task_execution() {
        let selector = ProviderSelector {
            cli_default_provider: Some("claude-code".to_string()),
            unit_frontmatter_override: Some("codex".to_string()),
            ..Default::default()
        };
        assert_eq!(selector.resolve(InvocationKind::TaskExecution), "codex");
    }

    #[test]
    fn force_task_provider_beats_everything_for_task_execution() {
        let selector = ProviderSelector {
            unit_frontmatter_override: Some("codex".to_string()),
            cli_default_provider: Some("claude-code".to_string()),
            force_task_provider: Some("claude-code".to_string()),
            ..Default::default()
        };
        assert_eq!(selector.resolve(InvocationKind::TaskExecution), "claude-code");
        assert_eq!(selector.resolve(InvocationKind::ReviewFix), "claude-code");
    }

    #[test]
    fn force_task_provider_is_ignored_for_merge_conflict_and_branch_naming() {
        let selector = ProviderSelector {
            cli_default_provider: Some("claude-code".to_string()),
            force_task_provider: Some("codex".to_string()),
            ..Default::default()
        };
        assert_eq!(
            selector.resolve(InvocationKind::MergeConflictResolution),
            "claude-code"
        );
        assert_eq!(selector.resolve(InvocationKind::BranchNaming), "claude-code");
    }
}
