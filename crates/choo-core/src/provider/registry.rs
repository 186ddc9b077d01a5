//! Provider registry -- a named collection of available Provider adapters.

use std::collections::HashMap;
use std::sync::Arc;

use super::trait_def::Provider;

/// A collection of registered [`Provider`] implementations, keyed by name.
/// Providers are stored behind `Arc` so the orchestrator can hand a shared
/// handle to each spawned worker task without re-instantiating the adapter.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider adapter, replacing any existing one with the same name.
    pub fn register(&mut self, provider: impl Provider + 'static) -> Option<Arc<dyn Provider>> {
        let name = provider.name().to_string();
        self.providers.insert(name, Arc::new(provider))
    }

    pub fn get(&self, name: &str) -> Option<&dyn Provider> {
        self.providers.get(name).map(|b| b.as_ref())
    }

    /// Like `get`, but returns a cloned `Arc` suitable for handing to a
    /// spawned task that must outlive the registry borrow.
    pub fn get_arc(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// A registry pre-populated with the built-in providers (`claude-code`, `codex`).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(super::claude_code::ClaudeCodeProvider::new());
        registry.register(super::codex::CodexCliProvider::new());
        registry
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_builtins_registers_claude_code_and_codex() {
        let registry = ProviderRegistry::with_builtins();
        assert!(registry.get("claude-code").is_some());
        assert!(registry.get("codex").is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn get_missing_returns_none() {
        let registry = ProviderRegistry::new();
        assert!(registry.get("nonexistent").is_none());
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = ProviderRegistry::new();
        registry.register(super::super::claude_code::ClaudeCodeProvider::new());
        let old = registry.register(super::super::claude_code::ClaudeCodeProvider::new());
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);
    }
}
