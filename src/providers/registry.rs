//! Provider registry: name-keyed lookup of the built-in providers.

use std::collections::HashMap;
use std::sync::Arc;

use super::{CliProvider, Provider};
use crate::error::ExecError;
use crate::worker::executor::ProcessExecutor;

/// Built-in providers: (name, program, leading args).
const BUILTIN_PROVIDERS: &[(&str, &str, &[&str])] = &[
    ("claude", "claude", &[]),
    ("codex", "codex", &["exec"]),
    ("shell", "sh", &["-c"]),
];

/// Registry of providers, fixed at construction.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Build from an explicit provider list. Later entries win on name clashes.
    pub fn new(providers: Vec<Arc<dyn Provider>>) -> Self {
        let providers = providers
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect();
        Self { providers }
    }

    /// The built-in providers, spawned through `executor`.
    pub fn builtin(executor: ProcessExecutor) -> Self {
        Self::new(
            BUILTIN_PROVIDERS
                .iter()
                .map(|(name, program, leading)| {
                    Arc::new(
                        CliProvider::new(*name, *program)
                            .with_leading_args(leading)
                            .with_executor(executor.clone()),
                    ) as Arc<dyn Provider>
                })
                .collect(),
        )
    }

    /// Look up a provider by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Provider>, ExecError> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ExecError::UnknownProvider {
                name: name.to_string(),
            })
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::builtin(ProcessExecutor::default())
    }
}
