//! Providers: named execution strategies used in place of a raw command.
//!
//! The set is fixed when the registry is built; there is no plugin loading.

pub mod cli;
pub mod registry;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::worker::executor::ExecutionControl;

pub use cli::CliProvider;
pub use registry::ProviderRegistry;

/// Inputs a provider receives from a `run` job.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub interactive: bool,
    /// Effective timeout after worker defaults are applied.
    pub timeout: Option<Duration>,
}

/// A named execution strategy.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry key, matched against `payload.provider`.
    fn name(&self) -> &str;

    /// Run to completion and return the exit code.
    ///
    /// Signal terminations (including cancellation through `control`) are
    /// reported as [`ExecError::SignalTermination`].
    async fn run(
        &self,
        request: ProviderRequest,
        control: &ExecutionControl,
    ) -> Result<i32, ExecError>;
}
