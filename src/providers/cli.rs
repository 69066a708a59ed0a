//! Providers backed by a command-line binary.

use async_trait::async_trait;

use super::{Provider, ProviderRequest};
use crate::error::ExecError;
use crate::worker::executor::{ExecutionControl, ProcessExecutor, ProcessSpec};

/// Runs `program leading_args... request.args...` through the process executor.
#[derive(Debug, Clone)]
pub struct CliProvider {
    name: String,
    program: String,
    leading_args: Vec<String>,
    executor: ProcessExecutor,
}

impl CliProvider {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            leading_args: Vec::new(),
            executor: ProcessExecutor::default(),
        }
    }

    /// Builder: arguments placed before the job's own arguments.
    pub fn with_leading_args(mut self, args: &[&str]) -> Self {
        self.leading_args = args.iter().map(|a| a.to_string()).collect();
        self
    }

    /// Builder: executor used to spawn the binary.
    pub fn with_executor(mut self, executor: ProcessExecutor) -> Self {
        self.executor = executor;
        self
    }

    fn spec(&self, request: ProviderRequest) -> ProcessSpec {
        let mut args = self.leading_args.clone();
        args.extend(request.args);
        ProcessSpec {
            program: self.program.clone(),
            args,
            env: request.env,
            cwd: request.cwd,
            interactive: request.interactive,
            timeout: request.timeout,
        }
    }
}

#[async_trait]
impl Provider for CliProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        request: ProviderRequest,
        control: &ExecutionControl,
    ) -> Result<i32, ExecError> {
        let spec = self.spec(request);
        self.executor.run(&spec, control).await
    }
}
