//! Isolation Boundary - where untrusted code actually runs
//!
//! This module provides a single contract over interchangeable backends:
//! - `ProcessSandbox`: a subprocess in its own session with rlimits, a
//!   writable scratch directory over a read-only view of the host, and
//!   (optionally) a fresh network namespace
//! - `DockerSandbox`: a throwaway container with no network and a read-only
//!   root filesystem
//!
//! The sandbox module does NOT:
//! - Know how a language is invoked (runners build the `Invocation`)
//! - Compare outputs or decide pass/fail
//! - Retry failures (the executor owns the retry policy)

pub mod docker;
pub mod process;

use async_trait::async_trait;
use codelab_common::{ErrorKind, Language};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::cancel::CancelSignal;
use crate::config::{EngineConfig, LanguageConfigManager};
use crate::limits::{LimitBreach, ResourceLimits};

pub use docker::DockerSandbox;
pub use process::{NetworkPolicy, ProcessSandbox};

/// A file placed in the scratch directory before the program starts
#[derive(Debug, Clone, PartialEq)]
pub struct ScratchFile {
    pub name: String,
    pub contents: String,
}

/// Everything a backend needs to launch one execution
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub language: Language,
    /// Program name or path, resolved inside the isolated context
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub files: Vec<ScratchFile>,
    /// Container image, used by the Docker backend only
    pub image: Option<String>,
    /// Fraction of a CPU granted to a container
    pub cpu_share: Option<f32>,
    /// The runtime maps far more address space than it touches, so only
    /// resident memory can be bounded
    pub reserves_address_space: bool,
}

impl Invocation {
    pub fn new(language: Language, program: impl Into<String>) -> Self {
        Self {
            language,
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            files: Vec::new(),
            image: None,
            cpu_share: None,
            reserves_address_space: false,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_file(mut self, name: impl Into<String>, contents: impl Into<String>) -> Self {
        self.files.push(ScratchFile {
            name: name.into(),
            contents: contents.into(),
        });
        self
    }

    pub fn with_image(mut self, image: Option<String>, cpu_share: Option<f32>) -> Self {
        self.image = image;
        self.cpu_share = cpu_share;
        self
    }

    pub fn reserving_address_space(mut self) -> Self {
        self.reserves_address_space = true;
        self
    }

    /// Program followed by its arguments
    pub fn command_line(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.iter().cloned());
        v
    }
}

/// Raw outcome of one execution (no verdict interpretation)
#[derive(Debug, Clone, Default)]
pub struct RawExecutionOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Terminating signal, if the program died from one
    pub signal: Option<i32>,
    pub wall_time_ms: u64,
    pub cpu_time_ms: Option<u64>,
    pub peak_memory_kb: Option<u64>,
    /// Limit the execution was terminated for, if any
    pub breach: Option<LimitBreach>,
    pub stdout_truncated: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("isolation setup failed: {0}")]
    SetupFailed(String),
    #[error("isolation setup failed: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SetupFailed
    }
}

#[async_trait]
pub trait IsolationBoundary: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run `invocation` with `stdin` under `limits` in a fresh isolated context.
    ///
    /// The context is torn down before this returns, and also when the
    /// returned future is dropped.
    async fn run(
        &self,
        invocation: &Invocation,
        stdin: &str,
        limits: &ResourceLimits,
        cancel: CancelSignal,
    ) -> Result<RawExecutionOutcome, SandboxError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationKind {
    Process,
    #[default]
    Docker,
}

impl IsolationKind {
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "process" => Some(IsolationKind::Process),
            "docker" | "container" => Some(IsolationKind::Docker),
            _ => None,
        }
    }
}

/// Build the configured backend
pub fn build_boundary(
    config: &EngineConfig,
    languages: &LanguageConfigManager,
) -> anyhow::Result<Arc<dyn IsolationBoundary>> {
    let boundary: Arc<dyn IsolationBoundary> = match config.isolation {
        IsolationKind::Process => {
            let sandbox = ProcessSandbox::new(config.network);
            sandbox.verify()?;
            Arc::new(sandbox)
        }
        IsolationKind::Docker => Arc::new(DockerSandbox::new_with_config(languages)?),
    };
    tracing::info!(backend = boundary.name(), "Isolation boundary ready");
    Ok(boundary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_builder() {
        let invocation = Invocation::new(Language::Python, "python3")
            .with_args(["-I", "main.py"])
            .with_env("PYTHONHASHSEED", "0")
            .with_file("main.py", "print(1)");

        assert_eq!(invocation.command_line(), vec!["python3", "-I", "main.py"]);
        assert_eq!(invocation.files[0].name, "main.py");
        assert_eq!(invocation.env[0].0, "PYTHONHASHSEED");
    }

    #[test]
    fn test_isolation_kind_parsing() {
        assert_eq!(IsolationKind::from_str("process"), Some(IsolationKind::Process));
        assert_eq!(IsolationKind::from_str("Container"), Some(IsolationKind::Docker));
        assert_eq!(IsolationKind::from_str("vm"), None);
    }

    #[test]
    fn test_setup_errors_map_to_setup_failed() {
        let err = SandboxError::SetupFailed("no scratch space".to_string());
        assert_eq!(err.kind(), ErrorKind::SetupFailed);
        let io = SandboxError::from(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(io.kind(), ErrorKind::SetupFailed);
    }
}
