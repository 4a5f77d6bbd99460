//! Language Runners - how each language is validated and invoked
//!
//! One `LanguageRunner` per supported language:
//! - `PythonRunner`: host `compile()` check, then `python3 main.py`
//! - `JavaScriptRunner`: host `node --check`, then `node main.js`
//! - `SqlRunner`: in-process statement filter, then `sqlite3 :memory:`
//!
//! Runners never execute untrusted code outside an `IsolationBoundary`.
//! The host-side checks only parse the source.

pub mod javascript;
pub mod python;
pub mod sql;

use async_trait::async_trait;
use codelab_common::Language;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::config::{LanguageConfig, LanguageConfigManager};
use crate::limits::{LimitOverrides, ResourceLimits};
use crate::sandbox::{Invocation, IsolationBoundary, RawExecutionOutcome, SandboxError};

pub use javascript::JavaScriptRunner;
pub use python::PythonRunner;
pub use sql::SqlRunner;

const HOST_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Source that passed validation and is ready to run against test inputs
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledUnit {
    pub language: Language,
    pub source: String,
    /// File name the source is written to inside the scratch directory
    pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PrepareError {
    #[error("{0}")]
    Syntax(String),
}

/// Interpreter settings a runner takes from its `LanguageConfig`
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerSettings {
    pub command: String,
    pub args: Vec<String>,
    pub image: Option<String>,
    pub cpu_share: Option<f32>,
    pub memory_floor_mb: Option<u64>,
    pub syntax_check: bool,
}

impl RunnerSettings {
    pub fn from_config(config: &LanguageConfig) -> Self {
        Self {
            command: config.execution.command.clone(),
            args: config.execution.args.clone(),
            image: Some(config.image.clone()),
            cpu_share: Some(config.cpu_limit),
            memory_floor_mb: config.memory_limit_mb,
            syntax_check: config.syntax_check,
        }
    }
}

#[async_trait]
pub trait LanguageRunner: Send + Sync {
    fn language(&self) -> Language;

    /// Validate `source` without occupying an isolation slot
    async fn prepare(&self, source: &str) -> Result<CompiledUnit, PrepareError>;

    fn invocation(&self, unit: &CompiledUnit, limits: &ResourceLimits) -> Invocation;

    /// Bytes fed to the program for one test case
    fn stdin_for(&self, _unit: &CompiledUnit, input: &str) -> String {
        input.to_string()
    }

    fn limit_overrides(&self) -> LimitOverrides {
        LimitOverrides::default()
    }

    async fn invoke(
        &self,
        boundary: &dyn IsolationBoundary,
        unit: &CompiledUnit,
        input: &str,
        limits: &ResourceLimits,
        cancel: CancelSignal,
    ) -> Result<RawExecutionOutcome, SandboxError> {
        let invocation = self.invocation(unit, limits);
        let stdin = self.stdin_for(unit, input);
        boundary.run(&invocation, &stdin, limits, cancel).await
    }
}

/// Result of a host-side parse check
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum HostCheck {
    Passed,
    Failed(String),
    /// The checker could not run; validation is left to the sandboxed run
    Unavailable(String),
}

/// Run a trusted parser on the host. Only ever parses; never executes the source.
pub(crate) async fn host_check(program: &str, args: &[&str], stdin: Option<&str>) -> HostCheck {
    debug!(program, ?args, "Running host syntax check");

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => return HostCheck::Unavailable(format!("{}: {}", program, e)),
    };

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        if let Err(e) = pipe.write_all(input.as_bytes()).await {
            return HostCheck::Unavailable(format!("failed to feed {}: {}", program, e));
        }
        drop(pipe);
    }

    match tokio::time::timeout(HOST_CHECK_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => HostCheck::Passed,
        Ok(Ok(output)) => HostCheck::Failed(String::from_utf8_lossy(&output.stderr).trim().to_string()),
        Ok(Err(e)) => HostCheck::Unavailable(format!("{}: {}", program, e)),
        Err(_) => HostCheck::Unavailable(format!("{} syntax check timed out", program)),
    }
}

/// Turn a host check into a prepare outcome, deferring when the checker is unavailable
pub(crate) fn finish_prepare(
    language: Language,
    source: &str,
    file_name: &str,
    check: HostCheck,
) -> Result<CompiledUnit, PrepareError> {
    match check {
        HostCheck::Passed => {}
        HostCheck::Failed(message) => return Err(PrepareError::Syntax(message)),
        HostCheck::Unavailable(reason) => {
            warn!(language = %language, reason = %reason, "Host syntax check unavailable, deferring to sandboxed run");
        }
    }

    Ok(CompiledUnit {
        language,
        source: source.to_string(),
        file_name: file_name.to_string(),
    })
}

/// Runners keyed by language
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<Language, Arc<dyn LanguageRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One runner per configured language
    pub fn from_config(manager: &LanguageConfigManager) -> Self {
        let mut registry = Self::new();
        for language in manager.list_languages() {
            let Ok(config) = manager.get_config(&language) else {
                continue;
            };
            let settings = RunnerSettings::from_config(config);
            let runner: Arc<dyn LanguageRunner> = match language {
                Language::Python => Arc::new(PythonRunner::new(settings)),
                Language::JavaScript => Arc::new(JavaScriptRunner::new(settings)),
                Language::Sql => Arc::new(SqlRunner::new(settings)),
            };
            registry.register(runner);
        }
        registry
    }

    pub fn register(&mut self, runner: Arc<dyn LanguageRunner>) {
        self.runners.insert(runner.language(), runner);
    }

    pub fn get(&self, language: Language) -> Option<Arc<dyn LanguageRunner>> {
        self.runners.get(&language).cloned()
    }

    pub fn languages(&self) -> Vec<Language> {
        Language::ALL
            .into_iter()
            .filter(|language| self.runners.contains_key(language))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_from_builtin_config() {
        let registry = RunnerRegistry::from_config(&LanguageConfigManager::builtin());
        assert_eq!(registry.languages(), Language::ALL.to_vec());
        assert_eq!(registry.get(Language::Sql).unwrap().language(), Language::Sql);
    }

    #[tokio::test]
    async fn test_missing_checker_is_unavailable() {
        let check = host_check("/nonexistent/checker", &[], Some("x")).await;
        assert!(matches!(check, HostCheck::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_failing_checker_reports_stderr() {
        let check = host_check("/bin/sh", &["-c", "echo 'bad token' >&2; exit 1"], None).await;
        assert_eq!(check, HostCheck::Failed("bad token".to_string()));
    }

    #[test]
    fn test_unavailable_check_defers() {
        let unit = finish_prepare(
            Language::Python,
            "print(1)",
            "main.py",
            HostCheck::Unavailable("python3 missing".to_string()),
        )
        .unwrap();
        assert_eq!(unit.file_name, "main.py");

        let err = finish_prepare(Language::Python, "(", "main.py", HostCheck::Failed("SyntaxError".to_string()))
            .unwrap_err();
        assert_eq!(err, PrepareError::Syntax("SyntaxError".to_string()));
    }
}
