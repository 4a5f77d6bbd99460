//! In-memory fakes for the isolation and runner seams

use async_trait::async_trait;
use codelab_common::{Challenge, Language, TestCase};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::cancel::CancelSignal;
use crate::limits::{LimitBreach, ResourceLimits};
use crate::runner::{CompiledUnit, LanguageRunner, PrepareError};
use crate::sandbox::{Invocation, IsolationBoundary, RawExecutionOutcome, SandboxError};

/// Echoes stdin back, optionally after a delay or a number of setup failures
#[derive(Default)]
pub struct FakeBoundary {
    runs: AtomicUsize,
    fail_first: usize,
    delay: Option<Duration>,
    input_delays: bool,
    started: Mutex<Vec<String>>,
}

impl FakeBoundary {
    pub fn echo() -> Self {
        Self::default()
    }

    pub fn failing_first(mut self, n: usize) -> Self {
        self.fail_first = n;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sleep for the number of milliseconds given on stdin
    pub fn with_input_delays(mut self) -> Self {
        self.input_delays = true;
        self
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Source of each started execution, in start order
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl IsolationBoundary for FakeBoundary {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn run(
        &self,
        invocation: &Invocation,
        stdin: &str,
        limits: &ResourceLimits,
        mut cancel: CancelSignal,
    ) -> Result<RawExecutionOutcome, SandboxError> {
        let call = self.runs.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Err(SandboxError::SetupFailed("fake setup failure".to_string()));
        }
        if let Some(file) = invocation.files.first() {
            self.started.lock().unwrap().push(file.contents.clone());
        }

        let delay = if self.input_delays {
            stdin.trim().parse().ok().map(Duration::from_millis)
        } else {
            self.delay
        };

        if let Some(delay) = delay {
            let breach = tokio::select! {
                _ = tokio::time::sleep(delay) => None,
                _ = tokio::time::sleep(limits.wall_time()) => Some(LimitBreach::WallTime),
                _ = cancel.cancelled() => Some(LimitBreach::Cancelled),
            };
            if breach.is_some() {
                return Ok(RawExecutionOutcome {
                    signal: Some(9),
                    wall_time_ms: 1,
                    breach,
                    ..Default::default()
                });
            }
        }

        Ok(RawExecutionOutcome {
            stdout: stdin.to_string(),
            exit_code: Some(0),
            wall_time_ms: 1,
            ..Default::default()
        })
    }
}

pub struct FakeRunner {
    language: Language,
}

impl FakeRunner {
    /// Source that fails `prepare`
    pub const SYNTAX_ERROR: &'static str = "<<syntax error>>";

    pub fn new(language: Language) -> Self {
        Self { language }
    }
}

#[async_trait]
impl LanguageRunner for FakeRunner {
    fn language(&self) -> Language {
        self.language
    }

    async fn prepare(&self, source: &str) -> Result<CompiledUnit, PrepareError> {
        if source == Self::SYNTAX_ERROR {
            return Err(PrepareError::Syntax("unexpected token".to_string()));
        }
        Ok(CompiledUnit {
            language: self.language,
            source: source.to_string(),
            file_name: "main".to_string(),
        })
    }

    fn invocation(&self, unit: &CompiledUnit, _limits: &ResourceLimits) -> Invocation {
        Invocation::new(self.language, "fake").with_file(&unit.file_name, &unit.source)
    }
}

/// Challenge with one exact-mode test case per (input, expected) pair, ids from 1
pub fn challenge_with(cases: &[(&str, &str)]) -> Challenge {
    Challenge {
        id: "echo".to_string(),
        title: "Echo".to_string(),
        test_cases: cases
            .iter()
            .enumerate()
            .map(|(i, (input, expected))| TestCase {
                id: i as u32 + 1,
                input: input.to_string(),
                expected_output: expected.to_string(),
                comparison_mode: Default::default(),
                hidden: false,
            })
            .collect(),
        time_limit_ms: 60_000,
        memory_limit_mb: 128,
        languages: vec![],
        points: 100,
        tolerance: 1e-6,
    }
}
