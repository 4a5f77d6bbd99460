/// Resource Limiter - Per-Execution Ceilings
///
/// **Core Responsibility:**
/// Describe the limits a single execution runs under and translate a limit
/// breach into the shared error taxonomy.
///
/// **Enforcement lives in the isolation backends:**
/// - Process backend: `setrlimit` backstops plus a `/proc` watchdog
/// - Docker backend: cgroup memory/pids limits plus `ulimit -t`
///
/// Whatever the backend, a breach always terminates the whole execution
/// (process group or container) before the outcome is reported.
use codelab_common::{Challenge, ErrorKind};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::sandbox::RawExecutionOutcome;

pub const DEFAULT_WALL_TIME_MS: u64 = 5000;
pub const DEFAULT_MEMORY_MB: u64 = 256;
pub const DEFAULT_OUTPUT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_GRACE_PERIOD_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub wall_time_ms: u64,
    /// CPU time ceiling, enforced independently of the wall clock
    pub cpu_time_ms: u64,
    pub memory_mb: u64,
    pub output_bytes: usize,
    /// Stderr is only kept for diagnostics; excess is dropped silently
    pub stderr_bytes: usize,
    pub max_open_files: u64,
    pub max_file_size_mb: u64,
    pub max_processes: u64,
    /// Time between the polite and the hard kill on cancellation
    pub grace_period_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_time_ms: DEFAULT_WALL_TIME_MS,
            cpu_time_ms: DEFAULT_WALL_TIME_MS,
            memory_mb: DEFAULT_MEMORY_MB,
            output_bytes: DEFAULT_OUTPUT_BYTES,
            stderr_bytes: 64 * 1024,
            max_open_files: 64,
            max_file_size_mb: 16,
            max_processes: 64,
            grace_period_ms: DEFAULT_GRACE_PERIOD_MS,
        }
    }
}

impl ResourceLimits {
    /// Limits for one test case of `challenge`, taking non-challenge settings from `base`.
    ///
    /// The CPU ceiling is twice the wall clock: a single-threaded program always
    /// meets the wall clock first, a program burning several cores does not.
    pub fn for_challenge(challenge: &Challenge, base: &ResourceLimits) -> Self {
        Self {
            wall_time_ms: challenge.time_limit_ms,
            cpu_time_ms: challenge.time_limit_ms.saturating_mul(2),
            memory_mb: challenge.memory_limit_mb,
            ..base.clone()
        }
    }

    pub fn with_overrides(mut self, overrides: &LimitOverrides) -> Self {
        if let Some(memory_mb) = overrides.memory_mb {
            self.memory_mb = self.memory_mb.max(memory_mb);
        }
        if let Some(extra) = overrides.extra_cpu_time_ms {
            self.cpu_time_ms = self.cpu_time_ms.saturating_add(extra);
        }
        if let Some(output_bytes) = overrides.output_bytes {
            self.output_bytes = output_bytes;
        }
        self
    }

    pub fn wall_time(&self) -> Duration {
        Duration::from_millis(self.wall_time_ms)
    }

    pub fn cpu_time(&self) -> Duration {
        Duration::from_millis(self.cpu_time_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb * 1024 * 1024
    }

    /// Whole seconds for `RLIMIT_CPU` / `ulimit -t`, rounded up with one second of slack
    /// so the precise watchdog normally fires first
    pub fn cpu_rlimit_secs(&self) -> u64 {
        self.cpu_time_ms.saturating_add(999) / 1000 + 1
    }
}

/// Per-runner adjustments layered over challenge limits
///
/// Overrides only ever loosen: memory is a floor and CPU time gains headroom.
/// The wall clock stays at the challenge's time limit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitOverrides {
    pub memory_mb: Option<u64>,
    pub extra_cpu_time_ms: Option<u64>,
    pub output_bytes: Option<usize>,
}

/// Which ceiling an execution ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitBreach {
    WallTime,
    CpuTime,
    Memory,
    OutputSize,
    Cancelled,
}

impl LimitBreach {
    pub fn error_kind(&self) -> ErrorKind {
        match self {
            LimitBreach::WallTime => ErrorKind::Timeout,
            LimitBreach::CpuTime | LimitBreach::Memory => ErrorKind::ResourceExceeded,
            LimitBreach::OutputSize => ErrorKind::OutputTooLarge,
            LimitBreach::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Map a raw outcome onto the error taxonomy; `None` means a clean exit
///
/// Priority: recorded breach, then CPU-limit signals, then any other
/// abnormal termination.
pub fn classify(outcome: &RawExecutionOutcome) -> Option<ErrorKind> {
    if let Some(breach) = outcome.breach {
        return Some(breach.error_kind());
    }

    match (outcome.exit_code, outcome.signal) {
        (Some(0), None) => None,
        (_, Some(signal)) if signal == Signal::SIGXCPU as i32 => Some(ErrorKind::ResourceExceeded),
        _ => Some(ErrorKind::RuntimeCrash),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelab_common::TestCase;

    fn outcome(exit_code: Option<i32>, signal: Option<i32>, breach: Option<LimitBreach>) -> RawExecutionOutcome {
        RawExecutionOutcome {
            stdout: String::new(),
            stderr: String::new(),
            exit_code,
            signal,
            wall_time_ms: 10,
            cpu_time_ms: None,
            peak_memory_kb: None,
            breach,
            stdout_truncated: false,
        }
    }

    fn challenge(time_limit_ms: u64, memory_limit_mb: u64) -> Challenge {
        Challenge {
            id: "c".to_string(),
            title: "c".to_string(),
            test_cases: vec![TestCase {
                id: 1,
                input: String::new(),
                expected_output: String::new(),
                comparison_mode: Default::default(),
                hidden: false,
            }],
            time_limit_ms,
            memory_limit_mb,
            languages: vec![],
            points: 100,
            tolerance: 1e-6,
        }
    }

    #[test]
    fn test_defaults() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.wall_time_ms, 5000);
        assert_eq!(limits.memory_mb, 256);
        assert_eq!(limits.output_bytes, 1024 * 1024);
        assert_eq!(limits.grace_period_ms, 500);
    }

    #[test]
    fn test_challenge_limits_with_overrides() {
        let limits = ResourceLimits::for_challenge(&challenge(2000, 128), &ResourceLimits::default())
            .with_overrides(&LimitOverrides {
                memory_mb: Some(512),
                extra_cpu_time_ms: Some(1000),
                output_bytes: None,
            });

        assert_eq!(limits.wall_time_ms, 2000);
        assert_eq!(limits.cpu_time_ms, 5000);
        assert_eq!(limits.memory_mb, 512);
    }

    #[test]
    fn test_memory_override_is_a_floor() {
        let limits = ResourceLimits::for_challenge(&challenge(1000, 1024), &ResourceLimits::default())
            .with_overrides(&LimitOverrides {
                memory_mb: Some(512),
                ..Default::default()
            });
        assert_eq!(limits.memory_mb, 1024);
    }

    #[test]
    fn test_cpu_rlimit_rounds_up() {
        let mut limits = ResourceLimits::default();
        limits.cpu_time_ms = 1500;
        assert_eq!(limits.cpu_rlimit_secs(), 3);
        limits.cpu_time_ms = 1000;
        assert_eq!(limits.cpu_rlimit_secs(), 2);
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&outcome(Some(0), None, None)), None);
        assert_eq!(classify(&outcome(Some(1), None, None)), Some(ErrorKind::RuntimeCrash));
        assert_eq!(
            classify(&outcome(None, Some(Signal::SIGSEGV as i32), None)),
            Some(ErrorKind::RuntimeCrash)
        );
        assert_eq!(
            classify(&outcome(None, Some(Signal::SIGXCPU as i32), None)),
            Some(ErrorKind::ResourceExceeded)
        );
        assert_eq!(
            classify(&outcome(None, Some(Signal::SIGKILL as i32), Some(LimitBreach::WallTime))),
            Some(ErrorKind::Timeout)
        );
        assert_eq!(
            classify(&outcome(Some(0), None, Some(LimitBreach::OutputSize))),
            Some(ErrorKind::OutputTooLarge)
        );
    }
}
