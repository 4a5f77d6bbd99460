/// Submission Executor - Runs One Submission End to End
///
/// **Responsibility:**
/// Coordinate a language runner, the isolation boundary and the evaluator
/// to turn one admitted submission into a verdict.
///
/// **Flow:**
/// 1. `prepare` the source (syntax errors fail every test case, no slot used)
/// 2. Fan out test cases, at most `per_submission_parallelism` at a time and
///    never more than the global execution permits allow
/// 3. Retry an isolation setup failure once, then record `InfrastructureError`
/// 4. Evaluate the outputs, in test case order
///
/// This module is the glue layer - it knows nothing about:
/// - How code executes (the boundary's job)
/// - How outputs are compared (the evaluator's job)
/// - Queueing and admission (the scheduler's job)
use codelab_common::{Challenge, ErrorKind, Submission, TestCase, Verdict};
use futures_util::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, error, info, warn};

use crate::cancel::CancelSignal;
use crate::config::EngineConfig;
use crate::evaluator::{self, TestExecutionOutput};
use crate::limits::{classify, ResourceLimits};
use crate::runner::{CompiledUnit, LanguageRunner, PrepareError, RunnerRegistry};
use crate::sandbox::{IsolationBoundary, RawExecutionOutcome};

/// Attempts per test case before an isolation failure becomes `InfrastructureError`
const MAX_ATTEMPTS: u32 = 2;

/// Live count of executing test cases, with a high-water mark
#[derive(Debug, Default)]
pub struct ExecutionGauge {
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ExecutionGauge {
    pub fn enter(self: &Arc<Self>) -> GaugeGuard {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard { gauge: self.clone() }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub struct GaugeGuard {
    gauge: Arc<ExecutionGauge>,
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.gauge.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Shared execution resources, cloned into every running submission
#[derive(Clone)]
pub struct ExecutionContext {
    pub boundary: Arc<dyn IsolationBoundary>,
    pub runners: Arc<RunnerRegistry>,
    pub base_limits: ResourceLimits,
    /// Global ceiling on simultaneously running test cases
    pub execution_permits: Arc<Semaphore>,
    pub per_submission_parallelism: usize,
    pub gauge: Arc<ExecutionGauge>,
}

impl ExecutionContext {
    pub fn new(boundary: Arc<dyn IsolationBoundary>, runners: RunnerRegistry, config: &EngineConfig) -> Self {
        Self {
            boundary,
            runners: Arc::new(runners),
            base_limits: config.limits.clone(),
            execution_permits: Arc::new(Semaphore::new(config.max_concurrent_executions.max(1))),
            per_submission_parallelism: config.per_submission_parallelism.max(1),
            gauge: Arc::new(ExecutionGauge::default()),
        }
    }
}

fn output_from_outcome(test_id: u32, outcome: RawExecutionOutcome) -> TestExecutionOutput {
    TestExecutionOutput {
        test_id,
        error: classify(&outcome),
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        execution_time_ms: outcome.wall_time_ms,
    }
}

/// Wait for a permit unless cancellation comes first
async fn acquire<'a>(semaphore: &'a Semaphore, cancel: &mut CancelSignal) -> Result<SemaphorePermit<'a>, ErrorKind> {
    tokio::select! {
        permit = semaphore.acquire() => permit.map_err(|_| ErrorKind::InfrastructureError),
        _ = cancel.cancelled() => Err(ErrorKind::Cancelled),
    }
}

async fn run_test_case(
    ctx: &ExecutionContext,
    runner: &dyn LanguageRunner,
    unit: &CompiledUnit,
    test_case: &TestCase,
    limits: &ResourceLimits,
    local_permits: &Semaphore,
    mut cancel: CancelSignal,
) -> TestExecutionOutput {
    if cancel.is_cancelled() {
        return TestExecutionOutput::failed(test_case.id, ErrorKind::Cancelled, "");
    }

    let _local = match acquire(local_permits, &mut cancel).await {
        Ok(permit) => permit,
        Err(kind) => return TestExecutionOutput::failed(test_case.id, kind, ""),
    };
    let _global = match acquire(&ctx.execution_permits, &mut cancel).await {
        Ok(permit) => permit,
        Err(kind) => return TestExecutionOutput::failed(test_case.id, kind, ""),
    };
    let _active = ctx.gauge.enter();

    let mut attempt = 0;
    loop {
        attempt += 1;
        match runner
            .invoke(ctx.boundary.as_ref(), unit, &test_case.input, limits, cancel.clone())
            .await
        {
            Ok(outcome) => {
                let output = output_from_outcome(test_case.id, outcome);
                debug!(
                    test_id = test_case.id,
                    execution_time_ms = output.execution_time_ms,
                    error = ?output.error,
                    "Test case executed"
                );
                return output;
            }
            Err(e) if e.kind().is_retryable() && attempt < MAX_ATTEMPTS && !cancel.is_cancelled() => {
                warn!(test_id = test_case.id, attempt, error = %e, "Isolation setup failed, retrying");
            }
            Err(e) => {
                error!(test_id = test_case.id, attempt, error = %e, "Isolation setup failed");
                let kind = if cancel.is_cancelled() {
                    ErrorKind::Cancelled
                } else {
                    ErrorKind::InfrastructureError
                };
                return TestExecutionOutput::failed(test_case.id, kind, e.to_string());
            }
        }
    }
}

/// Execute every test case of `submission` and evaluate the outputs
#[tracing::instrument(
    skip_all,
    fields(
        submission_id = %submission.id,
        language = %submission.language,
        test_count = challenge.test_cases.len()
    )
)]
pub async fn execute_submission(
    ctx: &ExecutionContext,
    submission: &Submission,
    challenge: &Challenge,
    cancel: CancelSignal,
) -> Verdict {
    info!("Starting submission execution");
    let start = std::time::Instant::now();

    let Some(runner) = ctx.runners.get(submission.language) else {
        error!("No runner registered for language");
        let outputs = challenge
            .test_cases
            .iter()
            .map(|tc| TestExecutionOutput::failed(tc.id, ErrorKind::InfrastructureError, "no runner for language"))
            .collect();
        return evaluator::evaluate(submission.id, challenge, outputs);
    };

    let unit = match runner.prepare(&submission.source_code).await {
        Ok(unit) => unit,
        Err(PrepareError::Syntax(message)) => {
            info!("Syntax check failed; all test cases marked as failed");
            let outputs = challenge
                .test_cases
                .iter()
                .map(|tc| TestExecutionOutput::failed(tc.id, ErrorKind::SyntaxError, message.clone()))
                .collect();
            return evaluator::evaluate(submission.id, challenge, outputs);
        }
    };

    let limits = ResourceLimits::for_challenge(challenge, &ctx.base_limits).with_overrides(&runner.limit_overrides());
    let local_permits = Semaphore::new(ctx.per_submission_parallelism);

    let outputs = join_all(challenge.test_cases.iter().map(|test_case| {
        run_test_case(
            ctx,
            runner.as_ref(),
            &unit,
            test_case,
            &limits,
            &local_permits,
            cancel.clone(),
        )
    }))
    .await;

    let verdict = evaluator::evaluate(submission.id, challenge, outputs);

    info!(
        overall_passed = verdict.overall_passed,
        score = verdict.aggregate_score,
        degraded = verdict.degraded,
        execution_ms = start.elapsed().as_millis() as u64,
        "Submission execution completed"
    );

    verdict
}
