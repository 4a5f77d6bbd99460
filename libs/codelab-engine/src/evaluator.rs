/// Verifier - Language-Agnostic Output Comparison and Scoring
///
/// **Core Responsibility:**
/// Compare raw execution outputs against expected outputs and aggregate
/// them into a verdict.
///
/// **Critical Properties:**
/// - Knows nothing about isolation backends
/// - Knows nothing about language runtimes
/// - Pure function: (execution outputs, challenge) → verdict
///
/// **Comparison Modes:**
/// - `exact`: byte-for-byte after stripping a single trailing newline
/// - `whitespace-insensitive`: whitespace runs collapse to one space, ends trimmed
/// - `numeric-tolerance`: same token count, each pair within the challenge epsilon
///
/// **Scoring Rules:**
/// - score = passed * points / total, rounded down
/// - overall_passed only when every test case passed
/// - degraded when any test case hit an infrastructure failure
use codelab_common::{Challenge, ComparisonMode, ErrorKind, ExecutionResult, TestCase, Verdict};
use tracing::debug;
use uuid::Uuid;

/// Raw execution output for a single test case
/// Produced by the executor, consumed by the evaluator
#[derive(Debug, Clone, PartialEq)]
pub struct TestExecutionOutput {
    pub test_id: u32,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u64,
    /// Set when the run did not complete normally; such a test never passes
    pub error: Option<ErrorKind>,
}

impl TestExecutionOutput {
    /// Output for a test case that never produced anything
    pub fn failed(test_id: u32, error: ErrorKind, stderr: impl Into<String>) -> Self {
        Self {
            test_id,
            stdout: String::new(),
            stderr: stderr.into(),
            execution_time_ms: 0,
            error: Some(error),
        }
    }
}

fn strip_trailing_newline(s: &str) -> &str {
    s.strip_suffix("\r\n")
        .or_else(|| s.strip_suffix('\n'))
        .unwrap_or(s)
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn numeric_tokens(s: &str) -> Option<Vec<f64>> {
    s.split(|c: char| c.is_whitespace() || matches!(c, ',' | '[' | ']' | '(' | ')'))
        .filter(|token| !token.is_empty())
        .map(|token| token.parse::<f64>().ok())
        .collect()
}

/// Compare actual against expected output under `mode`
pub fn compare(actual: &str, expected: &str, mode: ComparisonMode, epsilon: f64) -> bool {
    match mode {
        ComparisonMode::Exact => strip_trailing_newline(actual) == strip_trailing_newline(expected),
        ComparisonMode::WhitespaceInsensitive => collapse_whitespace(actual) == collapse_whitespace(expected),
        ComparisonMode::NumericTolerance => {
            // Anything unparseable, or nothing at all, fails closed
            let (Some(actual), Some(expected)) = (numeric_tokens(actual), numeric_tokens(expected)) else {
                return false;
            };
            !expected.is_empty()
                && actual.len() == expected.len()
                && actual
                    .iter()
                    .zip(&expected)
                    .all(|(a, e)| a == e || (a - e).abs() <= epsilon)
        }
    }
}

/// Evaluate a single test case execution output
///
/// A recorded error fails the test regardless of output; otherwise the
/// output is compared under the test case's mode.
pub fn evaluate_test(output: &TestExecutionOutput, test_case: &TestCase, epsilon: f64) -> ExecutionResult {
    let passed = output.error.is_none()
        && compare(&output.stdout, &test_case.expected_output, test_case.comparison_mode, epsilon);

    let stderr = (output.error.is_some() && !output.stderr.is_empty()).then(|| output.stderr.clone());

    ExecutionResult {
        test_case_id: test_case.id,
        passed,
        actual_output: output.stdout.clone(),
        execution_time_ms: output.execution_time_ms,
        error: output.error,
        stderr,
        hidden: test_case.hidden,
    }
}

/// Aggregate test outputs into the final verdict
///
/// Results follow the challenge's test case order. Outputs pair with test
/// cases by position; an out-of-place output is found by id instead. A test
/// case with no matching output is reported as an infrastructure failure.
pub fn aggregate_results(submission_id: Uuid, challenge: &Challenge, outputs: &[TestExecutionOutput]) -> Verdict {
    let results: Vec<ExecutionResult> = challenge
        .test_cases
        .iter()
        .enumerate()
        .map(|(index, test_case)| {
            let output = outputs
                .get(index)
                .filter(|o| o.test_id == test_case.id)
                .or_else(|| outputs.iter().find(|o| o.test_id == test_case.id));
            match output {
                Some(output) => evaluate_test(output, test_case, challenge.tolerance),
                None => evaluate_test(
                    &TestExecutionOutput::failed(test_case.id, ErrorKind::InfrastructureError, "no output recorded"),
                    test_case,
                    challenge.tolerance,
                ),
            }
        })
        .collect();

    let total = results.len() as u64;
    let passed = results.iter().filter(|r| r.passed).count() as u64;
    let aggregate_score = if total == 0 {
        0
    } else {
        (passed * challenge.points as u64 / total) as u32
    };
    let overall_passed = total > 0 && passed == total;
    let total_time_ms = results.iter().map(|r| r.execution_time_ms).sum();
    let degraded = results
        .iter()
        .any(|r| r.error == Some(ErrorKind::InfrastructureError));

    debug!(
        submission_id = %submission_id,
        passed,
        total,
        aggregate_score,
        degraded,
        "Evaluation complete"
    );

    Verdict {
        submission_id,
        overall_passed,
        aggregate_score,
        total_time_ms,
        results,
        degraded,
    }
}

/// Evaluate all test cases and produce the verdict
pub fn evaluate(submission_id: Uuid, challenge: &Challenge, outputs: Vec<TestExecutionOutput>) -> Verdict {
    aggregate_results(submission_id, challenge, &outputs)
}
