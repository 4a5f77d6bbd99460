//! End-to-end runs through the process sandbox with real interpreters

use codelab_common::{Challenge, ComparisonMode, ErrorKind, TestCase};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EngineConfig, LanguageConfigManager};
use crate::executor::ExecutionContext;
use crate::repository::InMemoryChallengeRepository;
use crate::runner::RunnerRegistry;
use crate::sandbox::{NetworkPolicy, ProcessSandbox};
use crate::scheduler::Scheduler;
use crate::submission::SubmissionService;

const KADANE_PY: &str = r#"
import json, sys

def max_subarray(nums):
    best = current = nums[0]
    for n in nums[1:]:
        current = max(n, current + n)
        best = max(best, current)
    return best

print(max_subarray(json.loads(sys.stdin.read())))
"#;

const STUB_PY: &str = r#"
def max_subarray(nums):
    pass
"#;

fn test_case(id: u32, input: &str, expected: &str) -> TestCase {
    TestCase {
        id,
        input: input.to_string(),
        expected_output: expected.to_string(),
        comparison_mode: ComparisonMode::Exact,
        hidden: false,
    }
}

fn challenge(id: &str, time_limit_ms: u64, test_cases: Vec<TestCase>) -> Challenge {
    Challenge {
        id: id.to_string(),
        title: id.to_string(),
        test_cases,
        time_limit_ms,
        memory_limit_mb: 256,
        languages: vec![],
        points: 100,
        tolerance: 1e-6,
    }
}

fn service() -> SubmissionService {
    let languages = LanguageConfigManager::builtin();
    let config = EngineConfig {
        max_concurrent_executions: 2,
        network: NetworkPolicy::Inherit,
        ..Default::default()
    };
    let ctx = ExecutionContext::new(
        Arc::new(ProcessSandbox::new(config.network)),
        RunnerRegistry::from_config(&languages),
        &config,
    );
    let scheduler = Scheduler::new(ctx, config.max_concurrent_executions, Duration::from_secs(60));

    let challenges = InMemoryChallengeRepository::new([
        challenge("echo", 5000, vec![test_case(1, "hello\n", "hello"), test_case(2, "1 2 3\n", "1 2 3")]),
        challenge(
            "sql-echo",
            5000,
            vec![test_case(
                1,
                "CREATE TABLE input(line TEXT); INSERT INTO input VALUES ('hello');",
                "hello",
            )],
        ),
        challenge(
            "max-subarray",
            5000,
            vec![
                test_case(1, "[-2,1,-3,4,-1,2,1,-5,4]", "6"),
                test_case(2, "[1]", "1"),
                test_case(3, "[5,4,-1,7,8]", "23"),
                test_case(4, "[-3,-1,-2]", "-1"),
            ],
        ),
        challenge("spin", 500, vec![test_case(1, "", "")]),
    ]);

    SubmissionService::new(scheduler, Arc::new(challenges), config.max_source_bytes)
}

#[tokio::test]
#[ignore = "requires python3, node and sqlite3 on the host"]
async fn test_echo_passes_in_every_language() {
    let service = service();

    let python = service
        .submit_and_wait("echo", "python", "import sys\nsys.stdout.write(sys.stdin.read())\n")
        .await
        .unwrap();
    assert!(python.overall_passed, "{:?}", python);

    let javascript = service
        .submit_and_wait(
            "echo",
            "javascript",
            "process.stdout.write(require('fs').readFileSync(0, 'utf8'));",
        )
        .await
        .unwrap();
    assert!(javascript.overall_passed, "{:?}", javascript);

    let sql = service
        .submit_and_wait("sql-echo", "sql", "SELECT line FROM input;")
        .await
        .unwrap();
    assert!(sql.overall_passed, "{:?}", sql);
}

#[tokio::test]
#[ignore = "requires python3 on the host"]
async fn test_kadane_passes_and_stub_fails() {
    let service = service();

    let solved = service.submit_and_wait("max-subarray", "python", KADANE_PY).await.unwrap();
    assert!(solved.overall_passed);
    assert_eq!(solved.aggregate_score, 100);

    let stub = service.submit_and_wait("max-subarray", "python", STUB_PY).await.unwrap();
    assert!(!stub.overall_passed);
    assert_eq!(stub.aggregate_score, 0);
}

#[tokio::test]
#[ignore = "requires python3 on the host"]
async fn test_resubmission_is_idempotent() {
    let service = service();

    let first = service.submit_and_wait("max-subarray", "python", KADANE_PY).await.unwrap();
    let second = service.submit_and_wait("max-subarray", "python", KADANE_PY).await.unwrap();

    assert_eq!(first.overall_passed, second.overall_passed);
    assert_eq!(first.aggregate_score, second.aggregate_score);
}

#[tokio::test]
#[ignore = "requires python3 on the host"]
async fn test_infinite_loop_times_out() {
    let service = service();

    let verdict = service.submit_and_wait("spin", "python", "while True:\n    pass\n").await.unwrap();

    assert!(!verdict.results[0].passed);
    assert_eq!(verdict.results[0].error, Some(ErrorKind::Timeout));
}

#[tokio::test]
#[ignore = "requires python3 on the host"]
async fn test_python_syntax_error() {
    let service = service();

    let verdict = service.submit_and_wait("echo", "python", "print(\n").await.unwrap();

    assert!(verdict
        .results
        .iter()
        .all(|r| r.error == Some(ErrorKind::SyntaxError)));
}

#[tokio::test]
#[ignore = "requires python3 on the host"]
async fn test_runtime_crash_keeps_stderr() {
    let service = service();

    let verdict = service
        .submit_and_wait("echo", "python", "raise ValueError('boom')\n")
        .await
        .unwrap();

    let result = &verdict.results[0];
    assert_eq!(result.error, Some(ErrorKind::RuntimeCrash));
    assert!(result.stderr.as_deref().unwrap_or("").contains("ValueError"));
}

#[tokio::test]
#[ignore = "requires python3 on the host"]
async fn test_memory_ceiling() {
    let service = service();

    let verdict = service
        .submit_and_wait("echo", "python", "blob = b'x' * (1024 * 1024 * 1024)\nprint(len(blob))\n")
        .await
        .unwrap();

    assert_eq!(verdict.results[0].error, Some(ErrorKind::ResourceExceeded));
}
