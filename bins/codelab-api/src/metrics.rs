// Prometheus metrics for the API
use codelab_common::{ErrorKind, Language, Verdict};
use codelab_engine::SchedulerStats;
use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

lazy_static! {
    pub static ref SUBMISSIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "codelab_submissions_total",
        "Submissions admitted to the scheduler",
        &["language", "mode"]
    )
    .expect("register codelab_submissions_total");
    pub static ref REJECTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "codelab_rejections_total",
        "Requests answered with a structured error",
        &["error_kind"]
    )
    .expect("register codelab_rejections_total");
    pub static ref VERDICTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "codelab_verdicts_total",
        "Completed verdicts by outcome",
        &["language", "outcome"]
    )
    .expect("register codelab_verdicts_total");
    pub static ref TEST_RESULTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "codelab_test_results_total",
        "Per test case outcomes",
        &["outcome"]
    )
    .expect("register codelab_test_results_total");
    pub static ref SUBMISSION_DURATION: HistogramVec = register_histogram_vec!(
        "codelab_submission_duration_seconds",
        "Summed execution time of a submission's test cases",
        &["language"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    )
    .expect("register codelab_submission_duration_seconds");
    pub static ref QUEUED: IntGauge =
        register_int_gauge!("codelab_queued_submissions", "Submissions waiting for a slot")
            .expect("register codelab_queued_submissions");
    pub static ref RUNNING: IntGauge =
        register_int_gauge!("codelab_running_submissions", "Submissions holding a slot")
            .expect("register codelab_running_submissions");
    pub static ref ACTIVE_EXECUTIONS: IntGauge = register_int_gauge!(
        "codelab_active_executions",
        "Isolation boundaries currently alive"
    )
    .expect("register codelab_active_executions");
    pub static ref PEAK_EXECUTIONS: IntGauge = register_int_gauge!(
        "codelab_peak_executions",
        "Highest number of simultaneously alive isolation boundaries"
    )
    .expect("register codelab_peak_executions");
}

pub fn record_rejection(kind: ErrorKind) {
    REJECTIONS_TOTAL.with_label_values(&[&kind.to_string()]).inc();
}

pub fn record_verdict(language: Language, verdict: &Verdict) {
    let outcome = if verdict.is_unrunnable() {
        "unrunnable"
    } else if verdict.overall_passed {
        "passed"
    } else {
        "failed"
    };
    let language = language.to_string();
    VERDICTS_TOTAL.with_label_values(&[&language, outcome]).inc();
    SUBMISSION_DURATION
        .with_label_values(&[&language])
        .observe(verdict.total_time_ms as f64 / 1000.0);

    for result in &verdict.results {
        let outcome = match result.error {
            Some(kind) => kind.to_string(),
            None if result.passed => "Passed".to_string(),
            None => "WrongAnswer".to_string(),
        };
        TEST_RESULTS_TOTAL.with_label_values(&[&outcome]).inc();
    }
}

/// Refresh the scheduler gauges from a stats snapshot
pub fn observe_scheduler(stats: &SchedulerStats) {
    QUEUED.set(stats.queued as i64);
    RUNNING.set(stats.running as i64);
    ACTIVE_EXECUTIONS.set(stats.active_executions as i64);
    PEAK_EXECUTIONS.set(stats.peak_executions as i64);
}

/// Encode the default registry in the Prometheus text format
pub fn render() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codelab_common::ExecutionResult;
    use uuid::Uuid;

    #[test]
    fn test_render_includes_recorded_series() {
        let verdict = Verdict {
            submission_id: Uuid::new_v4(),
            overall_passed: false,
            aggregate_score: 0,
            total_time_ms: 120,
            results: vec![ExecutionResult {
                test_case_id: 1,
                passed: false,
                actual_output: String::new(),
                execution_time_ms: 120,
                error: Some(ErrorKind::Timeout),
                stderr: None,
                hidden: false,
            }],
            degraded: false,
        };
        record_verdict(Language::Sql, &verdict);
        record_rejection(ErrorKind::InvalidSubmission);
        observe_scheduler(&SchedulerStats {
            queued: 3,
            running: 1,
            active_executions: 1,
            peak_executions: 2,
            retained: 4,
        });

        let text = render().unwrap();
        assert!(text.contains("codelab_verdicts_total{language=\"sql\",outcome=\"failed\"}"));
        assert!(text.contains("codelab_test_results_total{outcome=\"Timeout\"}"));
        assert!(text.contains("codelab_rejections_total{error_kind=\"InvalidSubmission\"}"));
        assert!(text.contains("codelab_queued_submissions 3"));
    }
}
