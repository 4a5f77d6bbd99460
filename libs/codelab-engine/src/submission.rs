/// Submission API - the boundary contract
///
/// Validates a request, resolves its challenge and hands it to the
/// scheduler. Callers either wait for the verdict (`submit_and_wait`) or
/// poll (`get_status`) with the returned id.
///
/// Rejections happen before admission and never occupy a pool slot:
/// - `InvalidSubmission`: unknown or unaccepted language, empty or oversized source
/// - `InvalidChallenge`: unknown challenge, one without test cases, or one
///   whose test case ids repeat
use codelab_common::{Language, Submission, SubmissionStatus, Verdict};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::repository::ChallengeRepository;
use crate::scheduler::{Scheduler, SchedulerStats, SubmissionState, VerdictHandle};

/// How long `cancel` waits for a running submission to settle
const CANCEL_SETTLE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub status: SubmissionStatus,
    pub verdict: Option<Arc<Verdict>>,
    pub failure: Option<String>,
}

impl From<SubmissionState> for StatusSnapshot {
    fn from(state: SubmissionState) -> Self {
        let failure = match &state {
            SubmissionState::Failed(reason) => Some(reason.clone()),
            _ => None,
        };
        Self {
            status: state.status(),
            verdict: state.verdict(),
            failure,
        }
    }
}

#[derive(Clone)]
pub struct SubmissionService {
    scheduler: Scheduler,
    challenges: Arc<dyn ChallengeRepository>,
    max_source_bytes: usize,
}

impl SubmissionService {
    pub fn new(scheduler: Scheduler, challenges: Arc<dyn ChallengeRepository>, max_source_bytes: usize) -> Self {
        Self {
            scheduler,
            challenges,
            max_source_bytes,
        }
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Validate and queue a submission
    pub async fn submit(&self, challenge_id: &str, language: &str, source_code: &str) -> Result<VerdictHandle, EngineError> {
        let language = Language::from_str(language)
            .ok_or_else(|| EngineError::InvalidSubmission(format!("unsupported language '{}'", language)))?;

        if source_code.trim().is_empty() {
            return Err(EngineError::InvalidSubmission("source code is empty".to_string()));
        }
        if source_code.len() > self.max_source_bytes {
            return Err(EngineError::InvalidSubmission(format!(
                "source code exceeds {} bytes",
                self.max_source_bytes
            )));
        }

        let challenge = self
            .challenges
            .get_challenge(challenge_id)
            .await
            .map_err(|e| EngineError::Infrastructure(format!("challenge lookup failed: {:#}", e)))?
            .ok_or_else(|| EngineError::InvalidChallenge(format!("challenge '{}' not found", challenge_id)))?;

        if challenge.test_cases.is_empty() {
            return Err(EngineError::InvalidChallenge(format!(
                "challenge '{}' has no test cases",
                challenge_id
            )));
        }
        let mut seen = HashSet::new();
        if let Some(duplicate) = challenge.test_cases.iter().find(|tc| !seen.insert(tc.id)) {
            return Err(EngineError::InvalidChallenge(format!(
                "challenge '{}' has more than one test case with id {}",
                challenge_id, duplicate.id
            )));
        }
        if !challenge.accepts(language) {
            return Err(EngineError::InvalidSubmission(format!(
                "challenge '{}' does not accept {}",
                challenge_id, language
            )));
        }
        if self.scheduler.runner_for(language).is_none() {
            return Err(EngineError::InvalidSubmission(format!("{} is not enabled", language)));
        }

        let submission = Submission::new(challenge_id, language, source_code);
        info!(
            submission_id = %submission.id,
            challenge_id,
            language = %language,
            source_size = source_code.len(),
            test_cases = challenge.test_cases.len(),
            "Received submission"
        );

        Ok(self.scheduler.enqueue(submission, Arc::new(challenge)))
    }

    /// Submit and wait for the terminal state
    pub async fn submit_and_wait(&self, challenge_id: &str, language: &str, source_code: &str) -> Result<Arc<Verdict>, EngineError> {
        let handle = self.submit(challenge_id, language, source_code).await?;
        let id = handle.id;

        match handle.wait().await {
            SubmissionState::Completed(verdict) => Ok(verdict),
            SubmissionState::Cancelled(_) => Err(EngineError::Cancelled(id)),
            SubmissionState::Failed(reason) => Err(EngineError::Infrastructure(reason)),
            other => Err(EngineError::Infrastructure(format!(
                "submission {} stopped in state {}",
                id,
                other.status()
            ))),
        }
    }

    pub fn get_status(&self, id: Uuid) -> Result<StatusSnapshot, EngineError> {
        self.scheduler
            .state(id)
            .map(StatusSnapshot::from)
            .ok_or(EngineError::SubmissionNotFound(id))
    }

    /// Cancel a submission. A running one is given a short window to settle
    /// so the returned snapshot usually carries the partial verdict.
    pub async fn cancel(&self, id: Uuid) -> Result<StatusSnapshot, EngineError> {
        let state = self.scheduler.cancel(id).ok_or(EngineError::SubmissionNotFound(id))?;
        if state != SubmissionState::Running {
            return Ok(state.into());
        }

        let Some(handle) = self.scheduler.subscribe(id) else {
            return Err(EngineError::SubmissionNotFound(id));
        };
        match tokio::time::timeout(CANCEL_SETTLE_TIMEOUT, handle.wait()).await {
            Ok(state) => Ok(state.into()),
            Err(_) => {
                warn!(submission_id = %id, "Running submission did not settle after cancellation");
                self.get_status(id)
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }
}
