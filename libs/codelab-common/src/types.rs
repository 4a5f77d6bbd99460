use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ErrorKind;

/// Languages a submission can be written in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    #[serde(alias = "js")]
    JavaScript,
    Sql,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Python, Language::JavaScript, Language::Sql];

    /// Parse a language name, accepting the common aliases
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "python" | "py" | "python3" => Some(Language::Python),
            "javascript" | "js" | "node" => Some(Language::JavaScript),
            "sql" | "sqlite" => Some(Language::Sql),
            _ => None,
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Sql => "sql",
        };
        write!(f, "{}", s)
    }
}

/// How a test case's actual output is matched against the expected output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComparisonMode {
    #[default]
    Exact,
    WhitespaceInsensitive,
    NumericTolerance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: u32,
    pub input: String,
    pub expected_output: String,
    #[serde(default)]
    pub comparison_mode: ComparisonMode,
    #[serde(default)]
    pub hidden: bool,
}

/// Read-only challenge definition, supplied by the challenge repository
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: String,
    pub title: String,
    pub test_cases: Vec<TestCase>,
    #[serde(default = "default_time_limit_ms")]
    pub time_limit_ms: u64,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    /// Languages accepted for this challenge; empty accepts every supported language
    #[serde(default)]
    pub languages: Vec<Language>,
    #[serde(default = "default_points")]
    pub points: u32,
    /// Epsilon used by numeric-tolerance comparisons
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

pub fn default_time_limit_ms() -> u64 {
    5000
}

pub fn default_memory_limit_mb() -> u64 {
    256
}

fn default_points() -> u32 {
    100
}

pub fn default_tolerance() -> f64 {
    1e-6
}

impl Challenge {
    pub fn accepts(&self, language: Language) -> bool {
        self.languages.is_empty() || self.languages.contains(&language)
    }
}

/// One attempt to solve one challenge in one language. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: Uuid,
    pub challenge_id: String,
    pub language: Language,
    pub source_code: String,
    pub submitted_at: DateTime<Utc>,
}

impl Submission {
    pub fn new(challenge_id: impl Into<String>, language: Language, source_code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            challenge_id: challenge_id.into(),
            language,
            source_code: source_code.into(),
            submitted_at: Utc::now(),
        }
    }
}

/// Outcome of a single test case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub test_case_id: u32,
    pub passed: bool,
    pub actual_output: String,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    /// Captured diagnostics for crashes and syntax errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default)]
    pub hidden: bool,
}

/// Final outcome of a submission across all of its test cases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub submission_id: Uuid,
    pub overall_passed: bool,
    pub aggregate_score: u32,
    pub total_time_ms: u64,
    pub results: Vec<ExecutionResult>,
    /// Set when at least one test case could not be run for infrastructure reasons
    #[serde(default)]
    pub degraded: bool,
}

impl Verdict {
    /// Copy of the verdict with hidden test case output removed
    pub fn redacted(&self) -> Verdict {
        let mut verdict = self.clone();
        for result in verdict.results.iter_mut().filter(|r| r.hidden) {
            result.actual_output.clear();
            result.stderr = None;
        }
        verdict
    }

    /// True when no test case could be run at all
    pub fn is_unrunnable(&self) -> bool {
        !self.results.is_empty()
            && self
                .results
                .iter()
                .all(|r| r.error == Some(ErrorKind::InfrastructureError))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubmissionStatus::Completed | SubmissionStatus::Cancelled | SubmissionStatus::Failed
        )
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SubmissionStatus::Queued => "queued",
            SubmissionStatus::Running => "running",
            SubmissionStatus::Completed => "completed",
            SubmissionStatus::Cancelled => "cancelled",
            SubmissionStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub challenge_id: String,
    pub language: String,
    pub source_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictResponse {
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub submission_id: Uuid,
    pub status: SubmissionStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: SubmissionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    /// Why a `failed` submission produced no verdict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
