use serde::{Deserialize, Serialize};
use std::fmt;

/// Error taxonomy shared by the engine, the API and the CLI
///
/// Execution-level kinds (`SyntaxError` through `Cancelled`) are embedded in
/// a verdict's per-test results. Admission-level kinds (`InvalidSubmission`,
/// `InvalidChallenge`) are returned to the caller directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SyntaxError,
    Timeout,
    ResourceExceeded,
    OutputTooLarge,
    RuntimeCrash,
    SetupFailed,
    InfrastructureError,
    Cancelled,
    InvalidSubmission,
    InvalidChallenge,
}

impl ErrorKind {
    /// HTTP-equivalent status for a response carrying this kind
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::InvalidSubmission => 400,
            ErrorKind::InvalidChallenge => 404,
            ErrorKind::InfrastructureError | ErrorKind::SetupFailed => 503,
            // Embedded in the verdict, not a transport error
            _ => 200,
        }
    }

    /// Whether the automatic retry path applies
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::SetupFailed)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_kind: ErrorKind,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_kind,
            message: message.into(),
        }
    }
}
