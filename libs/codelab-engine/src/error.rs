use codelab_common::{ErrorKind, ErrorResponse};
use uuid::Uuid;

/// Rejections surfaced directly to the caller; execution failures live in the verdict
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid submission: {0}")]
    InvalidSubmission(String),
    #[error("invalid challenge: {0}")]
    InvalidChallenge(String),
    #[error("submission {0} not found")]
    SubmissionNotFound(Uuid),
    #[error("submission {0} was cancelled")]
    Cancelled(Uuid),
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::InvalidSubmission(_) | EngineError::SubmissionNotFound(_) => ErrorKind::InvalidSubmission,
            EngineError::InvalidChallenge(_) => ErrorKind::InvalidChallenge,
            EngineError::Cancelled(_) => ErrorKind::Cancelled,
            EngineError::Infrastructure(_) => ErrorKind::InfrastructureError,
        }
    }

    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::SubmissionNotFound(_) => 404,
            EngineError::Cancelled(_) => 409,
            other => other.kind().http_status(),
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse::new(self.kind(), self.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::Infrastructure(format!("{:#}", e))
    }
}
