pub mod error;
pub mod types;

pub use error::{ErrorKind, ErrorResponse};
pub use types::{
    AcceptedResponse, Challenge, ComparisonMode, ExecutionResult, Language, StatusResponse,
    Submission, SubmissionStatus, SubmitRequest, TestCase, Verdict, VerdictResponse,
};
