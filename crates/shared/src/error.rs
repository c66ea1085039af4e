use serde::{Deserialize, Serialize};

/// Recoverable failure classes surfaced to the user. Each resets its
/// component to a retryable state; none is fatal to the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    UploadFailed,
    MissingImage,
    SubmissionFailed,
}
