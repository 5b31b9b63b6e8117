//! The error taxonomy shared by every component of the core.
use crate::operation::OperationKind;
use thiserror::Error;

/// A `Result` defaulting to the crate's [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Device enumeration, or a read/write against a device or file, failed.
    #[error("I/O failure: {0}")]
    IoFailure(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// The sampled post-write check disagreed with the source image. Advisory.
    #[error("sampled validation of {device} did not match the source image")]
    ValidationFailure { device: String },

    /// A cooperative cancel went through and the operation stopped.
    #[error("operation cancelled by user")]
    UserCancelled,

    /// The safety gate refused the action. Nothing was sent to the executor.
    #[error("blocked before reaching the device: {0}")]
    PrecheckBlocked(String),

    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("a {0} operation is already in progress")]
    OperationInProgress(OperationKind),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidSetting { key: String, reason: String },
}

impl Error {
    /// Whether this error should be shown as a warning rather than a failure.
    pub fn is_advisory(&self) -> bool {
        matches!(self, Error::ValidationFailure { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoFailure(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::IoFailure(format!("malformed JSON: {err}"))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::NetworkFailure(err.to_string())
    }
}
