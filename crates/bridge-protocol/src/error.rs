use thiserror::Error;

/// The exhaustive set of stable error code literals carried on `error` and
/// `ack` envelopes. Message text is human-oriented and may change; the code
/// is the stable contract.
pub mod error_codes {
    pub const INVALID_MESSAGE: &str = "INVALID_MESSAGE";
    pub const UNKNOWN_TARGET: &str = "UNKNOWN_TARGET";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const RATE_LIMITED: &str = "RATE_LIMITED";
    pub const UNAUTHORIZED: &str = "UNAUTHORIZED";
    pub const FORBIDDEN: &str = "FORBIDDEN";
    pub const ADAPTER_ERROR: &str = "ADAPTER_ERROR";
    pub const STATE_CONFLICT: &str = "STATE_CONFLICT";
    pub const SUBSCRIPTION_FAILED: &str = "SUBSCRIPTION_FAILED";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// Failures from building, validating, or (de)serializing an envelope or a
/// subscription pattern.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("invalid field '{field}': {reason}")]
    Invalid { field: String, reason: String },
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl CodecError {
    /// The stable error code this failure maps to on the wire.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            CodecError::Invalid { .. } | CodecError::Json(_) => error_codes::INVALID_MESSAGE,
        }
    }
}
