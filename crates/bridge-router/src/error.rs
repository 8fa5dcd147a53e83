use bridge_protocol::{error_codes, CodecError, Namespace};
use bridge_store::StoreError;
use thiserror::Error;

/// Failures surfaced while routing a message.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no target registered for namespace '{0}'")]
    UnknownTarget(Namespace),
    #[error("target '{0}' is already registered")]
    TargetAlreadyRegistered(Namespace),
    #[error("target handler failed: {0}")]
    AdapterError(String),
    #[error("state: {0}")]
    State(#[from] StoreError),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("router is shutting down")]
    ShuttingDown,
}

impl RouterError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            RouterError::UnknownTarget(_) => error_codes::UNKNOWN_TARGET,
            RouterError::AdapterError(_) => error_codes::ADAPTER_ERROR,
            RouterError::State(e) => e.code(),
            RouterError::Codec(e) => e.code(),
            RouterError::TargetAlreadyRegistered(_) | RouterError::ShuttingDown => {
                error_codes::INTERNAL_ERROR
            }
        }
    }
}
