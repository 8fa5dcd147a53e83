use bridge_protocol::{error_codes, CodecError};
use bridge_router::RouterError;
use bridge_store::StoreError;
use thiserror::Error;

/// Failures from decoding the wire line protocol or dispatching a bridge
/// command to it (`spec.md` §4.5).
#[derive(Debug, Error)]
pub enum SatelliteError {
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("missing required param '{0}'")]
    MissingParam(&'static str),
    #[error("unknown action '{0}'")]
    UnknownAction(String),
    #[error("capability '{0}' not advertised by the connected device")]
    MissingCapability(&'static str),
    #[error("not connected to upstream")]
    NotConnected,
    #[error("state: {0}")]
    State(#[from] StoreError),
    #[error("router: {0}")]
    Router(#[from] RouterError),
}

impl SatelliteError {
    /// The stable error code this failure maps to on an `ack`/`error`
    /// envelope (`spec.md` §4.5's handler table, §7).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            SatelliteError::Codec(e) => e.code(),
            SatelliteError::MissingParam(_) => error_codes::INVALID_MESSAGE,
            SatelliteError::UnknownAction(_)
            | SatelliteError::MissingCapability(_)
            | SatelliteError::NotConnected => error_codes::ADAPTER_ERROR,
            SatelliteError::State(e) => e.code(),
            SatelliteError::Router(e) => e.code(),
        }
    }
}
