use bridge_protocol::{CodecError, Namespace, Path};
use thiserror::Error;

/// Failures from mutating or querying the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A write to `path` was rejected because `attempted_by` is not the
    /// existing owner (`spec.md` §3, "Ownership and write rule").
    #[error("path '{path}' is owned by '{owner}', write from '{attempted_by}' rejected")]
    Conflict {
        path: Path,
        owner: Namespace,
        attempted_by: Namespace,
    },
    #[error("pattern: {0}")]
    Pattern(#[from] CodecError),
}

impl StoreError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Conflict { .. } => bridge_protocol::error_codes::STATE_CONFLICT,
            StoreError::Pattern(e) => e.code(),
        }
    }
}
