use bridge_protocol::{Namespace, Path};
use serde_json::Value;

/// `{ path, value, owner, version, stale, updatedAt }` (`spec.md` §3).
/// Exactly one owner per path; immutable after creation; `version` strictly
/// increases on every mutation, including staleness flips and deletions.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    pub path: Path,
    pub value: Value,
    pub owner: Namespace,
    pub version: u64,
    pub stale: bool,
    pub updated_at: u64,
}

/// `{ path, newEntry, previousVersion }`, delivered to listeners in the
/// order their triggering writes occurred (`spec.md` §3).
#[derive(Debug, Clone, PartialEq)]
pub struct StateDelta {
    pub path: Path,
    pub new_entry: StateEntry,
    pub previous_version: Option<u64>,
}

impl StateDelta {
    /// A deletion delta carries a `null` value and a final incremented
    /// version (`spec.md` §3).
    #[must_use]
    pub fn is_deletion(&self) -> bool {
        self.new_entry.value.is_null()
    }
}
