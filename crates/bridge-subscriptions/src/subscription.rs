use bridge_protocol::{Clock, Namespace, MessageKind, SubscriptionFilter};
use regex::Regex;
use uuid::Uuid;

/// Identifies one `subscribe()` call. Time-ordered the same way
/// [`bridge_protocol::MessageId`] is, so subscription ids sort by creation
/// order when listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    #[must_use]
    pub fn generate(clock: &dyn Clock) -> Self {
        let millis = clock.now_millis();
        #[allow(clippy::cast_possible_truncation)]
        let nanos = (millis % 1000) as u32 * 1_000_000;
        let ts = uuid::Timestamp::from_unix(uuid::NoContext, millis / 1000, nanos);
        Self(Uuid::new_v7(ts))
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A pattern compiled once at subscription time, paired with the source
/// string it was compiled from (needed by exact-string unsubscribe)
/// (`spec.md` §4.3).
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub source: String,
    pub regex: Regex,
}

/// `{ id, clientId, patterns[], compiledPatterns, filter, snapshot,
/// snapshotSent, createdAt }` (`spec.md` §3).
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub client_id: Namespace,
    pub patterns: Vec<CompiledPattern>,
    pub filter: SubscriptionFilter,
    pub snapshot: bool,
    pub snapshot_sent: bool,
    pub created_at: u64,
}

impl Subscription {
    /// The first compiled pattern (in insertion order) that matches `path`,
    /// gated by whether `filter` admits `kind` (`spec.md` §4.3, "Matching").
    #[must_use]
    pub fn matching_pattern(&self, path: &str, kind: MessageKind) -> Option<&str> {
        if !self.filter.admits(kind) {
            return None;
        }
        self.patterns
            .iter()
            .find(|p| p.regex.is_match(path))
            .map(|p| p.source.as_str())
    }
}
