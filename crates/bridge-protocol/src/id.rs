use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// A single wall-clock source for timestamps and id generation, injectable
/// so tests can fix "now" (`spec.md` §9, "time source").
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        #[allow(clippy::cast_possible_truncation)]
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        millis
    }
}

/// A fixed clock for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub u64);

impl Clock for FixedClock {
    fn now_millis(&self) -> u64 {
        self.0
    }
}

/// A time-ordered 128-bit message identifier (UUIDv7): the high 48 bits
/// encode unix milliseconds, the version/variant nibbles are fixed by the
/// UUIDv7 layout, and the remainder is cryptographically random
/// (`spec.md` §4.1). Two ids minted in the same millisecond sort by that
/// random suffix only — callers needing a strict total order must use
/// [`crate::SequenceCounter`] instead (`spec.md` §9, open question).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    #[must_use]
    pub fn generate(clock: &dyn Clock) -> Self {
        let millis = clock.now_millis();
        #[allow(clippy::cast_possible_truncation)]
        let nanos = (millis % 1000) as u32 * 1_000_000;
        let ts = uuid::Timestamp::from_unix(uuid::NoContext, millis / 1000, nanos);
        Self(Uuid::new_v7(ts))
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Per-source monotonic sequence counter (`spec.md` §4.1, §9: "replaces any
/// shared global counter ... each emitting entity owns its counter").
/// Starts at zero, never decreases, cheaply `Clone`-able across tasks.
#[derive(Debug, Clone, Default)]
pub struct SequenceCounter(Arc<AtomicU64>);

impl SequenceCounter {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicU64::new(0)))
    }

    /// Return the next sequence number and advance the counter.
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    #[must_use]
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_counter_starts_at_zero_and_never_decreases() {
        let counter = SequenceCounter::new();
        assert_eq!(counter.next(), 0);
        assert_eq!(counter.next(), 1);
        assert_eq!(counter.next(), 2);
        assert_eq!(counter.current(), 3);
    }

    #[test]
    fn sequence_counter_is_per_instance_not_global() {
        let a = SequenceCounter::new();
        let b = SequenceCounter::new();
        a.next();
        a.next();
        assert_eq!(a.current(), 2);
        assert_eq!(b.current(), 0);
    }

    #[test]
    fn message_id_is_time_ordered_across_distinct_milliseconds() {
        let earlier = MessageId::generate(&FixedClock(1_700_000_000_000));
        let later = MessageId::generate(&FixedClock(1_700_000_000_050));
        assert!(earlier.as_uuid().as_bytes() < later.as_uuid().as_bytes());
    }

    #[test]
    fn message_id_round_trips_through_json() {
        let id = MessageId::generate(&FixedClock(1_700_000_000_000));
        let json = serde_json::to_string(&id).unwrap();
        let back: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }
}
