use crate::subscription::{CompiledPattern, Subscription, SubscriptionId};
use bridge_protocol::{compile_pattern, CodecError, Clock, MessageKind, Namespace, SubscriptionFilter};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

struct SubsInner {
    by_id: HashMap<SubscriptionId, Subscription>,
    by_client: HashMap<Namespace, HashSet<SubscriptionId>>,
}

/// Tracks who wants to hear about which paths (`spec.md` §4.3). Indexed both
/// by subscription id and by client, so a disconnecting client's
/// subscriptions can be dropped in one pass without scanning every
/// subscription.
pub struct SubscriptionManager {
    inner: RwLock<SubsInner>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SubsInner {
                by_id: HashMap::new(),
                by_client: HashMap::new(),
            }),
        }
    }

    /// Compiles every pattern once, here, so the hot matching path never
    /// recompiles a regex per message (`spec.md` §9, design note).
    pub fn subscribe(
        &self,
        client_id: Namespace,
        patterns: Vec<String>,
        filter: SubscriptionFilter,
        snapshot: bool,
        clock: &dyn Clock,
    ) -> Result<SubscriptionId, CodecError> {
        let compiled = patterns
            .into_iter()
            .map(|source| {
                compile_pattern(&source).map(|regex| CompiledPattern { source, regex })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let id = SubscriptionId::generate(clock);
        let subscription = Subscription {
            id,
            client_id: client_id.clone(),
            patterns: compiled,
            filter,
            snapshot,
            snapshot_sent: false,
            created_at: clock.now_millis(),
        };

        let mut inner = self.inner.write().unwrap();
        inner.by_id.insert(id, subscription);
        inner.by_client.entry(client_id).or_default().insert(id);
        Ok(id)
    }

    /// Removes by id. Returns `true` if a subscription was actually removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.inner.write().unwrap();
        let Some(subscription) = inner.by_id.remove(&id) else {
            return false;
        };
        if let Some(set) = inner.by_client.get_mut(&subscription.client_id) {
            set.remove(&id);
            if set.is_empty() {
                inner.by_client.remove(&subscription.client_id);
            }
        }
        true
    }

    /// Removes, from every subscription owned by `client_id`, any pattern
    /// whose exact source string appears in `patterns`; a subscription left
    /// with zero patterns is removed entirely. Returns the number of
    /// patterns removed across all of the client's subscriptions
    /// (`spec.md` §4.4, "unsubscribe" ack carries `removedCount`).
    pub fn unsubscribe_patterns(&self, client_id: &Namespace, patterns: &[String]) -> usize {
        let mut inner = self.inner.write().unwrap();
        let Some(ids) = inner.by_client.get(client_id).cloned() else {
            return 0;
        };

        let mut removed_count = 0;
        let mut emptied = Vec::new();
        for id in ids {
            let Some(subscription) = inner.by_id.get_mut(&id) else {
                continue;
            };
            let before = subscription.patterns.len();
            subscription
                .patterns
                .retain(|p| !patterns.iter().any(|removed| removed == &p.source));
            removed_count += before - subscription.patterns.len();
            if subscription.patterns.is_empty() {
                emptied.push(id);
            }
        }

        for id in emptied {
            inner.by_id.remove(&id);
            if let Some(set) = inner.by_client.get_mut(client_id) {
                set.remove(&id);
            }
        }
        if inner.by_client.get(client_id).is_some_and(HashSet::is_empty) {
            inner.by_client.remove(client_id);
        }
        removed_count
    }

    /// Removes every subscription owned by `client_id`.
    pub fn unsubscribe_client(&self, client_id: &Namespace) {
        let mut inner = self.inner.write().unwrap();
        if let Some(ids) = inner.by_client.remove(client_id) {
            for id in ids {
                inner.by_id.remove(&id);
            }
        }
    }

    /// For each subscription matching `path`/`kind`, the client id and the
    /// pattern that matched, in no particular cross-subscription order
    /// (`spec.md` §4.3, "Matching").
    #[must_use]
    pub fn matching_subscriptions(
        &self,
        path: &str,
        kind: MessageKind,
    ) -> Vec<(SubscriptionId, Namespace, String)> {
        self.inner
            .read()
            .unwrap()
            .by_id
            .values()
            .filter_map(|s| {
                s.matching_pattern(path, kind)
                    .map(|pattern| (s.id, s.client_id.clone(), pattern.to_owned()))
            })
            .collect()
    }

    /// `true` if `id` has `snapshot` requested and it hasn't been sent yet.
    #[must_use]
    pub fn needs_snapshot(&self, id: SubscriptionId) -> bool {
        self.inner
            .read()
            .unwrap()
            .by_id
            .get(&id)
            .is_some_and(|s| s.snapshot && !s.snapshot_sent)
    }

    /// The pattern strings belonging to `id`, in insertion order (used to
    /// stream each pattern's snapshot at `subscribe` time).
    #[must_use]
    pub fn patterns_of(&self, id: SubscriptionId) -> Vec<String> {
        self.inner
            .read()
            .unwrap()
            .by_id
            .get(&id)
            .map(|s| s.patterns.iter().map(|p| p.source.clone()).collect())
            .unwrap_or_default()
    }

    pub fn mark_snapshot_sent(&self, id: SubscriptionId) {
        if let Some(subscription) = self.inner.write().unwrap().by_id.get_mut(&id) {
            subscription.snapshot_sent = true;
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().by_id.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
