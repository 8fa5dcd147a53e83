use crate::entry::{StateDelta, StateEntry};
use crate::error::StoreError;
use bridge_protocol::{compile_pattern, Clock, Namespace, Path};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A listener invoked for every delta, in registration order
/// (`spec.md` §4.2, "Listeners").
pub type Listener = Arc<dyn Fn(&StateDelta) + Send + Sync>;

/// Handle returned by [`StateStore::add_listener`], used to remove it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

struct Inner {
    entries: HashMap<Path, StateEntry>,
    global_version: u64,
}

/// Owner-scoped, versioned, stale-flag-aware, pattern-queryable key-value
/// store (`spec.md` §4.2). Mutation runs under a single coarse lock; the
/// listener registry is a separate lock so a listener that re-enters the
/// store (a common case: a target handling a delta synchronously writes
/// more state) cannot deadlock against the write it is reacting to
/// (`spec.md` §5).
pub struct StateStore {
    state: RwLock<Inner>,
    listeners: RwLock<Vec<(u64, Listener)>>,
    next_listener_id: AtomicU64,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Inner {
                entries: HashMap::new(),
                global_version: 0,
            }),
            listeners: RwLock::new(Vec::new()),
            next_listener_id: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn get(&self, path: &Path) -> Option<StateEntry> {
        self.state.read().unwrap().entries.get(path).cloned()
    }

    #[must_use]
    pub fn has(&self, path: &Path) -> bool {
        self.state.read().unwrap().entries.contains_key(path)
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.state.read().unwrap().entries.len()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.state.read().unwrap().global_version
    }

    pub fn add_listener(&self, listener: impl Fn(&StateDelta) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().unwrap().push((id, Arc::new(listener)));
        ListenerId(id)
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.listeners.write().unwrap().retain(|(lid, _)| *lid != id.0);
    }

    fn notify(&self, deltas: &[StateDelta]) {
        if deltas.is_empty() {
            return;
        }
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for delta in deltas {
            for listener in &listeners {
                // A listener that panics must not deny others their delta
                // (`spec.md` §7).
                if catch_unwind(AssertUnwindSafe(|| listener(delta))).is_err() {
                    tracing::error!(path = %delta.path, "state listener panicked");
                }
            }
        }
    }

    /// Apply the write rule from `spec.md` §3: the writer becomes the owner
    /// of an unclaimed path, or must already be the owner. Clears `stale` on
    /// every successful write, even one whose value is unchanged — this is
    /// what lets a reconnecting adapter's resync naturally clear staleness
    /// (`spec.md` §4.5).
    pub fn set(
        &self,
        path: Path,
        value: Value,
        owner: Namespace,
        clock: &dyn Clock,
    ) -> Result<Option<StateDelta>, StoreError> {
        let delta = {
            let mut inner = self.state.write().unwrap();
            match inner.entries.get(&path) {
                Some(existing) if existing.owner != owner => {
                    return Err(StoreError::Conflict {
                        path,
                        owner: existing.owner.clone(),
                        attempted_by: owner,
                    });
                }
                Some(existing) if existing.value == value && !existing.stale => None,
                Some(existing) => {
                    let previous_version = existing.version;
                    let new_entry = StateEntry {
                        path: path.clone(),
                        value,
                        owner,
                        version: previous_version + 1,
                        stale: false,
                        updated_at: clock.now_millis(),
                    };
                    inner.global_version += 1;
                    inner.entries.insert(path.clone(), new_entry.clone());
                    Some(StateDelta {
                        path,
                        new_entry,
                        previous_version: Some(previous_version),
                    })
                }
                None => {
                    let new_entry = StateEntry {
                        path: path.clone(),
                        value,
                        owner,
                        version: 1,
                        stale: false,
                        updated_at: clock.now_millis(),
                    };
                    inner.global_version += 1;
                    inner.entries.insert(path.clone(), new_entry.clone());
                    Some(StateDelta {
                        path,
                        new_entry,
                        previous_version: None,
                    })
                }
            }
        };

        if let Some(delta) = &delta {
            self.notify(std::slice::from_ref(delta));
        }
        Ok(delta)
    }

    /// Sequential individual `set` calls, same semantics
    /// (`spec.md` §4.2).
    pub fn set_bulk(
        &self,
        updates: Vec<(Path, Value)>,
        owner: Namespace,
        clock: &dyn Clock,
    ) -> Result<Vec<StateDelta>, StoreError> {
        let mut deltas = Vec::new();
        for (path, value) in updates {
            if let Some(delta) = self.set(path, value, owner.clone(), clock)? {
                deltas.push(delta);
            }
        }
        Ok(deltas)
    }

    /// Emits a final delta with `value = null` and `version = prev + 1`,
    /// then removes the entry (`spec.md` §3). A no-op on a path that does
    /// not exist.
    pub fn delete(
        &self,
        path: &Path,
        owner: &Namespace,
        clock: &dyn Clock,
    ) -> Result<Option<StateDelta>, StoreError> {
        let delta = {
            let mut inner = self.state.write().unwrap();
            match inner.entries.get(path) {
                None => None,
                Some(existing) if &existing.owner != owner => {
                    return Err(StoreError::Conflict {
                        path: path.clone(),
                        owner: existing.owner.clone(),
                        attempted_by: owner.clone(),
                    });
                }
                Some(existing) => {
                    let previous_version = existing.version;
                    let tombstone = StateEntry {
                        path: path.clone(),
                        value: Value::Null,
                        owner: owner.clone(),
                        version: previous_version + 1,
                        stale: existing.stale,
                        updated_at: clock.now_millis(),
                    };
                    inner.entries.remove(path);
                    inner.global_version += 1;
                    Some(StateDelta {
                        path: path.clone(),
                        new_entry: tombstone,
                        previous_version: Some(previous_version),
                    })
                }
            }
        };
        if let Some(delta) = &delta {
            self.notify(std::slice::from_ref(delta));
        }
        Ok(delta)
    }

    fn flip_owner_stale(&self, owner: &Namespace, stale: bool, clock: &dyn Clock) -> Vec<StateDelta> {
        let deltas = {
            let mut inner = self.state.write().unwrap();
            let mut deltas = Vec::new();
            let keys: Vec<Path> = inner
                .entries
                .iter()
                .filter(|(_, e)| &e.owner == owner && e.stale != stale)
                .map(|(p, _)| p.clone())
                .collect();
            for path in keys {
                let existing = inner.entries.get(&path).unwrap().clone();
                let previous_version = existing.version;
                let new_entry = StateEntry {
                    stale,
                    version: previous_version + 1,
                    updated_at: clock.now_millis(),
                    ..existing
                };
                inner.entries.insert(path.clone(), new_entry.clone());
                inner.global_version += 1;
                deltas.push(StateDelta {
                    path,
                    new_entry,
                    previous_version: Some(previous_version),
                });
            }
            deltas
        };
        self.notify(&deltas);
        deltas
    }

    /// Idempotent: flips `stale` only where it differs (`spec.md` §4.2).
    pub fn mark_owner_stale(&self, owner: &Namespace, clock: &dyn Clock) -> Vec<StateDelta> {
        self.flip_owner_stale(owner, true, clock)
    }

    /// Idempotent: flips `stale` only where it differs (`spec.md` §4.2).
    pub fn clear_owner_stale(&self, owner: &Namespace, clock: &dyn Clock) -> Vec<StateDelta> {
        self.flip_owner_stale(owner, false, clock)
    }

    /// Emits one deletion delta per entry, then removes them.
    pub fn delete_by_owner(&self, owner: &Namespace, clock: &dyn Clock) -> Vec<StateDelta> {
        let deltas = {
            let mut inner = self.state.write().unwrap();
            let paths: Vec<Path> = inner
                .entries
                .iter()
                .filter(|(_, e)| &e.owner == owner)
                .map(|(p, _)| p.clone())
                .collect();
            let mut deltas = Vec::new();
            for path in paths {
                let existing = inner.entries.remove(&path).unwrap();
                let previous_version = existing.version;
                inner.global_version += 1;
                deltas.push(StateDelta {
                    path: path.clone(),
                    new_entry: StateEntry {
                        path,
                        value: Value::Null,
                        version: previous_version + 1,
                        updated_at: clock.now_millis(),
                        ..existing
                    },
                    previous_version: Some(previous_version),
                });
            }
            deltas
        };
        self.notify(&deltas);
        deltas
    }

    /// Emits deletion deltas for all entries, then empties the store.
    pub fn clear(&self, clock: &dyn Clock) -> Vec<StateDelta> {
        let deltas = {
            let mut inner = self.state.write().unwrap();
            let entries: Vec<StateEntry> = inner.entries.drain().map(|(_, e)| e).collect();
            let mut deltas = Vec::new();
            for existing in entries {
                inner.global_version += 1;
                let previous_version = existing.version;
                deltas.push(StateDelta {
                    path: existing.path.clone(),
                    new_entry: StateEntry {
                        value: Value::Null,
                        version: previous_version + 1,
                        updated_at: clock.now_millis(),
                        ..existing
                    },
                    previous_version: Some(previous_version),
                });
            }
            deltas
        };
        self.notify(&deltas);
        deltas
    }

    pub fn matching_paths(&self, pattern: &str) -> Result<Vec<Path>, StoreError> {
        let re = compile_pattern(pattern)?;
        Ok(self
            .state
            .read()
            .unwrap()
            .entries
            .keys()
            .filter(|p| re.is_match(p.as_str()))
            .cloned()
            .collect())
    }

    pub fn matching_entries(&self, pattern: &str) -> Result<Vec<StateEntry>, StoreError> {
        let re = compile_pattern(pattern)?;
        Ok(self
            .state
            .read()
            .unwrap()
            .entries
            .values()
            .filter(|e| re.is_match(e.path.as_str()))
            .cloned()
            .collect())
    }

    /// Alias kept for parity with `spec.md`'s operation name
    /// `getSnapshotForPattern`.
    pub fn snapshot_for_pattern(&self, pattern: &str) -> Result<Vec<StateEntry>, StoreError> {
        self.matching_entries(pattern)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<StateEntry> {
        self.state.read().unwrap().entries.values().cloned().collect()
    }
}
