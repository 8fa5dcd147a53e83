use crate::error::RouterError;
use crate::idempotency::IdempotencyRecord;
use crate::target::RouteTarget;
use bridge_protocol::{
    error_codes, AckStatus, Clock, Envelope, MessageId, MessageKind, Namespace, Path, Payload,
    SequenceCounter,
};
use bridge_store::{StateDelta, StateEntry, StateStore, StoreError};
use bridge_subscriptions::SubscriptionManager;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{oneshot, watch};
use tracing::warn;

struct PendingCommand {
    source: Namespace,
    target: Namespace,
    path: Path,
    idempotency_key: Option<String>,
    cancel: oneshot::Sender<()>,
}

/// Owns state, subscriptions, targets, the idempotency cache and pending
/// commands, and dispatches every envelope kind (`spec.md` §4.4). Construct
/// with [`Router::new`], which returns an `Arc` because the router spawns
/// tasks (the idempotency sweep, per-command timeouts, state-delta fan-out)
/// that hold a clone of themselves.
pub struct Router {
    store: Arc<StateStore>,
    subs: Arc<SubscriptionManager>,
    targets: RwLock<HashMap<Namespace, RouteTarget>>,
    idempotency: RwLock<HashMap<String, IdempotencyRecord>>,
    pending: RwLock<HashMap<MessageId, PendingCommand>>,
    clock: Arc<dyn Clock>,
    sequence: SequenceCounter,
    idempotency_enabled: bool,
    idempotency_ttl_ms: u64,
    hub_core: Namespace,
    snapshot_complete_path: Path,
    shutdown_tx: watch::Sender<bool>,
}

impl Router {
    #[must_use]
    pub fn new(
        store: Arc<StateStore>,
        subs: Arc<SubscriptionManager>,
        clock: Arc<dyn Clock>,
        idempotency_enabled: bool,
        idempotency_ttl_ms: u64,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let router = Arc::new(Self {
            store: store.clone(),
            subs,
            targets: RwLock::new(HashMap::new()),
            idempotency: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            clock,
            sequence: SequenceCounter::new(),
            idempotency_enabled,
            idempotency_ttl_ms,
            hub_core: Namespace::new("hub.core").expect("hub.core is a valid namespace"),
            snapshot_complete_path: Path::new("hub.subscriptions").expect("valid path literal"),
            shutdown_tx,
        });

        let listener_router = router.clone();
        store.add_listener(move |delta: &StateDelta| {
            let router = listener_router.clone();
            let delta = delta.clone();
            tokio::spawn(async move {
                router.fan_out_state_delta(delta).await;
            });
        });

        router
    }

    /// Starts the background idempotency-cache sweep (`spec.md` §4.4:
    /// "a background sweep every ~10s removes records older than 2x TTL").
    pub fn spawn_cleanup_task(self: &Arc<Self>) {
        let router = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(10));
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() { break; }
                    }
                    _ = interval.tick() => {
                        router.sweep_idempotency_cache();
                    }
                }
            }
        });
    }

    fn sweep_idempotency_cache(&self) {
        let cutoff = self.clock.now_millis().saturating_sub(2 * self.idempotency_ttl_ms);
        self.idempotency
            .write()
            .unwrap()
            .retain(|_, record| record.recorded_at() > cutoff);
    }

    pub fn register_target(&self, target: RouteTarget) -> Result<(), RouterError> {
        let mut targets = self.targets.write().unwrap();
        if targets.contains_key(&target.namespace) {
            return Err(RouterError::TargetAlreadyRegistered(target.namespace));
        }
        targets.insert(target.namespace.clone(), target);
        Ok(())
    }

    /// Removes the target, rejects any command still pending for it with
    /// `"target unregistered"`, and drops its subscriptions (`spec.md`
    /// §4.4, "Target lifecycle").
    pub async fn unregister_target(self: &Arc<Self>, namespace: &Namespace) {
        self.targets.write().unwrap().remove(namespace);

        let rejected: Vec<(MessageId, PendingCommand)> = {
            let mut pending = self.pending.write().unwrap();
            let ids: Vec<MessageId> = pending
                .iter()
                .filter(|(_, p)| &p.target == namespace)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id).map(|p| (id, p))).collect()
        };

        for (id, pending) in rejected {
            let _ = pending.cancel.send(());
            let ack = self.build_ack_raw(
                id,
                &pending.source,
                &pending.path,
                AckStatus::Failed,
                None,
                Some(json!({ "reason": "target unregistered" })),
            );
            self.deliver_exact(&pending.source, ack).await;
        }

        self.subs.unsubscribe_client(namespace);
    }

    /// Cancels the cleanup sweep, rejects every pending command with
    /// `"router shutdown"`, clears the idempotency cache. Leaves
    /// subscriptions in place (`spec.md` §4.4, "Shutdown").
    pub async fn shutdown(self: &Arc<Self>) {
        let _ = self.shutdown_tx.send(true);

        let pending: Vec<(MessageId, PendingCommand)> = self.pending.write().unwrap().drain().collect();
        for (id, pending) in pending {
            let _ = pending.cancel.send(());
            let ack = self.build_ack_raw(
                id,
                &pending.source,
                &pending.path,
                AckStatus::Failed,
                None,
                Some(json!({ "reason": "router shutdown" })),
            );
            self.deliver_exact(&pending.source, ack).await;
        }

        self.idempotency.write().unwrap().clear();
    }

    /// Exact match, then successive dot-trimmed prefix match
    /// (`spec.md` §4.4, "Dispatch").
    fn find_target(&self, namespace: &Namespace) -> Option<RouteTarget> {
        let targets = self.targets.read().unwrap();
        let mut current = namespace.clone();
        loop {
            if let Some(target) = targets.get(&current) {
                return Some(target.clone());
            }
            current = current.parent()?;
        }
    }

    async fn deliver_exact(&self, namespace: &Namespace, envelope: Envelope) {
        let target = self.targets.read().unwrap().get(namespace).cloned();
        let Some(target) = target else {
            warn!(%namespace, "no target registered to deliver to");
            return;
        };
        if let Err(e) = (target.handler)(envelope).await {
            warn!(%namespace, error = %e, "delivery to target failed");
        }
    }

    /// Entry point: dispatch `envelope` according to its payload kind
    /// (`spec.md` §4.4, "Dispatch").
    pub async fn route(self: &Arc<Self>, envelope: Envelope) -> Result<(), RouterError> {
        match &envelope.payload {
            Payload::Command { .. } => self.handle_command(envelope).await,
            Payload::Event { .. } => {
                self.handle_event(envelope).await;
                Ok(())
            }
            Payload::State { .. } => self.handle_state(envelope).await,
            Payload::Ack { .. } => {
                self.handle_ack(envelope).await;
                Ok(())
            }
            Payload::Error { .. } => {
                self.handle_error(envelope).await;
                Ok(())
            }
            Payload::Subscribe { .. } => self.handle_subscribe(envelope).await,
            Payload::Unsubscribe { .. } => {
                self.handle_unsubscribe(envelope).await;
                Ok(())
            }
        }
    }

    async fn handle_command(self: &Arc<Self>, envelope: Envelope) -> Result<(), RouterError> {
        let Some(target_ns) = envelope.target.clone() else {
            return Err(RouterError::UnknownTarget(envelope.source.clone()));
        };

        if self.idempotency_enabled {
            if let Some(key) = envelope.idempotency_key.clone() {
                let cached = self.idempotency.read().unwrap().get(&key).cloned();
                match cached {
                    Some(IdempotencyRecord::Terminal { mut ack, .. }) => {
                        ack.target = Some(envelope.source.clone());
                        self.deliver_exact(&envelope.source, ack).await;
                        return Ok(());
                    }
                    Some(IdempotencyRecord::InFlight { .. }) => return Ok(()),
                    None => {}
                }
            }
        }

        let Some(target) = self.find_target(&target_ns) else {
            self.emit_error(
                &envelope.source,
                &envelope.path,
                error_codes::UNKNOWN_TARGET,
                "no target registered for namespace",
                Some(envelope.id),
            )
            .await;
            return Ok(());
        };

        let received = self.build_ack_raw(envelope.id, &envelope.source, &envelope.path, AckStatus::Received, None, None);
        self.deliver_exact(&envelope.source, received).await;

        self.register_pending(&envelope);

        match (target.handler)(envelope.clone()).await {
            Ok(()) => {
                if self.idempotency_enabled {
                    if let Some(key) = envelope.idempotency_key {
                        self.idempotency.write().unwrap().insert(
                            key,
                            IdempotencyRecord::InFlight { recorded_at: self.clock.now_millis() },
                        );
                    }
                }
                Ok(())
            }
            Err(e) => {
                self.pending.write().unwrap().remove(&envelope.id);
                self.emit_error(
                    &envelope.source,
                    &envelope.path,
                    error_codes::ADAPTER_ERROR,
                    &e.to_string(),
                    Some(envelope.id),
                )
                .await;
                Ok(())
            }
        }
    }

    fn register_pending(self: &Arc<Self>, envelope: &Envelope) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.pending.write().unwrap().insert(
            envelope.id,
            PendingCommand {
                source: envelope.source.clone(),
                target: envelope.target.clone().expect("command envelopes always carry a target"),
                path: envelope.path.clone(),
                idempotency_key: envelope.idempotency_key.clone(),
                cancel: cancel_tx,
            },
        );

        let Some(ttl) = envelope.ttl else { return };
        let router = self.clone();
        let command_id = envelope.id;
        let source = envelope.source.clone();
        let path = envelope.path.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(std::time::Duration::from_millis(u64::from(ttl))) => {
                    if router.pending.write().unwrap().remove(&command_id).is_some() {
                        let ack = router.build_ack_raw(command_id, &source, &path, AckStatus::Timeout, None, None);
                        router.deliver_exact(&source, ack).await;
                    }
                }
                _ = cancel_rx => {}
            }
        });
    }

    async fn handle_event(&self, envelope: Envelope) {
        let matches = self.subs.matching_subscriptions(envelope.path.as_str(), MessageKind::Event);
        for (_, client_id, _) in matches {
            if client_id == envelope.source {
                continue;
            }
            self.deliver_exact(&client_id, envelope.clone()).await;
        }
    }

    async fn handle_state(&self, envelope: Envelope) -> Result<(), RouterError> {
        let Payload::State { value, .. } = &envelope.payload else {
            unreachable!("handle_state only called for State payloads")
        };
        match self.store.set(envelope.path.clone(), value.clone(), envelope.source.clone(), self.clock.as_ref()) {
            Ok(_) => Ok(()),
            Err(StoreError::Conflict { .. }) => {
                self.emit_error(
                    &envelope.source,
                    &envelope.path,
                    error_codes::STATE_CONFLICT,
                    "path is owned by a different namespace",
                    Some(envelope.id),
                )
                .await;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_ack(&self, envelope: Envelope) {
        let Payload::Ack { command_id, .. } = &envelope.payload else {
            unreachable!("handle_ack only called for Ack payloads")
        };
        let command_id = *command_id;

        if let Some(pending) = self.pending.write().unwrap().remove(&command_id) {
            let _ = pending.cancel.send(());
            if self.idempotency_enabled {
                if let Some(key) = pending.idempotency_key {
                    self.idempotency.write().unwrap().insert(
                        key,
                        IdempotencyRecord::Terminal { ack: envelope.clone(), recorded_at: self.clock.now_millis() },
                    );
                }
            }
        }

        if let Some(target) = envelope.target.clone() {
            self.deliver_exact(&target, envelope).await;
        }
    }

    async fn handle_error(&self, envelope: Envelope) {
        if let Some(target) = envelope.target.clone() {
            self.deliver_exact(&target, envelope).await;
        }
    }

    async fn handle_subscribe(&self, envelope: Envelope) -> Result<(), RouterError> {
        let Payload::Subscribe { patterns, filter, snapshot } = &envelope.payload else {
            unreachable!("handle_subscribe only called for Subscribe payloads")
        };
        let patterns = patterns.clone();
        let filter = *filter;
        let snapshot = *snapshot;

        let id = self.subs.subscribe(envelope.source.clone(), patterns.clone(), filter, snapshot, self.clock.as_ref())?;

        let ack = self.build_ack_raw(
            envelope.id,
            &envelope.source,
            &envelope.path,
            AckStatus::Completed,
            Some(json!({ "subscriptionId": id.to_string() })),
            None,
        );
        self.deliver_exact(&envelope.source, ack).await;

        if snapshot {
            for pattern in &patterns {
                for entry in self.store.snapshot_for_pattern(pattern)? {
                    let state = self.build_state_message(&envelope.source, &entry);
                    self.deliver_exact(&envelope.source, state).await;
                }
            }
            let complete = self.build_event(
                &envelope.source,
                "snapshot_complete",
                Some(json!({ "subscriptionId": id.to_string() })),
            );
            self.deliver_exact(&envelope.source, complete).await;
            self.subs.mark_snapshot_sent(id);
        }

        Ok(())
    }

    async fn handle_unsubscribe(&self, envelope: Envelope) {
        let Payload::Unsubscribe { patterns } = &envelope.payload else {
            unreachable!("handle_unsubscribe only called for Unsubscribe payloads")
        };
        let removed_count = self.subs.unsubscribe_patterns(&envelope.source, patterns);
        let ack = self.build_ack_raw(
            envelope.id,
            &envelope.source,
            &envelope.path,
            AckStatus::Completed,
            Some(json!({ "removedCount": removed_count })),
            None,
        );
        self.deliver_exact(&envelope.source, ack).await;
    }

    /// The router's state-store listener: for each delta, forward to every
    /// subscriber whose filter admits state and whose pattern matches,
    /// except the owning namespace (`spec.md` §4.4, "State delta fan-out").
    async fn fan_out_state_delta(&self, delta: StateDelta) {
        let matches = self.subs.matching_subscriptions(delta.path.as_str(), MessageKind::State);
        for (_, client_id, _) in matches {
            if client_id == delta.new_entry.owner {
                continue;
            }
            let msg = self.build_state_message(&client_id, &delta.new_entry);
            self.deliver_exact(&client_id, msg).await;
        }
    }

    fn build_ack_raw(
        &self,
        command_id: MessageId,
        target: &Namespace,
        path: &Path,
        status: AckStatus,
        result: Option<Value>,
        error: Option<Value>,
    ) -> Envelope {
        Envelope {
            id: MessageId::generate(self.clock.as_ref()),
            source: self.hub_core.clone(),
            target: Some(target.clone()),
            path: path.clone(),
            payload: Payload::Ack { status, command_id, result, error },
            timestamp: self.clock.now_millis(),
            sequence: self.sequence.next(),
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        }
    }

    async fn emit_error(&self, target: &Namespace, path: &Path, code: &str, message: &str, related: Option<MessageId>) {
        let envelope = Envelope {
            id: MessageId::generate(self.clock.as_ref()),
            source: self.hub_core.clone(),
            target: Some(target.clone()),
            path: path.clone(),
            payload: Payload::Error {
                code: code.to_owned(),
                message: message.to_owned(),
                details: None,
                related_message_id: related,
            },
            timestamp: self.clock.now_millis(),
            sequence: self.sequence.next(),
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        };
        self.deliver_exact(target, envelope).await;
    }

    fn build_event(&self, target: &Namespace, event: &str, data: Option<Value>) -> Envelope {
        Envelope {
            id: MessageId::generate(self.clock.as_ref()),
            source: self.hub_core.clone(),
            target: Some(target.clone()),
            path: self.snapshot_complete_path.clone(),
            payload: Payload::Event { event: event.to_owned(), data },
            timestamp: self.clock.now_millis(),
            sequence: self.sequence.next(),
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        }
    }

    fn build_state_message(&self, target: &Namespace, entry: &StateEntry) -> Envelope {
        Envelope {
            id: MessageId::generate(self.clock.as_ref()),
            source: self.hub_core.clone(),
            target: Some(target.clone()),
            path: entry.path.clone(),
            payload: Payload::State {
                value: entry.value.clone(),
                stale: Some(entry.stale),
                owner: Some(entry.owner.clone()),
                version: Some(entry.version),
            },
            timestamp: self.clock.now_millis(),
            sequence: self.sequence.next(),
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        }
    }
}
