//! Message dispatch: state writes, subscriptions, command/ack lifecycle,
//! idempotency, target lifecycle (`spec.md` §4.4).

mod error;
mod idempotency;
mod router;
mod target;

pub use error::RouterError;
pub use idempotency::IdempotencyRecord;
pub use router::Router;
pub use target::RouteTarget;

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_protocol::{
        AckStatus, Envelope, FixedClock, MessageId, Namespace, Path, Payload, SubscriptionFilter,
    };
    use bridge_store::StateStore;
    use bridge_subscriptions::SubscriptionManager;
    use bridge_test_support::recording_target;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn ns(s: &str) -> Namespace {
        Namespace::new(s).unwrap()
    }

    fn path(s: &str) -> Path {
        Path::new(s).unwrap()
    }

    fn new_router() -> Arc<Router> {
        Router::new(
            Arc::new(StateStore::new()),
            Arc::new(SubscriptionManager::new()),
            Arc::new(FixedClock(1_700_000_000_000)),
            true,
            60_000,
        )
    }

    fn command_envelope(source: Namespace, target: Namespace, key: &str) -> Envelope {
        Envelope {
            id: MessageId::generate(&FixedClock(1)),
            source,
            target: Some(target),
            path: path("companion.device.1.press"),
            payload: Payload::Command { action: "press".to_owned(), params: None },
            timestamp: 1,
            sequence: 0,
            correlation_id: None,
            ttl: None,
            idempotency_key: Some(key.to_owned()),
        }
    }

    #[tokio::test]
    async fn command_to_unknown_target_emits_unknown_target_error() {
        let router = new_router();
        let (client, client_inbox) = recording_target(ns("app.dashboard"));
        router.register_target(client).unwrap();

        let command = command_envelope(ns("app.dashboard"), ns("companion.satellite"), "k1");
        router.route(command).await.unwrap();

        let inbox = client_inbox.lock().unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(matches!(&inbox[0].payload, Payload::Error { code, .. } if code == "UNKNOWN_TARGET"));
    }

    #[tokio::test]
    async fn command_dispatch_acks_received_then_invokes_target() {
        let router = new_router();
        let (client, client_inbox) = recording_target(ns("app.dashboard"));
        let (satellite, satellite_inbox) = recording_target(ns("companion.satellite"));
        router.register_target(client).unwrap();
        router.register_target(satellite).unwrap();

        let command = command_envelope(ns("app.dashboard"), ns("companion.satellite"), "k1");
        router.route(command).await.unwrap();

        assert_eq!(satellite_inbox.lock().unwrap().len(), 1);
        let client_msgs = client_inbox.lock().unwrap();
        assert_eq!(client_msgs.len(), 1);
        assert!(matches!(&client_msgs[0].payload, Payload::Ack { status: AckStatus::Received, .. }));
    }

    #[tokio::test]
    async fn command_resolves_target_via_prefix_trim() {
        let router = new_router();
        let (client, client_inbox) = recording_target(ns("app.dashboard"));
        let (satellite, satellite_inbox) = recording_target(ns("companion"));
        router.register_target(client).unwrap();
        router.register_target(satellite).unwrap();

        let command = command_envelope(ns("app.dashboard"), ns("companion.satellite"), "k1");
        router.route(command).await.unwrap();

        assert_eq!(satellite_inbox.lock().unwrap().len(), 1);
        assert_eq!(client_inbox.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cached_idempotency_key_short_circuits_dispatch() {
        let router = new_router();
        let (client, client_inbox) = recording_target(ns("app.dashboard"));
        let (satellite, satellite_inbox) = recording_target(ns("companion.satellite"));
        router.register_target(client).unwrap();
        router.register_target(satellite).unwrap();

        let first = command_envelope(ns("app.dashboard"), ns("companion.satellite"), "same-key");
        router.route(first).await.unwrap();

        // Satellite sends the terminal ack back through the router.
        let ack = Envelope {
            id: MessageId::generate(&FixedClock(2)),
            source: ns("companion.satellite"),
            target: Some(ns("app.dashboard")),
            path: path("companion.device.1.press"),
            payload: Payload::Ack {
                status: AckStatus::Completed,
                command_id: satellite_inbox.lock().unwrap()[0].id,
                result: None,
                error: None,
            },
            timestamp: 2,
            sequence: 0,
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        };
        router.route(ack).await.unwrap();

        let second = command_envelope(ns("app.dashboard"), ns("companion.satellite"), "same-key");
        router.route(second).await.unwrap();

        // Satellite was only invoked once; the replay was answered from cache.
        assert_eq!(satellite_inbox.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn state_write_conflict_emits_error_to_source() {
        let router = new_router();
        let (owner_a, _) = recording_target(ns("owner.a"));
        let (owner_b, owner_b_inbox) = recording_target(ns("owner.b"));
        router.register_target(owner_a).unwrap();
        router.register_target(owner_b).unwrap();

        let first = Envelope {
            id: MessageId::generate(&FixedClock(1)),
            source: ns("owner.a"),
            target: None,
            path: path("race.timer.1.split"),
            payload: Payload::State { value: json!(1), stale: None, owner: None, version: None },
            timestamp: 1,
            sequence: 0,
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        };
        router.route(first).await.unwrap();

        let conflicting = Envelope {
            id: MessageId::generate(&FixedClock(2)),
            source: ns("owner.b"),
            target: None,
            path: path("race.timer.1.split"),
            payload: Payload::State { value: json!(2), stale: None, owner: None, version: None },
            timestamp: 2,
            sequence: 0,
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        };
        router.route(conflicting).await.unwrap();

        let inbox = owner_b_inbox.lock().unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(matches!(&inbox[0].payload, Payload::Error { code, .. } if code == "STATE_CONFLICT"));
    }

    #[tokio::test]
    async fn state_delta_fans_out_to_subscribers_but_not_the_owner() {
        let router = new_router();
        let (owner, owner_inbox) = recording_target(ns("owner.a"));
        let (subscriber, subscriber_inbox) = recording_target(ns("app.dashboard"));
        router.register_target(owner).unwrap();
        router.register_target(subscriber).unwrap();

        let subscribe = Envelope {
            id: MessageId::generate(&FixedClock(1)),
            source: ns("app.dashboard"),
            target: None,
            path: path("race.timer.1.split"),
            payload: Payload::Subscribe { patterns: vec!["race.**".to_owned()], filter: SubscriptionFilter::All, snapshot: false },
            timestamp: 1,
            sequence: 0,
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        };
        router.route(subscribe).await.unwrap();
        subscriber_inbox.lock().unwrap().clear();

        let state = Envelope {
            id: MessageId::generate(&FixedClock(2)),
            source: ns("owner.a"),
            target: None,
            path: path("race.timer.1.split"),
            payload: Payload::State { value: json!(12.5), stale: None, owner: None, version: None },
            timestamp: 2,
            sequence: 0,
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        };
        router.route(state).await.unwrap();

        // Fan-out runs on a spawned task off the store listener.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(owner_inbox.lock().unwrap().is_empty());
        assert_eq!(subscriber_inbox.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscribe_with_snapshot_streams_existing_entries_then_completion_event() {
        let router = new_router();
        let (owner, _) = recording_target(ns("owner.a"));
        let (subscriber, subscriber_inbox) = recording_target(ns("app.dashboard"));
        router.register_target(owner).unwrap();
        router.register_target(subscriber).unwrap();

        let state = Envelope {
            id: MessageId::generate(&FixedClock(1)),
            source: ns("owner.a"),
            target: None,
            path: path("race.timer.1.split"),
            payload: Payload::State { value: json!(12.5), stale: None, owner: None, version: None },
            timestamp: 1,
            sequence: 0,
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        };
        router.route(state).await.unwrap();

        let subscribe = Envelope {
            id: MessageId::generate(&FixedClock(2)),
            source: ns("app.dashboard"),
            target: None,
            path: path("race.timer.1.split"),
            payload: Payload::Subscribe { patterns: vec!["race.**".to_owned()], filter: SubscriptionFilter::All, snapshot: true },
            timestamp: 2,
            sequence: 0,
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        };
        router.route(subscribe).await.unwrap();

        let inbox = subscriber_inbox.lock().unwrap();
        // ack(completed) + state snapshot + event(snapshot_complete)
        assert_eq!(inbox.len(), 3);
        assert!(matches!(&inbox[0].payload, Payload::Ack { status: AckStatus::Completed, .. }));
        assert!(matches!(&inbox[1].payload, Payload::State { .. }));
        assert!(matches!(&inbox[2].payload, Payload::Event { event, .. } if event == "snapshot_complete"));
    }

    #[tokio::test]
    async fn unsubscribe_reports_removed_count() {
        let router = new_router();
        let (subscriber, subscriber_inbox) = recording_target(ns("app.dashboard"));
        router.register_target(subscriber).unwrap();

        let subscribe = Envelope {
            id: MessageId::generate(&FixedClock(1)),
            source: ns("app.dashboard"),
            target: None,
            path: path("race.timer.1.split"),
            payload: Payload::Subscribe { patterns: vec!["race.a".to_owned()], filter: SubscriptionFilter::All, snapshot: false },
            timestamp: 1,
            sequence: 0,
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        };
        router.route(subscribe).await.unwrap();
        subscriber_inbox.lock().unwrap().clear();

        let unsubscribe = Envelope {
            id: MessageId::generate(&FixedClock(2)),
            source: ns("app.dashboard"),
            target: None,
            path: path("race.a"),
            payload: Payload::Unsubscribe { patterns: vec!["race.a".to_owned()] },
            timestamp: 2,
            sequence: 0,
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        };
        router.route(unsubscribe).await.unwrap();

        let inbox = subscriber_inbox.lock().unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(matches!(&inbox[0].payload, Payload::Ack { result: Some(r), .. } if r["removedCount"] == json!(1)));
    }

    #[tokio::test]
    async fn unregistering_a_target_rejects_its_pending_commands() {
        let router = new_router();
        let (client, client_inbox) = recording_target(ns("app.dashboard"));
        let (satellite, _satellite_inbox) = recording_target(ns("companion.satellite"));
        router.register_target(client).unwrap();
        router.register_target(satellite).unwrap();

        let command = command_envelope(ns("app.dashboard"), ns("companion.satellite"), "k1");
        router.route(command).await.unwrap();
        client_inbox.lock().unwrap().clear();

        router.unregister_target(&ns("companion.satellite")).await;

        let inbox = client_inbox.lock().unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(matches!(&inbox[0].payload, Payload::Ack { status: AckStatus::Failed, .. }));
    }

    #[tokio::test]
    async fn registering_a_namespace_twice_fails() {
        let router = new_router();
        let (a, _) = recording_target(ns("app.dashboard"));
        let (b, _) = recording_target(ns("app.dashboard"));
        router.register_target(a).unwrap();
        assert!(router.register_target(b).is_err());
    }

    #[tokio::test]
    async fn shutdown_rejects_pending_commands_but_keeps_subscriptions() {
        let router = new_router();
        let (client, client_inbox) = recording_target(ns("app.dashboard"));
        let (satellite, _) = recording_target(ns("companion.satellite"));
        router.register_target(client).unwrap();
        router.register_target(satellite).unwrap();

        let command = command_envelope(ns("app.dashboard"), ns("companion.satellite"), "k1");
        router.route(command).await.unwrap();
        client_inbox.lock().unwrap().clear();

        let subscribe = Envelope {
            id: MessageId::generate(&FixedClock(2)),
            source: ns("app.dashboard"),
            target: None,
            path: path("race.a"),
            payload: Payload::Subscribe { patterns: vec!["race.a".to_owned()], filter: SubscriptionFilter::All, snapshot: false },
            timestamp: 2,
            sequence: 0,
            correlation_id: None,
            ttl: None,
            idempotency_key: None,
        };
        router.route(subscribe).await.unwrap();
        client_inbox.lock().unwrap().clear();

        router.shutdown().await;

        let inbox = client_inbox.lock().unwrap();
        assert_eq!(inbox.len(), 1);
        assert!(matches!(&inbox[0].payload, Payload::Ack { status: AckStatus::Failed, .. }));
    }
}
