use bridge_protocol::Envelope;
use bridge_router::{RouteTarget, RouterError};
use futures_util::future::BoxFuture;
use std::sync::{Arc, Mutex};

/// A [`RouteTarget`] that records every envelope it is handed instead of
/// doing anything with it, for asserting on router dispatch in tests
/// (mirrors this workspace's `MockWsClient`/`MockWsServer` role for the
/// router rather than the wire).
pub fn recording_target(namespace: bridge_protocol::Namespace) -> (RouteTarget, Arc<Mutex<Vec<Envelope>>>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let recorded = received.clone();
    let target = RouteTarget::new(namespace, move |envelope: Envelope| -> BoxFuture<'static, Result<(), RouterError>> {
        let recorded = recorded.clone();
        Box::pin(async move {
            recorded.lock().unwrap().push(envelope);
            Ok(())
        })
    });
    (target, received)
}

/// A [`RouteTarget`] whose handler always fails, for exercising the
/// `ADAPTER_ERROR` path.
pub fn failing_target(namespace: bridge_protocol::Namespace, message: &'static str) -> RouteTarget {
    RouteTarget::new(namespace, move |_envelope: Envelope| -> BoxFuture<'static, Result<(), RouterError>> {
        Box::pin(async move { Err(RouterError::AdapterError(message.to_owned())) })
    })
}
