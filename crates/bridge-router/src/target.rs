use crate::error::RouterError;
use bridge_protocol::{Envelope, Namespace};
use futures_util::future::BoxFuture;
use std::sync::Arc;

/// A destination the router can deliver envelopes to: a connected client, an
/// upstream adapter, or anything else that registers under a namespace
/// (`spec.md` §3). The handler is re-entrant — it may itself call back into
/// the router while being invoked (`spec.md` §5).
#[derive(Clone)]
pub struct RouteTarget {
    pub namespace: Namespace,
    pub handler: Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<(), RouterError>> + Send + Sync>,
}

impl RouteTarget {
    pub fn new<F>(namespace: Namespace, handler: F) -> Self
    where
        F: Fn(Envelope) -> BoxFuture<'static, Result<(), RouterError>> + Send + Sync + 'static,
    {
        Self {
            namespace,
            handler: Arc::new(handler),
        }
    }
}
