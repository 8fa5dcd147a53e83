//! Shared handle bundle threaded through every downstream client connection
//! and into axum's router state.

use bridge_protocol::Clock;
use crate::config::HubConfig;
use bridge_router::Router;
use bridge_satellite::SatelliteAdapter;
use bridge_store::StateStore;
use bridge_subscriptions::SubscriptionManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<HubConfig>,
    pub store: Arc<StateStore>,
    pub subs: Arc<SubscriptionManager>,
    pub router: Arc<Router>,
    pub satellite: Arc<SatelliteAdapter>,
    pub clock: Arc<dyn Clock>,
    pub shutdown: broadcast::Sender<()>,
    active_clients: Arc<RwLock<HashMap<String, ()>>>,
    next_client_seq: Arc<AtomicU64>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Arc<HubConfig>,
        store: Arc<StateStore>,
        subs: Arc<SubscriptionManager>,
        router: Arc<Router>,
        satellite: Arc<SatelliteAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            config,
            store,
            subs,
            router,
            satellite,
            clock,
            shutdown,
            active_clients: Arc::new(RwLock::new(HashMap::new())),
            next_client_seq: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Broadcasts a shutdown signal; every connected client's loop sees it
    /// and closes with code 1001 (`spec.md` §6).
    pub fn notify_shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Reserves a slot for a new client if `maxClients` allows it, returning
    /// a fresh session id and its sequence number on success (`spec.md` §6,
    /// "maxClients"). The sequence number disambiguates a namespace collision
    /// between two clients that sanitize to the same name.
    pub async fn try_register_client(&self) -> Option<(String, u64)> {
        let mut clients = self.active_clients.write().await;
        if clients.len() as u32 >= self.config.transport.max_clients {
            return None;
        }
        let seq = self.next_client_seq.fetch_add(1, Ordering::SeqCst);
        let session_id = format!("session-{seq}");
        clients.insert(session_id.clone(), ());
        Some((session_id, seq))
    }

    pub async fn unregister_client(&self, session_id: &str) {
        self.active_clients.write().await.remove(session_id);
    }

    pub async fn client_count(&self) -> usize {
        self.active_clients.read().await.len()
    }
}
