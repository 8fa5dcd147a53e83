pub mod config;
pub mod state;
pub mod ws;

pub use state::AppState;

use axum::routing::get;
use axum::Router;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::client_ws_handler))
        .route("/health", get(health::health))
        .route("/health/live", get(health::live))
        .route("/health/ready", get(health::ready))
        .with_state(state)
}

mod health {
    use crate::state::AppState;
    use axum::extract::State;
    use axum::response::IntoResponse;
    use axum::Json;
    use serde_json::json;

    /// The core has no fatal-to-process error path and tracks no external
    /// dependency checkers of its own, so `/health` always reports healthy
    /// while the process is up (`spec.md` §6's composite aggregator is an
    /// external collaborator this core does not implement).
    pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
        Json(json!({ "status": "healthy", "clients": state.client_count().await }))
    }

    pub async fn live() -> impl IntoResponse {
        "ok"
    }

    pub async fn ready() -> impl IntoResponse {
        "ok"
    }
}
