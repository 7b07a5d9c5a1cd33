use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /health: liveness probe with live counters.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "engine": state.engine.name(),
        "connections": state.registry.len(),
        "sessions": state.sessions.len(),
        "generations": state.streams.active_count(),
        "cachedConversations": state.history.cached_conversations(),
    }))
}
