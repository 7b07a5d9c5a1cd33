use std::sync::Arc;

use axum::{routing::get, Router};
use convoy_agent::{CompactionService, ConversationEngine};
use convoy_core::config::ConvoyConfig;
use convoy_history::HistoryStore;
use tokio_util::task::TaskTracker;

use crate::ws::registry::ConnectionRegistry;
use crate::ws::session::SessionRegistry;
use crate::ws::stream::StreamingCoordinator;

/// Central shared state, passed as `Arc<AppState>` to every handler and
/// generation task.
pub struct AppState {
    pub config: ConvoyConfig,
    pub registry: ConnectionRegistry,
    pub sessions: SessionRegistry,
    pub streams: StreamingCoordinator,
    /// Generation drivers, awaited on shutdown.
    pub generations: TaskTracker,
    pub history: Arc<HistoryStore>,
    pub compaction: CompactionService,
    pub engine: Arc<dyn ConversationEngine>,
}

impl AppState {
    pub fn new(
        config: ConvoyConfig,
        history: Arc<HistoryStore>,
        compaction: CompactionService,
        engine: Arc<dyn ConversationEngine>,
    ) -> Self {
        Self {
            config,
            registry: ConnectionRegistry::new(),
            sessions: SessionRegistry::new(),
            streams: StreamingCoordinator::new(),
            generations: TaskTracker::new(),
            history,
            compaction,
            engine,
        }
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/ws", get(crate::ws::connection::ws_handler))
        .with_state(state)
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
