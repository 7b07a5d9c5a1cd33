use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use convoy_agent::anthropic::AnthropicProvider;
use convoy_agent::{
    CompactionService, ConversationEngine, LlmProvider, ProviderEngine, UnconfiguredEngine,
};
use convoy_core::config::ConvoyConfig;
use convoy_history::{HistoryStore, SqliteSnapshotStore};
use tracing::{info, warn};

mod app;
mod http;
#[cfg(test)]
mod test_support;
mod ws;

#[derive(Parser, Debug)]
#[command(name = "convoy-gateway", version, about = "Conversation fan-out gateway")]
struct Cli {
    /// Path to convoy.toml (default: ~/.convoy/convoy.toml)
    #[arg(long, env = "CONVOY_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "convoy_gateway=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = ConvoyConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        ConvoyConfig::default()
    });

    let db_path = config.history.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening history database");
    let db = rusqlite::Connection::open(&db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    let history = Arc::new(HistoryStore::new(Arc::new(SqliteSnapshotStore::new(db)?)));

    let provider = build_provider(&config);
    let engine: Arc<dyn ConversationEngine> = match &provider {
        Some(provider) => Arc::new(ProviderEngine::new(Arc::clone(provider), &config.agent)),
        None => {
            warn!("no LLM credentials configured; every generation will fail");
            Arc::new(UnconfiguredEngine::new(
                "set providers.anthropic.api_key or ANTHROPIC_API_KEY",
            ))
        }
    };
    let compaction =
        CompactionService::new(Arc::clone(&history), provider, config.compaction.clone());

    let addr: SocketAddr = format!("{}:{}", config.gateway.bind, config.gateway.port).parse()?;
    let state = Arc::new(app::AppState::new(
        config,
        Arc::clone(&history),
        compaction,
        engine,
    ));
    let router = app::build_router(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("convoy gateway listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    ws::generation::shutdown(&state).await;
    info!("flushing pending history writes");
    history.flush_all().await;
    Ok(())
}

/// providers.anthropic first, then the ANTHROPIC_API_KEY env var.
fn build_provider(config: &ConvoyConfig) -> Option<Arc<dyn LlmProvider>> {
    if let Some(anthropic) = &config.providers.anthropic {
        info!(base_url = %anthropic.base_url, "using Anthropic provider from config");
        return Some(Arc::new(AnthropicProvider::new(
            anthropic.api_key.clone(),
            Some(anthropic.base_url.clone()),
        )));
    }
    match std::env::var("ANTHROPIC_API_KEY") {
        Ok(key) if !key.is_empty() => {
            info!("using Anthropic provider from ANTHROPIC_API_KEY");
            Some(Arc::new(AnthropicProvider::new(key, None)))
        }
        _ => None,
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn ensure_parent_dir(path: &str) {
    if path == ":memory:" {
        return;
    }
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
