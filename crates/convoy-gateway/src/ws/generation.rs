//! One generation, from the user's message to its terminal state.
//!
//! The driver task owns the conversation's single-flight claim. Exactly one of
//! three endings happens: completed, failed (reported as an apology and then
//! completed), or aborted (partial text kept). In every case the stream state
//! is removed before the task exits.

use std::sync::Arc;

use convoy_agent::{CompactionError, CompactionResult, EngineError, EngineEvent, GenerationRequest};
use convoy_core::types::now_millis;
use convoy_core::{ConversationKey, GenerationId, TokenUsage};
use convoy_history::{HistoryMessage, HistoryObserver};
use convoy_protocol::{
    GenerationState, LlmChunk, LlmComplete, Notification, OutboundMessage, StatusUpdate,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::app::AppState;
use crate::ws::tool_events::ToolEventBroadcaster;

/// Sent in place of the rest of the response when the engine fails.
pub const APOLOGY: &str =
    "Sorry, something went wrong while generating a response. Please try again.";

/// Claim the conversation and spawn the driver. `None` when a generation is
/// already running or the server is shutting down; nothing is started or
/// queued in that case.
pub fn start(
    app: &Arc<AppState>,
    key: &ConversationKey,
    text: String,
) -> Option<(GenerationId, JoinHandle<()>)> {
    if app.generations.is_closed() {
        return None;
    }
    let (generation_id, cancel) = app.streams.start_generation(key)?;
    let claim = Claim {
        app: Arc::clone(app),
        key: key.clone(),
        generation_id: generation_id.clone(),
    };
    let handle = app.generations.spawn(drive(claim, text, cancel));
    Some((generation_id, handle))
}

/// Stop accepting generations, abort the running ones and wait until each
/// has recorded its partial output.
pub async fn shutdown(app: &AppState) {
    app.generations.close();
    let aborted = app.streams.abort_all();
    if aborted > 0 {
        info!(aborted, "aborting in-flight generations");
    }
    app.generations.wait().await;
}

/// Releases the single-flight marker even if the driver panics.
struct Claim {
    app: Arc<AppState>,
    key: ConversationKey,
    generation_id: GenerationId,
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self
            .app
            .streams
            .complete_generation(&self.key, &self.generation_id)
            .is_some()
        {
            warn!(conversation = %self.key, generation = %self.generation_id, "generation released by guard");
        }
    }
}

async fn drive(claim: Claim, text: String, cancel: CancellationToken) {
    let app = &claim.app;
    let key = &claim.key;
    let generation_id = &claim.generation_id;
    info!(conversation = %key, generation = %generation_id, "generation started");
    broadcast_status(app, key, GenerationState::Generating, generation_id);

    let user = HistoryMessage::user(text);
    if let Err(e) = app.history.append(key, user.clone()).await {
        warn!(conversation = %key, error = %e, "failed to record user message");
    }
    let history = match app.history.get(key).await {
        Ok(history) => history,
        Err(e) => {
            warn!(conversation = %key, error = %e, "history unavailable, generating without it");
            vec![user]
        }
    };

    let request = GenerationRequest {
        key: key.clone(),
        message_id: generation_id.to_string(),
        history,
    };
    let relay = ToolEventBroadcaster::new(&app.registry, key, generation_id.as_str());
    let (events_tx, mut events_rx) = mpsc::channel::<EngineEvent>(64);
    let generate = app.engine.generate(request, events_tx, cancel.clone());
    tokio::pin!(generate);

    let mut events_open = true;
    let result = loop {
        tokio::select! {
            event = events_rx.recv(), if events_open => match event {
                Some(event) => on_event(app, key, generation_id, &relay, event).await,
                None => events_open = false,
            },
            result = &mut generate => {
                while let Ok(event) = events_rx.try_recv() {
                    on_event(app, key, generation_id, &relay, event).await;
                }
                break result;
            }
        }
    };

    match result {
        Ok(outcome) => {
            debug!(conversation = %key, stop_reason = %outcome.stop_reason, "engine finished");
            complete(app, key, generation_id, outcome.token_usage).await;
        }
        Err(EngineError::Cancelled) => abort(app, key, generation_id).await,
        Err(_) if cancel.is_cancelled() => abort(app, key, generation_id).await,
        Err(e) => {
            warn!(conversation = %key, generation = %generation_id, error = %e, "generation failed");
            let has_text = buffered_text(app, key, generation_id).is_some_and(|t| !t.is_empty());
            let apology = if has_text {
                format!("\n\n{APOLOGY}")
            } else {
                APOLOGY.to_string()
            };
            publish_fragment(app, key, generation_id, &apology);
            complete(app, key, generation_id, None).await;
        }
    }
}

async fn on_event(
    app: &AppState,
    key: &ConversationKey,
    generation_id: &GenerationId,
    relay: &ToolEventBroadcaster<'_>,
    event: EngineEvent,
) {
    match event {
        EngineEvent::Fragment(text) => publish_fragment(app, key, generation_id, &text),
        EngineEvent::MessageAppended(message) => {
            app.history.message_appended(key, message).await
        }
        other => {
            relay.relay(&other);
        }
    }
}

/// Buffer a fragment and fan it out while the stream entry is locked.
fn publish_fragment(app: &AppState, key: &ConversationKey, generation_id: &GenerationId, text: &str) {
    app.streams.append_fragment(key, generation_id, text, |state| {
        app.registry.broadcast(
            key,
            OutboundMessage::LlmChunk(LlmChunk {
                chunk: text.to_string(),
                is_complete: false,
                is_accumulated: None,
                start_time: Some(state.started_at),
                message_id: Some(state.message_id().to_string()),
            }),
        );
    });
}

fn buffered_text(app: &AppState, key: &ConversationKey, generation_id: &GenerationId) -> Option<String> {
    app.streams
        .snapshot_for(key)
        .into_iter()
        .find(|s| s.generation_id == *generation_id)
        .map(|s| s.text)
}

/// Broadcast the completion, issue the history write, then drop the stream.
async fn complete(
    app: &Arc<AppState>,
    key: &ConversationKey,
    generation_id: &GenerationId,
    token_usage: Option<TokenUsage>,
) {
    let Some(state) = app
        .streams
        .snapshot_for(key)
        .into_iter()
        .find(|s| s.generation_id == *generation_id)
    else {
        warn!(conversation = %key, generation = %generation_id, "stream vanished before completion");
        return;
    };

    let completion = LlmComplete {
        full_text: state.text.clone(),
        completion_time: now_millis(),
        thinking_duration: state.thinking_duration(),
        token_usage,
        message_id: Some(generation_id.to_string()),
        replayed: None,
    };
    let broadcast = OutboundMessage::LlmComplete(completion.clone());
    app.streams
        .finish(key, generation_id, completion.clone(), |_| {
            app.registry.broadcast(key, broadcast);
        });

    let record = HistoryMessage::assistant_completed(
        generation_id.as_str(),
        completion.full_text,
        completion.completion_time,
        completion.thinking_duration,
        completion.token_usage,
    );
    if let Err(e) = app.history.append(key, record).await {
        warn!(conversation = %key, error = %e, "failed to record assistant message");
    }

    app.streams.complete_generation(key, generation_id);
    broadcast_status(app, key, GenerationState::Idle, generation_id);
    info!(conversation = %key, generation = %generation_id, chars = state.text.len(), "generation completed");

    spawn_auto_compaction(app, key);
}

/// Keep whatever was streamed as an aborted message. Nothing is recorded when
/// no text was produced.
async fn abort(app: &AppState, key: &ConversationKey, generation_id: &GenerationId) {
    let partial = buffered_text(app, key, generation_id).unwrap_or_default();
    if !partial.is_empty() {
        let record = HistoryMessage::assistant_aborted(generation_id.as_str(), partial.as_str());
        if let Err(e) = app.history.append(key, record).await {
            warn!(conversation = %key, error = %e, "failed to record aborted message");
        }
    }
    app.streams.complete_generation(key, generation_id);
    broadcast_status(app, key, GenerationState::Aborted, generation_id);
    info!(conversation = %key, generation = %generation_id, chars = partial.len(), "generation aborted");
}

fn broadcast_status(
    app: &AppState,
    key: &ConversationKey,
    state: GenerationState,
    generation_id: &GenerationId,
) {
    app.registry.broadcast(
        key,
        OutboundMessage::Status(StatusUpdate {
            state,
            generation_id: Some(generation_id.to_string()),
        }),
    );
}

fn spawn_auto_compaction(app: &Arc<AppState>, key: &ConversationKey) {
    let app = Arc::clone(app);
    let key = key.clone();
    tokio::spawn(async move {
        match app.compaction.should_compact(&key).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!(conversation = %key, error = %e, "compaction check failed");
                return;
            }
        }
        info!(conversation = %key, "token threshold reached, compacting");
        if let Err(e) = compact_conversation(&app, &key).await {
            warn!(conversation = %key, error = %e, "auto-compaction failed");
        }
    });
}

/// Compact the conversation's current history and tell its viewers.
pub async fn compact_conversation(
    app: &AppState,
    key: &ConversationKey,
) -> Result<CompactionResult, CompactionError> {
    let messages = app.history.get(key).await?;
    let result = app.compaction.compact(key, messages).await?;
    if result.compacted {
        app.registry.broadcast(
            key,
            OutboundMessage::Notification(Notification::info(format!(
                "Conversation compacted: {} messages now {}, about {} tokens saved",
                result.messages_before, result.messages_after, result.tokens_saved
            ))),
        );
    }
    Ok(result)
}
