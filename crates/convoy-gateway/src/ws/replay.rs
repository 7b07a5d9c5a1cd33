//! What a connection is told the moment it attaches.
//!
//! With a generation in flight it gets the accumulated buffer (always carrying
//! `startTime`) and, if the completion already went out, the completion too.
//! Registration and replay happen under the stream's entry lock, so no live
//! fragment can slip between the two. Without a generation, the last persisted
//! message is checked: an assistant entry that never got its completion marker
//! is resolved with one synthetic `llm_complete`.

use std::sync::Arc;

use convoy_core::types::now_millis;
use convoy_core::ConvoyError;
use convoy_history::HistoryMessage;
use convoy_protocol::{LlmChunk, LlmComplete, OutboundMessage};
use tracing::{debug, warn};

use crate::app::AppState;
use crate::ws::registry::ConnectionHandle;
use crate::ws::stream::StreamState;

pub async fn attach(
    app: &AppState,
    handle: ConnectionHandle,
) -> Result<Arc<ConnectionHandle>, ConvoyError> {
    let key = handle.key.clone();
    let (conn, replayed_stream) = app.streams.attach(&key, |active| {
        let conn = app.registry.register(handle)?;
        if let Some(state) = active {
            for message in replay_active(state) {
                conn.send(message);
            }
        }
        Ok::<_, ConvoyError>((conn, active.is_some()))
    })?;

    if replayed_stream {
        debug!(conn_id = %conn.conn_id, conversation = %key, "replayed active generation");
        return Ok(conn);
    }

    match app.history.get(&key).await {
        Ok(messages) => {
            if let Some(message) = replay_persisted(&messages) {
                debug!(conn_id = %conn.conn_id, conversation = %key, "resolving incomplete message");
                conn.send(message);
            }
        }
        Err(e) => warn!(conversation = %key, error = %e, "history unavailable on attach"),
    }
    Ok(conn)
}

/// Catch-up for an in-flight generation.
pub fn replay_active(state: &StreamState) -> Vec<OutboundMessage> {
    let mut out = vec![OutboundMessage::LlmChunk(LlmChunk {
        chunk: state.text.clone(),
        is_complete: false,
        is_accumulated: Some(true),
        start_time: Some(state.started_at),
        message_id: Some(state.message_id().to_string()),
    })];
    if let Some(completion) = &state.completion {
        out.push(OutboundMessage::LlmComplete(completion.clone()));
    }
    out
}

/// Synthetic completion for a trailing assistant message that was cut off.
pub fn replay_persisted(messages: &[HistoryMessage]) -> Option<OutboundMessage> {
    let last = messages.last().filter(|m| m.looks_incomplete())?;
    Some(OutboundMessage::LlmComplete(LlmComplete {
        full_text: last.content.clone(),
        completion_time: now_millis(),
        thinking_duration: last.thinking_duration,
        token_usage: last.token_usage,
        message_id: last.id.clone(),
        replayed: Some(true),
    }))
}
