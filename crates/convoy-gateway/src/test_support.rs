//! Shared fixtures for gateway tests: an in-memory app state and a scripted
//! engine whose pacing the test controls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use convoy_agent::provider::ProviderError;
use convoy_agent::{
    CompactionService, ConversationEngine, EngineError, EngineEvent, GenerationOutcome,
    GenerationRequest,
};
use convoy_core::config::ConvoyConfig;
use convoy_core::{ConversationKey, SessionId, TokenUsage};
use convoy_history::{HistoryMessage, HistoryStore, SqliteSnapshotStore};
use convoy_protocol::ToolStatus;
use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::app::AppState;
use crate::ws::registry::ConnectionHandle;
use crate::ws::replay;

pub struct ScriptedEngine {
    fragments: Vec<String>,
    /// Pause before emitting fragment N until notified (or cancelled).
    gate: Option<(usize, Arc<Notify>)>,
    fail: bool,
    tool_call: bool,
    calls: AtomicUsize,
}

impl ScriptedEngine {
    fn build(fragments: Vec<&str>) -> Self {
        Self {
            fragments: fragments.into_iter().map(String::from).collect(),
            gate: None,
            fail: false,
            tool_call: false,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn new(fragments: Vec<&str>) -> Arc<Self> {
        Arc::new(Self::build(fragments))
    }

    pub fn gated(fragments: Vec<&str>, before: usize, gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            gate: Some((before, gate)),
            ..Self::build(fragments)
        })
    }

    /// Emits its fragments, then fails like an upstream outage.
    pub fn failing(fragments: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::build(fragments)
        })
    }

    /// Runs one `todo_write` call before streaming its fragments.
    pub fn with_tool_call(fragments: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            tool_call: true,
            ..Self::build(fragments)
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn wait_gate(&self, index: usize, cancel: &CancellationToken) -> Result<(), EngineError> {
        if let Some((before, gate)) = &self.gate {
            if *before == index {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    _ = gate.notified() => {}
                }
            }
        }
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        _request: GenerationRequest,
        events: mpsc::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Result<GenerationOutcome, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.tool_call {
            let arguments = serde_json::json!({ "todos": [] });
            let _ = events
                .send(EngineEvent::ToolStarted {
                    call_id: "call-1".into(),
                    tool_name: "todo_write".into(),
                    arguments,
                    status: ToolStatus::Running,
                    partial_result: None,
                })
                .await;
            let _ = events
                .send(EngineEvent::ToolSucceeded {
                    call_id: "call-1".into(),
                    tool_name: "todo_write".into(),
                    result: Value::String("ok".into()),
                })
                .await;
            let _ = events
                .send(EngineEvent::MessageAppended(HistoryMessage::tool_result(
                    "call-1",
                    "todo_write",
                    "ok",
                )))
                .await;
        }

        for (index, fragment) in self.fragments.iter().enumerate() {
            self.wait_gate(index, &cancel).await?;
            let _ = events.send(EngineEvent::Fragment(fragment.clone())).await;
        }
        self.wait_gate(self.fragments.len(), &cancel).await?;

        if self.fail {
            return Err(EngineError::Provider(ProviderError::Api {
                status: 529,
                message: "overloaded".into(),
            }));
        }
        Ok(GenerationOutcome {
            token_usage: Some(TokenUsage {
                input_tokens: 12,
                output_tokens: 3,
            }),
            stop_reason: "end_turn".into(),
        })
    }
}

pub fn test_state(engine: Arc<dyn ConversationEngine>) -> Arc<AppState> {
    let config = ConvoyConfig::default();
    let durable = SqliteSnapshotStore::new(Connection::open_in_memory().unwrap()).unwrap();
    let history = Arc::new(HistoryStore::new(Arc::new(durable)));
    let compaction = CompactionService::new(Arc::clone(&history), None, config.compaction.clone());
    Arc::new(AppState::new(config, history, compaction, engine))
}

/// Attach a fake connection the way the socket task does.
pub async fn connect(
    app: &AppState,
    key: &ConversationKey,
) -> (Arc<ConnectionHandle>, mpsc::Receiver<String>) {
    let (tx, rx) = mpsc::channel(256);
    let handle = ConnectionHandle::new(key.clone(), SessionId::new(), tx);
    let conn = replay::attach(app, handle).await.unwrap();
    (conn, rx)
}

/// Everything queued for a connection so far, parsed.
pub fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(json) = rx.try_recv() {
        out.push(serde_json::from_str(&json).unwrap());
    }
    out
}

pub fn frames_of<'a>(frames: &'a [Value], kind: &str) -> Vec<&'a Value> {
    frames.iter().filter(|f| f["type"] == kind).collect()
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}
