//! The conversation engine contract and its LLM-backed implementation.
//!
//! A generation is a single call to [`ConversationEngine::generate`]. Output is
//! pushed through an `mpsc` channel of [`EngineEvent`]s as it is produced; the
//! returned future resolves once the model is done, failed, or was cancelled.
//! Cancellation always surfaces as [`EngineError::Cancelled`], never as a
//! provider error.

use std::sync::Arc;

use async_trait::async_trait;
use convoy_core::config::AgentConfig;
use convoy_core::{ConversationKey, TokenUsage};
use convoy_history::{HistoryMessage, Role as HistoryRole};
use convoy_protocol::{TodoItem, ToolStatus};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::provider::{ChatRequest, LlmProvider, ProviderError};
use crate::stream::StreamEvent;
use crate::tools::{self, Tool};

/// Cap on model round-trips per generation when tools keep being called.
pub const MAX_TOOL_ITERATIONS: usize = 10;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Everything the engine needs for one generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub key: ConversationKey,
    /// Id of the assistant message being produced.
    pub message_id: String,
    /// Conversation history, ending with the user message being answered.
    pub history: Vec<HistoryMessage>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Next piece of assistant text. May be empty.
    Fragment(String),
    ToolStarted {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
        status: ToolStatus,
        partial_result: Option<serde_json::Value>,
    },
    ToolSucceeded {
        call_id: String,
        tool_name: String,
        result: serde_json::Value,
    },
    ToolFailed {
        call_id: String,
        tool_name: String,
        error: String,
    },
    TodoUpdate(Vec<TodoItem>),
    /// A message the engine added to the conversation (tool results).
    MessageAppended(HistoryMessage),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationOutcome {
    pub token_usage: Option<TokenUsage>,
    pub stop_reason: String,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("generation cancelled")]
    Cancelled,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("engine not configured: {0}")]
    Unconfigured(String),
}

#[async_trait]
pub trait ConversationEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        request: GenerationRequest,
        events: mpsc::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Result<GenerationOutcome, EngineError>;
}

// ---------------------------------------------------------------------------
// ProviderEngine
// ---------------------------------------------------------------------------

/// Streams a reply from an [`LlmProvider`], running tool calls in between.
pub struct ProviderEngine {
    provider: Arc<dyn LlmProvider>,
    model: String,
    max_tokens: u32,
    system_prompt: String,
    tools: Vec<Box<dyn Tool>>,
}

impl ProviderEngine {
    pub fn new(provider: Arc<dyn LlmProvider>, config: &AgentConfig) -> Self {
        Self {
            provider,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            tools: tools::builtin_tools(),
        }
    }

    pub fn with_tools(mut self, tools: Vec<Box<dyn Tool>>) -> Self {
        self.tools = tools;
        self
    }

    /// Per-iteration stream handling. Returns the text produced and the tool
    /// calls requested in this round trip.
    async fn stream_once(
        &self,
        req: &ChatRequest,
        events: &mpsc::Sender<EngineEvent>,
        cancel: &CancellationToken,
        usage: &mut TokenUsage,
        stop_reason: &mut String,
    ) -> Result<RoundTrip, EngineError> {
        let (stream_tx, mut stream_rx) = mpsc::channel::<StreamEvent>(64);
        let send_fut = self.provider.send_stream(req, stream_tx);
        tokio::pin!(send_fut);

        let mut round = RoundTrip::default();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(EngineError::Cancelled);
                }
                event = stream_rx.recv() => {
                    match event {
                        Some(event) => round.apply(event, events, usage, stop_reason).await?,
                        None => break,
                    }
                }
                result = &mut send_fut => {
                    result?;
                    while let Ok(event) = stream_rx.try_recv() {
                        round.apply(event, events, usage, stop_reason).await?;
                    }
                    break;
                }
            }
        }
        Ok(round)
    }
}

#[derive(Default)]
struct RoundTrip {
    text: String,
    // (tool_use_id, tool_name, input)
    tool_calls: Vec<(String, String, serde_json::Value)>,
}

impl RoundTrip {
    async fn apply(
        &mut self,
        event: StreamEvent,
        events: &mpsc::Sender<EngineEvent>,
        usage: &mut TokenUsage,
        stop_reason: &mut String,
    ) -> Result<(), EngineError> {
        match event {
            StreamEvent::TextDelta { text } => {
                self.text.push_str(&text);
                let _ = events.send(EngineEvent::Fragment(text)).await;
            }
            StreamEvent::ToolUse { id, name, input } => self.tool_calls.push((id, name, input)),
            StreamEvent::Done {
                tokens_in,
                tokens_out,
                stop_reason: reason,
                ..
            } => {
                usage.add(TokenUsage {
                    input_tokens: u64::from(tokens_in),
                    output_tokens: u64::from(tokens_out),
                });
                *stop_reason = reason;
            }
            StreamEvent::Error { message } => {
                warn!(error = %message, "stream error");
                return Err(ProviderError::Stream(message).into());
            }
            StreamEvent::Thinking { .. } => {}
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationEngine for ProviderEngine {
    fn name(&self) -> &str {
        self.provider.name()
    }

    async fn generate(
        &self,
        request: GenerationRequest,
        events: mpsc::Sender<EngineEvent>,
        cancel: CancellationToken,
    ) -> Result<GenerationOutcome, EngineError> {
        let (system, mut raw_messages) = build_context(&self.system_prompt, &request.history);
        let tool_defs = tools::to_definitions(&self.tools);

        let mut usage = TokenUsage::default();
        let mut stop_reason = String::new();

        for iteration in 0..MAX_TOOL_ITERATIONS {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            debug!(iteration, conversation = %request.key, "engine iteration");

            let req = ChatRequest {
                model: self.model.clone(),
                system: system.clone(),
                messages: Vec::new(),
                max_tokens: self.max_tokens,
                stream: true,
                tools: tool_defs.clone(),
                raw_messages: Some(raw_messages.clone()),
            };

            let round = self
                .stream_once(&req, &events, &cancel, &mut usage, &mut stop_reason)
                .await?;

            if round.tool_calls.is_empty() || stop_reason != "tool_use" {
                info!(
                    conversation = %request.key,
                    tokens_in = usage.input_tokens,
                    tokens_out = usage.output_tokens,
                    "generation complete"
                );
                return Ok(GenerationOutcome {
                    token_usage: Some(usage),
                    stop_reason,
                });
            }

            let mut assistant: Vec<serde_json::Value> = Vec::new();
            if !round.text.is_empty() {
                assistant.push(serde_json::json!({ "type": "text", "text": round.text }));
            }
            for (id, name, input) in &round.tool_calls {
                assistant.push(serde_json::json!({
                    "type": "tool_use", "id": id, "name": name, "input": input,
                }));
            }
            raw_messages.push(serde_json::json!({ "role": "assistant", "content": assistant }));

            let mut results: Vec<serde_json::Value> = Vec::new();
            for (id, name, input) in round.tool_calls {
                if cancel.is_cancelled() {
                    return Err(EngineError::Cancelled);
                }
                let _ = events
                    .send(EngineEvent::ToolStarted {
                        call_id: id.clone(),
                        tool_name: name.clone(),
                        arguments: input.clone(),
                        status: ToolStatus::Running,
                        partial_result: None,
                    })
                    .await;

                let result = tools::execute_tool(&self.tools, &name, input).await;

                if let Some(todos) = result.todos.clone() {
                    let _ = events.send(EngineEvent::TodoUpdate(todos)).await;
                }
                let terminal = if result.is_error {
                    EngineEvent::ToolFailed {
                        call_id: id.clone(),
                        tool_name: name.clone(),
                        error: result.content.clone(),
                    }
                } else {
                    EngineEvent::ToolSucceeded {
                        call_id: id.clone(),
                        tool_name: name.clone(),
                        result: serde_json::Value::String(result.content.clone()),
                    }
                };
                let _ = events.send(terminal).await;
                let _ = events
                    .send(EngineEvent::MessageAppended(HistoryMessage::tool_result(
                        id.clone(),
                        name,
                        result.content.clone(),
                    )))
                    .await;

                results.push(serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": id,
                    "content": result.content,
                    "is_error": result.is_error,
                }));
            }
            raw_messages.push(serde_json::json!({ "role": "user", "content": results }));
        }

        warn!(
            max_iterations = MAX_TOOL_ITERATIONS,
            conversation = %request.key,
            "tool loop hit maximum iterations"
        );
        Ok(GenerationOutcome {
            token_usage: Some(usage),
            stop_reason: "max_iterations".to_string(),
        })
    }
}

/// Turn stored history into a system prompt plus API messages.
///
/// System entries extend the prompt. Tool results are bookkeeping only and
/// empty entries (zero-length aborts) are dropped. A compaction summary is
/// handed to the model as user-side context.
fn build_context(base_prompt: &str, history: &[HistoryMessage]) -> (String, Vec<serde_json::Value>) {
    let mut system = base_prompt.to_string();
    let mut messages = Vec::new();

    for msg in history {
        match msg.role {
            HistoryRole::System => {
                system.push_str("\n\n");
                system.push_str(&msg.content);
            }
            HistoryRole::Tool => {}
            _ if msg.content.is_empty() => {}
            HistoryRole::Assistant if msg.summary => {
                messages.push(serde_json::json!({
                    "role": "user",
                    "content": format!("Summary of the earlier conversation:\n{}", msg.content),
                }));
            }
            HistoryRole::User => {
                messages.push(serde_json::json!({ "role": "user", "content": msg.content }));
            }
            HistoryRole::Assistant => {
                messages.push(serde_json::json!({ "role": "assistant", "content": msg.content }));
            }
        }
    }
    (system, messages)
}

// ---------------------------------------------------------------------------
// UnconfiguredEngine
// ---------------------------------------------------------------------------

/// Stand-in used when no provider credentials are available. Every generation
/// fails, which clients see as the usual apology.
pub struct UnconfiguredEngine {
    reason: String,
}

impl UnconfiguredEngine {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ConversationEngine for UnconfiguredEngine {
    fn name(&self) -> &str {
        "unconfigured"
    }

    async fn generate(
        &self,
        _request: GenerationRequest,
        _events: mpsc::Sender<EngineEvent>,
        _cancel: CancellationToken,
    ) -> Result<GenerationOutcome, EngineError> {
        Err(EngineError::Unconfigured(self.reason.clone()))
    }
}
