use convoy_core::TokenUsage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A validated client → server message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    UserMessage(UserMessage),
    Control(ControlCommand),
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub text: String,
    #[serde(default)]
    pub file_ids: Vec<String>,
    #[serde(default)]
    pub options: Option<Value>,
}

/// Control commands carried in `{ "type": "control", "data": { "type": ... } }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlCommand {
    Abort,
    ClearHistory,
    GetHistory,
    GetStatus,
    CompactChat,
    GetCompactionStatus,
}

impl ControlCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlCommand::Abort => "abort",
            ControlCommand::ClearHistory => "clear_history",
            ControlCommand::GetHistory => "get_history",
            ControlCommand::GetStatus => "get_status",
            ControlCommand::CompactChat => "compact_chat",
            ControlCommand::GetCompactionStatus => "get_compaction_status",
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// A server → client message. Serialized adjacently: `type` + `data`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OutboundMessage {
    LlmChunk(LlmChunk),
    LlmComplete(LlmComplete),
    ToolCall(ToolCallEvent),
    ToolResult(ToolResultEvent),
    TodoUpdate(TodoUpdate),
    Status(StatusUpdate),
    ControlResponse(ControlResponse),
    Error(ErrorPayload),
    Pong,
    Notification(Notification),
}

impl OutboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::LlmChunk(_) => "llm_chunk",
            OutboundMessage::LlmComplete(_) => "llm_complete",
            OutboundMessage::ToolCall(_) => "tool_call",
            OutboundMessage::ToolResult(_) => "tool_result",
            OutboundMessage::TodoUpdate(_) => "todo_update",
            OutboundMessage::Status(_) => "status",
            OutboundMessage::ControlResponse(_) => "control_response",
            OutboundMessage::Error(_) => "error",
            OutboundMessage::Pong => "pong",
            OutboundMessage::Notification(_) => "notification",
        }
    }

    pub fn error(code: &str, message: impl Into<String>, recoverable: bool) -> Self {
        OutboundMessage::Error(ErrorPayload {
            code: code.to_string(),
            message: message.into(),
            recoverable,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmChunk {
    pub chunk: String,
    pub is_complete: bool,
    /// Set on replay: `chunk` is the whole buffer so far, not a delta.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_accumulated: Option<bool>,
    /// Generation start (epoch millis) so clients can render elapsed time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmComplete {
    pub full_text: String,
    pub completion_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// Set when this completion is synthesized on attach for a persisted record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replayed: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallEvent {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: Value,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultEvent {
    pub call_id: String,
    pub tool_name: String,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub id: String,
    pub content: String,
    pub status: TodoStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoUpdate {
    pub todos: Vec<TodoItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationState {
    Generating,
    Idle,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub state: GenerationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ControlResponse {
    pub fn ok(command: ControlCommand, result: impl Serialize) -> Self {
        Self {
            command: command.as_str().to_string(),
            success: true,
            result: Some(serde_json::to_value(result).unwrap_or(Value::Null)),
        }
    }

    pub fn failed(command: ControlCommand, result: impl Serialize) -> Self {
        Self {
            command: command.as_str().to_string(),
            success: false,
            result: Some(serde_json::to_value(result).unwrap_or(Value::Null)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
}

impl Notification {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Warning,
            message: message.into(),
        }
    }
}
