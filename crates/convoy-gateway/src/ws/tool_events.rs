use convoy_agent::EngineEvent;
use convoy_core::ConversationKey;
use convoy_protocol::{OutboundMessage, TodoUpdate, ToolCallEvent, ToolResultEvent, ToolStatus};

use crate::ws::registry::ConnectionRegistry;

/// Relays tool lifecycle events from the engine to every viewer of the
/// conversation, tagged with the assistant message they belong to.
pub struct ToolEventBroadcaster<'a> {
    registry: &'a ConnectionRegistry,
    key: &'a ConversationKey,
    message_id: &'a str,
}

impl<'a> ToolEventBroadcaster<'a> {
    pub fn new(registry: &'a ConnectionRegistry, key: &'a ConversationKey, message_id: &'a str) -> Self {
        Self {
            registry,
            key,
            message_id,
        }
    }

    /// Broadcast `event` if it is a tool or todo event. Returns the delivery
    /// count, or `None` for events this relay does not handle.
    pub fn relay(&self, event: &EngineEvent) -> Option<usize> {
        let message = to_outbound(event, self.message_id)?;
        Some(self.registry.broadcast(self.key, message))
    }
}

pub fn to_outbound(event: &EngineEvent, message_id: &str) -> Option<OutboundMessage> {
    let message_id = Some(message_id.to_string());
    let message = match event {
        EngineEvent::ToolStarted {
            call_id,
            tool_name,
            arguments,
            status,
            partial_result,
        } => OutboundMessage::ToolCall(ToolCallEvent {
            call_id: call_id.clone(),
            tool_name: tool_name.clone(),
            arguments: arguments.clone(),
            status: *status,
            partial_result: partial_result.clone(),
            message_id,
        }),
        EngineEvent::ToolSucceeded {
            call_id,
            tool_name,
            result,
        } => OutboundMessage::ToolResult(ToolResultEvent {
            call_id: call_id.clone(),
            tool_name: tool_name.clone(),
            status: ToolStatus::Completed,
            result: Some(result.clone()),
            error: None,
            message_id,
        }),
        EngineEvent::ToolFailed {
            call_id,
            tool_name,
            error,
        } => OutboundMessage::ToolResult(ToolResultEvent {
            call_id: call_id.clone(),
            tool_name: tool_name.clone(),
            status: ToolStatus::Failed,
            result: None,
            error: Some(error.clone()),
            message_id,
        }),
        EngineEvent::TodoUpdate(todos) => OutboundMessage::TodoUpdate(TodoUpdate {
            todos: todos.clone(),
            message_id,
        }),
        EngineEvent::Fragment(_) | EngineEvent::MessageAppended(_) => return None,
    };
    Some(message)
}
