use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::messages::{ControlCommand, InboundMessage, OutboundMessage, UserMessage};

/// Envelope metadata carried in both directions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Metadata {
    pub fn now() -> Self {
        Self {
            timestamp: convoy_core::types::now_millis(),
            ..Self::default()
        }
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Raw inbound frame: the `type` discriminator plus an untyped body.
/// Wire: `{ "type": "user_message", "id": "m1", "data": { "text": "hi" } }`
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl InboundFrame {
    /// Parse and validate one text frame in a single step.
    pub fn parse(text: &str) -> Result<(InboundFrame, InboundMessage), ProtocolError> {
        let frame: InboundFrame = serde_json::from_str(text)?;
        let message = frame.to_message()?;
        Ok((frame, message))
    }

    /// Interpret the body according to the `type` discriminator.
    pub fn to_message(&self) -> Result<InboundMessage, ProtocolError> {
        match self.frame_type.as_str() {
            "user_message" => {
                let user: UserMessage = self.typed_data()?;
                if user.text.trim().is_empty() {
                    return Err(ProtocolError::InvalidPayload {
                        kind: self.frame_type.clone(),
                        reason: "text cannot be empty".to_string(),
                    });
                }
                Ok(InboundMessage::UserMessage(user))
            }
            "control" => match self.typed_data::<ControlCommand>() {
                Ok(cmd) => Ok(InboundMessage::Control(cmd)),
                Err(ProtocolError::InvalidPayload { kind, reason }) => {
                    match self.data.as_ref().and_then(|d| d.get("type")).and_then(Value::as_str) {
                        Some(name) => Err(ProtocolError::UnknownControl(name.to_string())),
                        None => Err(ProtocolError::InvalidPayload { kind, reason }),
                    }
                }
                Err(e) => Err(e),
            },
            "ping" => Ok(InboundMessage::Ping),
            other => Err(ProtocolError::UnknownType(other.to_string())),
        }
    }

    fn typed_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let data = self.data.clone().ok_or_else(|| ProtocolError::MissingData {
            kind: self.frame_type.clone(),
        })?;
        serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
            kind: self.frame_type.clone(),
            reason: e.to_string(),
        })
    }
}

/// Server → client frame.
/// Wire: `{ "type": "llm_chunk", "id": "...", "data": {...}, "metadata": {...} }`
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    #[serde(flatten)]
    pub message: OutboundMessage,
    pub id: String,
    pub metadata: Metadata,
}

impl OutboundFrame {
    pub fn new(message: OutboundMessage, metadata: Metadata) -> Self {
        Self {
            message,
            id: uuid::Uuid::new_v4().to_string(),
            metadata,
        }
    }

    /// Reply to a specific inbound message, echoing its id.
    pub fn reply(reply_to: impl Into<String>, message: OutboundMessage, metadata: Metadata) -> Self {
        Self {
            message,
            id: reply_to.into(),
            metadata,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
