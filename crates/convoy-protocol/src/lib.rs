//! Wire protocol for the conversation channel.
//!
//! Both directions use the same envelope: `{ type, id, data?, metadata? }`.
//! Inbound frames are validated into [`messages::InboundMessage`] at the
//! boundary; nothing past the gateway's read loop sees raw JSON.

pub mod error;
pub mod frames;
pub mod handshake;
pub mod messages;

pub use error::ProtocolError;
pub use frames::{InboundFrame, Metadata, OutboundFrame};
pub use messages::{
    ControlCommand, ControlResponse, ErrorPayload, GenerationState, InboundMessage, LlmChunk,
    LlmComplete, Notification, OutboundMessage, StatusUpdate, TodoItem, TodoStatus, TodoUpdate,
    ToolCallEvent, ToolResultEvent, ToolStatus, UserMessage,
};
