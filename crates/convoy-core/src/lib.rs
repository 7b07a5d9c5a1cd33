//! Shared building blocks for the convoy gateway: configuration, id types,
//! and the top-level error enum.

pub mod config;
pub mod error;
pub mod types;

pub use error::{ConvoyError, Result};
pub use types::{ConnId, ConversationKey, GenerationId, SessionId, TokenUsage};
