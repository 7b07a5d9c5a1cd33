//! `convoy-agent`: everything that talks to a language model.
//!
//! - [`engine::ConversationEngine`]: the cancellable fragment producer the
//!   gateway drives once per generation.
//! - [`provider::LlmProvider`] and the Anthropic implementation behind it.
//! - [`compact::CompactionService`]: token-triggered history summarization.

pub mod anthropic;
pub mod anthropic_stream;
pub mod compact;
pub mod engine;
pub mod provider;
pub mod stream;
pub mod tools;

pub use compact::{CompactionError, CompactionResult, CompactionService, CompactionStatus};
pub use engine::{
    ConversationEngine, EngineError, EngineEvent, GenerationOutcome, GenerationRequest,
    ProviderEngine, UnconfiguredEngine,
};
pub use provider::{LlmProvider, ProviderError};
