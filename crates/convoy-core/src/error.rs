use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConvoyError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Missing required context: {0}")]
    MissingContext(&'static str),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown control command: {0}")]
    UnknownControl(String),

    #[error("Generation already in progress for conversation {conversation}")]
    GenerationBusy { conversation: String },

    #[error("Compaction failed: {0}")]
    Compaction(String),

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ConvoyError {
    /// Short error code string sent to clients in outbound `error` messages.
    pub fn code(&self) -> &'static str {
        match self {
            ConvoyError::Config(_) => "CONFIG_ERROR",
            ConvoyError::AuthFailed(_) => "AUTH_FAILED",
            ConvoyError::MissingContext(_) => "MISSING_CONTEXT",
            ConvoyError::Protocol(_) => "INVALID_MESSAGE",
            ConvoyError::UnknownControl(_) => "UNKNOWN_CONTROL",
            ConvoyError::GenerationBusy { .. } => "GENERATION_BUSY",
            ConvoyError::Compaction(_) => "COMPACTION_FAILED",
            ConvoyError::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            ConvoyError::Serialization(_) => "INVALID_MESSAGE",
            ConvoyError::Io(_) => "IO_ERROR",
            ConvoyError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the client can keep using the connection after this error.
    pub fn recoverable(&self) -> bool {
        !matches!(
            self,
            ConvoyError::AuthFailed(_) | ConvoyError::MissingContext(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ConvoyError>;
