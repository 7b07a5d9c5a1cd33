use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("message type '{kind}' requires a data payload")]
    MissingData { kind: String },

    #[error("invalid '{kind}' payload: {reason}")]
    InvalidPayload { kind: String, reason: String },

    #[error("unknown control command: {0}")]
    UnknownControl(String),

    #[error("missing required parameter: {0}")]
    MissingParam(&'static str),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            ProtocolError::UnknownType(_) => "UNKNOWN_MESSAGE_TYPE",
            ProtocolError::UnknownControl(_) => "UNKNOWN_CONTROL",
            ProtocolError::MissingParam(_) => "MISSING_CONTEXT",
            _ => "INVALID_MESSAGE",
        }
    }
}
