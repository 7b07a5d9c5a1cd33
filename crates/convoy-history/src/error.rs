use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The blocking task that touched the durable medium panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, HistoryError>;
