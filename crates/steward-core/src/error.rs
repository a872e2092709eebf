// Steward Error Types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StewardError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Path not allowed: {0}")]
    PathNotAllowed(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Memory error: {0}")]
    Memory(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<String> for StewardError {
    fn from(err: String) -> Self {
        StewardError::InvalidConfig(err)
    }
}

pub type Result<T> = std::result::Result<T, StewardError>;
