use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Integrity error: {0}")]
    Integrity(String),
    #[error("Invariant violation: {0}")]
    Invariant(String),
    #[error("Permission denied: {0}")]
    Permission(String),
    #[error("Not supported: {0}")]
    NotSupported(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Transient provider error: {0}")]
    TransientProvider(String),
    #[error("Provider error: {0}")]
    PermanentProvider(String),
    #[error("SQL driver error: {0}")]
    Sql(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
}

impl EngineError {
    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientProvider(_))
    }
}

impl From<OpenAIError> for EngineError {
    fn from(err: OpenAIError) -> Self {
        match err {
            // Network level failures may resolve on retry; everything the API
            // itself rejected is permanent.
            OpenAIError::Reqwest(e) => Self::TransientProvider(e.to_string()),
            OpenAIError::StreamError(e) => Self::TransientProvider(e.to_string()),
            other => Self::PermanentProvider(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_only_covers_provider_timeouts() {
        assert!(EngineError::TransientProvider("timeout".into()).is_transient());
        assert!(!EngineError::Validation("empty batch".into()).is_transient());
        assert!(!EngineError::PermanentProvider("bad request".into()).is_transient());
    }
}
