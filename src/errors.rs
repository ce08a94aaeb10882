use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("STORAGE_FAILURE: {0}")]
    Storage(String),
    #[error("VALIDATION_FAILED: {0}")]
    Validation(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("UNSUPPORTED: {0}")]
    Unsupported(String),
    #[error("CLASSIFICATION_FAILED: {0}")]
    Classification(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl From<std::io::Error> for EngineError {
    fn from(value: std::io::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
