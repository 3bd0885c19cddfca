use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Remote store is not available")]
    Offline,

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Not authenticated")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Session invalid: {reason}")]
    SessionInvalid { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
