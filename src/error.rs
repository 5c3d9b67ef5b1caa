// src/error.rs
// Standardized error types for LabLink

use thiserror::Error;

/// Main error type for the LabLink library
#[derive(Error, Debug)]
pub enum LabLinkError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unknown error: {0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Convenience type alias for Result using LabLinkError
pub type Result<T> = std::result::Result<T, LabLinkError>;

impl From<String> for LabLinkError {
    fn from(s: String) -> Self {
        LabLinkError::Other(s)
    }
}

impl From<LabLinkError> for String {
    fn from(err: LabLinkError) -> Self {
        err.to_string()
    }
}
