//! Error types for the SMS extraction pipeline

use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, ExtractionError>;

#[derive(Error, Debug)]
pub enum ExtractionError {

    // =============================
    // Extraction Pipeline Errors
    // =============================

    #[error("LLM endpoint unavailable: {0}")]
    LlmUnavailable(String),

    #[error("LLM returned malformed response: {0}")]
    LlmMalformedResponse(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing essential fields: {0}")]
    MissingEssentialFields(String),

    #[error("Parsing error: {0}")]
    ParsingError(String),

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Permanent upstream rejection (status {status}): {body}")]
    PermanentRejection { status: u16, body: String },

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ExtractionError {
    /// Transient errors are retried with backoff; permanent errors go
    /// straight to the dead-letter set.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            ExtractionError::ValidationError(_)
                | ExtractionError::MissingEssentialFields(_)
                | ExtractionError::ParsingError(_)
                | ExtractionError::PermanentRejection { .. }
        )
    }
}
