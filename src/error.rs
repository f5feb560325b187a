use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BloomError>;

#[derive(Debug, Error)]
pub enum BloomError {
    #[error("API key not configured for {provider}")]
    MissingCredential { provider: String },

    #[error("invalid provider: {0}")]
    InvalidProvider(String),

    #[error("validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),

    #[error("{message}")]
    Analysis {
        message: String,
        details: Option<String>,
    },

    #[error("failed to parse PDF: {0}")]
    Extraction(String),

    #[error("no text could be extracted from the PDF; the document may contain only images or be password-protected")]
    NoExtractableText,

    #[error("language model error: {0}")]
    LanguageModel(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("prediction error: {0}")]
    Prediction(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BloomError {
    /// Stable machine-readable code surfaced to clients.
    pub fn code(&self) -> &'static str {
        match self {
            BloomError::MissingCredential { .. } => "MISSING_CREDENTIAL",
            BloomError::InvalidProvider(_) => "INVALID_PROVIDER",
            BloomError::Validation(_) => "VALIDATION_ERROR",
            BloomError::Analysis { .. } => "ANALYSIS_ERROR",
            BloomError::Extraction(_) | BloomError::NoExtractableText => "EXTRACTION_ERROR",
            BloomError::LanguageModel(_) => "LLM_ERROR",
            BloomError::Timeout(_) => "TIMEOUT",
            BloomError::Cancelled => "CANCELLED",
            BloomError::Prediction(_) => "PREDICTION_ERROR",
            BloomError::Storage(_) => "STORAGE_ERROR",
            BloomError::Config(_) => "CONFIG_ERROR",
            BloomError::Protocol(_) | BloomError::Serde(_) | BloomError::Io(_) => "INTERNAL_ERROR",
        }
    }

    /// Wraps any failure of the document pipeline into an `ANALYSIS_ERROR`.
    pub fn into_analysis(self) -> BloomError {
        match self {
            analysis @ BloomError::Analysis { .. } => analysis,
            other => BloomError::Analysis {
                message: other.to_string(),
                details: Some(format!("{other:?}")),
            },
        }
    }
}
