use thiserror::Error;

/// Why a payload, or one object inside it, could not become a reading.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("malformed JSON payload: {0}")]
    MalformedPayload(String),

    #[error("unsupported payload shape: {0}")]
    UnsupportedShape(String),

    #[error("missing source ID: no '{key}' field and topic '{topic}' has no device segment")]
    MissingSourceId { key: String, topic: String },

    #[error("invalid source ID: {0}")]
    InvalidSourceId(String),

    #[error("missing timestamp: none of [{0}] present")]
    MissingTimestamp(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("invalid measurement '{field}': {reason}")]
    InvalidMeasurement { field: String, reason: String },
}

pub type NormalizeResult<T> = std::result::Result<T, NormalizeError>;
