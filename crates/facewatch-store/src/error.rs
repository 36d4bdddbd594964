use facewatch_core::{CompareError, ProviderError, SinkError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity name must not be empty")]
    EmptyName,
    #[error("no identity named {0:?}")]
    UnknownIdentity(String),
    #[error("face already registered as {identity:?} (confidence {confidence:.3})")]
    DuplicateFace { identity: String, confidence: f32 },
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(#[from] CompareError),
    #[error("embedding is all zeros; the encoder could not read the face")]
    DegenerateEmbedding,
    #[error(transparent)]
    Setting(#[from] ProviderError),
    #[error("invalid database value: {0}")]
    InvalidDbValue(String),
    #[error("database connection lock poisoned")]
    Poisoned,
}

impl From<StoreError> for ProviderError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Setting(inner) => inner,
            other => ProviderError::Unavailable(other.to_string()),
        }
    }
}

impl From<StoreError> for SinkError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Json(inner) => SinkError::Rejected(inner.to_string()),
            other => SinkError::Unavailable(other.to_string()),
        }
    }
}
