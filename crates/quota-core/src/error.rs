//! Unified error handling for quota-core

use thiserror::Error;

use crate::models::Category;

/// Errors produced while turning command text into an intent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// No `<amount><unit>` pattern, or no category word next to it
    #[error("Unrecognized command format (try 'YouTube 2GB')")]
    UnrecognizedFormat,

    /// The category word is not a known alias
    #[error("Unknown category: {0}")]
    UnknownCategory(String),

    /// The amount does not fit in a byte counter
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

/// Errors produced by the bucket ledger
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
    /// Usage exceeds every eligible bucket combined
    #[error("Insufficient balance: requested {requested} bytes, {available} available")]
    InsufficientBalance { requested: u64, available: u64 },

    /// Arithmetic would leave the representable range
    #[error("Arithmetic overflow")]
    Overflow,

    /// Zero-byte top-ups and usage events are not committed
    #[error("Amount must be greater than zero")]
    ZeroAmount,

    /// The bucket layout has no bucket for this category
    #[error("No bucket configured for category {0}")]
    MissingBucket(Category),
}

/// Errors raised by the background persistence path
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Value out of range for storage: {0}")]
    OutOfRange(String),

    #[error("Corrupt record for user {user_id}: {reason}")]
    Corrupt { user_id: String, reason: String },
}

impl PersistenceError {
    /// Whether retrying the same write can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, PersistenceError::Database(_))
    }

    pub(crate) fn corrupt(user_id: &str, reason: impl Into<String>) -> Self {
        PersistenceError::Corrupt {
            user_id: user_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Core error type for quota-core
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Quota(#[from] QuotaError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for quota-core
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// The ledger error, if this is one
    pub fn as_quota(&self) -> Option<&QuotaError> {
        match self {
            Error::Quota(e) => Some(e),
            _ => None,
        }
    }

    /// The parser error, if this is one
    pub fn as_parse(&self) -> Option<&ParseError> {
        match self {
            Error::Parse(e) => Some(e),
            _ => None,
        }
    }
}

// Host shells receive plain strings
impl From<Error> for String {
    fn from(err: Error) -> Self {
        err.to_string()
    }
}
