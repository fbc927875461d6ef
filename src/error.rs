//! Error types for harvest-rs.
//!
//! Every variant maps to an [`ErrorClass`]. Retry, requeue and drop
//! decisions are made on the class, never on error text.

use thiserror::Error;

/// Postgres SQLSTATE for a detected deadlock.
const SQLSTATE_DEADLOCK: &str = "40P01";
/// Postgres SQLSTATE for a serialization failure.
const SQLSTATE_SERIALIZATION: &str = "40001";

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("api returned status {status} for {url}")]
    Api { status: u16, url: String },

    #[error("transport failure for {url}: {message}")]
    Transport { url: String, message: String },

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    #[error("invalid parameter for {operation}: {message}")]
    InvalidParameter { operation: String, message: String },

    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("storage conflict: {0}")]
    StorageConflict(String),

    #[error("storage error: {0}")]
    Storage(sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Failure classes of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// 5xx or network failure. Retried inside the transport.
    TransientServer,
    /// Upstream rate limit exceeded. Retried after an explicit cool-down.
    RateLimited,
    /// Any other 4xx. Returned unretried.
    ClientError,
    /// 401/403/404 against a specific target. The caller applies a target cool-down.
    PermanentAuth,
    /// Deadlock or serialization failure. Retried transparently.
    StorageConflict,
    /// Non-retryable storage failure.
    StorageFatal,
    /// Malformed payload. Logged and dropped.
    Decode,
    /// Misconfiguration or programming error.
    Fatal,
}

impl ErrorClass {
    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            0 => Some(Self::TransientServer),
            401 | 403 | 404 => Some(Self::PermanentAuth),
            420 | 429 => Some(Self::RateLimited),
            400..=499 => Some(Self::ClientError),
            500..=599 => Some(Self::TransientServer),
            _ => None,
        }
    }
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::Api { status, .. } => {
                ErrorClass::from_status(*status).unwrap_or(ErrorClass::ClientError)
            }
            Error::Transport { .. } => ErrorClass::TransientServer,
            Error::Decode(_) | Error::InvalidParameter { .. } => ErrorClass::Decode,
            Error::StorageConflict(_) => ErrorClass::StorageConflict,
            Error::Storage(_) | Error::Migration(_) => ErrorClass::StorageFatal,
            Error::Config(_)
            | Error::UnknownOperation(_)
            | Error::UnknownTopic(_)
            | Error::Io(_)
            | Error::Other(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::StorageConflict
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        let conflict = match &err {
            sqlx::Error::Database(db) => matches!(
                db.code().as_deref(),
                Some(SQLSTATE_DEADLOCK) | Some(SQLSTATE_SERIALIZATION)
            ),
            _ => false,
        };
        if conflict {
            Error::StorageConflict(err.to_string())
        } else {
            Error::Storage(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
