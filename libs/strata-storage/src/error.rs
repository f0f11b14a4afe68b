//! Storage errors.

use mongodb::error::ErrorKind;
use strata_query::QueryError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by every backend.
///
/// [`StorageError::NotFound`] is the only variant callers are expected to
/// branch on; everything else is a failure to propagate.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{kind} '{id}' not found")]
    NotFound { kind: String, id: String },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("invalid query: {0}")]
    InvalidQuery(#[from] QueryError),

    #[error("invalid kind '{0}': expected [A-Za-z_][A-Za-z0-9_]* of at most 63 bytes")]
    InvalidKind(String),

    #[error("invalid id '{0}'")]
    InvalidId(String),

    #[error("cannot decode {kind} '{id}': {message}")]
    Serialization {
        kind: String,
        id: String,
        message: String,
    },

    #[error("storage has been disposed")]
    Disposed,

    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl StorageError {
    #[must_use]
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    #[must_use]
    pub fn serialization(
        kind: impl Into<String>,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Serialization {
            kind: kind.into(),
            id: id.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed => Self::BackendUnavailable(err.to_string()),
            other => Self::Backend(other.to_string()),
        }
    }
}

impl From<mongodb::error::Error> for StorageError {
    fn from(err: mongodb::error::Error) -> Self {
        if matches!(
            *err.kind,
            ErrorKind::Io(_) | ErrorKind::ServerSelection { .. }
        ) {
            Self::BackendUnavailable(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}

impl From<redb::Error> for StorageError {
    fn from(err: redb::Error) -> Self {
        match err {
            redb::Error::DatabaseAlreadyOpen | redb::Error::Io(_) => {
                Self::BackendUnavailable(err.to_string())
            }
            other => Self::Backend(other.to_string()),
        }
    }
}

/// Errors converting an entity to or from its raw form.
#[derive(Debug, Error)]
pub enum EntityError {
    #[error("raw form must be a JSON object")]
    NotAnObject,

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
