//! Engine error taxonomy.

use crate::store::StoreError;
use parley_protocol::codes;
use thiserror::Error;

/// The kind of an [`EngineError`], for callers that only branch on the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authorization,
    NotFound,
    Conflict,
    Store,
}

impl ErrorKind {
    /// Label used in logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authorization => "authorization",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Store => "store",
        }
    }

    /// Protocol error code for this kind.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            ErrorKind::Authorization => codes::UNAUTHORIZED,
            ErrorKind::NotFound => codes::NOT_FOUND,
            ErrorKind::Conflict => codes::CONFLICT,
            ErrorKind::Store => codes::STORE_FAILURE,
        }
    }
}

/// Failure of an engine operation. An operation that fails has applied
/// nothing and published nothing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The caller's identity does not permit the operation.
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    /// A referenced entity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// The operation collides with existing state.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The entity store rejected or failed the operation.
    #[error("Store failure: {0}")]
    Store(StoreError),
}

impl EngineError {
    pub(crate) fn unauthorized() -> Self {
        EngineError::Unauthorized("Not authorized".to_string())
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Unauthorized(_) => ErrorKind::Authorization,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::Store(_) => ErrorKind::Store,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => EngineError::NotFound(format!("{entity} {id}")),
            StoreError::UniqueViolation(what) => EngineError::Conflict(what),
            other => EngineError::Store(other),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
