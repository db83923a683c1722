use thiserror::Error;
use ulid::Ulid;

use crate::lifecycle::LifecycleError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("email already registered: {0}")]
    EmailTaken(String),
    /// Carries the id of the active booking that overlaps the request.
    #[error("conflict with booking: {0}")]
    Conflict(Ulid),
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
    #[error("internal error: {0}")]
    Internal(String),
}
