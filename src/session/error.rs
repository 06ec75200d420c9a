//! Session-level error taxonomy. The HTTP surface maps each variant onto
//! exactly one status code.

use thiserror::Error;

use crate::agent::AgentError;
use crate::storage::StorageError;
use crate::workspace::WorkspaceError;

#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed caller input (user id, subdir, empty message).
    #[error("{0}")]
    InvalidInput(String),

    /// Session id not in the store, or resume target absent/closed.
    #[error("session not found: {0}")]
    NotFound(String),

    /// A chat turn is already in progress for this session.
    #[error("session {0} is busy processing another request")]
    Busy(String),

    /// Would breach the per-user live client cap.
    #[error("{0}")]
    QuotaExceeded(String),

    /// Would breach a fleet-wide cap (sessions, memory, concurrent turns).
    #[error("{0}")]
    Overloaded(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("agent failure: {0}")]
    Agent(#[from] AgentError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<WorkspaceError> for SessionError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::InvalidInput(msg) => SessionError::InvalidInput(msg),
            WorkspaceError::PathEscape(msg) => {
                SessionError::InvalidInput(format!("path escape: {msg}"))
            }
            WorkspaceError::Io(err) => SessionError::Internal(format!("workspace io: {err}")),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
