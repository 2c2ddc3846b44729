//! Error types for the collaboration crate.

use crate::ids::SessionId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for collaboration operations.
pub type CollabResult<T> = Result<T, CollabError>;

/// Errors that can occur in the synchronization core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    /// The operation does not span the document it is applied to.
    #[error("Length mismatch: operation spans {expected} characters, document has {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    /// Structurally invalid operation (zero-length component, bad composition, ...).
    #[error("Malformed operation: {0}")]
    MalformedOperation(String),

    /// The client's base version is older than the retained history.
    #[error("Stale client: base version {base_version} predates oldest retained version {oldest_available}")]
    StaleClient {
        base_version: u64,
        oldest_available: u64,
    },

    /// The client claims a version the server has not produced yet.
    #[error("Base version {base_version} is ahead of current version {current}")]
    FutureVersion { base_version: u64, current: u64 },

    /// Connection dropped or could not be established.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An observer callback failed.
    #[error("Listener error: {0}")]
    Listener(String),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The session is no longer running.
    #[error("Session closed: {0}")]
    SessionClosed(SessionId),

    /// A message arrived on a connection that has not joined a session.
    #[error("Connection has not joined a session")]
    NotJoined,

    /// The session already holds its maximum number of connections.
    #[error("Session is full (max: {max})")]
    SessionFull { max: usize },

    /// Persisting or loading a document failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl CollabError {
    /// Wire error code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            CollabError::LengthMismatch { .. }
            | CollabError::MalformedOperation(_)
            | CollabError::FutureVersion { .. } => ErrorCode::MalformedOperation,
            CollabError::StaleClient { .. } => ErrorCode::StaleClient,
            CollabError::NotJoined => ErrorCode::NotJoined,
            CollabError::SessionFull { .. } => ErrorCode::SessionFull,
            CollabError::Serialization(_) => ErrorCode::InvalidMessage,
            CollabError::Transport(_)
            | CollabError::Listener(_)
            | CollabError::SessionClosed(_)
            | CollabError::Storage(_) => ErrorCode::Internal,
        }
    }
}

impl From<crate::store::StoreError> for CollabError {
    fn from(err: crate::store::StoreError) -> Self {
        CollabError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(err: serde_json::Error) -> Self {
        CollabError::Serialization(err.to_string())
    }
}

/// Error codes carried by `error` messages on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    MalformedOperation,
    StaleClient,
    NotJoined,
    SessionFull,
    InvalidMessage,
    Internal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(
            CollabError::LengthMismatch { expected: 3, actual: 4 }.code(),
            ErrorCode::MalformedOperation
        );
        assert_eq!(
            CollabError::StaleClient { base_version: 1, oldest_available: 10 }.code(),
            ErrorCode::StaleClient
        );
    }

    #[test]
    fn test_error_code_wire_format() {
        let json = serde_json::to_string(&ErrorCode::StaleClient).unwrap();
        assert_eq!(json, "\"stale_client\"");
    }
}
