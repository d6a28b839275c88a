/// Collaborative editing infrastructure
/// Revision logs, tree conflict handling and the session gateway built on docops
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use docops::{self, DocOp, DocOpBuilder, DocOpComponent, DocOpError};

mod config;
pub use config::*;

mod revision;
pub use revision::*;

mod edit_session;
pub use edit_session::*;

mod storage;
pub use storage::*;

mod tree;
pub use tree::*;

mod conflict;
pub use conflict::*;

mod chunks;
pub use chunks::*;

mod protocol;
pub use protocol::*;

mod presence;
pub use presence::*;

mod sync;
pub use sync::*;

mod client;
pub use client::*;

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("malformed operation: {0}")]
    MalformedOperation(String),

    #[error("incompatible operation: {0}")]
    IncompatibleOperation(String),

    #[error("base revision {base} is older than the compaction horizon {horizon}")]
    StaleBaseRevision { base: u64, horizon: u64 },

    #[error("base revision {base} is ahead of head revision {head}")]
    FutureBaseRevision { base: u64, head: u64 },

    #[error("resolution {choice:?} is not valid for conflict {handle}")]
    InvalidResolutionChoice {
        handle: ConflictHandle,
        choice: ResolutionChoice,
    },

    #[error("conflict {0} is already resolved")]
    ConflictAlreadyResolved(ConflictHandle),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("invalid tree mutation: {0}")]
    InvalidMutation(String),

    #[error("transient failure: {0}")]
    TransientFailure(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("configuration error: {0}")]
    ConfigError(String),
}

impl CollaborationError {
    /// Whether the same request may be sent again unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientFailure(_))
    }

    /// Stable code used in error messages sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedOperation(_) => "malformed_operation",
            Self::IncompatibleOperation(_) => "incompatible_operation",
            Self::StaleBaseRevision { .. } => "stale_base_revision",
            Self::FutureBaseRevision { .. } => "future_base_revision",
            Self::InvalidResolutionChoice { .. } => "invalid_resolution_choice",
            Self::ConflictAlreadyResolved(_) => "conflict_already_resolved",
            Self::ConflictNotFound(_) => "conflict_not_found",
            Self::InvalidMutation(_) => "invalid_mutation",
            Self::TransientFailure(_) => "transient_failure",
            Self::StorageError(_) => "storage_error",
            Self::SessionNotFound(_) => "session_not_found",
            Self::NetworkError(_) => "network_error",
            Self::SerializationError(_) => "serialization_error",
            Self::ConfigError(_) => "config_error",
        }
    }
}

impl From<DocOpError> for CollaborationError {
    fn from(err: DocOpError) -> Self {
        match err {
            DocOpError::MalformedOperation(msg) => Self::MalformedOperation(msg),
            DocOpError::IncompatibleOperation(msg) => Self::IncompatibleOperation(msg),
        }
    }
}

impl From<serde_json::Error> for CollaborationError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// Connected client identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientId(pub uuid::Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Workspace identifier, assigned by the workspace service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkspaceId(pub String);

impl From<&str> for WorkspaceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of one file's edit session within a workspace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileEditSessionKey(pub String);

impl From<&str> for FileEditSessionKey {
    fn from(key: &str) -> Self {
        Self(key.to_string())
    }
}

impl fmt::Display for FileEditSessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One document stream: the unit revision logs and locks are keyed by
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamKey {
    pub workspace_id: WorkspaceId,
    pub file_edit_session_key: FileEditSessionKey,
}

impl StreamKey {
    pub fn new(
        workspace_id: impl Into<WorkspaceId>,
        file_edit_session_key: impl Into<FileEditSessionKey>,
    ) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            file_edit_session_key: file_edit_session_key.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.workspace_id, self.file_edit_session_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docop_errors_keep_their_kind() {
        let err: CollaborationError = DocOpError::MalformedOperation("bad".to_string()).into();
        assert_eq!(err.code(), "malformed_operation");
        assert!(!err.is_retryable());

        let err = CollaborationError::TransientFailure("timeout".to_string());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_stream_key_display() {
        let key = StreamKey::new("ws-1", "file-9");
        assert_eq!(key.to_string(), "ws-1/file-9");
    }
}
