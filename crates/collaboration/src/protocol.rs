/// Messages exchanged between clients and the sync gateway
use serde::{Deserialize, Serialize};

use docops::DocOp;

use crate::{
    ClientId, ConflictHandle, DocumentSelection, FileEditSessionKey, FileSnapshot, Mutation,
    NodeConflict, ResolutionChoice, WorkspaceId,
};

/// Client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "join")]
    Join {
        workspace_id: WorkspaceId,
        name: String,
    },

    /// Open a file's edit session, creating it with `initial_contents` if new
    #[serde(rename = "open_file")]
    OpenFile {
        workspace_id: WorkspaceId,
        file_edit_session_key: FileEditSessionKey,
        path: String,
        #[serde(default)]
        initial_contents: String,
    },

    /// Submit an edit. Resending with the same base revision is safe: the
    /// server acks the revision it already recorded.
    #[serde(rename = "submit_op")]
    SubmitOp {
        workspace_id: WorkspaceId,
        file_edit_session_key: FileEditSessionKey,
        base_revision: u64,
        op: DocOp,

        /// The author's selection right after the edit
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<DocumentSelection>,
    },

    /// Ask for everything after `current_revision`. A client with an
    /// unacked operation sends its base as `current_revision` and the
    /// operation as `resend`.
    #[serde(rename = "recover_missed")]
    RecoverMissed {
        workspace_id: WorkspaceId,
        file_edit_session_key: FileEditSessionKey,
        current_revision: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        resend: Option<DocOp>,
    },

    /// Share a cursor move that came without an edit
    #[serde(rename = "update_selection")]
    UpdateSelection {
        workspace_id: WorkspaceId,
        file_edit_session_key: FileEditSessionKey,
        base_revision: u64,
        selection: DocumentSelection,
    },

    #[serde(rename = "save_file")]
    SaveFile {
        workspace_id: WorkspaceId,
        file_edit_session_key: FileEditSessionKey,
    },

    #[serde(rename = "submit_tree_mutation")]
    SubmitTreeMutation {
        workspace_id: WorkspaceId,
        base_revision: u64,
        mutations: Vec<Mutation>,
    },

    #[serde(rename = "resolve_conflict")]
    ResolveConflict {
        workspace_id: WorkspaceId,
        conflict_handle: ConflictHandle,
        resolution_choice: ResolutionChoice,
    },

    #[serde(rename = "get_participants")]
    GetParticipants { workspace_id: WorkspaceId },

    #[serde(rename = "keep_alive")]
    KeepAlive { workspace_id: WorkspaceId },

    #[serde(rename = "leave")]
    Leave { workspace_id: WorkspaceId },
}

/// Server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "joined")]
    Joined {
        workspace_id: WorkspaceId,
        client_id: ClientId,
        tree_revision: u64,
    },

    #[serde(rename = "file_opened")]
    FileOpened { snapshot: FileSnapshot },

    /// Sent to the author in place of the broadcast
    #[serde(rename = "operation_ack")]
    OperationAck {
        workspace_id: WorkspaceId,
        file_edit_session_key: FileEditSessionKey,
        applied_revision: u64,
    },

    #[serde(rename = "broadcast_op")]
    BroadcastOp {
        workspace_id: WorkspaceId,
        file_edit_session_key: FileEditSessionKey,
        applied_revision: u64,
        op: DocOp,
        author_client_id: ClientId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        selection: Option<DocumentSelection>,
    },

    /// `composed_op` covers everything after the requested revision;
    /// `operations` lists the same revisions one by one with their authors
    #[serde(rename = "recover_missed_response")]
    RecoverMissedResponse {
        workspace_id: WorkspaceId,
        file_edit_session_key: FileEditSessionKey,
        composed_op: DocOp,
        new_revision: u64,
        #[serde(default)]
        operations: Vec<RecoveredOp>,
    },

    #[serde(rename = "selection_changed")]
    SelectionChanged {
        workspace_id: WorkspaceId,
        file_edit_session_key: FileEditSessionKey,
        revision: u64,
        client_id: ClientId,
        selection: DocumentSelection,
    },

    #[serde(rename = "file_saved")]
    FileSaved {
        workspace_id: WorkspaceId,
        file_edit_session_key: FileEditSessionKey,
        saved_revision: u64,
        sha: String,
    },

    #[serde(rename = "tree_mutation_accepted")]
    TreeMutationAccepted {
        workspace_id: WorkspaceId,
        tree_revision: u64,
    },

    #[serde(rename = "workspace_tree_update")]
    WorkspaceTreeUpdate {
        workspace_id: WorkspaceId,
        tree_revision: u64,
        mutations: Vec<Mutation>,
        author_client_id: ClientId,
    },

    #[serde(rename = "tree_conflict_notice")]
    TreeConflictNotice {
        workspace_id: WorkspaceId,
        conflicts: Vec<NodeConflict>,
    },

    #[serde(rename = "conflict_resolved")]
    ConflictResolved {
        workspace_id: WorkspaceId,
        conflict: NodeConflict,
        tree_revision: u64,
    },

    #[serde(rename = "participants")]
    Participants {
        workspace_id: WorkspaceId,
        participants: Vec<ParticipantInfo>,
    },

    #[serde(rename = "participant_joined")]
    ParticipantJoined {
        workspace_id: WorkspaceId,
        participant: ParticipantInfo,
    },

    #[serde(rename = "participant_left")]
    ParticipantLeft {
        workspace_id: WorkspaceId,
        client_id: ClientId,
    },

    #[serde(rename = "pong")]
    Pong,

    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl From<&crate::CollaborationError> for ServerMessage {
    fn from(err: &crate::CollaborationError) -> Self {
        ServerMessage::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }
}

/// One revision in a recovery response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveredOp {
    pub applied_revision: u64,
    pub op: DocOp,
    pub author_client_id: ClientId,
}

/// Public view of a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub client_id: ClientId,
    pub name: String,
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use docops::DocOpBuilder;

    #[test]
    fn test_client_message_json_shape() {
        let message = ClientMessage::SubmitOp {
            workspace_id: WorkspaceId::from("ws"),
            file_edit_session_key: FileEditSessionKey::from("doc"),
            base_revision: 3,
            op: DocOpBuilder::new().retain(2, false).insert("x").build(),
            selection: None,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "submit_op");
        assert_eq!(json["base_revision"], 3);
        assert_eq!(json["op"][1]["type"], "insert");
        assert!(json.get("selection").is_none());

        let back: ClientMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_optional_fields_default() {
        let json = r#"{"type":"recover_missed","workspace_id":"ws",
            "file_edit_session_key":"doc","current_revision":4}"#;
        match serde_json::from_str::<ClientMessage>(json).unwrap() {
            ClientMessage::RecoverMissed {
                current_revision,
                resend,
                ..
            } => {
                assert_eq!(current_revision, 4);
                assert!(resend.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        let json = r#"{"type":"submit_op","workspace_id":"ws","file_edit_session_key":"doc",
            "base_revision":0,"op":[{"type":"insert","text":"a"}],
            "selection":{"base":{"line":0,"column":1},"cursor":{"line":0,"column":1}}}"#;
        match serde_json::from_str::<ClientMessage>(json).unwrap() {
            ClientMessage::SubmitOp { selection, .. } => {
                assert!(selection.is_some_and(|s| s.is_caret()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_invalid_op_rejected_on_decode() {
        let json = r#"{"type":"submit_op","workspace_id":"ws","file_edit_session_key":"doc",
            "base_revision":0,"op":[{"type":"retain","count":0,"has_trailing_newline":false}]}"#;
        assert!(serde_json::from_str::<ClientMessage>(json).is_err());
    }

    #[test]
    fn test_error_message_from_error() {
        let err = crate::CollaborationError::StaleBaseRevision {
            base: 1,
            horizon: 10,
        };
        match ServerMessage::from(&err) {
            ServerMessage::Error {
                code, retryable, ..
            } => {
                assert_eq!(code, "stale_base_revision");
                assert!(!retryable);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
