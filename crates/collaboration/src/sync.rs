/// Session gateway
/// Routes client messages to revision logs, the workspace tree and the participant registry
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

use docops::DocOp;

use crate::{
    detect_conflicts, rebase_path, ClientId, ClientMessage, CollabConfig, CollaborationError,
    ConflictHandle, ConflictRegistry, DocumentSelection, FileEditSession, FileEditSessionKey,
    FileSnapshot, JsonFileStore, MemoryStore, Mutation, MutationType, NodeConflict,
    ParticipantRegistry, RecoveredOp, ResolutionChoice, Result, RevisionEntry, RevisionLog,
    RevisionStore, RevisionType, ServerMessage, StorageBackend, StreamKey, WorkspaceId,
    WorkspaceTree,
};

/// Tree and conflicts of one workspace, guarded together
#[derive(Debug, Default)]
struct WorkspaceState {
    tree: WorkspaceTree,
    conflicts: ConflictRegistry,
}

/// What a client missed, composed and one revision at a time
#[derive(Debug, Clone, PartialEq)]
pub struct Recovery {
    pub composed_op: DocOp,
    pub new_revision: u64,
    pub operations: Vec<RecoveredOp>,
}

/// Result of submitting a batch of tree mutations
#[derive(Debug, Clone, PartialEq)]
pub enum TreeSubmission {
    Accepted { tree_revision: u64 },
    Conflicts(Vec<NodeConflict>),
}

/// Server side of the sync protocol.
///
/// Each document stream has its own lock, held across rebasing, persisting
/// and broadcasting, so appends to one stream are strictly serialized while
/// different streams proceed in parallel.
pub struct SyncGateway {
    config: CollabConfig,
    store: Arc<dyn RevisionStore>,
    participants: Arc<ParticipantRegistry>,
    connections: RwLock<HashMap<ClientId, mpsc::UnboundedSender<ServerMessage>>>,
    sessions: RwLock<HashMap<StreamKey, Arc<Mutex<FileEditSession>>>>,
    workspaces: RwLock<HashMap<WorkspaceId, Arc<Mutex<WorkspaceState>>>>,

    /// Saved revisions of evicted sessions, restored when they are reopened
    saved_revisions: RwLock<HashMap<StreamKey, u64>>,
}

impl SyncGateway {
    pub fn new(
        config: CollabConfig,
        store: Arc<dyn RevisionStore>,
        participants: Arc<ParticipantRegistry>,
    ) -> Self {
        Self {
            config,
            store,
            participants,
            connections: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            workspaces: RwLock::new(HashMap::new()),
            saved_revisions: RwLock::new(HashMap::new()),
        }
    }

    /// Build a gateway with the store selected by `config.storage`
    pub fn from_config(config: CollabConfig) -> Self {
        let store: Arc<dyn RevisionStore> = match config.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::JsonFile => Arc::new(JsonFileStore::new(&config.storage.data_dir)),
        };
        Self::new(config, store, Arc::new(ParticipantRegistry::new()))
    }

    pub fn config(&self) -> &CollabConfig {
        &self.config
    }

    pub fn participants(&self) -> &Arc<ParticipantRegistry> {
        &self.participants
    }

    /// Register a connected client's outgoing channel
    pub async fn connect(&self, client_id: ClientId, tx: mpsc::UnboundedSender<ServerMessage>) {
        self.connections.write().await.insert(client_id, tx);
        tracing::debug!("client {} connected", client_id);
    }

    /// Drop a client from every workspace and forget its acknowledgements
    pub async fn disconnect(&self, client_id: &ClientId) {
        self.connections.write().await.remove(client_id);
        for workspace_id in self.participants.disconnect(client_id).await {
            self.forget_client(&workspace_id, client_id).await;
            self.evict_if_empty(&workspace_id).await;
        }
        tracing::debug!("client {} disconnected", client_id);
    }

    /// Process one client message and return the direct replies.
    ///
    /// Messages for other participants, and the author's `OperationAck`,
    /// go through the participant registry so they stay in revision order.
    pub async fn handle(&self, client_id: ClientId, message: ClientMessage) -> Vec<ServerMessage> {
        match self.dispatch(client_id, message).await {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!("request from {} failed: {}", client_id, e);
                vec![ServerMessage::from(&e)]
            }
        }
    }

    async fn dispatch(
        &self,
        client_id: ClientId,
        message: ClientMessage,
    ) -> Result<Vec<ServerMessage>> {
        match message {
            ClientMessage::Join { workspace_id, name } => {
                let tree_revision = self.join(client_id, &workspace_id, name).await?;
                Ok(vec![ServerMessage::Joined {
                    workspace_id,
                    client_id,
                    tree_revision,
                }])
            }

            ClientMessage::OpenFile {
                workspace_id,
                file_edit_session_key,
                path,
                initial_contents,
            } => {
                self.require_member(&workspace_id, &client_id).await?;
                let snapshot = self
                    .open_file(
                        client_id,
                        StreamKey::new(workspace_id, file_edit_session_key),
                        path,
                        &initial_contents,
                    )
                    .await?;
                Ok(vec![ServerMessage::FileOpened { snapshot }])
            }

            ClientMessage::SubmitOp {
                workspace_id,
                file_edit_session_key,
                base_revision,
                op,
                selection,
            } => {
                self.require_member(&workspace_id, &client_id).await?;
                self.submit_operation_with_selection(
                    client_id,
                    &workspace_id,
                    &file_edit_session_key,
                    base_revision,
                    op,
                    selection,
                )
                .await?;
                Ok(Vec::new())
            }

            ClientMessage::RecoverMissed {
                workspace_id,
                file_edit_session_key,
                current_revision,
                resend,
            } => {
                self.require_member(&workspace_id, &client_id).await?;
                let recovery = self
                    .recover_with_resend(
                        client_id,
                        &workspace_id,
                        &file_edit_session_key,
                        current_revision,
                        resend,
                    )
                    .await?;
                Ok(vec![ServerMessage::RecoverMissedResponse {
                    workspace_id,
                    file_edit_session_key,
                    composed_op: recovery.composed_op,
                    new_revision: recovery.new_revision,
                    operations: recovery.operations,
                }])
            }

            ClientMessage::UpdateSelection {
                workspace_id,
                file_edit_session_key,
                base_revision,
                selection,
            } => {
                self.require_member(&workspace_id, &client_id).await?;
                self.update_selection(
                    client_id,
                    &workspace_id,
                    &file_edit_session_key,
                    base_revision,
                    selection,
                )
                .await?;
                Ok(Vec::new())
            }

            ClientMessage::SaveFile {
                workspace_id,
                file_edit_session_key,
            } => {
                self.require_member(&workspace_id, &client_id).await?;
                let (saved_revision, sha) =
                    self.save_file(&workspace_id, &file_edit_session_key).await?;
                Ok(vec![ServerMessage::FileSaved {
                    workspace_id,
                    file_edit_session_key,
                    saved_revision,
                    sha,
                }])
            }

            ClientMessage::SubmitTreeMutation {
                workspace_id,
                base_revision,
                mutations,
            } => {
                self.require_member(&workspace_id, &client_id).await?;
                let reply = match self
                    .submit_tree_mutation(client_id, &workspace_id, base_revision, mutations)
                    .await?
                {
                    TreeSubmission::Accepted { tree_revision } => {
                        ServerMessage::TreeMutationAccepted {
                            workspace_id,
                            tree_revision,
                        }
                    }
                    TreeSubmission::Conflicts(conflicts) => ServerMessage::TreeConflictNotice {
                        workspace_id,
                        conflicts,
                    },
                };
                Ok(vec![reply])
            }

            ClientMessage::ResolveConflict {
                workspace_id,
                conflict_handle,
                resolution_choice,
            } => {
                self.require_member(&workspace_id, &client_id).await?;
                let (conflict, tree_revision) = self
                    .resolve_conflict(client_id, &workspace_id, conflict_handle, resolution_choice)
                    .await?;
                Ok(vec![ServerMessage::ConflictResolved {
                    workspace_id,
                    conflict,
                    tree_revision,
                }])
            }

            ClientMessage::GetParticipants { workspace_id } => {
                self.require_member(&workspace_id, &client_id).await?;
                let participants = self.participants.participants(&workspace_id).await;
                Ok(vec![ServerMessage::Participants {
                    workspace_id,
                    participants,
                }])
            }

            ClientMessage::KeepAlive { workspace_id } => {
                self.participants.keep_alive(&workspace_id, &client_id).await?;
                Ok(vec![ServerMessage::Pong])
            }

            ClientMessage::Leave { workspace_id } => {
                if self.participants.leave(&workspace_id, &client_id).await {
                    self.forget_client(&workspace_id, &client_id).await;
                    self.evict_if_empty(&workspace_id).await;
                }
                Ok(Vec::new())
            }
        }
    }

    /// Add a connected client to a workspace; returns the current tree revision
    pub async fn join(
        &self,
        client_id: ClientId,
        workspace_id: &WorkspaceId,
        name: String,
    ) -> Result<u64> {
        let tx = self
            .connections
            .read()
            .await
            .get(&client_id)
            .cloned()
            .ok_or_else(|| {
                CollaborationError::SessionNotFound(format!("client {} is not connected", client_id))
            })?;

        self.participants
            .join(workspace_id, client_id, name, tx)
            .await;
        let workspace = self.workspace(workspace_id).await;
        let revision = workspace.lock().await.tree.revision();
        Ok(revision)
    }

    /// Open a file's edit session, creating or reloading its stream as needed
    pub async fn open_file(
        &self,
        client_id: ClientId,
        key: StreamKey,
        path: String,
        initial_contents: &str,
    ) -> Result<FileSnapshot> {
        let existing = self.sessions.read().await.get(&key).cloned();
        let session = match existing {
            Some(session) => session,
            None => {
                // Loading happens outside the map lock; a racing open of the
                // same stream loads the same data and the first insert wins
                self.bounded("create", self.store.create(&key, initial_contents))
                    .await?;
                let stored = self
                    .bounded("load", self.store.load(&key))
                    .await?
                    .ok_or_else(|| {
                        CollaborationError::StorageError(format!("stream {} vanished", key))
                    })?;
                let log = RevisionLog::restore(key.clone(), &stored.initial_contents, stored.entries)?;
                tracing::info!("opened {} at revision {}", key, log.head());
                let saved = self.saved_revisions.write().await.remove(&key);

                let mut sessions = self.sessions.write().await;
                sessions
                    .entry(key.clone())
                    .or_insert_with(|| {
                        let mut session = FileEditSession::new(path, log);
                        if let Some(saved) = saved {
                            session.restore_saved_revision(saved);
                        }
                        Arc::new(Mutex::new(session))
                    })
                    .clone()
            }
        };

        let mut session = session.lock().await;
        self.ensure_fresh(&mut session).await?;
        let head = session.log().head();
        session.log_mut().acknowledge(client_id, head);
        Ok(session.snapshot())
    }

    /// Rebase, persist and record one operation, then fan it out.
    ///
    /// Nothing is recorded if persistence fails or times out; the error is
    /// then retryable with the same base revision. A resend of an operation
    /// that was recorded after all is acked again and not applied twice.
    pub async fn submit_operation(
        &self,
        client_id: ClientId,
        workspace_id: &WorkspaceId,
        file_edit_session_key: &FileEditSessionKey,
        base_revision: u64,
        op: DocOp,
    ) -> Result<u64> {
        self.submit_operation_with_selection(
            client_id,
            workspace_id,
            file_edit_session_key,
            base_revision,
            op,
            None,
        )
        .await
    }

    /// `submit_operation` with the author's selection after the edit; the
    /// selection is rebased onto the head and shared with the broadcast
    pub async fn submit_operation_with_selection(
        &self,
        client_id: ClientId,
        workspace_id: &WorkspaceId,
        file_edit_session_key: &FileEditSessionKey,
        base_revision: u64,
        op: DocOp,
        selection: Option<DocumentSelection>,
    ) -> Result<u64> {
        let key = StreamKey::new(workspace_id.clone(), file_edit_session_key.clone());
        let session = self.session(&key).await?;
        let mut session = session.lock().await;
        self.ensure_fresh(&mut session).await?;

        if let Some(revision) = session.log().duplicate_of(&client_id, base_revision)? {
            tracing::info!("{} resent revision {} of {}", client_id, revision, key);
            self.send_ack(client_id, &key, revision).await;
            return Ok(revision);
        }

        let (entry, selection) = self
            .record(&mut session, client_id, base_revision, &op, selection)
            .await?;
        self.send_ack(client_id, &key, entry.revision).await;
        self.broadcast_entry(&key, &entry, selection).await;
        Ok(entry.revision)
    }

    /// Everything the client missed since `current_revision`, as one operation
    pub async fn recover_missed(
        &self,
        client_id: ClientId,
        workspace_id: &WorkspaceId,
        file_edit_session_key: &FileEditSessionKey,
        current_revision: u64,
    ) -> Result<(DocOp, u64)> {
        let recovery = self
            .recover_with_resend(
                client_id,
                workspace_id,
                file_edit_session_key,
                current_revision,
                None,
            )
            .await?;
        Ok((recovery.composed_op, recovery.new_revision))
    }

    /// Recover from `current_revision`, first recording `resend` from that
    /// base unless it was recorded already.
    ///
    /// The author gets no separate ack for a resent operation; its revision
    /// is in the returned operations.
    pub async fn recover_with_resend(
        &self,
        client_id: ClientId,
        workspace_id: &WorkspaceId,
        file_edit_session_key: &FileEditSessionKey,
        current_revision: u64,
        resend: Option<DocOp>,
    ) -> Result<Recovery> {
        let key = StreamKey::new(workspace_id.clone(), file_edit_session_key.clone());
        let session = self.session(&key).await?;
        let mut session = session.lock().await;
        self.ensure_fresh(&mut session).await?;

        if let Some(op) = resend {
            match session.log().duplicate_of(&client_id, current_revision)? {
                Some(revision) => {
                    tracing::info!("{} resent revision {} of {}", client_id, revision, key);
                }
                None => {
                    let (entry, _) = self
                        .record(&mut session, client_id, current_revision, &op, None)
                        .await?;
                    self.broadcast_entry(&key, &entry, None).await;
                }
            }
        }

        let operations: Vec<RecoveredOp> = session
            .log()
            .operations_since(current_revision)?
            .map(|entry| RecoveredOp {
                applied_revision: entry.revision,
                op: entry.op.clone(),
                author_client_id: entry.author,
            })
            .collect();
        let (composed_op, new_revision) = session.log().recover_missed(current_revision)?;
        session.log_mut().acknowledge(client_id, new_revision);
        tracing::debug!(
            "{} recovered {} from {} to {}",
            client_id,
            key,
            current_revision,
            new_revision
        );
        Ok(Recovery {
            composed_op,
            new_revision,
            operations,
        })
    }

    /// Share a cursor move made at `base_revision`; returns it rebased onto the head
    pub async fn update_selection(
        &self,
        client_id: ClientId,
        workspace_id: &WorkspaceId,
        file_edit_session_key: &FileEditSessionKey,
        base_revision: u64,
        selection: DocumentSelection,
    ) -> Result<DocumentSelection> {
        let key = StreamKey::new(workspace_id.clone(), file_edit_session_key.clone());
        let session = self.session(&key).await?;
        let mut session = session.lock().await;
        self.ensure_fresh(&mut session).await?;

        let selection = session.log().rebase_selection(base_revision, &selection)?;
        session.set_selection(client_id, selection);
        self.participants
            .broadcast(
                workspace_id,
                ServerMessage::SelectionChanged {
                    workspace_id: workspace_id.clone(),
                    file_edit_session_key: file_edit_session_key.clone(),
                    revision: session.log().head(),
                    client_id,
                    selection,
                },
                Some(client_id),
            )
            .await;
        Ok(selection)
    }

    /// Prepare, persist and commit one operation under the stream lock.
    ///
    /// A failed store call may still have written the entry, so the session
    /// is reloaded from the store before it is used again.
    async fn record(
        &self,
        session: &mut FileEditSession,
        client_id: ClientId,
        base_revision: u64,
        op: &DocOp,
        selection: Option<DocumentSelection>,
    ) -> Result<(RevisionEntry, Option<DocumentSelection>)> {
        let prepared = session.log().prepare(client_id, base_revision, op)?;
        let stored = self
            .bounded("append", self.store.append(session.key(), prepared.entry()))
            .await;
        if let Err(e) = stored {
            session.mark_stale();
            return Err(e);
        }

        let (entry, selection) = session.commit(prepared, selection)?;
        session.log_mut().acknowledge(client_id, entry.revision);
        Ok((entry, selection))
    }

    /// Reload a session whose last append outcome is unknown.
    ///
    /// Revisions found only in the store are broadcast to everyone but
    /// their author, who learns about them from its resend or recovery.
    async fn ensure_fresh(&self, session: &mut FileEditSession) -> Result<()> {
        if !session.is_stale() {
            return Ok(());
        }
        let key = session.key().clone();
        let stored = self
            .bounded("load", self.store.load(&key))
            .await?
            .ok_or_else(|| CollaborationError::StorageError(format!("stream {} vanished", key)))?;
        let found = session.reload(&stored.initial_contents, stored.entries)?;
        tracing::warn!(
            "{} reloaded from the store at revision {}, {} revisions were only stored",
            key,
            session.log().head(),
            found.len()
        );
        for entry in &found {
            self.broadcast_entry(&key, entry, None).await;
        }
        Ok(())
    }

    async fn send_ack(&self, client_id: ClientId, key: &StreamKey, applied_revision: u64) {
        let ack = ServerMessage::OperationAck {
            workspace_id: key.workspace_id.clone(),
            file_edit_session_key: key.file_edit_session_key.clone(),
            applied_revision,
        };
        if let Err(e) = self.participants.send_to(&key.workspace_id, &client_id, ack).await {
            tracing::warn!("could not ack revision {} to {}: {}", applied_revision, client_id, e);
        }
    }

    async fn broadcast_entry(
        &self,
        key: &StreamKey,
        entry: &RevisionEntry,
        selection: Option<DocumentSelection>,
    ) {
        self.participants
            .broadcast(
                &key.workspace_id,
                ServerMessage::BroadcastOp {
                    workspace_id: key.workspace_id.clone(),
                    file_edit_session_key: key.file_edit_session_key.clone(),
                    applied_revision: entry.revision,
                    op: entry.op.clone(),
                    author_client_id: entry.author,
                    selection,
                },
                Some(entry.author),
            )
            .await;
    }

    /// Mark the head revision as saved; returns it with the content digest
    pub async fn save_file(
        &self,
        workspace_id: &WorkspaceId,
        file_edit_session_key: &FileEditSessionKey,
    ) -> Result<(u64, String)> {
        let key = StreamKey::new(workspace_id.clone(), file_edit_session_key.clone());
        let session = self.session(&key).await?;
        let mut session = session.lock().await;
        let revision = session.save();
        Ok((revision, session.sha()))
    }

    pub async fn snapshot(&self, key: &StreamKey) -> Result<FileSnapshot> {
        let session = self.session(key).await?;
        let session = session.lock().await;
        Ok(session.snapshot())
    }

    /// Check a batch against everything other clients committed since its
    /// base and apply it only if nothing conflicts.
    ///
    /// A conflicting batch is not applied at all. Newly detected conflicts
    /// are recorded under a conflict marker revision; a repeat detection
    /// returns the existing handles.
    pub async fn submit_tree_mutation(
        &self,
        client_id: ClientId,
        workspace_id: &WorkspaceId,
        base_revision: u64,
        mutations: Vec<Mutation>,
    ) -> Result<TreeSubmission> {
        let workspace = self.workspace(workspace_id).await;
        let mut state = workspace.lock().await;
        let WorkspaceState { tree, conflicts } = &mut *state;

        let committed: Vec<Mutation> = tree
            .revisions_since(base_revision)?
            .iter()
            .filter(|revision| revision.author != client_id)
            .flat_map(|revision| revision.mutations.iter().cloned())
            .collect();

        let detected = detect_conflicts(&committed, &mutations);
        if !detected.is_empty() {
            let (recorded, new_count) = conflicts.record(tree, detected);
            if new_count > 0 {
                let marker = tree.commit(client_id, Vec::new(), RevisionType::ConflictMarker)?;
                tracing::warn!(
                    "{} new tree conflicts in {} at tree revision {}",
                    new_count,
                    workspace_id,
                    marker.revision
                );
            }
            return Ok(TreeSubmission::Conflicts(recorded));
        }

        let tree_revision = tree
            .commit(client_id, mutations.clone(), RevisionType::Normal)?
            .revision;
        self.publish_tree_update(client_id, workspace_id, tree_revision, &mutations)
            .await;
        Ok(TreeSubmission::Accepted { tree_revision })
    }

    /// Apply the chosen resolution and mark the conflict resolved
    pub async fn resolve_conflict(
        &self,
        client_id: ClientId,
        workspace_id: &WorkspaceId,
        handle: ConflictHandle,
        choice: ResolutionChoice,
    ) -> Result<(NodeConflict, u64)> {
        let workspace = self.workspace(workspace_id).await;
        let mut state = workspace.lock().await;
        let WorkspaceState { tree, conflicts } = &mut *state;

        let mutations = conflicts.plan_resolution(&handle, choice, tree)?;
        let tree_revision = tree
            .commit(client_id, mutations.clone(), RevisionType::FinalResolution)?
            .revision;
        let conflict = conflicts.mark_resolved(&handle, choice)?;
        tracing::info!("conflict {} resolved with {:?}", handle, choice);

        self.participants
            .broadcast(
                workspace_id,
                ServerMessage::ConflictResolved {
                    workspace_id: workspace_id.clone(),
                    conflict: conflict.clone(),
                    tree_revision,
                },
                Some(client_id),
            )
            .await;
        if !mutations.is_empty() {
            self.publish_tree_update(client_id, workspace_id, tree_revision, &mutations)
                .await;
        }
        Ok((conflict, tree_revision))
    }

    /// Copy of a workspace's current tree
    pub async fn tree(&self, workspace_id: &WorkspaceId) -> WorkspaceTree {
        let workspace = self.workspace(workspace_id).await;
        let state = workspace.lock().await;
        state.tree.clone()
    }

    pub async fn unresolved_conflicts(&self, workspace_id: &WorkspaceId) -> Vec<NodeConflict> {
        let workspace = self.workspace(workspace_id).await;
        let state = workspace.lock().await;
        state.conflicts.unresolved().cloned().collect()
    }

    /// Drop participants that stopped sending keep-alives
    pub async fn expire_idle(&self) -> usize {
        let expired = self
            .participants
            .expire_idle(self.config.keep_alive_timeout())
            .await;
        for (workspace_id, client_id) in &expired {
            self.forget_client(workspace_id, client_id).await;
        }
        for (workspace_id, _) in &expired {
            self.evict_if_empty(workspace_id).await;
        }
        expired.len()
    }

    /// Compact every open stream up to its slowest live client
    pub async fn compact_all(&self) -> usize {
        let sessions: Vec<Arc<Mutex<FileEditSession>>> =
            self.sessions.read().await.values().cloned().collect();
        let mut dropped = 0;
        for session in sessions {
            dropped += session.lock().await.log_mut().compact();
        }
        if dropped > 0 {
            tracing::debug!("compacted {} revisions", dropped);
        }
        dropped
    }

    async fn publish_tree_update(
        &self,
        author: ClientId,
        workspace_id: &WorkspaceId,
        tree_revision: u64,
        mutations: &[Mutation],
    ) {
        self.relocate_sessions(workspace_id, mutations).await;
        self.participants
            .broadcast(
                workspace_id,
                ServerMessage::WorkspaceTreeUpdate {
                    workspace_id: workspace_id.clone(),
                    tree_revision,
                    mutations: mutations.to_vec(),
                    author_client_id: author,
                },
                Some(author),
            )
            .await;
    }

    /// Keep open edit sessions pointing at their files after moves
    async fn relocate_sessions(&self, workspace_id: &WorkspaceId, mutations: &[Mutation]) {
        let moves: Vec<(&str, &str)> = mutations
            .iter()
            .filter(|m| m.mutation_type == MutationType::Move)
            .filter_map(|m| Some((m.source()?, m.target()?)))
            .collect();
        if moves.is_empty() {
            return;
        }

        for session in self.sessions_in(workspace_id).await {
            let mut session = session.lock().await;
            for (from, to) in &moves {
                let moved = rebase_path(session.path(), from, to);
                if moved != session.path() {
                    tracing::debug!("{} moved to {}", session.key(), moved);
                    session.set_path(moved);
                }
            }
        }
    }

    async fn forget_client(&self, workspace_id: &WorkspaceId, client_id: &ClientId) {
        for session in self.sessions_in(workspace_id).await {
            session.lock().await.forget_client(client_id);
        }
    }

    /// Release the streams of a workspace nobody is in any more.
    ///
    /// Every committed revision is already in the store, so a later open
    /// reloads the same history. The workspace tree only lives in memory and
    /// is kept unless it never changed.
    async fn evict_if_empty(&self, workspace_id: &WorkspaceId) {
        if !self.participants.participants(workspace_id).await.is_empty() {
            return;
        }

        let evicted: Vec<(StreamKey, Arc<Mutex<FileEditSession>>)> = {
            let mut sessions = self.sessions.write().await;
            let keys: Vec<StreamKey> = sessions
                .keys()
                .filter(|key| key.workspace_id == *workspace_id)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| sessions.remove(&key).map(|session| (key, session)))
                .collect()
        };
        for (key, session) in &evicted {
            let saved = session.lock().await.saved_revision();
            self.saved_revisions.write().await.insert(key.clone(), saved);
        }

        let mut workspaces = self.workspaces.write().await;
        let untouched = match workspaces.get(workspace_id) {
            Some(state) => state.lock().await.tree.revision() == 0,
            None => false,
        };
        if untouched {
            workspaces.remove(workspace_id);
        }
        if !evicted.is_empty() || untouched {
            tracing::info!(
                "{} is empty, released {} edit sessions",
                workspace_id,
                evicted.len()
            );
        }
    }

    /// Number of edit sessions currently held in memory
    pub async fn open_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn sessions_in(&self, workspace_id: &WorkspaceId) -> Vec<Arc<Mutex<FileEditSession>>> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter(|(key, _)| key.workspace_id == *workspace_id)
            .map(|(_, session)| session.clone())
            .collect()
    }

    async fn require_member(&self, workspace_id: &WorkspaceId, client_id: &ClientId) -> Result<()> {
        if self.participants.is_member(workspace_id, client_id).await {
            Ok(())
        } else {
            Err(CollaborationError::SessionNotFound(format!(
                "{} has not joined {}",
                client_id, workspace_id
            )))
        }
    }

    async fn session(&self, key: &StreamKey) -> Result<Arc<Mutex<FileEditSession>>> {
        self.sessions
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| CollaborationError::SessionNotFound(key.to_string()))
    }

    async fn workspace(&self, workspace_id: &WorkspaceId) -> Arc<Mutex<WorkspaceState>> {
        if let Some(state) = self.workspaces.read().await.get(workspace_id) {
            return state.clone();
        }
        let mut workspaces = self.workspaces.write().await;
        workspaces.entry(workspace_id.clone()).or_default().clone()
    }

    /// Run a store call under the append timeout; any failure is transient
    async fn bounded<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.append_timeout(), call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                tracing::error!("store {} failed: {}", what, e);
                Err(CollaborationError::TransientFailure(format!("{}: {}", what, e)))
            }
            Err(_) => {
                tracing::error!("store {} timed out", what);
                Err(CollaborationError::TransientFailure(format!(
                    "{} timed out after {:?}",
                    what,
                    self.config.append_timeout()
                )))
            }
        }
    }
}
