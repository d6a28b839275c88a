/// File edit sessions
/// Binds one open file to its revision log and tracks what has been saved
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use docops::{transform_position, DocOp, Position};

use crate::{
    content_digest, ClientId, PreparedAppend, Result, RevisionEntry, RevisionLog, StreamKey,
};

/// A client's selection; `base` is the anchor and `cursor` the moving end
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSelection {
    pub base: Position,
    pub cursor: Position,
}

impl DocumentSelection {
    pub fn new(base: Position, cursor: Position) -> Self {
        Self { base, cursor }
    }

    pub fn caret(position: Position) -> Self {
        Self::new(position, position)
    }

    pub fn is_caret(&self) -> bool {
        self.base == self.cursor
    }

    /// The same selection after `op` was applied underneath it
    pub fn transformed(&self, op: &DocOp) -> Self {
        let base = transform_position(op, self.base.line, self.base.column);
        let cursor = transform_position(op, self.cursor.line, self.cursor.column);
        Self { base, cursor }
    }
}

/// A participant's selection as seen by others
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantSelection {
    pub client_id: ClientId,
    pub selection: DocumentSelection,
}

#[derive(Debug, Clone)]
pub struct FileEditSession {
    path: String,
    log: RevisionLog,
    saved_revision: u64,
    selections: HashMap<ClientId, DocumentSelection>,

    /// An append may have reached the store without being recorded here
    stale: bool,
}

impl FileEditSession {
    pub fn new(path: impl Into<String>, log: RevisionLog) -> Self {
        let saved_revision = log.head();
        Self {
            path: path.into(),
            log,
            saved_revision,
            selections: HashMap::new(),
            stale: false,
        }
    }

    pub fn key(&self) -> &StreamKey {
        self.log.key()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    pub fn log(&self) -> &RevisionLog {
        &self.log
    }

    pub fn log_mut(&mut self) -> &mut RevisionLog {
        &mut self.log
    }

    /// Record a prepared append and move tracked selections past it.
    ///
    /// The author's `selection` is taken as made right after its own edit and
    /// is returned rebased onto the new head.
    pub fn commit(
        &mut self,
        prepared: PreparedAppend,
        selection: Option<DocumentSelection>,
    ) -> Result<(RevisionEntry, Option<DocumentSelection>)> {
        let selection = selection.map(|selection| prepared.rebase_selection(&selection));
        let entry = self.log.commit(prepared)?;
        self.move_selections(&entry);
        if let Some(selection) = selection {
            self.selections.insert(entry.author, selection);
        }
        Ok((entry, selection))
    }

    fn move_selections(&mut self, entry: &RevisionEntry) {
        for (client, selection) in self.selections.iter_mut() {
            if *client != entry.author {
                *selection = selection.transformed(&entry.op);
            }
        }
    }

    /// Record a selection already expressed against the head
    pub fn set_selection(&mut self, client: ClientId, selection: DocumentSelection) {
        self.selections.insert(client, selection);
    }

    pub fn selection(&self, client: &ClientId) -> Option<DocumentSelection> {
        self.selections.get(client).copied()
    }

    /// Drop everything kept on behalf of `client`
    pub fn forget_client(&mut self, client: &ClientId) {
        self.log.forget_client(client);
        self.selections.remove(client);
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn mark_stale(&mut self) {
        self.stale = true;
    }

    /// Resynchronize with the store; returns the entries that were missing
    pub fn reload(
        &mut self,
        initial_contents: &str,
        entries: Vec<RevisionEntry>,
    ) -> Result<Vec<RevisionEntry>> {
        let found = self.log.reload(initial_contents, entries)?;
        for entry in &found {
            self.move_selections(entry);
        }
        self.stale = false;
        Ok(found)
    }

    /// Digest of the current contents
    pub fn sha(&self) -> String {
        content_digest(self.log.contents())
    }

    /// Length of the current contents in characters
    pub fn size(&self) -> usize {
        self.log.contents().chars().count()
    }

    pub fn saved_revision(&self) -> u64 {
        self.saved_revision
    }

    pub fn has_changes(&self) -> bool {
        self.log.head() != self.saved_revision
    }

    /// Carry over the saved revision of an earlier session on the same stream
    pub fn restore_saved_revision(&mut self, revision: u64) {
        self.saved_revision = revision.min(self.log.head());
    }

    /// Mark the head revision as saved
    pub fn save(&mut self) -> u64 {
        self.saved_revision = self.log.head();
        self.saved_revision
    }

    pub fn snapshot(&self) -> FileSnapshot {
        let mut selections: Vec<ParticipantSelection> = self
            .selections
            .iter()
            .map(|(client_id, selection)| ParticipantSelection {
                client_id: *client_id,
                selection: *selection,
            })
            .collect();
        selections.sort_by_key(|s| s.client_id);

        FileSnapshot {
            key: self.key().clone(),
            path: self.path.clone(),
            contents: self.log.contents().to_string(),
            revision: self.log.head(),
            sha: self.sha(),
            size: self.size(),
            has_changes: self.has_changes(),
            selections,
        }
    }
}

/// Everything a client needs to start editing from a known revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSnapshot {
    pub key: StreamKey,
    pub path: String,
    pub contents: String,
    pub revision: u64,
    pub sha: String,
    pub size: usize,
    pub has_changes: bool,

    #[serde(default)]
    pub selections: Vec<ParticipantSelection>,
}
