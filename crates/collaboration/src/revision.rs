/// Per-document revision log
/// Append-only history of accepted operations for one stream, with compaction
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};

use docops::{apply, compose_all, transform, DocOp};

use crate::{ClientId, CollaborationError, DocumentSelection, Result, StreamKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionType {
    Normal,
    ConflictMarker,
    FinalResolution,
}

/// Metadata recorded for every accepted revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub timestamp: chrono::DateTime<chrono::Utc>,

    /// Content hash of the document or tree after this revision
    pub root_id: String,

    pub node_id: String,
    pub revision_type: RevisionType,
    pub has_unresolved_conflicts: bool,
    pub is_final_resolution: bool,

    /// Compacted revisions directly before this one
    pub previous_nodes_skipped: u64,
}

impl Revision {
    pub fn new(root_id: String, node_id: String, revision_type: RevisionType) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            root_id,
            node_id,
            revision_type,
            has_unresolved_conflicts: revision_type == RevisionType::ConflictMarker,
            is_final_resolution: revision_type == RevisionType::FinalResolution,
            previous_nodes_skipped: 0,
        }
    }
}

/// Hex SHA-256 of a document
pub fn content_digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// One accepted operation, already rebased onto the revision before it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionEntry {
    pub revision: u64,
    pub author: ClientId,

    /// Revision the author built the operation against
    #[serde(default)]
    pub base_revision: u64,

    pub op: DocOp,
    pub metadata: Revision,
}

/// An append that has been folded and applied but not yet recorded
#[derive(Debug, Clone)]
pub struct PreparedAppend {
    entry: RevisionEntry,
    contents: String,

    /// Logged operations rebased to follow the incoming one
    bridge: Vec<DocOp>,
}

impl PreparedAppend {
    pub fn entry(&self) -> &RevisionEntry {
        &self.entry
    }

    pub fn contents(&self) -> &str {
        &self.contents
    }

    /// Move a selection made right after the author's edit onto the head
    pub fn rebase_selection(&self, selection: &DocumentSelection) -> DocumentSelection {
        self.bridge
            .iter()
            .fold(*selection, |selection, op| selection.transformed(op))
    }
}

/// The last operation a client got recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Submitted {
    base_revision: u64,
    revision: u64,
}

/// Authoritative history of one `(workspace, file edit session)` stream.
///
/// Revision 0 is the document the log was created with. Revisions up to and
/// including `horizon` have been compacted away; a client whose base is older
/// than that can no longer be caught up incrementally.
#[derive(Debug, Clone)]
pub struct RevisionLog {
    key: StreamKey,
    contents: String,
    head: u64,
    horizon: u64,
    entries: VecDeque<RevisionEntry>,
    acked: HashMap<ClientId, u64>,
    last_submitted: HashMap<ClientId, Submitted>,
}

impl RevisionLog {
    pub fn new(key: StreamKey, contents: impl Into<String>) -> Self {
        Self {
            key,
            contents: contents.into(),
            head: 0,
            horizon: 0,
            entries: VecDeque::new(),
            acked: HashMap::new(),
            last_submitted: HashMap::new(),
        }
    }

    /// Rebuild a log by replaying persisted entries over the initial contents
    pub fn restore(key: StreamKey, initial_contents: &str, entries: Vec<RevisionEntry>) -> Result<Self> {
        let mut log = Self::new(key, initial_contents);
        for entry in entries {
            if entry.revision != log.head + 1 {
                return Err(CollaborationError::StorageError(format!(
                    "stream {} jumps from revision {} to {}",
                    log.key, log.head, entry.revision
                )));
            }
            log.contents = apply(&entry.op, &log.contents)?;
            log.head = entry.revision;
            log.note_submitted(&entry);
            log.entries.push_back(entry);
        }
        Ok(log)
    }

    /// Replace the in-memory state with what the store holds.
    ///
    /// Acknowledgements and the compaction horizon carry over. Returns the
    /// entries the store has beyond the old head, which happens when an
    /// append reached the store after the caller gave up on it.
    pub fn reload(
        &mut self,
        initial_contents: &str,
        entries: Vec<RevisionEntry>,
    ) -> Result<Vec<RevisionEntry>> {
        let mut fresh = Self::restore(self.key.clone(), initial_contents, entries)?;
        if fresh.head < self.head {
            return Err(CollaborationError::StorageError(format!(
                "stream {} has revision {} in memory but only {} in the store",
                self.key, self.head, fresh.head
            )));
        }

        let found: Vec<RevisionEntry> = fresh
            .entries
            .iter()
            .filter(|entry| entry.revision > self.head)
            .cloned()
            .collect();
        fresh.acked = std::mem::take(&mut self.acked);
        fresh.compact_through(self.horizon);
        *self = fresh;
        Ok(found)
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    /// Document text at the head revision
    pub fn contents(&self) -> &str {
        &self.contents
    }

    pub fn head(&self) -> u64 {
        self.head
    }

    pub fn horizon(&self) -> u64 {
        self.horizon
    }

    /// Entries still held in memory, oldest first
    pub fn entries(&self) -> impl Iterator<Item = &RevisionEntry> {
        self.entries.iter()
    }

    fn check_base(&self, base: u64) -> Result<()> {
        if base < self.horizon {
            return Err(CollaborationError::StaleBaseRevision {
                base,
                horizon: self.horizon,
            });
        }
        if base > self.head {
            return Err(CollaborationError::FutureBaseRevision {
                base,
                head: self.head,
            });
        }
        Ok(())
    }

    /// Entries recorded after `revision`, in revision order
    pub fn operations_since(&self, revision: u64) -> Result<impl Iterator<Item = &RevisionEntry>> {
        self.check_base(revision)?;
        Ok(self.entries.iter().skip((revision - self.horizon) as usize))
    }

    /// Revision already recorded for a resent operation.
    ///
    /// A client has at most one operation in flight, so a second submission
    /// from the same base is a resend of the one already recorded. A base
    /// older than the last recorded one can only come from a resend that was
    /// overtaken and is refused.
    pub fn duplicate_of(&self, author: &ClientId, base: u64) -> Result<Option<u64>> {
        self.check_base(base)?;
        match self.last_submitted.get(author) {
            Some(last) if last.base_revision == base => Ok(Some(last.revision)),
            Some(last) if last.base_revision > base => {
                Err(CollaborationError::IncompatibleOperation(format!(
                    "{} resent an operation from revision {} after one from {} was recorded",
                    author, base, last.base_revision
                )))
            }
            _ => Ok(None),
        }
    }

    fn note_submitted(&mut self, entry: &RevisionEntry) {
        self.last_submitted.insert(
            entry.author,
            Submitted {
                base_revision: entry.base_revision,
                revision: entry.revision,
            },
        );
    }

    /// Rebase `op` onto the head and apply it, without recording anything
    pub fn prepare(&self, author: ClientId, base: u64, op: &DocOp) -> Result<PreparedAppend> {
        let mut rebased = op.clone();
        let mut bridge = Vec::new();
        for logged in self.operations_since(base)? {
            // The logged op was ordered first, so it wins insert ties
            let (logged_after, incoming) = transform(&logged.op, &rebased)?;
            bridge.push(logged_after);
            rebased = incoming;
        }

        let contents = apply(&rebased, &self.contents)?;
        let revision = self.head + 1;
        let metadata = Revision::new(
            content_digest(&contents),
            format!("{}@{}", self.key, revision),
            RevisionType::Normal,
        );

        Ok(PreparedAppend {
            entry: RevisionEntry {
                revision,
                author,
                base_revision: base,
                op: rebased,
                metadata,
            },
            contents,
            bridge,
        })
    }

    /// Record a prepared append; fails if another append landed in between
    pub fn commit(&mut self, prepared: PreparedAppend) -> Result<RevisionEntry> {
        let PreparedAppend { entry, contents, .. } = prepared;
        if entry.revision != self.head + 1 {
            return Err(CollaborationError::IncompatibleOperation(format!(
                "append prepared for revision {} but head is {}",
                entry.revision, self.head
            )));
        }

        self.head = entry.revision;
        self.contents = contents;
        self.note_submitted(&entry);
        self.entries.push_back(entry.clone());
        tracing::debug!("{} accepted revision {}: {}", self.key, entry.revision, entry.op);
        Ok(entry)
    }

    /// Rebase, apply and record `op` in one step
    pub fn append(&mut self, author: ClientId, base: u64, op: &DocOp) -> Result<RevisionEntry> {
        let prepared = self.prepare(author, base, op)?;
        self.commit(prepared)
    }

    /// Move a selection made at `base` onto the head
    pub fn rebase_selection(&self, base: u64, selection: &DocumentSelection) -> Result<DocumentSelection> {
        Ok(self
            .operations_since(base)?
            .fold(*selection, |selection, entry| selection.transformed(&entry.op)))
    }

    /// Everything a client at `current` missed, as one operation plus the new head
    pub fn recover_missed(&self, current: u64) -> Result<(DocOp, u64)> {
        let missed: Vec<&RevisionEntry> = self.operations_since(current)?.collect();
        let op = match missed.as_slice() {
            [] => DocOp::identity_for(&self.contents),
            [single] => single.op.clone(),
            _ => compose_all(missed.iter().map(|entry| &entry.op))?
                .unwrap_or_else(|| DocOp::identity_for(&self.contents)),
        };
        Ok((op, self.head))
    }

    /// Note that `client` has seen everything up to `revision`
    pub fn acknowledge(&mut self, client: ClientId, revision: u64) {
        let revision = revision.min(self.head);
        let acked = self.acked.entry(client).or_insert(revision);
        *acked = (*acked).max(revision);
    }

    pub fn forget_client(&mut self, client: &ClientId) {
        self.acked.remove(client);
    }

    pub fn acknowledged(&self, client: &ClientId) -> Option<u64> {
        self.acked.get(client).copied()
    }

    /// Drop entries every live client has acknowledged.
    ///
    /// Does nothing while no client is registered, since there is no base
    /// revision to protect and a later joiner may still need the history.
    pub fn compact(&mut self) -> usize {
        match self.acked.values().min().copied() {
            Some(oldest) => self.compact_through(oldest),
            None => 0,
        }
    }

    /// Drop entries up to and including `revision`; returns how many went
    pub fn compact_through(&mut self, revision: u64) -> usize {
        let revision = revision.min(self.head);
        if revision <= self.horizon {
            return 0;
        }

        let mut dropped = 0;
        while self.entries.front().is_some_and(|e| e.revision <= revision) {
            self.entries.pop_front();
            dropped += 1;
        }
        self.horizon = revision;
        if let Some(front) = self.entries.front_mut() {
            front.metadata.previous_nodes_skipped = self.horizon;
        }

        tracing::info!(
            "{} compacted {} revisions, horizon now {}",
            self.key,
            dropped,
            self.horizon
        );
        dropped
    }
}
