/// Tree conflict detection and resolution
/// Concurrent tree mutations that cannot both apply become conflicts with a fixed set of choices
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use crate::{
    ancestors, is_at_or_under, is_descendant, rebase_path, CollaborationError, Mutation,
    MutationType, NodeType, Result, TreeNodeInfo, WorkspaceTree,
};

/// Identifies every conflict raised at one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(pub uuid::Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

/// Stable reference to one conflict among several at the same path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictHandle {
    pub conflict_id: ConflictId,
    pub conflict_index: u32,
}

impl fmt::Display for ConflictHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.conflict_id.0, self.conflict_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionChoice {
    KeepMine,
    KeepTheirs,
    KeepBoth,
    DeleteBoth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimplifiedConflictType {
    FileLevel,
    TreeLevel,
    Resolved,
}

/// How an incoming mutation ("mine") collides with a committed one ("theirs")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both moved the same node to different places
    DivergentMove,
    /// Mine reads or removes a node theirs deleted
    SourceRemoved,
    /// Mine creates a node inside a directory theirs deleted
    ParentRemoved,
    /// Mine refers to a node, or a directory, that theirs moved away
    NodeMoved,
    /// Both created something at the same path
    TargetCollision,
    /// Mine deletes a directory theirs put something into
    DeleteChangedSubtree,
}

impl ConflictKind {
    pub fn valid_resolutions(&self) -> Vec<ResolutionChoice> {
        use ResolutionChoice::*;
        match self {
            ConflictKind::SourceRemoved => vec![KeepTheirs],
            ConflictKind::TargetCollision => vec![KeepMine, KeepTheirs, KeepBoth, DeleteBoth],
            ConflictKind::DivergentMove
            | ConflictKind::ParentRemoved
            | ConflictKind::NodeMoved
            | ConflictKind::DeleteChangedSubtree => vec![KeepMine, KeepTheirs],
        }
    }

    fn describe(&self, child_path: &str, theirs: &Mutation) -> String {
        let their_target = theirs.target().unwrap_or_default();
        match self {
            ConflictKind::DivergentMove => {
                format!("{} was already moved to {}", child_path, their_target)
            }
            ConflictKind::SourceRemoved => format!("{} was deleted", child_path),
            ConflictKind::ParentRemoved => {
                format!("the directory containing {} was deleted", child_path)
            }
            ConflictKind::NodeMoved => format!(
                "{} was moved to {}",
                theirs.source().unwrap_or_default(),
                their_target
            ),
            ConflictKind::TargetCollision => format!("{} was already created", child_path),
            ConflictKind::DeleteChangedSubtree => {
                format!("{} was changed by {}", child_path, their_target)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConflictState {
    Detected,
    Resolved { choice: ResolutionChoice },
}

/// A structural conflict as presented to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConflict {
    pub conflict_handle: ConflictHandle,
    pub child_path: String,

    /// Ancestors of `child_path`, root first
    pub parent_paths: Vec<String>,

    pub conflict_description: String,
    pub simplified_conflict_type: SimplifiedConflictType,

    /// Fixed when the conflict is detected
    pub valid_resolutions: Vec<ResolutionChoice>,

    /// Other conflicts raised by the same incoming mutation
    pub grouped_conflicts: Vec<ConflictHandle>,

    pub kind: ConflictKind,
    pub mine: Mutation,
    pub theirs: Mutation,
    pub state: ConflictState,
    pub detected_at: chrono::DateTime<chrono::Utc>,
}

/// Raw detector output before handles are assigned
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedConflict {
    pub kind: ConflictKind,
    pub child_path: String,
    pub mine: Mutation,
    pub theirs: Mutation,

    /// Position of `mine` in the incoming batch
    pub incoming_index: usize,
}

/// Compare an incoming batch against mutations committed since its base.
///
/// Committed paths are indexed by prefix so each incoming mutation is only
/// compared with committed ones touching the same path, an ancestor or a
/// descendant.
pub fn detect_conflicts(committed: &[Mutation], incoming: &[Mutation]) -> Vec<DetectedConflict> {
    let mut index: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, mutation) in committed.iter().enumerate() {
        for path in mutation.paths() {
            index.entry(path).or_default().push(i);
        }
    }

    let mut detected = Vec::new();
    for (incoming_index, mine) in incoming.iter().enumerate() {
        let mut candidates = BTreeSet::new();
        for path in mine.paths() {
            for related in std::iter::once(path).chain(ancestors(path)) {
                if let Some(ids) = index.get(related) {
                    candidates.extend(ids.iter().copied());
                }
            }

            let prefix = format!("{}/", path);
            for (_, ids) in index
                .range::<&str, _>(prefix.as_str()..)
                .take_while(|(p, _)| p.starts_with(&prefix))
            {
                candidates.extend(ids.iter().copied());
            }
        }

        for i in candidates {
            let theirs = &committed[i];
            if let Some((kind, child_path)) = classify(mine, theirs) {
                detected.push(DetectedConflict {
                    kind,
                    child_path,
                    mine: mine.clone(),
                    theirs: theirs.clone(),
                    incoming_index,
                });
            }
        }
    }
    detected
}

fn classify(mine: &Mutation, theirs: &Mutation) -> Option<(ConflictKind, String)> {
    if mine == theirs {
        return None;
    }

    let (my_source, my_target) = (mine.source(), mine.target());

    if mine.mutation_type == MutationType::Move
        && theirs.mutation_type == MutationType::Move
        && my_source == theirs.source()
    {
        return my_source.map(|s| (ConflictKind::DivergentMove, s.to_string()));
    }

    if let (Some(mt), Some(tt)) = (my_target, theirs.target()) {
        if mt == tt {
            return Some((ConflictKind::TargetCollision, mt.to_string()));
        }
    }

    if let Some(their_source) = theirs.source() {
        let (source_kind, target_kind) = match theirs.mutation_type {
            MutationType::Delete => (ConflictKind::SourceRemoved, ConflictKind::ParentRemoved),
            MutationType::Move => (ConflictKind::NodeMoved, ConflictKind::NodeMoved),
            _ => return delete_of_changed(mine, theirs),
        };
        if let Some(ms) = my_source.filter(|s| is_at_or_under(s, their_source)) {
            return Some((source_kind, ms.to_string()));
        }
        if let Some(mt) = my_target.filter(|t| is_descendant(t, their_source)) {
            return Some((target_kind, mt.to_string()));
        }
    }

    delete_of_changed(mine, theirs)
}

fn delete_of_changed(mine: &Mutation, theirs: &Mutation) -> Option<(ConflictKind, String)> {
    if mine.mutation_type != MutationType::Delete {
        return None;
    }
    let deleted = mine.source()?;
    let changed = theirs.target()?;
    is_descendant(changed, deleted)
        .then(|| (ConflictKind::DeleteChangedSubtree, deleted.to_string()))
}

fn owned(path: Option<&str>) -> String {
    path.unwrap_or_default().to_string()
}

/// Conflicts of one workspace, keyed by handle
#[derive(Debug, Clone, Default)]
pub struct ConflictRegistry {
    conflicts: Vec<NodeConflict>,
    location_ids: HashMap<String, ConflictId>,
}

impl ConflictRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, handle: &ConflictHandle) -> Option<&NodeConflict> {
        self.conflicts.iter().find(|c| c.conflict_handle == *handle)
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &NodeConflict> {
        self.conflicts
            .iter()
            .filter(|c| c.state == ConflictState::Detected)
    }

    pub fn has_unresolved(&self) -> bool {
        self.unresolved().next().is_some()
    }

    /// Assign handles to detector output.
    ///
    /// An unresolved conflict detected again keeps its handle. Returns the
    /// conflicts in detection order and how many of them are new.
    pub fn record(
        &mut self,
        tree: &WorkspaceTree,
        detected: Vec<DetectedConflict>,
    ) -> (Vec<NodeConflict>, usize) {
        let mut recorded: Vec<(usize, usize)> = Vec::new();
        let mut new_count = 0;

        for found in detected {
            let existing = self.conflicts.iter().position(|c| {
                c.state == ConflictState::Detected
                    && c.kind == found.kind
                    && c.child_path == found.child_path
                    && c.mine == found.mine
                    && c.theirs == found.theirs
            });

            let pos = match existing {
                Some(pos) => pos,
                None => {
                    new_count += 1;
                    self.insert(tree, &found);
                    self.conflicts.len() - 1
                }
            };
            if !recorded.iter().any(|(_, p)| *p == pos) {
                recorded.push((found.incoming_index, pos));
            }
        }

        for &(incoming_index, pos) in &recorded {
            let grouped = recorded
                .iter()
                .filter(|(i, p)| *i == incoming_index && *p != pos)
                .map(|(_, p)| self.conflicts[*p].conflict_handle)
                .collect();
            self.conflicts[pos].grouped_conflicts = grouped;
        }

        let conflicts = recorded
            .iter()
            .map(|(_, pos)| self.conflicts[*pos].clone())
            .collect();
        (conflicts, new_count)
    }

    fn insert(&mut self, tree: &WorkspaceTree, found: &DetectedConflict) {
        let conflict_id = *self
            .location_ids
            .entry(found.child_path.clone())
            .or_insert_with(ConflictId::new);
        let conflict_index = self
            .conflicts
            .iter()
            .filter(|c| c.conflict_handle.conflict_id == conflict_id)
            .count() as u32;

        let node_type = tree
            .get(&found.child_path)
            .or(found.mine.new_node_info.as_ref())
            .or_else(|| found.theirs.target().and_then(|t| tree.get(t)))
            .or(found.theirs.new_node_info.as_ref())
            .map(|info| info.node_type)
            .unwrap_or(NodeType::Directory);
        let simplified_conflict_type = match node_type {
            NodeType::File => SimplifiedConflictType::FileLevel,
            NodeType::Directory => SimplifiedConflictType::TreeLevel,
        };

        let mut parent_paths: Vec<String> =
            ancestors(&found.child_path).map(str::to_string).collect();
        parent_paths.reverse();

        let conflict = NodeConflict {
            conflict_handle: ConflictHandle {
                conflict_id,
                conflict_index,
            },
            child_path: found.child_path.clone(),
            parent_paths,
            conflict_description: found.kind.describe(&found.child_path, &found.theirs),
            simplified_conflict_type,
            valid_resolutions: found.kind.valid_resolutions(),
            grouped_conflicts: Vec::new(),
            kind: found.kind,
            mine: found.mine.clone(),
            theirs: found.theirs.clone(),
            state: ConflictState::Detected,
            detected_at: chrono::Utc::now(),
        };
        tracing::info!(
            "conflict {} at {}: {}",
            conflict.conflict_handle,
            conflict.child_path,
            conflict.conflict_description
        );
        self.conflicts.push(conflict);
    }

    /// Mutations that carry out `choice`, checked against the frozen valid set.
    ///
    /// Nothing changes here; the caller applies the mutations and then calls
    /// [`ConflictRegistry::mark_resolved`].
    pub fn plan_resolution(
        &self,
        handle: &ConflictHandle,
        choice: ResolutionChoice,
        tree: &WorkspaceTree,
    ) -> Result<Vec<Mutation>> {
        let conflict = self
            .get(handle)
            .ok_or_else(|| CollaborationError::ConflictNotFound(handle.to_string()))?;
        if conflict.state != ConflictState::Detected {
            return Err(CollaborationError::ConflictAlreadyResolved(*handle));
        }
        if !conflict.valid_resolutions.contains(&choice) {
            return Err(CollaborationError::InvalidResolutionChoice {
                handle: *handle,
                choice,
            });
        }
        Ok(outcome(conflict, choice, tree))
    }

    pub fn mark_resolved(
        &mut self,
        handle: &ConflictHandle,
        choice: ResolutionChoice,
    ) -> Result<NodeConflict> {
        let conflict = self
            .conflicts
            .iter_mut()
            .find(|c| c.conflict_handle == *handle)
            .ok_or_else(|| CollaborationError::ConflictNotFound(handle.to_string()))?;
        conflict.state = ConflictState::Resolved { choice };
        conflict.simplified_conflict_type = SimplifiedConflictType::Resolved;
        Ok(conflict.clone())
    }
}

fn outcome(conflict: &NodeConflict, choice: ResolutionChoice, tree: &WorkspaceTree) -> Vec<Mutation> {
    let mine = &conflict.mine;
    let theirs = &conflict.theirs;
    let my_target = owned(mine.target());

    match (conflict.kind, choice) {
        (_, ResolutionChoice::KeepTheirs) => Vec::new(),
        (ConflictKind::DivergentMove, ResolutionChoice::KeepMine) => {
            vec![Mutation::move_node(owned(theirs.target()), my_target)]
        }
        (ConflictKind::ParentRemoved, ResolutionChoice::KeepMine) => {
            let mut missing: Vec<Mutation> = ancestors(&my_target)
                .filter(|dir| !tree.contains(dir))
                .map(|dir| Mutation::add(dir, TreeNodeInfo::directory()))
                .collect();
            missing.reverse();
            missing.push(mine.clone());
            missing
        }
        (ConflictKind::NodeMoved, ResolutionChoice::KeepMine) => {
            let from = owned(theirs.source());
            let to = owned(theirs.target());
            let mut rebased = mine.clone();
            rebased.old_path = mine.old_path.as_deref().map(|p| rebase_path(p, &from, &to));
            rebased.new_path = mine.new_path.as_deref().map(|p| rebase_path(p, &from, &to));
            vec![rebased]
        }
        (ConflictKind::TargetCollision, ResolutionChoice::KeepMine) => {
            vec![Mutation::delete(my_target), mine.clone()]
        }
        (ConflictKind::TargetCollision, ResolutionChoice::KeepBoth) => {
            let mut renamed = mine.clone();
            renamed.new_path = Some(tree.free_path_like(&my_target));
            vec![renamed]
        }
        (ConflictKind::TargetCollision, ResolutionChoice::DeleteBoth) => {
            vec![Mutation::delete(my_target)]
        }
        (ConflictKind::DeleteChangedSubtree, ResolutionChoice::KeepMine) => vec![mine.clone()],
        // Not reachable through plan_resolution
        _ => Vec::new(),
    }
}
