/// Workspace tree model
/// Paths, tree mutations and the per-workspace mutation history
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::{ClientId, CollaborationError, FileEditSessionKey, Result, Revision, RevisionType};

pub const ROOT_PATH: &str = "/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationType {
    Add,
    Delete,
    /// Rename or move
    Move,
    Copy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TreeNodeInfo {
    pub node_type: NodeType,
    pub file_edit_session_key: Option<FileEditSessionKey>,
}

impl TreeNodeInfo {
    pub fn file(file_edit_session_key: Option<FileEditSessionKey>) -> Self {
        Self {
            node_type: NodeType::File,
            file_edit_session_key,
        }
    }

    pub fn directory() -> Self {
        Self {
            node_type: NodeType::Directory,
            file_edit_session_key: None,
        }
    }
}

/// One atomic tree change
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mutation {
    pub mutation_type: MutationType,
    pub old_path: Option<String>,
    pub new_path: Option<String>,
    pub new_node_info: Option<TreeNodeInfo>,
}

impl Mutation {
    pub fn add(path: impl Into<String>, info: TreeNodeInfo) -> Self {
        Self {
            mutation_type: MutationType::Add,
            old_path: None,
            new_path: Some(path.into()),
            new_node_info: Some(info),
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            mutation_type: MutationType::Delete,
            old_path: Some(path.into()),
            new_path: None,
            new_node_info: None,
        }
    }

    pub fn move_node(old_path: impl Into<String>, new_path: impl Into<String>) -> Self {
        Self {
            mutation_type: MutationType::Move,
            old_path: Some(old_path.into()),
            new_path: Some(new_path.into()),
            new_node_info: None,
        }
    }

    pub fn copy(old_path: impl Into<String>, new_path: impl Into<String>) -> Self {
        Self {
            mutation_type: MutationType::Copy,
            old_path: Some(old_path.into()),
            new_path: Some(new_path.into()),
            new_node_info: None,
        }
    }

    /// Existing node the mutation reads or removes
    pub fn source(&self) -> Option<&str> {
        match self.mutation_type {
            MutationType::Add => None,
            _ => self.old_path.as_deref(),
        }
    }

    /// Path the mutation creates
    pub fn target(&self) -> Option<&str> {
        match self.mutation_type {
            MutationType::Delete => None,
            _ => self.new_path.as_deref(),
        }
    }

    /// Paths the mutation touches, source first
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.source().into_iter().chain(self.target())
    }

    fn required_source(&self) -> Result<&str> {
        self.source().ok_or_else(|| {
            CollaborationError::InvalidMutation(format!("{:?} without old_path", self.mutation_type))
        })
    }

    fn required_target(&self) -> Result<&str> {
        self.target().ok_or_else(|| {
            CollaborationError::InvalidMutation(format!("{:?} without new_path", self.mutation_type))
        })
    }
}

/// Parent of a path; `None` for the root
pub fn parent_path(path: &str) -> Option<&str> {
    if path == ROOT_PATH {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT_PATH),
        Some(i) => Some(&path[..i]),
        None => None,
    }
}

/// Ancestors of a path, nearest first, ending with the root
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(parent_path(path), |p| parent_path(*p))
}

/// True when `path` lies strictly inside `dir`
pub fn is_descendant(path: &str, dir: &str) -> bool {
    if dir == ROOT_PATH {
        return path != ROOT_PATH && path.starts_with('/');
    }
    path.len() > dir.len() && path.starts_with(dir) && path.as_bytes()[dir.len()] == b'/'
}

/// True when `path` is `dir` or inside it
pub fn is_at_or_under(path: &str, dir: &str) -> bool {
    path == dir || is_descendant(path, dir)
}

/// Move `path` from under `from` to under `to`; unchanged when not under `from`
pub fn rebase_path(path: &str, from: &str, to: &str) -> String {
    if is_at_or_under(path, from) {
        format!("{}{}", to, &path[from.len()..])
    } else {
        path.to_string()
    }
}

fn validate_path(path: &str) -> Result<()> {
    let valid = path.starts_with('/')
        && path != ROOT_PATH
        && !path.ends_with('/')
        && !path[1..].split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if valid {
        Ok(())
    } else {
        Err(CollaborationError::InvalidMutation(format!("invalid path {:?}", path)))
    }
}

/// One committed tree revision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeRevision {
    pub revision: u64,
    pub author: ClientId,
    pub mutations: Vec<Mutation>,
    pub metadata: Revision,
}

/// The shared file tree of one workspace
#[derive(Debug, Clone)]
pub struct WorkspaceTree {
    nodes: BTreeMap<String, TreeNodeInfo>,
    revision: u64,
    history: Vec<TreeRevision>,
}

impl Default for WorkspaceTree {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkspaceTree {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(ROOT_PATH.to_string(), TreeNodeInfo::directory());
        Self {
            nodes,
            revision: 0,
            history: Vec::new(),
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn get(&self, path: &str) -> Option<&TreeNodeInfo> {
        self.nodes.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn history(&self) -> &[TreeRevision] {
        &self.history
    }

    /// Revisions committed after `base`, oldest first
    pub fn revisions_since(&self, base: u64) -> Result<&[TreeRevision]> {
        if base > self.revision {
            return Err(CollaborationError::FutureBaseRevision {
                base,
                head: self.revision,
            });
        }
        let start = self.history.partition_point(|r| r.revision <= base);
        Ok(&self.history[start..])
    }

    /// Hash over every path and node kind
    pub fn root_id(&self) -> String {
        let mut hasher = Sha256::new();
        for (path, info) in &self.nodes {
            let kind = match info.node_type {
                NodeType::File => "f",
                NodeType::Directory => "d",
            };
            hasher.update(format!("{}\t{}\n", kind, path).as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// A path close to `path` that is not in the tree, e.g. `b (2).txt`
    pub fn free_path_like(&self, path: &str) -> String {
        let (dir, name) = match path.rfind('/') {
            Some(i) => path.split_at(i + 1),
            None => ("", path),
        };
        let (stem, ext) = match name.rfind('.') {
            Some(i) if i > 0 => name.split_at(i),
            _ => (name, ""),
        };
        let mut n = 2;
        loop {
            let candidate = format!("{}{} ({}){}", dir, stem, n, ext);
            if !self.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    /// The node at `path` and everything below it
    fn subtree(&self, path: &str) -> Vec<(String, TreeNodeInfo)> {
        let prefix = format!("{}/", path);
        let below = self
            .nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix));
        self.nodes
            .get_key_value(path)
            .into_iter()
            .chain(below)
            .map(|(p, info)| (p.clone(), info.clone()))
            .collect()
    }

    fn require_node(&self, path: &str) -> Result<&TreeNodeInfo> {
        self.nodes
            .get(path)
            .ok_or_else(|| CollaborationError::InvalidMutation(format!("{} does not exist", path)))
    }

    fn require_free_target(&self, path: &str) -> Result<()> {
        validate_path(path)?;
        if self.contains(path) {
            return Err(CollaborationError::InvalidMutation(format!(
                "{} already exists",
                path
            )));
        }
        match parent_path(path).and_then(|parent| self.nodes.get(parent)) {
            Some(info) if info.node_type == NodeType::Directory => Ok(()),
            _ => Err(CollaborationError::InvalidMutation(format!(
                "parent of {} is not a directory",
                path
            ))),
        }
    }

    /// Apply one mutation in place
    pub fn apply_mutation(&mut self, mutation: &Mutation) -> Result<()> {
        match mutation.mutation_type {
            MutationType::Add => {
                let target = mutation.required_target()?;
                self.require_free_target(target)?;
                let info = mutation.new_node_info.clone().ok_or_else(|| {
                    CollaborationError::InvalidMutation(format!("add of {} without node info", target))
                })?;
                self.nodes.insert(target.to_string(), info);
            }
            MutationType::Delete => {
                let source = mutation.required_source()?;
                validate_path(source)?;
                self.require_node(source)?;
                for (path, _) in self.subtree(source) {
                    self.nodes.remove(&path);
                }
            }
            MutationType::Move | MutationType::Copy => {
                let source = mutation.required_source()?;
                let target = mutation.required_target()?;
                validate_path(source)?;
                self.require_node(source)?;
                self.require_free_target(target)?;
                if is_descendant(target, source) {
                    return Err(CollaborationError::InvalidMutation(format!(
                        "cannot place {} inside itself at {}",
                        source, target
                    )));
                }

                let moving = mutation.mutation_type == MutationType::Move;
                for (path, mut info) in self.subtree(source) {
                    if moving {
                        self.nodes.remove(&path);
                    } else {
                        // A copy is a new file without an edit session yet
                        info.file_edit_session_key = None;
                    }
                    self.nodes.insert(rebase_path(&path, source, target), info);
                }
            }
        }
        Ok(())
    }

    /// Apply a batch atomically and record it as the next revision
    pub fn commit(
        &mut self,
        author: ClientId,
        mutations: Vec<Mutation>,
        revision_type: RevisionType,
    ) -> Result<&TreeRevision> {
        let backup = self.nodes.clone();
        for mutation in &mutations {
            if let Err(e) = self.apply_mutation(mutation) {
                self.nodes = backup;
                return Err(e);
            }
        }

        self.revision += 1;
        let metadata = Revision::new(
            self.root_id(),
            format!("tree@{}", self.revision),
            revision_type,
        );
        self.history.push(TreeRevision {
            revision: self.revision,
            author,
            mutations,
            metadata,
        });
        Ok(&self.history[self.history.len() - 1])
    }
}
