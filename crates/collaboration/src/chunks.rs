/// Content-level conflict chunks
/// Three-way line merge of a file, with per-chunk resolution
use serde::{Deserialize, Serialize};
use similar::{DiffOp, TextDiff};

use crate::{CollaborationError, Result};

/// One colliding region. Line numbers are 0-based and index the merged text;
/// `end_line` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictChunk {
    pub start_line: usize,
    pub end_line: usize,
    pub local_text: String,
    pub remote_text: String,
    pub base_text: String,
    pub is_resolved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "text", rename_all = "snake_case")]
pub enum ChunkResolution {
    Local,
    Remote,
    Base,
    Custom(String),
}

/// Merged view of one file and the chunks that still need a decision.
///
/// Unresolved chunks show the local text until they are resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileConflicts {
    lines: Vec<String>,
    chunks: Vec<ConflictChunk>,
}

impl FileConflicts {
    pub fn chunks(&self) -> &[ConflictChunk] {
        &self.chunks
    }

    pub fn has_unresolved(&self) -> bool {
        self.chunks.iter().any(|c| !c.is_resolved)
    }

    pub fn merged_text(&self) -> String {
        self.lines.concat()
    }

    /// Replace a chunk's lines with the chosen text and shift the chunks after it
    pub fn resolve_chunk(&mut self, index: usize, resolution: ChunkResolution) -> Result<()> {
        let chunk = self
            .chunks
            .get(index)
            .ok_or_else(|| CollaborationError::ConflictNotFound(format!("chunk {}", index)))?;

        let text = match &resolution {
            ChunkResolution::Local => chunk.local_text.clone(),
            ChunkResolution::Remote => chunk.remote_text.clone(),
            ChunkResolution::Base => chunk.base_text.clone(),
            ChunkResolution::Custom(text) => text.clone(),
        };
        let replacement = split_lines(&text);
        let (start, end) = (chunk.start_line, chunk.end_line);
        let new_end = start + replacement.len();
        self.lines.splice(start..end, replacement);

        let chunk = &mut self.chunks[index];
        chunk.end_line = new_end;
        chunk.is_resolved = true;

        for later in self.chunks.iter_mut().skip(index + 1) {
            later.start_line = later.start_line + new_end - end;
            later.end_line = later.end_line + new_end - end;
        }
        Ok(())
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.split_inclusive('\n').map(str::to_string).collect()
}

/// For each line of `base`, the line of `side` it is kept as, if any
fn line_matches(base: &str, side: &str, base_len: usize) -> Vec<Option<usize>> {
    let diff = TextDiff::from_lines(base, side);
    let mut matches = vec![None; base_len];
    for op in diff.ops() {
        if let DiffOp::Equal {
            old_index,
            new_index,
            len,
        } = *op
        {
            for offset in 0..len {
                matches[old_index + offset] = Some(new_index + offset);
            }
        }
    }
    matches
}

/// Three-way merge of `local` and `remote` against their common `base`.
///
/// Base lines kept by both sides anchor the merge. Between anchors a side
/// that left the base untouched takes the other side's text, identical
/// changes merge, and anything else becomes a chunk.
pub fn detect_chunks(base: &str, local: &str, remote: &str) -> FileConflicts {
    let local_matches = line_matches(base, local, split_lines(base).len());
    let remote_matches = line_matches(base, remote, local_matches.len());
    let base = split_lines(base);
    let local = split_lines(local);
    let remote = split_lines(remote);

    let mut anchors: Vec<(usize, usize, usize)> = base
        .iter()
        .enumerate()
        .filter_map(|(b, _)| Some((b, local_matches[b]?, remote_matches[b]?)))
        .collect();
    anchors.push((base.len(), local.len(), remote.len()));

    let mut lines = Vec::new();
    let mut chunks = Vec::new();
    let (mut b0, mut l0, mut r0) = (0, 0, 0);

    for (b1, l1, r1) in anchors {
        let base_part = &base[b0..b1];
        let local_part = &local[l0..l1];
        let remote_part = &remote[r0..r1];

        if local_part == base_part || local_part == remote_part {
            lines.extend_from_slice(remote_part);
        } else if remote_part == base_part {
            lines.extend_from_slice(local_part);
        } else {
            let start_line = lines.len();
            lines.extend_from_slice(local_part);
            chunks.push(ConflictChunk {
                start_line,
                end_line: lines.len(),
                local_text: local_part.concat(),
                remote_text: remote_part.concat(),
                base_text: base_part.concat(),
                is_resolved: false,
            });
        }

        if b1 < base.len() {
            lines.push(base[b1].clone());
        }
        (b0, l0, r0) = (b1 + 1, l1 + 1, r1 + 1);
    }

    FileConflicts { lines, chunks }
}
