/// Incremental, compacting construction of operations
use crate::{DocOp, DocOpComponent};

/// Builds a [`DocOp`] component by component.
///
/// Adjacent components of the same kind are merged unless the pending one
/// already ends a line, and a line touched only by retains collapses into a
/// retain-line. Multi-line text is split so every component stays on one line.
/// Within a run of edits between two retains, deletes are emitted before
/// inserts, which gives equal edits equal component lists.
#[derive(Debug, Default)]
pub struct DocOpBuilder {
    components: Vec<DocOpComponent>,
    /// Pending retain or retain-line
    current: Option<DocOpComponent>,
    deleted: Vec<String>,
    inserted: Vec<String>,
    line_has_edits: bool,
}

impl DocOpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retain(&mut self, count: usize, has_trailing_newline: bool) -> &mut Self {
        if count == 0 {
            return self;
        }
        self.flush_edits();

        if has_trailing_newline && !self.line_has_edits {
            // Only retains on this line so far
            return self.retain_line(1);
        }

        let merged = match &mut self.current {
            Some(DocOpComponent::Retain {
                count: pending,
                has_trailing_newline: pending_newline,
            }) if !*pending_newline => {
                *pending += count;
                *pending_newline = has_trailing_newline;
                true
            }
            _ => false,
        };
        if !merged {
            self.commit();
            self.current = Some(DocOpComponent::retain(count, has_trailing_newline));
        }

        if has_trailing_newline {
            self.line_has_edits = false;
        }
        self
    }

    pub fn retain_line(&mut self, line_count: usize) -> &mut Self {
        if line_count == 0 {
            return self;
        }
        self.flush_edits();

        // A partial retain of the same line is covered by the retain-line
        if matches!(
            self.current,
            Some(DocOpComponent::Retain {
                has_trailing_newline: false,
                ..
            })
        ) {
            self.current = None;
        }

        if let Some(DocOpComponent::RetainLine { line_count: pending }) = &mut self.current {
            *pending += line_count;
        } else {
            self.commit();
            self.current = Some(DocOpComponent::retain_line(line_count));
        }
        self.line_has_edits = false;
        self
    }

    /// Retain exactly `text`, one retain per line
    pub fn retain_text(&mut self, text: &str) -> &mut Self {
        for line in text.split_inclusive('\n') {
            self.retain(line.chars().count(), line.ends_with('\n'));
        }
        self
    }

    pub fn insert(&mut self, text: &str) -> &mut Self {
        self.commit();
        for line in text.split_inclusive('\n') {
            push_line(&mut self.inserted, line);
        }
        self
    }

    pub fn delete(&mut self, text: &str) -> &mut Self {
        self.commit();
        for line in text.split_inclusive('\n') {
            push_line(&mut self.deleted, line);
        }
        self
    }

    /// Append an already-formed component
    pub fn push(&mut self, component: DocOpComponent) -> &mut Self {
        match component {
            DocOpComponent::Retain {
                count,
                has_trailing_newline,
            } => self.retain(count, has_trailing_newline),
            DocOpComponent::RetainLine { line_count } => self.retain_line(line_count),
            DocOpComponent::Insert { text } => self.insert(&text),
            DocOpComponent::Delete { text } => self.delete(&text),
        }
    }

    /// Finish the operation and reset the builder
    pub fn build(&mut self) -> DocOp {
        self.flush_edits();
        self.commit();
        self.line_has_edits = false;
        DocOp::from_built(std::mem::take(&mut self.components))
    }

    fn flush_edits(&mut self) {
        if self.deleted.is_empty() && self.inserted.is_empty() {
            return;
        }

        let deleted = std::mem::take(&mut self.deleted);
        let inserted = std::mem::take(&mut self.inserted);
        let last = inserted.last().or(deleted.last());
        self.line_has_edits = last.map_or(false, |text| !text.ends_with('\n'));

        self.components
            .extend(deleted.into_iter().map(|text| DocOpComponent::Delete { text }));
        self.components
            .extend(inserted.into_iter().map(|text| DocOpComponent::Insert { text }));
    }

    fn commit(&mut self) {
        if let Some(component) = self.current.take() {
            self.components.push(component);
        }
    }
}

/// Append one line segment, extending the last entry if it is still open
fn push_line(lines: &mut Vec<String>, line: &str) {
    match lines.last_mut() {
        Some(open) if !open.ends_with('\n') => open.push_str(line),
        _ => lines.push(line.to_string()),
    }
}
