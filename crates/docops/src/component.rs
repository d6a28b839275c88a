/// Operation components, the immutable DocOp value and its extent
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{DocOpBuilder, DocOpError, Result};

/// One step of an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DocOpComponent {
    /// Copy `count` characters; the last one is a newline iff `has_trailing_newline`
    #[serde(rename = "retain")]
    Retain {
        count: usize,
        has_trailing_newline: bool,
    },

    /// Copy the rest of the current line, then `line_count - 1` whole lines
    #[serde(rename = "retain_line")]
    RetainLine { line_count: usize },

    #[serde(rename = "insert")]
    Insert { text: String },

    #[serde(rename = "delete")]
    Delete { text: String },
}

impl DocOpComponent {
    pub fn retain(count: usize, has_trailing_newline: bool) -> Self {
        Self::Retain {
            count,
            has_trailing_newline,
        }
    }

    pub fn retain_line(line_count: usize) -> Self {
        Self::RetainLine { line_count }
    }

    pub fn insert(text: impl Into<String>) -> Self {
        Self::Insert { text: text.into() }
    }

    pub fn delete(text: impl Into<String>) -> Self {
        Self::Delete { text: text.into() }
    }

    /// Check the line-structure rules every component must satisfy
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Retain { count, .. } => {
                if *count == 0 {
                    return Err(DocOpError::MalformedOperation(
                        "retain with zero count".to_string(),
                    ));
                }
            }
            Self::RetainLine { line_count } => {
                if *line_count == 0 {
                    return Err(DocOpError::MalformedOperation(
                        "retain line with zero line count".to_string(),
                    ));
                }
            }
            Self::Insert { text } => validate_text("insert", text)?,
            Self::Delete { text } => validate_text("delete", text)?,
        }
        Ok(())
    }
}

fn validate_text(kind: &str, text: &str) -> Result<()> {
    if text.is_empty() {
        return Err(DocOpError::MalformedOperation(format!(
            "{} with empty text",
            kind
        )));
    }
    if let Some(pos) = text.find('\n') {
        if pos + 1 != text.len() {
            return Err(DocOpError::MalformedOperation(format!(
                "{} text {:?} spans more than one line",
                kind, text
            )));
        }
    }
    Ok(())
}

impl fmt::Display for DocOpComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retain {
                count,
                has_trailing_newline: true,
            } => write!(f, "R({},nl)", count),
            Self::Retain { count, .. } => write!(f, "R({})", count),
            Self::RetainLine { line_count } => write!(f, "RL({})", line_count),
            Self::Insert { text } => write!(f, "I({:?})", text),
            Self::Delete { text } => write!(f, "D({:?})", text),
        }
    }
}

/// Which side of an operation a length refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    /// The document the operation applies to
    Input,
    /// The document the operation produces
    Output,
}

/// Shape of the document an operation consumes or produces.
///
/// Line breaks and the tail (characters after the last newline) are always
/// exact. `chars` counts every character outside retain-line components, so
/// the total length is only known exactly when `retained_lines` is zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub chars: usize,
    pub line_breaks: usize,
    pub retained_lines: usize,
    pub tail: usize,
}

impl Extent {
    /// Exact length in characters, if the operation pins it down
    pub fn exact_len(&self) -> Option<usize> {
        (self.retained_lines == 0).then_some(self.chars)
    }

    /// Smallest document length consistent with this extent
    pub fn min_len(&self) -> usize {
        self.chars + self.retained_lines
    }

    /// Whether a document of exactly `len` characters fits this extent
    pub fn admits_len(&self, len: usize) -> bool {
        match self.exact_len() {
            Some(exact) => exact == len,
            None => self.min_len() <= len,
        }
    }

    /// Whether both extents can describe the same document
    pub fn matches(&self, other: &Extent) -> bool {
        if self.line_breaks != other.line_breaks || self.tail != other.tail {
            return false;
        }
        match (self.exact_len(), other.exact_len()) {
            (Some(a), Some(b)) => a == b,
            (Some(a), None) => other.min_len() <= a,
            (None, Some(b)) => self.min_len() <= b,
            (None, None) => true,
        }
    }

    fn add_text(&mut self, text: &str) {
        let len = text.chars().count();
        self.chars += len;
        if text.ends_with('\n') {
            self.line_breaks += 1;
            self.tail = 0;
        } else {
            self.tail += len;
        }
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exact_len() {
            Some(len) => write!(
                f,
                "{} chars, {} line breaks, tail {}",
                len, self.line_breaks, self.tail
            ),
            None => write!(
                f,
                ">= {} chars, {} line breaks, tail {}",
                self.min_len(),
                self.line_breaks,
                self.tail
            ),
        }
    }
}

/// An immutable, validated document operation
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<DocOpComponent>", into = "Vec<DocOpComponent>")]
pub struct DocOp {
    components: Vec<DocOpComponent>,
}

impl DocOp {
    /// Validate and wrap a component sequence
    pub fn new(components: Vec<DocOpComponent>) -> Result<Self> {
        for component in &components {
            component.validate()?;
        }
        Ok(Self { components })
    }

    /// Like [`DocOp::new`], but also checks the input tiles `declared` characters
    pub fn with_input_length(components: Vec<DocOpComponent>, declared: usize) -> Result<Self> {
        let op = Self::new(components)?;
        let extent = op.input_extent();
        if !extent.admits_len(declared) {
            return Err(DocOpError::MalformedOperation(format!(
                "components consume {} but the operation claims {} chars",
                extent, declared
            )));
        }
        Ok(op)
    }

    /// Builder output is valid by construction
    pub(crate) fn from_built(components: Vec<DocOpComponent>) -> Self {
        Self { components }
    }

    /// The operation that leaves any document with this extent unchanged
    pub fn identity(extent: &Extent) -> Self {
        DocOpBuilder::new()
            .retain_line(extent.line_breaks)
            .retain(extent.tail, false)
            .build()
    }

    /// The identity operation for a concrete document
    pub fn identity_for(text: &str) -> Self {
        DocOpBuilder::new().retain_text(text).build()
    }

    pub fn components(&self) -> &[DocOpComponent] {
        &self.components
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// True when the operation changes nothing
    pub fn is_noop(&self) -> bool {
        self.components.iter().all(|c| {
            matches!(
                c,
                DocOpComponent::Retain { .. } | DocOpComponent::RetainLine { .. }
            )
        })
    }

    /// Measure the document on one side of the operation
    pub fn length_of(&self, axis: Axis) -> Extent {
        let mut extent = Extent::default();
        for component in &self.components {
            match component {
                DocOpComponent::Retain {
                    count,
                    has_trailing_newline,
                } => {
                    extent.chars += count;
                    if *has_trailing_newline {
                        extent.line_breaks += 1;
                        extent.tail = 0;
                    } else {
                        extent.tail += count;
                    }
                }
                DocOpComponent::RetainLine { line_count } => {
                    extent.line_breaks += line_count;
                    extent.retained_lines += line_count;
                    extent.tail = 0;
                }
                DocOpComponent::Insert { text } if axis == Axis::Output => extent.add_text(text),
                DocOpComponent::Delete { text } if axis == Axis::Input => extent.add_text(text),
                DocOpComponent::Insert { .. } | DocOpComponent::Delete { .. } => {}
            }
        }
        extent
    }

    pub fn input_extent(&self) -> Extent {
        self.length_of(Axis::Input)
    }

    pub fn output_extent(&self) -> Extent {
        self.length_of(Axis::Output)
    }

    /// Rebuild through the builder so equal edits compare equal
    pub fn normalized(&self) -> Self {
        let mut builder = DocOpBuilder::new();
        for component in &self.components {
            builder.push(component.clone());
        }
        builder.build()
    }
}

impl TryFrom<Vec<DocOpComponent>> for DocOp {
    type Error = DocOpError;

    fn try_from(components: Vec<DocOpComponent>) -> Result<Self> {
        Self::new(components)
    }
}

impl From<DocOp> for Vec<DocOpComponent> {
    fn from(op: DocOp) -> Self {
        op.components
    }
}

impl fmt::Display for DocOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", component)?;
        }
        write!(f, "]")
    }
}
