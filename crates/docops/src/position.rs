/// Moving cursor positions through an operation
use serde::{Deserialize, Serialize};

use crate::{DocOp, DocOpComponent};

/// A zero-based line and column (in chars) within a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

impl Position {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }

    /// Same offset from `to` as `self` has from `from`
    fn shifted(self, from: Position, to: Position) -> Position {
        if self.line == from.line {
            Position::new(to.line, to.column + self.column - from.column)
        } else {
            Position::new(to.line + self.line - from.line, self.column)
        }
    }
}

/// Where the text at `line`/`column` ends up once `op` is applied.
///
/// An insert at or before the position pushes it forward. A position inside
/// deleted text collapses to where the delete happened. Positions past the
/// last component keep their offset from the end of the operation, so a
/// partial operation still moves later positions correctly.
pub fn transform_position(op: &DocOp, line: usize, column: usize) -> Position {
    let target = Position::new(line, column);
    let mut input = Position::default();
    let mut output = Position::default();

    for component in op.components() {
        match component {
            DocOpComponent::Insert { text } => {
                if input > target {
                    break;
                }
                output = advance(output, text.chars().count(), text.ends_with('\n'));
            }
            DocOpComponent::Retain {
                count,
                has_trailing_newline,
            } => {
                if target.line == input.line && target.column < input.column + count {
                    return target.shifted(input, output);
                }
                input = advance(input, *count, *has_trailing_newline);
                output = advance(output, *count, *has_trailing_newline);
            }
            DocOpComponent::RetainLine { line_count } => {
                if target.line < input.line + line_count {
                    return target.shifted(input, output);
                }
                input = Position::new(input.line + line_count, 0);
                output = Position::new(output.line + line_count, 0);
            }
            DocOpComponent::Delete { text } => {
                let end = advance(input, text.chars().count(), text.ends_with('\n'));
                if input <= target && target < end {
                    return output;
                }
                input = end;
            }
        }
    }

    target.shifted(input, output)
}

fn advance(pos: Position, count: usize, ends_line: bool) -> Position {
    if ends_line {
        Position::new(pos.line + 1, 0)
    } else {
        Position::new(pos.line, pos.column + count)
    }
}
