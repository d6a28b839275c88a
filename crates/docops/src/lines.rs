/// Line-by-line walking shared by compose and transform.
///
/// Operations are cut into line groups so that a retain-line, whose length is
/// unknown without the document, can be matched against the other side's
/// components for the same line.
use std::collections::VecDeque;

use crate::{DocOp, DocOpBuilder, DocOpComponent, DocOpError, Result};

/// Length of a piece; `Rest` runs to the end of the current line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Len {
    Chars(usize),
    Rest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Piece {
    Retain { len: Len, newline: bool },
    Insert(String),
    Delete(String),
}

impl Piece {
    fn size(&self) -> Len {
        match self {
            Piece::Retain { len, .. } => *len,
            Piece::Insert(text) | Piece::Delete(text) => Len::Chars(text.chars().count()),
        }
    }

    fn ends_line(&self) -> bool {
        match self {
            Piece::Retain { newline, .. } => *newline,
            Piece::Insert(text) | Piece::Delete(text) => text.ends_with('\n'),
        }
    }

    /// Split off the first `n` characters; `n` is smaller than the piece
    fn split_front(&mut self, n: usize) -> Piece {
        match self {
            Piece::Retain { len, .. } => {
                if let Len::Chars(total) = len {
                    *total -= n;
                }
                Piece::Retain {
                    len: Len::Chars(n),
                    newline: false,
                }
            }
            Piece::Insert(text) => Piece::Insert(split_text(text, n)),
            Piece::Delete(text) => Piece::Delete(split_text(text, n)),
        }
    }
}

fn split_text(text: &mut String, n: usize) -> String {
    let at = text
        .char_indices()
        .nth(n)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let rest = text.split_off(at);
    std::mem::replace(text, rest)
}

pub(crate) type LineGroup = VecDeque<Piece>;

/// Which pieces end a line for the side being walked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Input,
    Output,
}

/// Cut an operation into one group per line of the given side.
///
/// There is always one more group than line breaks; the last may be empty.
pub(crate) fn line_groups(op: &DocOp, side: Side) -> Vec<LineGroup> {
    let mut groups = Vec::new();
    let mut current = LineGroup::new();

    for component in op.components() {
        let pieces = match component {
            DocOpComponent::Retain {
                count,
                has_trailing_newline,
            } => vec![Piece::Retain {
                len: Len::Chars(*count),
                newline: *has_trailing_newline,
            }],
            DocOpComponent::RetainLine { line_count } => vec![
                Piece::Retain {
                    len: Len::Rest,
                    newline: true,
                };
                *line_count
            ],
            DocOpComponent::Insert { text } => vec![Piece::Insert(text.clone())],
            DocOpComponent::Delete { text } => vec![Piece::Delete(text.clone())],
        };

        for piece in pieces {
            let closes = match (&piece, side) {
                (Piece::Retain { newline, .. }, _) => *newline,
                (Piece::Delete(text), Side::Input) | (Piece::Insert(text), Side::Output) => {
                    text.ends_with('\n')
                }
                _ => false,
            };
            current.push_back(piece);
            if closes {
                groups.push(std::mem::take(&mut current));
            }
        }
    }

    groups.push(current);
    groups
}

/// Take the overlapping front of two length-carrying pieces.
///
/// Both fronts must be present. Returns the consumed chunk of each side; a
/// piece is only popped once fully consumed.
pub(crate) fn take_overlap(xs: &mut LineGroup, ys: &mut LineGroup) -> Result<(Piece, Piece)> {
    let (x, y) = match (xs.front_mut(), ys.front_mut()) {
        (Some(x), Some(y)) => (x, y),
        _ => {
            return Err(DocOpError::IncompatibleOperation(
                "line ended on one side only".to_string(),
            ))
        }
    };

    match (x.size(), y.size()) {
        (Len::Rest, Len::Rest) => {
            let chunk = Piece::Retain {
                len: Len::Rest,
                newline: true,
            };
            xs.pop_front();
            ys.pop_front();
            Ok((chunk.clone(), chunk))
        }
        (Len::Rest, Len::Chars(n)) => {
            let newline = y.ends_line();
            let x_chunk = Piece::Retain {
                len: Len::Chars(n),
                newline,
            };
            if newline {
                xs.pop_front();
            }
            let y_chunk = pop(ys)?;
            Ok((x_chunk, y_chunk))
        }
        (Len::Chars(n), Len::Rest) => {
            let newline = x.ends_line();
            let y_chunk = Piece::Retain {
                len: Len::Chars(n),
                newline,
            };
            if newline {
                ys.pop_front();
            }
            let x_chunk = pop(xs)?;
            Ok((x_chunk, y_chunk))
        }
        (Len::Chars(n), Len::Chars(k)) if n == k => {
            if x.ends_line() != y.ends_line() {
                return Err(DocOpError::IncompatibleOperation(format!(
                    "{:?} and {:?} disagree on a line break",
                    x, y
                )));
            }
            Ok((pop(xs)?, pop(ys)?))
        }
        (Len::Chars(n), Len::Chars(k)) => {
            let (shorter, longer, swapped) = if n < k { (xs, ys, false) } else { (ys, xs, true) };
            let short = pop(shorter)?;
            if short.ends_line() {
                return Err(DocOpError::IncompatibleOperation(format!(
                    "{:?} ends a line inside the other side's component",
                    short
                )));
            }
            let long = match longer.front_mut() {
                Some(piece) => piece.split_front(n.min(k)),
                None => return Err(DocOpError::IncompatibleOperation("missing piece".to_string())),
            };
            Ok(if swapped { (long, short) } else { (short, long) })
        }
    }
}

fn pop(group: &mut LineGroup) -> Result<Piece> {
    group
        .pop_front()
        .ok_or_else(|| DocOpError::IncompatibleOperation("missing piece".to_string()))
}

/// Pair up the groups of two operations, failing on a line count mismatch
pub(crate) fn zip_groups(
    left: Vec<LineGroup>,
    right: Vec<LineGroup>,
) -> Result<impl Iterator<Item = (LineGroup, LineGroup)>> {
    if left.len() != right.len() {
        return Err(DocOpError::IncompatibleOperation(format!(
            "operations cover {} and {} lines",
            left.len(),
            right.len()
        )));
    }
    Ok(left.into_iter().zip(right))
}

/// Emit a retain chunk, as a retain-line when it spans an unknown rest of line
pub(crate) fn emit_retain(builder: &mut DocOpBuilder, len: Len, newline: bool) {
    match len {
        Len::Rest => {
            builder.retain_line(1);
        }
        Len::Chars(n) => {
            builder.retain(n, newline);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_groups_by_input() {
        let op = DocOpBuilder::new()
            .retain_line(1)
            .insert("new\n")
            .delete("gone\n")
            .retain(2, false)
            .build();
        let groups = line_groups(&op, Side::Input);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[1].len(), 1);
        assert_eq!(groups[2].len(), 2);
    }

    #[test]
    fn test_line_groups_by_output() {
        let op = DocOpBuilder::new()
            .retain_line(1)
            .insert("new\n")
            .delete("gone\n")
            .retain(2, false)
            .build();
        let groups = line_groups(&op, Side::Output);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[1].len(), 2);
        assert_eq!(groups[2].len(), 1);
    }

    #[test]
    fn test_take_overlap_splits_longer() {
        let mut xs: LineGroup = vec![Piece::Delete("abcd".to_string())].into();
        let mut ys: LineGroup = vec![Piece::Retain {
            len: Len::Chars(1),
            newline: false,
        }]
        .into();
        let (x, y) = take_overlap(&mut xs, &mut ys).unwrap();
        assert_eq!(x, Piece::Delete("a".to_string()));
        assert_eq!(y.size(), Len::Chars(1));
        assert_eq!(xs.front(), Some(&Piece::Delete("bcd".to_string())));
        assert!(ys.is_empty());
    }

    #[test]
    fn test_take_overlap_rest_follows_line_end() {
        let mut xs: LineGroup = vec![Piece::Retain {
            len: Len::Rest,
            newline: true,
        }]
        .into();
        let mut ys: LineGroup = vec![
            Piece::Delete("ab".to_string()),
            Piece::Delete("c\n".to_string()),
        ]
        .into();

        take_overlap(&mut xs, &mut ys).unwrap();
        assert_eq!(xs.len(), 1);

        let (x, _) = take_overlap(&mut xs, &mut ys).unwrap();
        assert_eq!(
            x,
            Piece::Retain {
                len: Len::Chars(2),
                newline: true
            }
        );
        assert!(xs.is_empty());
        assert!(ys.is_empty());
    }

    #[test]
    fn test_take_overlap_rejects_line_break_mismatch() {
        let mut xs: LineGroup = vec![Piece::Delete("ab\n".to_string())].into();
        let mut ys: LineGroup = vec![Piece::Retain {
            len: Len::Chars(5),
            newline: false,
        }]
        .into();
        assert!(matches!(
            take_overlap(&mut xs, &mut ys),
            Err(DocOpError::IncompatibleOperation(_))
        ));
    }
}
