/// Transformation of concurrent operations
use crate::lines::{emit_retain, line_groups, take_overlap, zip_groups, Piece, Side};
use crate::{DocOp, DocOpBuilder, DocOpError, Result};

/// Rebase two operations made against the same document onto each other.
///
/// Returns `(a', b')` such that applying `a` then `b'` gives the same text as
/// applying `b` then `a'`. When both insert at the same position the insert
/// from `a` goes first, so callers pass the operation that was ordered first
/// (the one already in the log) as `a`.
pub fn transform(a: &DocOp, b: &DocOp) -> Result<(DocOp, DocOp)> {
    let a_input = a.input_extent();
    let b_input = b.input_extent();
    if !a_input.matches(&b_input) {
        return Err(DocOpError::IncompatibleOperation(format!(
            "operations apply to different documents: {} vs {}",
            a_input, b_input
        )));
    }

    let mut a_prime = DocOpBuilder::new();
    let mut b_prime = DocOpBuilder::new();
    let groups = zip_groups(line_groups(a, Side::Input), line_groups(b, Side::Input))?;

    for (mut a_line, mut b_line) in groups {
        loop {
            if let Some(Piece::Insert(text)) = a_line.front() {
                a_prime.insert(text);
                b_prime.retain_text(text);
                a_line.pop_front();
                continue;
            }
            if let Some(Piece::Insert(text)) = b_line.front() {
                b_prime.insert(text);
                a_prime.retain_text(text);
                b_line.pop_front();
                continue;
            }
            if a_line.is_empty() && b_line.is_empty() {
                break;
            }

            match take_overlap(&mut a_line, &mut b_line)? {
                (Piece::Retain { len, newline }, Piece::Retain { .. }) => {
                    emit_retain(&mut a_prime, len, newline);
                    emit_retain(&mut b_prime, len, newline);
                }
                (Piece::Retain { .. }, Piece::Delete(text)) => {
                    b_prime.delete(&text);
                }
                (Piece::Delete(text), Piece::Retain { .. }) => {
                    a_prime.delete(&text);
                }
                (Piece::Delete(a_text), Piece::Delete(b_text)) => {
                    // Removed by both sides; neither rebased op repeats it
                    if a_text != b_text {
                        return Err(DocOpError::IncompatibleOperation(format!(
                            "both operations delete at the same place but disagree: {:?} vs {:?}",
                            a_text, b_text
                        )));
                    }
                }
                (x, y) => {
                    return Err(DocOpError::IncompatibleOperation(format!(
                        "cannot transform {:?} against {:?}",
                        x, y
                    )))
                }
            }
        }
    }

    Ok((a_prime.build(), b_prime.build()))
}
