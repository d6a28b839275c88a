/// Composition of sequential operations
use crate::lines::{emit_retain, line_groups, take_overlap, zip_groups, Piece, Side};
use crate::{DocOp, DocOpBuilder, DocOpError, Result};

/// Combine `a` then `b` into a single equivalent operation.
///
/// Deletions from `a` pass through first, then insertions from `b`, so an
/// insert that meets a retain at the same position always lands before it.
pub fn compose(a: &DocOp, b: &DocOp) -> Result<DocOp> {
    let a_output = a.output_extent();
    let b_input = b.input_extent();
    if !a_output.matches(&b_input) {
        return Err(DocOpError::IncompatibleOperation(format!(
            "first operation produces {} but second consumes {}",
            a_output, b_input
        )));
    }

    let mut builder = DocOpBuilder::new();
    let groups = zip_groups(line_groups(a, Side::Output), line_groups(b, Side::Input))?;

    for (mut a_line, mut b_line) in groups {
        loop {
            if let Some(Piece::Delete(text)) = a_line.front() {
                builder.delete(text);
                a_line.pop_front();
                continue;
            }
            if let Some(Piece::Insert(text)) = b_line.front() {
                builder.insert(text);
                b_line.pop_front();
                continue;
            }
            if a_line.is_empty() && b_line.is_empty() {
                break;
            }

            match take_overlap(&mut a_line, &mut b_line)? {
                (Piece::Insert(text), Piece::Retain { .. }) => {
                    builder.insert(&text);
                }
                (Piece::Insert(inserted), Piece::Delete(deleted)) => {
                    if inserted != deleted {
                        return Err(DocOpError::IncompatibleOperation(format!(
                            "second operation deletes {:?} where the first inserted {:?}",
                            deleted, inserted
                        )));
                    }
                }
                (Piece::Retain { len, newline }, Piece::Retain { .. }) => {
                    emit_retain(&mut builder, len, newline);
                }
                (Piece::Retain { .. }, Piece::Delete(text)) => {
                    builder.delete(&text);
                }
                (x, y) => {
                    return Err(DocOpError::IncompatibleOperation(format!(
                        "cannot compose {:?} with {:?}",
                        x, y
                    )))
                }
            }
        }
    }

    Ok(builder.build())
}

/// Compose a run of operations in order; `None` when there are none
pub fn compose_all<'a, I>(ops: I) -> Result<Option<DocOp>>
where
    I: IntoIterator<Item = &'a DocOp>,
{
    let mut ops = ops.into_iter();
    let Some(first) = ops.next() else {
        return Ok(None);
    };
    let mut composed = first.clone();
    for op in ops {
        composed = compose(&composed, op)?;
    }
    Ok(Some(composed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{apply, DocOpComponent};

    fn b() -> DocOpBuilder {
        DocOpBuilder::new()
    }

    #[test]
    fn test_compose_inserts() {
        let a = b().insert("X").retain(3, false).build();
        let c = b().retain(4, false).insert("Y").build();
        let composed = compose(&a, &c).unwrap();
        assert_eq!(apply(&composed, "abc").unwrap(), "XabcY");
        assert_eq!(
            composed.components(),
            &[
                DocOpComponent::insert("X"),
                DocOpComponent::retain(3, false),
                DocOpComponent::insert("Y"),
            ]
        );
    }

    #[test]
    fn test_compose_insert_then_delete_cancels() {
        let a = b().retain(1, false).insert("tmp").retain(1, false).build();
        let c = b().retain(1, false).delete("tmp").retain(1, false).build();
        let composed = compose(&a, &c).unwrap();
        assert_eq!(composed.components(), &[DocOpComponent::retain(2, false)]);
    }

    #[test]
    fn test_compose_delete_passes_through() {
        let a = b().delete("hello").insert("world").build();
        let c = b().retain(5, false).insert("!").build();
        let composed = compose(&a, &c).unwrap();
        assert_eq!(apply(&composed, "hello").unwrap(), "world!");
        assert_eq!(
            composed.components(),
            &[DocOpComponent::delete("hello"), DocOpComponent::insert("world!")]
        );
    }

    #[test]
    fn test_compose_with_retain_lines() {
        let doc = "one\ntwo\nthree\n";
        let a = b().retain_line(1).insert("X").retain_line(2).build();
        let c = b().retain_line(2).delete("three\n").build();
        let composed = compose(&a, &c).unwrap();
        assert_eq!(
            apply(&composed, doc).unwrap(),
            apply(&c, &apply(&a, doc).unwrap()).unwrap()
        );
        assert_eq!(
            composed.components(),
            &[
                DocOpComponent::retain_line(1),
                DocOpComponent::insert("X"),
                DocOpComponent::retain_line(1),
                DocOpComponent::delete("three\n"),
            ]
        );
    }

    #[test]
    fn test_compose_joins_lines() {
        let doc = "ab\ncd";
        let a = b().retain(2, false).delete("\n").retain(2, false).build();
        let c = b().retain(1, false).delete("bc").retain(1, false).build();
        let composed = compose(&a, &c).unwrap();
        assert_eq!(apply(&composed, doc).unwrap(), "ad");
    }

    #[test]
    fn test_compose_rejects_length_mismatch() {
        let a = b().insert("abc").build();
        let c = b().retain(4, false).build();
        assert!(matches!(
            compose(&a, &c),
            Err(DocOpError::IncompatibleOperation(_))
        ));
    }

    #[test]
    fn test_compose_rejects_deleting_other_text() {
        let a = b().insert("abc").build();
        let c = b().delete("xyz").build();
        assert!(matches!(
            compose(&a, &c),
            Err(DocOpError::IncompatibleOperation(_))
        ));
    }

    #[test]
    fn test_compose_with_identity() {
        let a = b()
            .retain_line(1)
            .retain(2, false)
            .delete("x")
            .insert("yz\n")
            .retain(3, true)
            .retain(2, false)
            .build();
        let left = DocOp::identity(&a.input_extent());
        let right = DocOp::identity(&a.output_extent());
        assert_eq!(compose(&a, &right).unwrap(), a);
        assert_eq!(compose(&left, &a).unwrap(), a);
    }

    #[test]
    fn test_compose_all() {
        let ops = vec![
            b().insert("a").build(),
            b().retain(1, false).insert("b").build(),
            b().retain(2, false).insert("c").build(),
        ];
        let composed = compose_all(&ops).unwrap().unwrap();
        assert_eq!(composed.components(), &[DocOpComponent::insert("abc")]);
        assert!(compose_all(&[]).unwrap().is_none());
    }
}
