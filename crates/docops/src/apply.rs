/// Applying an operation to document text
use crate::{DocOp, DocOpComponent, DocOpError, Result};

/// Apply `op` to `text`, checking every component against the document.
///
/// Retains must not cross a newline except as their flagged last character,
/// deleted text must match the document, and the operation must consume the
/// whole input.
pub fn apply(op: &DocOp, text: &str) -> Result<String> {
    let input: Vec<char> = text.chars().collect();
    let mut pos = 0;
    let mut output = String::with_capacity(text.len());

    for component in op.components() {
        match component {
            DocOpComponent::Retain {
                count,
                has_trailing_newline,
            } => {
                let end = pos + count;
                if end > input.len() {
                    return Err(malformed(component, pos, "runs past the end of the document"));
                }
                let span = &input[pos..end];
                let (last, body) = span
                    .split_last()
                    .ok_or_else(|| malformed(component, pos, "is empty"))?;
                if body.contains(&'\n') || (*last == '\n') != *has_trailing_newline {
                    return Err(malformed(component, pos, "disagrees with the line structure"));
                }
                output.extend(span);
                pos = end;
            }
            DocOpComponent::RetainLine { line_count } => {
                for _ in 0..*line_count {
                    let offset = input[pos..]
                        .iter()
                        .position(|c| *c == '\n')
                        .ok_or_else(|| malformed(component, pos, "found no line to retain"))?;
                    let end = pos + offset + 1;
                    output.extend(&input[pos..end]);
                    pos = end;
                }
            }
            DocOpComponent::Insert { text } => output.push_str(text),
            DocOpComponent::Delete { text } => {
                let len = text.chars().count();
                let end = pos + len;
                if end > input.len() || !input[pos..end].iter().copied().eq(text.chars()) {
                    return Err(malformed(component, pos, "does not match the document"));
                }
                pos = end;
            }
        }
    }

    if pos != input.len() {
        return Err(DocOpError::MalformedOperation(format!(
            "operation {} stops at {} of {} chars",
            op,
            pos,
            input.len()
        )));
    }

    Ok(output)
}

fn malformed(component: &DocOpComponent, pos: usize, reason: &str) -> DocOpError {
    DocOpError::MalformedOperation(format!("{} at {} {}", component, pos, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DocOpBuilder;

    #[test]
    fn test_apply_insert_and_delete() {
        let op = DocOpBuilder::new()
            .retain(1, false)
            .delete("b")
            .insert("XY")
            .retain(1, false)
            .build();
        assert_eq!(apply(&op, "abc").unwrap(), "aXYc");
    }

    #[test]
    fn test_apply_retain_line() {
        let op = DocOpBuilder::new()
            .retain_line(1)
            .insert("new\n")
            .retain_line(1)
            .retain(3, false)
            .build();
        assert_eq!(
            apply(&op, "first\nsecond\nend").unwrap(),
            "first\nnew\nsecond\nend"
        );
    }

    #[test]
    fn test_apply_retain_line_mid_line() {
        let op = DocOpBuilder::new().insert(">").retain_line(1).build();
        assert_eq!(apply(&op, "line\n").unwrap(), ">line\n");
    }

    #[test]
    fn test_apply_counts_chars_not_bytes() {
        let op = DocOpBuilder::new().retain(2, false).insert("!").build();
        assert_eq!(apply(&op, "hé").unwrap(), "hé!");
    }

    #[test]
    fn test_apply_rejects_short_operation() {
        let op = DocOpBuilder::new().retain(2, false).build();
        assert!(matches!(
            apply(&op, "abc"),
            Err(DocOpError::MalformedOperation(_))
        ));
    }

    #[test]
    fn test_apply_rejects_wrong_delete() {
        let op = DocOpBuilder::new().delete("xyz").build();
        assert!(apply(&op, "abc").is_err());
    }

    #[test]
    fn test_apply_rejects_retain_across_newline() {
        let op = DocOp::new(vec![DocOpComponent::retain(4, false)]).unwrap();
        assert!(apply(&op, "ab\nc").is_err());

        let op = DocOp::new(vec![DocOpComponent::retain(2, true)]).unwrap();
        assert!(apply(&op, "ab").is_err());
    }

    #[test]
    fn test_apply_rejects_retain_line_on_last_segment() {
        let op = DocOpBuilder::new().retain_line(1).build();
        assert!(apply(&op, "no newline").is_err());
    }
}
