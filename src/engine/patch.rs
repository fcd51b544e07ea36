use std::error::Error;
use std::fmt;

use super::diff::DiffOp;

/// A context-anchored edit script submitted by a client, covering the whole
/// document it was built against.
pub type PatchBatch = Vec<DiffOp>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    /// An `Equal` or `Delete` span did not match the document at its offset.
    ContextMismatch { offset: usize, expected: String },
    /// The batch stopped short of the end of the document.
    UnconsumedTail { offset: usize, remaining: usize },
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::ContextMismatch { offset, expected } => {
                write!(
                    f,
                    "patch context mismatch at offset {offset}: expected {expected:?}"
                )
            }
            PatchError::UnconsumedTail { offset, remaining } => {
                write!(
                    f,
                    "patch batch ends at offset {offset} but {remaining} characters of the document remain"
                )
            }
        }
    }
}

impl Error for PatchError {}

/// Apply a patch batch to `text`, all-or-nothing.
///
/// `Equal` spans are verified and carried over, `Delete` spans are verified
/// and dropped, `Insert` spans are added. Offsets are char offsets. A batch
/// built against a stale revision fails the context check and leaves the
/// caller's text untouched; no partial application is ever observable.
pub fn apply(text: &str, patches: &PatchBatch) -> Result<String, PatchError> {
    let src: Vec<char> = text.chars().collect();
    let mut cursor = 0usize;
    let mut out = String::with_capacity(text.len());

    for op in patches {
        match op {
            DiffOp::Equal(expected) | DiffOp::Delete(expected) => {
                if !matches_at(&src, cursor, expected) {
                    return Err(PatchError::ContextMismatch {
                        offset: cursor,
                        expected: expected.clone(),
                    });
                }
                if let DiffOp::Equal(_) = op {
                    out.push_str(expected);
                }
                cursor += expected.chars().count();
            }
            DiffOp::Insert(addition) => out.push_str(addition),
        }
    }

    if cursor != src.len() {
        return Err(PatchError::UnconsumedTail {
            offset: cursor,
            remaining: src.len() - cursor,
        });
    }

    Ok(out)
}

fn matches_at(src: &[char], at: usize, expected: &str) -> bool {
    let mut i = at;
    for ch in expected.chars() {
        match src.get(i) {
            Some(c) if *c == ch => i += 1,
            _ => return false,
        }
    }
    true
}
