//! Transform engine for concurrent operations.
//!
//! Given `a` and `b` computed against the same document, [`transform`]
//! returns `(a', b')` with `apply(apply(doc, a), b') == apply(apply(doc, b), a')`.
//!
//! When both operations insert at the same position, the operation whose
//! client id is lexicographically smaller ends up *after* the other one's
//! insertion. Server and clients use the same rule, so every peer computes
//! byte-identical results for the same pair. Timestamps never take part.

use crate::error::{CollabError, CollabResult};
use crate::operation::{char_len, remainder, Component, Operation, TextOperation};

/// Which operand's text goes second when both insert at one position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TieBreak {
    /// The first operand's insert is placed after the second's.
    FirstAfter,
    /// The first operand's insert is placed before the second's.
    FirstBefore,
}

impl TieBreak {
    /// Decide the tie-break for `a` against `b` from their client ids.
    ///
    /// Equal client ids only happen for the same client; the operation id
    /// keeps the order total anyway.
    pub fn between(a: &Operation, b: &Operation) -> Self {
        if (&a.client_id, a.id) < (&b.client_id, b.id) {
            TieBreak::FirstAfter
        } else {
            TieBreak::FirstBefore
        }
    }
}

/// Transform two concurrent text operations against each other.
pub fn transform(
    a: &TextOperation,
    b: &TextOperation,
    tie: TieBreak,
) -> CollabResult<(TextOperation, TextOperation)> {
    if a.base_len() != b.base_len() {
        return Err(CollabError::LengthMismatch {
            expected: a.base_len(),
            actual: b.base_len(),
        });
    }

    let mut a_prime = TextOperation::new();
    let mut b_prime = TextOperation::new();
    let mut iter_a = a.components().iter().cloned();
    let mut iter_b = b.components().iter().cloned();
    let mut ca = iter_a.next();
    let mut cb = iter_b.next();

    loop {
        let a_inserts = matches!(ca, Some(Component::Insert(_)));
        let b_inserts = matches!(cb, Some(Component::Insert(_)));

        if a_inserts && (!b_inserts || tie == TieBreak::FirstBefore) {
            if let Some(Component::Insert(text)) = ca.take() {
                b_prime.retain(char_len(&text));
                a_prime.insert(&text);
            }
            ca = iter_a.next();
            continue;
        }
        if b_inserts {
            if let Some(Component::Insert(text)) = cb.take() {
                a_prime.retain(char_len(&text));
                b_prime.insert(&text);
            }
            cb = iter_b.next();
            continue;
        }

        match (ca.take(), cb.take()) {
            (None, None) => break,
            (None, _) | (_, None) => {
                return Err(CollabError::MalformedOperation(
                    "transform: operands cover different lengths".to_string(),
                ));
            }
            (Some(Component::Retain(x)), Some(Component::Retain(y))) => {
                let n = x.min(y);
                a_prime.retain(n);
                b_prime.retain(n);
                ca = remainder(Component::Retain(x - n), &mut iter_a);
                cb = remainder(Component::Retain(y - n), &mut iter_b);
            }
            (Some(Component::Delete(x)), Some(Component::Delete(y))) => {
                // Both removed the same span; nothing left to do for it.
                let n = x.min(y);
                ca = remainder(Component::Delete(x - n), &mut iter_a);
                cb = remainder(Component::Delete(y - n), &mut iter_b);
            }
            (Some(Component::Delete(x)), Some(Component::Retain(y))) => {
                let n = x.min(y);
                a_prime.delete(n);
                ca = remainder(Component::Delete(x - n), &mut iter_a);
                cb = remainder(Component::Retain(y - n), &mut iter_b);
            }
            (Some(Component::Retain(x)), Some(Component::Delete(y))) => {
                let n = x.min(y);
                b_prime.delete(n);
                ca = remainder(Component::Retain(x - n), &mut iter_a);
                cb = remainder(Component::Delete(y - n), &mut iter_b);
            }
            (Some(Component::Insert(_)), _) | (_, Some(Component::Insert(_))) => {
                return Err(CollabError::MalformedOperation(
                    "transform: unexpected insert while matching spans".to_string(),
                ));
            }
        }
    }

    Ok((a_prime, b_prime))
}

/// Transform two concurrent [`Operation`]s, deriving the tie-break from
/// their client ids. Returns `(a', b')` keeping each operation's identity.
pub fn transform_operations(a: &Operation, b: &Operation) -> CollabResult<(Operation, Operation)> {
    let (a_ops, b_ops) = transform(&a.ops, &b.ops, TieBreak::between(a, b))?;
    Ok((a.with_ops(a_ops), b.with_ops(b_ops)))
}

/// Rebase `op` over a sequence of operations that were applied after its
/// base, oldest first.
pub fn rebase<'a>(
    op: &Operation,
    applied: impl IntoIterator<Item = &'a Operation>,
) -> CollabResult<Operation> {
    let mut current = op.clone();
    for other in applied {
        let (rebased, _) = transform_operations(&current, other)?;
        current = rebased;
    }
    Ok(current)
}

/// Shift a character offset through `op`.
///
/// Text inserted exactly at `index` pushes it forward.
pub fn transform_index(index: usize, op: &TextOperation) -> usize {
    let mut new_index = index;
    let mut pos = 0usize;
    for component in op.components() {
        if pos > index {
            break;
        }
        match component {
            Component::Retain(n) => pos += n,
            Component::Insert(text) => {
                new_index += char_len(text);
            }
            Component::Delete(n) => {
                let removed = (*n).min(index.saturating_sub(pos));
                new_index -= removed;
                pos += n;
            }
        }
    }
    new_index
}
