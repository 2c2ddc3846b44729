//! Operation model: Retain/Insert/Delete sequences and their algebra.
//!
//! A [`TextOperation`] always spans a whole document: the Retain and Delete
//! components together consume exactly `base_len` characters, and the result
//! has `target_len` characters. Lengths count Unicode scalar values.
//!
//! The builder keeps operations canonical: adjacent components of the same
//! kind are merged, zero-length components are dropped, and an insert is
//! always placed before an adjacent delete. Two operations with the same
//! effect therefore compare equal.

use crate::error::{CollabError, CollabResult};
use crate::ids::{ClientId, OperationId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single primitive edit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    /// Keep the next `n` characters.
    Retain(usize),
    /// Insert text at the current position.
    Insert(String),
    /// Remove the next `n` characters.
    Delete(usize),
}

/// An ordered sequence of components covering a full document.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Component>", into = "Vec<Component>")]
pub struct TextOperation {
    components: Vec<Component>,
    base_len: usize,
    target_len: usize,
}

impl TextOperation {
    /// Create an empty operation (applies to the empty document).
    pub fn new() -> Self {
        Self::default()
    }

    /// The identity operation for a document of `len` characters.
    pub fn identity(len: usize) -> Self {
        let mut op = Self::new();
        op.retain(len);
        op
    }

    /// Components in order.
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Length of the document this operation applies to.
    pub fn base_len(&self) -> usize {
        self.base_len
    }

    /// Length of the document this operation produces.
    pub fn target_len(&self) -> usize {
        self.target_len
    }

    /// True if applying this operation never changes a document.
    pub fn is_noop(&self) -> bool {
        self.components
            .iter()
            .all(|c| matches!(c, Component::Retain(_)))
    }

    /// Skip over `n` characters.
    pub fn retain(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        self.target_len += n;
        if let Some(Component::Retain(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Retain(n));
        }
        self
    }

    /// Insert `text` at the current position.
    pub fn insert(&mut self, text: &str) -> &mut Self {
        if text.is_empty() {
            return self;
        }
        self.target_len += char_len(text);
        let len = self.components.len();
        match self.components.last_mut() {
            Some(Component::Insert(last)) => last.push_str(text),
            Some(Component::Delete(_)) => {
                // Keep inserts ahead of deletes so equivalent ops are equal.
                if len >= 2 {
                    if let Component::Insert(prev) = &mut self.components[len - 2] {
                        prev.push_str(text);
                        return self;
                    }
                }
                self.components.insert(len - 1, Component::Insert(text.to_string()));
            }
            _ => self.components.push(Component::Insert(text.to_string())),
        }
        self
    }

    /// Remove the next `n` characters.
    pub fn delete(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        self.base_len += n;
        if let Some(Component::Delete(last)) = self.components.last_mut() {
            *last += n;
        } else {
            self.components.push(Component::Delete(n));
        }
        self
    }

    /// Apply this operation to `document`, producing the new text.
    ///
    /// Fails without producing anything if the operation does not span the
    /// document exactly.
    pub fn apply(&self, document: &str) -> CollabResult<String> {
        let actual = char_len(document);
        if actual != self.base_len {
            return Err(CollabError::LengthMismatch {
                expected: self.base_len,
                actual,
            });
        }

        let mut out = String::with_capacity(document.len());
        let mut chars = document.chars();
        for component in &self.components {
            match component {
                Component::Retain(n) => out.extend(chars.by_ref().take(*n)),
                Component::Insert(text) => out.push_str(text),
                Component::Delete(n) => {
                    chars.by_ref().take(*n).for_each(drop);
                }
            }
        }
        Ok(out)
    }

    /// Build the operation that undoes `self`, given the document it was
    /// applied to.
    pub fn invert(&self, prior: &str) -> CollabResult<TextOperation> {
        let actual = char_len(prior);
        if actual != self.base_len {
            return Err(CollabError::LengthMismatch {
                expected: self.base_len,
                actual,
            });
        }

        let mut inverse = TextOperation::new();
        let mut chars = prior.chars();
        for component in &self.components {
            match component {
                Component::Retain(n) => {
                    inverse.retain(*n);
                    chars.by_ref().take(*n).for_each(drop);
                }
                Component::Insert(text) => {
                    inverse.delete(char_len(text));
                }
                Component::Delete(n) => {
                    let removed: String = chars.by_ref().take(*n).collect();
                    inverse.insert(&removed);
                }
            }
        }
        Ok(inverse)
    }

    /// Merge `self` followed by `next` into one operation.
    ///
    /// `apply(compose(a, b)) == apply(b, apply(a))`.
    pub fn compose(&self, next: &TextOperation) -> CollabResult<TextOperation> {
        if self.target_len != next.base_len {
            return Err(CollabError::LengthMismatch {
                expected: self.target_len,
                actual: next.base_len,
            });
        }

        let mut out = TextOperation::new();
        let mut iter_a = self.components.iter().cloned();
        let mut iter_b = next.components.iter().cloned();
        let mut a = iter_a.next();
        let mut b = iter_b.next();

        loop {
            match (a.take(), b.take()) {
                (None, None) => break,
                (Some(Component::Delete(n)), rest_b) => {
                    out.delete(n);
                    a = iter_a.next();
                    b = rest_b;
                }
                (rest_a, Some(Component::Insert(text))) => {
                    out.insert(&text);
                    a = rest_a;
                    b = iter_b.next();
                }
                (None, _) | (_, None) => {
                    return Err(CollabError::MalformedOperation(
                        "compose: operands cover different lengths".to_string(),
                    ));
                }
                (Some(Component::Retain(x)), Some(Component::Retain(y))) => {
                    let n = x.min(y);
                    out.retain(n);
                    a = remainder(Component::Retain(x - n), &mut iter_a);
                    b = remainder(Component::Retain(y - n), &mut iter_b);
                }
                (Some(Component::Retain(x)), Some(Component::Delete(y))) => {
                    let n = x.min(y);
                    out.delete(n);
                    a = remainder(Component::Retain(x - n), &mut iter_a);
                    b = remainder(Component::Delete(y - n), &mut iter_b);
                }
                (Some(Component::Insert(text)), Some(Component::Retain(y))) => {
                    let len = char_len(&text);
                    if len <= y {
                        out.insert(&text);
                        a = iter_a.next();
                        b = remainder(Component::Retain(y - len), &mut iter_b);
                    } else {
                        let (head, tail) = split_at_char(&text, y);
                        out.insert(head);
                        a = Some(Component::Insert(tail.to_string()));
                        b = iter_b.next();
                    }
                }
                (Some(Component::Insert(text)), Some(Component::Delete(y))) => {
                    // The second op deletes text the first one inserted.
                    let len = char_len(&text);
                    if len <= y {
                        a = iter_a.next();
                        b = remainder(Component::Delete(y - len), &mut iter_b);
                    } else {
                        let (_, tail) = split_at_char(&text, y);
                        a = Some(Component::Insert(tail.to_string()));
                        b = iter_b.next();
                    }
                }
            }
        }

        Ok(out)
    }

    /// Build an operation turning `old` into `new` by trimming the common
    /// prefix and suffix and replacing the middle.
    pub fn diff(old: &str, new: &str) -> TextOperation {
        let old_chars: Vec<char> = old.chars().collect();
        let new_chars: Vec<char> = new.chars().collect();

        let prefix = old_chars
            .iter()
            .zip(new_chars.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
        let suffix = old_chars
            .iter()
            .rev()
            .zip(new_chars.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        let inserted: String = new_chars[prefix..new_chars.len() - suffix].iter().collect();
        let mut op = TextOperation::new();
        op.retain(prefix)
            .insert(&inserted)
            .delete(old_chars.len() - prefix - suffix)
            .retain(suffix);
        op
    }
}

impl TryFrom<Vec<Component>> for TextOperation {
    type Error = CollabError;

    fn try_from(components: Vec<Component>) -> Result<Self, Self::Error> {
        let mut op = TextOperation::new();
        for component in components {
            match component {
                Component::Retain(0) | Component::Delete(0) => {
                    return Err(CollabError::MalformedOperation(
                        "zero-length component".to_string(),
                    ));
                }
                Component::Insert(text) if text.is_empty() => {
                    return Err(CollabError::MalformedOperation(
                        "empty insert component".to_string(),
                    ));
                }
                Component::Retain(n) => {
                    op.retain(n);
                }
                Component::Insert(text) => {
                    op.insert(&text);
                }
                Component::Delete(n) => {
                    op.delete(n);
                }
            }
        }
        Ok(op)
    }
}

impl From<TextOperation> for Vec<Component> {
    fn from(op: TextOperation) -> Self {
        op.components
    }
}

/// Apply `op` to `document`. See [`TextOperation::apply`].
pub fn apply(document: &str, op: &TextOperation) -> CollabResult<String> {
    op.apply(document)
}

/// Compose two sequential operations. See [`TextOperation::compose`].
pub fn compose(first: &TextOperation, second: &TextOperation) -> CollabResult<TextOperation> {
    first.compose(second)
}

/// Invert `op` against the document it applied to. See [`TextOperation::invert`].
pub fn invert(op: &TextOperation, prior: &str) -> CollabResult<TextOperation> {
    op.invert(prior)
}

/// Number of characters (Unicode scalar values) in `text`.
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Split `text` after `n` characters.
pub(crate) fn split_at_char(text: &str, n: usize) -> (&str, &str) {
    match text.char_indices().nth(n) {
        Some((idx, _)) => text.split_at(idx),
        None => (text, ""),
    }
}

/// Keep a partially consumed component, or move on when it is used up.
pub(crate) fn remainder(
    rest: Component,
    iter: &mut impl Iterator<Item = Component>,
) -> Option<Component> {
    match rest {
        Component::Retain(0) | Component::Delete(0) => iter.next(),
        Component::Insert(ref text) if text.is_empty() => iter.next(),
        other => Some(other),
    }
}

/// A text operation together with its identity and causal metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Client-generated unique id, used for acknowledgement and deduplication.
    pub id: OperationId,
    /// Originating client.
    pub client_id: ClientId,
    /// Originating user.
    pub user_id: UserId,
    /// Server version the operation was computed against.
    pub base_version: u64,
    /// The edit itself.
    pub ops: TextOperation,
    /// Wall-clock creation time. Advisory only; never used for ordering.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Operation {
    /// Create a new operation with a fresh id.
    pub fn new(
        client_id: ClientId,
        user_id: UserId,
        base_version: u64,
        ops: TextOperation,
    ) -> Self {
        Self {
            id: OperationId::generate(),
            client_id,
            user_id,
            base_version,
            ops,
            timestamp: Utc::now(),
        }
    }

    /// Same identity, different content (used after rebasing).
    pub fn with_ops(&self, ops: TextOperation) -> Self {
        Self {
            ops,
            ..self.clone()
        }
    }
}
