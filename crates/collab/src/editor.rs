//! Editor abstraction the sync engine drives.
//!
//! The engine never talks to a concrete widget. It reads and replaces the
//! buffer, applies remote operations and pushes remote cursor decorations
//! through [`Editor`]; local edits come back in as [`EditorChange`]s.

use crate::error::{CollabError, CollabResult};
use crate::operation::{char_len, TextOperation};
use crate::presence::RemoteCursor;
use serde::{Deserialize, Serialize};

/// A single contiguous edit reported by the editor widget.
///
/// Offsets are in characters, relative to the document before this change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorChange {
    pub offset: usize,
    /// Number of characters removed at `offset`.
    pub removed: usize,
    /// Text inserted at `offset` after the removal.
    pub inserted: String,
}

impl EditorChange {
    pub fn insert(offset: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            removed: 0,
            inserted: text.into(),
        }
    }

    pub fn delete(offset: usize, removed: usize) -> Self {
        Self {
            offset,
            removed,
            inserted: String::new(),
        }
    }

    pub fn replace(offset: usize, removed: usize, text: impl Into<String>) -> Self {
        Self {
            offset,
            removed,
            inserted: text.into(),
        }
    }

    /// Express the change as an operation over a document of `doc_len` characters.
    pub fn to_operation(&self, doc_len: usize) -> CollabResult<TextOperation> {
        let end = self.offset + self.removed;
        if end > doc_len {
            return Err(CollabError::MalformedOperation(format!(
                "edit range {}..{} exceeds document length {}",
                self.offset, end, doc_len
            )));
        }
        let mut op = TextOperation::new();
        op.retain(self.offset)
            .delete(self.removed)
            .insert(&self.inserted)
            .retain(doc_len - end);
        Ok(op)
    }
}

/// The editing surface a sync engine is attached to.
pub trait Editor: Send {
    /// Current buffer contents.
    fn value(&self) -> String;

    /// Replace the whole buffer without reporting it as a local edit.
    fn set_value(&mut self, value: &str);

    /// Apply a remote operation without reporting it as a local edit.
    fn apply_operation(&mut self, op: &TextOperation) -> CollabResult<()> {
        let next = op.apply(&self.value())?;
        self.set_value(&next);
        Ok(())
    }

    /// Replace the rendered remote carets and selections.
    fn set_decorations(&mut self, cursors: &[RemoteCursor]);
}

/// In-memory editor, used headless and in tests.
#[derive(Clone, Debug, Default)]
pub struct MemoryEditor {
    content: String,
    decorations: Vec<RemoteCursor>,
}

impl MemoryEditor {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            decorations: Vec::new(),
        }
    }

    /// Simulate the user typing: apply `change` to the buffer and hand it back
    /// so it can be fed to the sync engine.
    pub fn edit(&mut self, change: EditorChange) -> CollabResult<EditorChange> {
        let op = change.to_operation(char_len(&self.content))?;
        self.content = op.apply(&self.content)?;
        Ok(change)
    }

    pub fn decorations(&self) -> &[RemoteCursor] {
        &self.decorations
    }
}

impl Editor for MemoryEditor {
    fn value(&self) -> String {
        self.content.clone()
    }

    fn set_value(&mut self, value: &str) {
        self.content = value.to_string();
    }

    fn set_decorations(&mut self, cursors: &[RemoteCursor]) {
        self.decorations = cursors.to_vec();
    }
}
