//! Collaborative undo/redo for local edits.
//!
//! Stacks hold inverses of local edits. Remote edits that arrive afterwards
//! are transformed into every stored entry, so undoing only reverts the
//! local user's own change and leaves concurrent work intact.

use crate::error::CollabResult;
use crate::operation::TextOperation;
use crate::transform::{transform, TieBreak};

/// Undo and redo stacks; the top of each applies to the current document.
#[derive(Clone, Debug)]
pub struct UndoManager {
    undo: Vec<TextOperation>,
    redo: Vec<TextOperation>,
    limit: usize,
}

impl UndoManager {
    pub fn new(limit: usize) -> Self {
        Self {
            undo: Vec::new(),
            redo: Vec::new(),
            limit,
        }
    }

    /// Record the inverse of a fresh local edit. Clears redo.
    pub fn record(&mut self, inverse: TextOperation) {
        self.redo.clear();
        push_bounded(&mut self.undo, inverse, self.limit);
    }

    /// Record the inverse of an undo so it can be redone.
    pub fn record_redo(&mut self, inverse: TextOperation) {
        push_bounded(&mut self.redo, inverse, self.limit);
    }

    /// Record the inverse of a redo without clearing the redo stack.
    pub fn record_undo(&mut self, inverse: TextOperation) {
        push_bounded(&mut self.undo, inverse, self.limit);
    }

    pub fn pop_undo(&mut self) -> Option<TextOperation> {
        self.undo.pop()
    }

    pub fn pop_redo(&mut self) -> Option<TextOperation> {
        self.redo.pop()
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
    }

    /// Rebase both stacks over an operation applied to the current document.
    pub fn transform(&mut self, remote: &TextOperation) -> CollabResult<()> {
        self.undo = transform_stack(&self.undo, remote)?;
        self.redo = transform_stack(&self.redo, remote)?;
        Ok(())
    }
}

fn push_bounded(stack: &mut Vec<TextOperation>, op: TextOperation, limit: usize) {
    if op.is_noop() {
        return;
    }
    stack.push(op);
    if stack.len() > limit {
        stack.remove(0);
    }
}

/// Walk from the top down; each entry applies to the state the previous one
/// reverts to, so the remote operation is carried along transformed.
fn transform_stack(stack: &[TextOperation], remote: &TextOperation) -> CollabResult<Vec<TextOperation>> {
    let mut carried = remote.clone();
    let mut rebuilt = Vec::with_capacity(stack.len());
    for entry in stack.iter().rev() {
        let (entry_prime, carried_prime) = transform(entry, &carried, TieBreak::FirstBefore)?;
        rebuilt.push(entry_prime);
        carried = carried_prime;
    }
    rebuilt.reverse();
    Ok(rebuilt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undo_survives_remote_edit() {
        let mut undo = UndoManager::new(10);
        // Local: "abc" -> "abcX"
        let mut local = TextOperation::new();
        local.retain(3).insert("X");
        undo.record(local.invert("abc").unwrap());

        // Remote: "abcX" -> ">abcX"
        let mut remote = TextOperation::new();
        remote.insert(">").retain(4);
        undo.transform(&remote).unwrap();

        let inverse = undo.pop_undo().unwrap();
        assert_eq!(inverse.apply(">abcX").unwrap(), ">abc");
    }

    #[test]
    fn test_record_clears_redo_and_limit_applies() {
        let mut undo = UndoManager::new(2);
        for _ in 0..3 {
            let mut op = TextOperation::new();
            op.delete(1);
            undo.record(op);
        }
        let mut redo = TextOperation::new();
        redo.insert("x");
        undo.record_redo(redo);
        assert!(undo.can_redo());

        let mut op = TextOperation::new();
        op.delete(1);
        undo.record(op);
        assert!(!undo.can_redo());
        assert_eq!(undo.undo.len(), 2);
    }

    #[test]
    fn test_noop_not_recorded() {
        let mut undo = UndoManager::new(5);
        undo.record(TextOperation::identity(4));
        assert!(!undo.can_undo());
    }
}
