//! Property tests for the operation algebra and for end-to-end convergence
//! under arbitrary interleavings of edits, deliveries and reconnects.

mod common;

use code_collab::editor::EditorChange;
use code_collab::operation::{char_len, TextOperation};
use code_collab::transform::{transform, transform_index, TieBreak};
use common::CollaborationHarness;
use proptest::prelude::*;

/// An edit described independently of the document it lands on.
#[derive(Clone, Debug)]
struct Edit {
    at: usize,
    remove: usize,
    text: String,
}

impl Edit {
    fn change(&self, doc: &str) -> EditorChange {
        let len = char_len(doc);
        let at = self.at % (len + 1);
        let remove = self.remove.min(len - at);
        EditorChange::replace(at, remove, self.text.clone())
    }

    fn operation(&self, doc: &str) -> TextOperation {
        self.change(doc).to_operation(char_len(doc)).unwrap()
    }
}

fn edit() -> impl Strategy<Value = Edit> {
    (0usize..64, 0usize..5, "[a-cé\n]{0,4}").prop_map(|(at, remove, text)| Edit { at, remove, text })
}

fn document() -> impl Strategy<Value = String> {
    "[a-zé\n]{0,12}"
}

proptest! {
    #[test]
    fn transform_converges(doc in document(), a in edit(), b in edit(), a_first in any::<bool>()) {
        let op_a = a.operation(&doc);
        let op_b = b.operation(&doc);
        let tie = if a_first { TieBreak::FirstBefore } else { TieBreak::FirstAfter };
        let (a_prime, b_prime) = transform(&op_a, &op_b, tie).unwrap();

        let left = b_prime.apply(&op_a.apply(&doc).unwrap()).unwrap();
        let right = a_prime.apply(&op_b.apply(&doc).unwrap()).unwrap();
        prop_assert_eq!(left, right);
    }

    #[test]
    fn compose_matches_sequential_apply(doc in document(), a in edit(), b in edit()) {
        let op_a = a.operation(&doc);
        let after_a = op_a.apply(&doc).unwrap();
        let op_b = b.operation(&after_a);

        let composed = op_a.compose(&op_b).unwrap();
        prop_assert_eq!(composed.apply(&doc).unwrap(), op_b.apply(&after_a).unwrap());
    }

    #[test]
    fn invert_restores_document(doc in document(), a in edit()) {
        let op = a.operation(&doc);
        let inverse = op.invert(&doc).unwrap();
        prop_assert_eq!(inverse.apply(&op.apply(&doc).unwrap()).unwrap(), doc);
    }

    #[test]
    fn apply_rejects_wrong_length(doc in document(), a in edit(), extra in "[a-z]{1,3}") {
        let op = a.operation(&doc);
        let longer = format!("{doc}{extra}");
        prop_assert!(op.apply(&longer).is_err());
    }

    #[test]
    fn diff_reconstructs_target(old in document(), new in document()) {
        let op = TextOperation::diff(&old, &new);
        prop_assert_eq!(op.apply(&old).unwrap(), new);
    }

    #[test]
    fn transformed_index_stays_in_bounds(doc in document(), a in edit(), index in 0usize..20) {
        let op = a.operation(&doc);
        let index = index.min(char_len(&doc));
        prop_assert!(transform_index(index, &op) <= op.target_len());
    }
}

#[derive(Clone, Debug)]
enum Action {
    Edit(usize, Edit),
    Flush(usize),
    DeliverUp(usize),
    DeliverDown(usize),
    Disconnect(usize),
    Reconnect(usize),
    Wait(u64),
}

fn action() -> impl Strategy<Value = Action> {
    let client = 0usize..3;
    prop_oneof![
        4 => (client.clone(), edit()).prop_map(|(c, e)| Action::Edit(c, e)),
        2 => client.clone().prop_map(Action::Flush),
        3 => client.clone().prop_map(Action::DeliverUp),
        3 => client.clone().prop_map(Action::DeliverDown),
        1 => client.clone().prop_map(Action::Disconnect),
        1 => client.prop_map(Action::Reconnect),
        1 => (0u64..700).prop_map(Action::Wait),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn clients_converge_after_arbitrary_interleaving(actions in prop::collection::vec(action(), 1..60)) {
        let mut h = CollaborationHarness::with_document("shared", 0);
        for name in ["a", "b", "c"] {
            let idx = h.add_client(name);
            h.connect(idx);
        }

        for action in actions {
            match action {
                Action::Edit(idx, edit) => {
                    let change = edit.change(h.document(idx));
                    h.edit(idx, change);
                }
                Action::Flush(idx) => h.flush(idx),
                Action::DeliverUp(idx) => {
                    h.deliver_up(idx);
                }
                Action::DeliverDown(idx) => {
                    h.deliver_down(idx);
                }
                Action::Disconnect(idx) => h.disconnect(idx),
                Action::Reconnect(idx) => {
                    if h.clients[idx].link.is_none() {
                        h.connect(idx);
                    }
                }
                Action::Wait(ms) => h.advance(ms),
            }
        }

        for idx in 0..h.clients.len() {
            if h.clients[idx].link.is_none() {
                h.connect(idx);
            }
            h.flush(idx);
        }
        // Acks release queued operations one at a time.
        for _ in 0..8 {
            h.settle();
            for idx in 0..h.clients.len() {
                h.flush(idx);
            }
        }
        h.settle();
        h.assert_converged();
    }
}
