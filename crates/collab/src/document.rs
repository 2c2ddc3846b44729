//! Authoritative document state owned by a session coordinator.
//!
//! `DocumentState` is single-writer: every mutation goes through
//! [`DocumentState::accept`] or [`DocumentState::replay`], which rebase the
//! incoming operation over the retained history, apply it, bump the version
//! exactly once and append it to the bounded history.

use crate::error::{CollabError, CollabResult};
use crate::ids::{ClientId, OperationId};
use crate::operation::{char_len, Operation};
use crate::transform::{rebase, transform_operations};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// An accepted operation, as applied, tagged with the version it produced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub version: u64,
    pub operation: Operation,
}

/// The newest operation accepted from one client.
///
/// Outlives history eviction, so a client reconnecting after its work aged
/// out of history can still be told which of its queued operations landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedMark {
    pub operation_id: OperationId,
    pub version: u64,
}

/// Outcome of accepting one operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Acceptance {
    /// The operation was rebased and applied.
    Applied(HistoryEntry),
    /// The operation id was already in history; nothing was applied.
    Duplicate {
        operation_id: OperationId,
        version: u64,
    },
}

/// One message owed to a reconnecting client, in send order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayStep {
    /// An operation the client has not seen yet.
    Missed(HistoryEntry),
    /// One of the client's queued operations, now in history at `version`.
    Acknowledged {
        operation_id: OperationId,
        version: u64,
    },
}

/// Result of replaying a reconnecting client's queue.
#[derive(Clone, Debug, Default)]
pub struct Replay {
    /// Messages for the reconnecting client, in order.
    pub steps: Vec<ReplayStep>,
    /// Newly applied operations to broadcast to everyone else.
    pub accepted: Vec<HistoryEntry>,
    /// Set when a queued operation was rejected; the rest of the queue was
    /// not applied because it depends on the rejected one.
    pub rejected: Option<(OperationId, CollabError)>,
}

/// Version, content and recent history of one shared document.
#[derive(Clone, Debug)]
pub struct DocumentState {
    version: u64,
    content: String,
    len: usize,
    history: VecDeque<HistoryEntry>,
    capacity: usize,
    applied: HashMap<ClientId, AppliedMark>,
}

impl DocumentState {
    /// Create a document at `version` holding `content`.
    ///
    /// History starts empty, so clients must be at `version` or resync.
    pub fn new(content: impl Into<String>, version: u64, capacity: usize) -> Self {
        let content = content.into();
        Self {
            version,
            len: char_len(&content),
            content,
            history: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            applied: HashMap::new(),
        }
    }

    /// Restore per-client marks saved with a checkpoint.
    pub fn with_applied(mut self, applied: HashMap<ClientId, AppliedMark>) -> Self {
        self.applied = applied;
        self
    }

    pub fn applied_marks(&self) -> &HashMap<ClientId, AppliedMark> {
        &self.applied
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    /// Length of the content in characters.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Retained history, oldest first.
    pub fn history(&self) -> &VecDeque<HistoryEntry> {
        &self.history
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest base version that can still be rebased onto the current state.
    pub fn oldest_rebasable_version(&self) -> u64 {
        self.version - self.history.len() as u64
    }

    /// Look up a retained history entry by operation id.
    pub fn find(&self, operation_id: OperationId) -> Option<&HistoryEntry> {
        self.history
            .iter()
            .find(|entry| entry.operation.id == operation_id)
    }

    /// Version `op` was applied at, if it already was.
    pub fn applied_version(&self, op: &Operation) -> Option<u64> {
        if let Some(entry) = self.find(op.id) {
            return Some(entry.version);
        }
        self.applied
            .get(&op.client_id)
            .filter(|mark| mark.operation_id == op.id)
            .map(|mark| mark.version)
    }

    /// Ids of the leading operations of a client's queued chain that are
    /// already applied.
    ///
    /// A client's operations are applied in queue order, so everything up to
    /// the last applied one has landed even when it left history.
    pub fn applied_prefix(&self, chain: &[Operation]) -> Vec<OperationId> {
        match chain.iter().rposition(|op| self.applied_version(op).is_some()) {
            Some(last) => chain[..=last].iter().map(|op| op.id).collect(),
            None => Vec::new(),
        }
    }

    /// History entries with a version greater than `base_version`.
    pub fn entries_since(
        &self,
        base_version: u64,
    ) -> CollabResult<impl Iterator<Item = &HistoryEntry> + '_> {
        if base_version > self.version {
            return Err(CollabError::FutureVersion {
                base_version,
                current: self.version,
            });
        }
        let oldest = self.oldest_rebasable_version();
        if base_version < oldest {
            return Err(CollabError::StaleClient {
                base_version,
                oldest_available: oldest,
            });
        }
        let skip = (base_version - oldest) as usize;
        Ok(self.history.iter().skip(skip))
    }

    /// Rebase `op` from its base version onto the current version.
    pub fn rebase(&self, op: &Operation) -> CollabResult<Operation> {
        let since = self.entries_since(op.base_version)?;
        rebase(op, since.map(|entry| &entry.operation))
    }

    /// Rebase, apply and record one operation.
    pub fn accept(&mut self, op: Operation) -> CollabResult<Acceptance> {
        if let Some(version) = self.applied_version(&op) {
            return Ok(Acceptance::Duplicate {
                operation_id: op.id,
                version,
            });
        }
        let rebased = self.rebase(&op)?;
        self.commit(rebased).map(Acceptance::Applied)
    }

    /// Bring a reconnecting client up to date and accept its queued chain.
    ///
    /// `chain` holds the client's pending operations in order; the first is
    /// based on `base_version` and each later one on the state after its
    /// predecessor. History after `base_version` is walked in order: queued
    /// operations found there are re-acknowledged, everything else is owed to
    /// the client as missed and the remaining chain is transformed over it
    /// exactly as the client transforms its own queue. What is left of the
    /// chain is then based on the current version and applied as is.
    pub fn replay(&mut self, base_version: u64, chain: Vec<Operation>) -> CollabResult<Replay> {
        let missed: Vec<HistoryEntry> = self.entries_since(base_version)?.cloned().collect();
        let mut chain: VecDeque<Operation> = chain.into();
        let mut replay = Replay::default();

        for entry in missed {
            if chain.front().map(|op| op.id) == Some(entry.operation.id) {
                chain.pop_front();
                replay.steps.push(ReplayStep::Acknowledged {
                    operation_id: entry.operation.id,
                    version: entry.version,
                });
                continue;
            }

            let mut incoming = entry.operation.clone();
            for queued in chain.iter_mut() {
                let (queued_prime, incoming_prime) = transform_operations(queued, &incoming)?;
                *queued = queued_prime;
                incoming = incoming_prime;
            }
            replay.steps.push(ReplayStep::Missed(entry));
        }

        for op in chain {
            if let Some(version) = self.applied_version(&op) {
                replay.steps.push(ReplayStep::Acknowledged {
                    operation_id: op.id,
                    version,
                });
                continue;
            }
            let operation_id = op.id;
            match self.commit(op) {
                Ok(entry) => {
                    replay.steps.push(ReplayStep::Acknowledged {
                        operation_id,
                        version: entry.version,
                    });
                    replay.accepted.push(entry);
                }
                Err(err) => {
                    replay.rejected = Some((operation_id, err));
                    break;
                }
            }
        }

        Ok(replay)
    }

    /// Apply an operation already based on the current version.
    fn commit(&mut self, mut op: Operation) -> CollabResult<HistoryEntry> {
        let content = op.ops.apply(&self.content)?;

        self.content = content;
        self.len = op.ops.target_len();
        op.base_version = self.version;
        self.version += 1;

        self.applied.insert(
            op.client_id.clone(),
            AppliedMark {
                operation_id: op.id,
                version: self.version,
            },
        );
        let entry = HistoryEntry {
            version: self.version,
            operation: op,
        };
        self.history.push_back(entry.clone());
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
        Ok(entry)
    }
}
