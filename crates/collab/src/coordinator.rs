//! Server-side coordinator for one editing session.
//!
//! The coordinator is the single writer of a session's document. It accepts
//! operations (rebasing them over concurrent history), acknowledges them to
//! their sender, broadcasts them to everyone else in version order, relays
//! presence, and answers resync requests.
//!
//! Lifecycle:
//!
//! ```text
//! Empty --first join--> Active --last leave--> Draining --grace expiry--> Empty
//!                         ^                        |
//!                         +-------join-------------+
//! ```
//!
//! The document is loaded from the store on `Empty -> Active` and
//! checkpointed on `Draining -> Empty`. The grace timer itself lives in the
//! session actor (see `registry`).

use crate::document::{Acceptance, DocumentState, ReplayStep};
use crate::error::{CollabError, CollabResult, ErrorCode};
use crate::ids::{ClientId, ConnectionId, SessionId};
use crate::message::{
    Envelope, ErrorPayload, Message, ResyncRequestPayload, ResyncResponsePayload, UserJoinPayload,
    UserLeavePayload,
};
use crate::operation::Operation;
use crate::presence::{Identity, PresenceManager, PresenceState};
use crate::store::{DocumentStore, StoredDocument};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Outbound queue of one connection.
pub type Outbox = mpsc::UnboundedSender<Envelope>;

/// Configuration for a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Accepted operations retained for rebasing; older clients resync.
    pub history_capacity: usize,
    /// How long an empty session stays loaded before it is torn down.
    pub grace_period_ms: u64,
    /// Interval between checkpoints of a modified document.
    pub checkpoint_interval_ms: u64,
    /// Maximum number of connections in one session.
    pub max_participants: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_capacity: 500,
            grace_period_ms: 30_000,
            checkpoint_interval_ms: 60_000,
            max_participants: 100,
        }
    }
}

impl SessionConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.checkpoint_interval_ms)
    }
}

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No participants and no document in memory.
    #[default]
    Empty,
    /// At least one participant.
    Active,
    /// No participants; the document stays loaded until the grace period ends.
    Draining,
}

/// One joined connection.
#[derive(Clone, Debug)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub client_id: ClientId,
    pub identity: Identity,
    pub joined_at: DateTime<Utc>,
    sender: Outbox,
}

/// Statistics about a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub session_id: SessionId,
    pub state: SessionState,
    /// Distinct users present.
    pub users: usize,
    pub connections: usize,
    /// Current version, if the document is loaded.
    pub version: Option<u64>,
    pub history_len: usize,
    pub accepted_operations: u64,
    pub rejected_operations: u64,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

/// Coordinator for one session's document and participants.
pub struct SessionCoordinator {
    session_id: SessionId,
    config: SessionConfig,
    store: Arc<dyn DocumentStore>,
    state: SessionState,
    document: Option<DocumentState>,
    participants: HashMap<ConnectionId, Participant>,
    presence: PresenceManager,
    /// Modified since the last checkpoint.
    dirty: bool,
    /// Connections whose outbox was found closed; removed after each call.
    failed: Vec<ConnectionId>,
    accepted_operations: u64,
    rejected_operations: u64,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
}

impl SessionCoordinator {
    pub fn new(session_id: SessionId, config: SessionConfig, store: Arc<dyn DocumentStore>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            config,
            store,
            state: SessionState::Empty,
            document: None,
            participants: HashMap::new(),
            presence: PresenceManager::new(),
            dirty: false,
            failed: Vec::new(),
            accepted_operations: 0,
            rejected_operations: 0,
            created_at: now,
            last_activity: now,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn document(&self) -> Option<&DocumentState> {
        self.document.as_ref()
    }

    pub fn version(&self) -> Option<u64> {
        self.document.as_ref().map(DocumentState::version)
    }

    pub fn content(&self) -> Option<&str> {
        self.document.as_ref().map(DocumentState::content)
    }

    pub fn connection_count(&self) -> usize {
        self.participants.len()
    }

    pub fn user_count(&self) -> usize {
        self.presence.user_count()
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn presence(&self) -> &PresenceManager {
        &self.presence
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.session_id.clone(),
            state: self.state,
            users: self.user_count(),
            connections: self.connection_count(),
            version: self.version(),
            history_len: self.document.as_ref().map_or(0, |d| d.history().len()),
            accepted_operations: self.accepted_operations,
            rejected_operations: self.rejected_operations,
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    // ========== Membership ==========

    /// Add a connection to the session, loading the document if the session
    /// was empty.
    ///
    /// The newcomer receives a `user-join` and the latest presence for every
    /// user already present; everyone else receives a `user-join` for the
    /// newcomer unless the same user was already connected.
    pub fn join(
        &mut self,
        connection_id: ConnectionId,
        client_id: ClientId,
        identity: Identity,
        sender: Outbox,
    ) -> CollabResult<()> {
        if !self.participants.contains_key(&connection_id)
            && self.participants.len() >= self.config.max_participants
        {
            let err = CollabError::SessionFull {
                max: self.config.max_participants,
            };
            let _ = sender.send(Envelope::new(
                self.session_id.clone(),
                Message::Error(ErrorPayload::from_error(&err, None)),
            ));
            tracing::warn!(session = %self.session_id, %connection_id, "session full");
            return Err(err);
        }

        match self.state {
            SessionState::Empty => {
                let stored = self.store.load_or_empty(&self.session_id)?;
                tracing::info!(session = %self.session_id, version = stored.version, "session activated");
                self.document = Some(
                    DocumentState::new(stored.content, stored.version, self.config.history_capacity)
                        .with_applied(stored.applied),
                );
                self.dirty = false;
            }
            SessionState::Draining => {
                tracing::info!(session = %self.session_id, "session resumed during grace period");
            }
            SessionState::Active => {}
        }
        self.state = SessionState::Active;

        let color = match &identity.color {
            Some(color) => color.clone(),
            None => self.presence.assign_color(&identity.user_id),
        };
        let identity = Identity {
            color: Some(color.clone()),
            ..identity
        };
        let first_for_user = !self
            .participants
            .values()
            .any(|p| p.identity.user_id == identity.user_id);

        let participant = Participant {
            connection_id,
            client_id: client_id.clone(),
            identity: identity.clone(),
            joined_at: Utc::now(),
            sender,
        };
        self.participants.insert(connection_id, participant);

        let roster: Vec<PresenceState> = self
            .presence
            .all_users()
            .into_iter()
            .filter(|state| state.user_id != identity.user_id)
            .cloned()
            .collect();
        for state in roster {
            self.send_to(
                connection_id,
                Message::UserJoin(UserJoinPayload {
                    user_id: state.user_id.clone(),
                    display_name: state.display_name.clone(),
                    color: Some(state.color.clone()),
                    client_id: None,
                    token: None,
                }),
            );
            self.send_to(connection_id, Message::Presence(state));
        }

        if first_for_user {
            self.presence.update_user(PresenceState::new(
                identity.user_id.clone(),
                identity.display_name.clone(),
                color.clone(),
            ));
            self.broadcast_to_others(
                connection_id,
                Message::UserJoin(UserJoinPayload {
                    user_id: identity.user_id.clone(),
                    display_name: identity.display_name.clone(),
                    color: Some(color),
                    client_id: Some(client_id),
                    token: None,
                }),
            );
        }

        tracing::info!(
            session = %self.session_id,
            %connection_id,
            user = %identity.user_id,
            connections = self.participants.len(),
            "participant joined"
        );
        self.touch();
        self.reap();
        Ok(())
    }

    /// Remove a connection. Returns the resulting session state.
    pub fn leave(&mut self, connection_id: ConnectionId) -> SessionState {
        self.remove_connection(connection_id);
        self.reap();
        self.state
    }

    fn remove_connection(&mut self, connection_id: ConnectionId) {
        let Some(participant) = self.participants.remove(&connection_id) else {
            return;
        };
        let user_id = participant.identity.user_id;
        tracing::info!(session = %self.session_id, %connection_id, user = %user_id, "participant left");

        let still_present = self
            .participants
            .values()
            .any(|p| p.identity.user_id == user_id);
        if !still_present {
            self.presence.remove_user(&user_id);
            self.broadcast_to_all(Message::UserLeave(UserLeavePayload { user_id }));
        }

        if self.participants.is_empty() && self.state == SessionState::Active {
            tracing::info!(session = %self.session_id, "session draining");
            self.state = SessionState::Draining;
        }
        self.touch();
    }

    /// Tear the session down after the grace period: final checkpoint, then
    /// drop the document. Does nothing (returns false) if anyone rejoined.
    pub fn close(&mut self) -> CollabResult<bool> {
        if !self.participants.is_empty() || self.state == SessionState::Empty {
            return Ok(false);
        }
        self.checkpoint()?;
        self.document = None;
        self.state = SessionState::Empty;
        tracing::info!(session = %self.session_id, "session closed");
        Ok(true)
    }

    /// Persist the document if it changed since the last checkpoint.
    pub fn checkpoint(&mut self) -> CollabResult<bool> {
        let Some(document) = &self.document else {
            return Ok(false);
        };
        if !self.dirty {
            return Ok(false);
        }
        let stored = StoredDocument::new(
            self.session_id.clone(),
            document.content(),
            document.version(),
        )
        .with_applied(document.applied_marks().clone());
        self.store.save(&stored)?;
        self.dirty = false;
        tracing::debug!(session = %self.session_id, version = stored.version, "checkpoint written");
        Ok(true)
    }

    // ========== Inbound messages ==========

    /// Process one message from a joined connection.
    pub fn handle(&mut self, connection_id: ConnectionId, message: Message) -> CollabResult<()> {
        if !self.participants.contains_key(&connection_id) {
            return Err(CollabError::NotJoined);
        }
        match message {
            Message::Operation(payload) => self.submit(connection_id, payload.operation),
            Message::Presence(state) => self.update_presence(connection_id, state),
            Message::ResyncRequest(payload) => self.resync(connection_id, payload),
            Message::UserLeave(_) => self.remove_connection(connection_id),
            Message::UserJoin(_) => {
                tracing::debug!(session = %self.session_id, %connection_id, "repeated user-join ignored");
            }
            other @ (Message::Ack(_) | Message::ResyncResponse(_) | Message::Error(_)) => {
                self.send_to(
                    connection_id,
                    Message::error(
                        ErrorCode::InvalidMessage,
                        format!("{:?} is not accepted from clients", other.kind()),
                    ),
                );
            }
        }
        self.touch();
        self.reap();
        Ok(())
    }

    /// Force the operation's identity to the connection's and check it.
    fn authenticate(&self, connection_id: ConnectionId, mut op: Operation) -> CollabResult<Operation> {
        let participant = self
            .participants
            .get(&connection_id)
            .ok_or(CollabError::NotJoined)?;
        if op.client_id != participant.client_id {
            return Err(CollabError::MalformedOperation(format!(
                "operation from client {} on connection of client {}",
                op.client_id, participant.client_id
            )));
        }
        op.user_id = participant.identity.user_id.clone();
        Ok(op)
    }

    fn submit(&mut self, connection_id: ConnectionId, op: Operation) {
        let operation_id = op.id;
        let result = self
            .authenticate(connection_id, op)
            .and_then(|op| self.document_mut()?.accept(op));

        match result {
            Ok(Acceptance::Applied(entry)) => {
                tracing::debug!(session = %self.session_id, operation = %operation_id, version = entry.version, "operation accepted");
                self.accepted_operations += 1;
                self.dirty = true;
                self.presence.transform_all(&entry.operation.ops);
                self.send_to(connection_id, Message::ack(operation_id, entry.version));
                self.broadcast_to_others(
                    connection_id,
                    Message::broadcast(entry.operation, entry.version),
                );
            }
            Ok(Acceptance::Duplicate { version, .. }) => {
                tracing::debug!(session = %self.session_id, operation = %operation_id, version, "duplicate operation re-acknowledged");
                self.send_to(connection_id, Message::ack(operation_id, version));
            }
            Err(err @ CollabError::StaleClient { .. }) => {
                tracing::info!(session = %self.session_id, operation = %operation_id, %err, "stale client, sending snapshot");
                self.rejected_operations += 1;
                self.send_to(
                    connection_id,
                    Message::Error(ErrorPayload::from_error(&err, Some(operation_id))),
                );
                self.send_snapshot(connection_id, &[]);
            }
            Err(err) => {
                tracing::warn!(session = %self.session_id, operation = %operation_id, %err, "operation rejected");
                self.rejected_operations += 1;
                self.send_to(
                    connection_id,
                    Message::Error(ErrorPayload::from_error(&err, Some(operation_id))),
                );
            }
        }
    }

    fn update_presence(&mut self, connection_id: ConnectionId, mut state: PresenceState) {
        let Some(participant) = self.participants.get(&connection_id) else {
            return;
        };
        state.user_id = participant.identity.user_id.clone();
        state.display_name = participant.identity.display_name.clone();
        if let Some(color) = &participant.identity.color {
            state.color = color.clone();
        }
        self.presence.update_user(state.clone());
        self.broadcast_to_others(connection_id, Message::Presence(state));
    }

    /// Catch a (re)connecting client up, replaying its queued chain.
    fn resync(&mut self, connection_id: ConnectionId, payload: ResyncRequestPayload) {
        let chain: CollabResult<Vec<Operation>> = payload
            .operations
            .into_iter()
            .map(|op| self.authenticate(connection_id, op))
            .collect();
        let chain = match chain {
            Ok(chain) => chain,
            Err(err) => {
                tracing::warn!(session = %self.session_id, %connection_id, %err, "resync chain rejected");
                self.rejected_operations += 1;
                self.send_to(connection_id, Message::Error(ErrorPayload::from_error(&err, None)));
                return;
            }
        };

        let Some(version) = payload.version else {
            self.send_snapshot(connection_id, &chain);
            return;
        };

        let result = self
            .document_mut()
            .and_then(|document| document.replay(version, chain.clone()));
        match result {
            Ok(replay) => {
                tracing::debug!(
                    session = %self.session_id,
                    %connection_id,
                    from = version,
                    steps = replay.steps.len(),
                    accepted = replay.accepted.len(),
                    "replayed history"
                );
                for step in replay.steps {
                    let message = match step {
                        ReplayStep::Missed(entry) => Message::broadcast(entry.operation, entry.version),
                        ReplayStep::Acknowledged {
                            operation_id,
                            version,
                        } => Message::ack(operation_id, version),
                    };
                    self.send_to(connection_id, message);
                }
                for entry in replay.accepted {
                    self.accepted_operations += 1;
                    self.dirty = true;
                    self.presence.transform_all(&entry.operation.ops);
                    self.broadcast_to_others(
                        connection_id,
                        Message::broadcast(entry.operation, entry.version),
                    );
                }
                if let Some((operation_id, err)) = replay.rejected {
                    tracing::warn!(session = %self.session_id, operation = %operation_id, %err, "queued operation rejected");
                    self.rejected_operations += 1;
                    self.send_to(
                        connection_id,
                        Message::Error(ErrorPayload::from_error(&err, Some(operation_id))),
                    );
                }
            }
            Err(CollabError::StaleClient { .. }) | Err(CollabError::FutureVersion { .. }) => {
                tracing::info!(session = %self.session_id, %connection_id, from = version, "client cannot be replayed, sending snapshot");
                self.send_snapshot(connection_id, &chain);
            }
            Err(err) => {
                tracing::warn!(session = %self.session_id, %connection_id, %err, "replay failed, sending snapshot");
                self.rejected_operations += 1;
                self.send_to(connection_id, Message::Error(ErrorPayload::from_error(&err, None)));
                self.send_snapshot(connection_id, &chain);
            }
        }
    }

    fn document_mut(&mut self) -> CollabResult<&mut DocumentState> {
        self.document
            .as_mut()
            .ok_or_else(|| CollabError::SessionClosed(self.session_id.clone()))
    }

    fn send_snapshot(&mut self, connection_id: ConnectionId, chain: &[Operation]) {
        let Some(document) = &self.document else {
            return;
        };
        let applied_operation_ids = document.applied_prefix(chain);
        let snapshot = Message::ResyncResponse(ResyncResponsePayload {
            version: document.version(),
            content: document.content().to_string(),
            applied_operation_ids,
        });
        self.send_to(connection_id, snapshot);
    }

    // ========== Outbound ==========

    fn send_to(&mut self, connection_id: ConnectionId, message: Message) {
        if let Some(participant) = self.participants.get(&connection_id) {
            let envelope = Envelope::new(self.session_id.clone(), message);
            if participant.sender.send(envelope).is_err() {
                self.failed.push(connection_id);
            }
        }
    }

    fn broadcast_to_others(&mut self, exclude: ConnectionId, message: Message) {
        let recipients: Vec<ConnectionId> = self
            .participants
            .keys()
            .filter(|id| **id != exclude)
            .copied()
            .collect();
        for connection_id in recipients {
            self.send_to(connection_id, message.clone());
        }
    }

    fn broadcast_to_all(&mut self, message: Message) {
        let recipients: Vec<ConnectionId> = self.participants.keys().copied().collect();
        for connection_id in recipients {
            self.send_to(connection_id, message.clone());
        }
    }

    /// Drop connections whose outbox is closed.
    fn reap(&mut self) {
        while let Some(connection_id) = self.failed.pop() {
            if self.participants.contains_key(&connection_id) {
                tracing::debug!(session = %self.session_id, %connection_id, "dropping unreachable connection");
                self.remove_connection(connection_id);
            }
        }
    }
}

impl std::fmt::Debug for SessionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCoordinator")
            .field("session_id", &self.session_id)
            .field("state", &self.state)
            .field("version", &self.version())
            .field("connections", &self.participants.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;
    use crate::message::MessageType;
    use crate::operation::TextOperation;
    use crate::store::MemoryDocumentStore;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Peer {
        connection_id: ConnectionId,
        client_id: ClientId,
        rx: UnboundedReceiver<Envelope>,
    }

    impl Peer {
        fn drain(&mut self) -> Vec<Message> {
            let mut messages = Vec::new();
            while let Ok(envelope) = self.rx.try_recv() {
                messages.push(envelope.message);
            }
            messages
        }

        fn insert(&self, base: u64, len: usize, pos: usize, text: &str) -> Operation {
            let mut ops = TextOperation::new();
            ops.retain(pos).insert(text).retain(len - pos);
            Operation::new(self.client_id.clone(), UserId::new("spoofed"), base, ops)
        }
    }

    fn coordinator_with(store: Arc<dyn DocumentStore>, config: SessionConfig) -> SessionCoordinator {
        SessionCoordinator::new(SessionId::new("room"), config, store)
    }

    fn coordinator() -> SessionCoordinator {
        coordinator_with(Arc::new(MemoryDocumentStore::new()), SessionConfig::default())
    }

    fn join(coordinator: &mut SessionCoordinator, name: &str) -> Peer {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = ConnectionId::next();
        let client_id = ClientId::new(format!("client-{name}"));
        coordinator
            .join(connection_id, client_id.clone(), Identity::new(UserId::new(name), name), tx)
            .unwrap();
        Peer {
            connection_id,
            client_id,
            rx,
        }
    }

    fn kinds(messages: &[Message]) -> Vec<MessageType> {
        messages.iter().map(Message::kind).collect()
    }

    #[test]
    fn test_lifecycle_transitions() {
        let store = Arc::new(MemoryDocumentStore::new());
        store.save(&StoredDocument::new(SessionId::new("room"), "saved", 7)).unwrap();
        let mut c = coordinator_with(store.clone(), SessionConfig::default());
        assert_eq!(c.state(), SessionState::Empty);
        assert!(c.document().is_none());

        let alice = join(&mut c, "alice");
        assert_eq!(c.state(), SessionState::Active);
        assert_eq!(c.content(), Some("saved"));
        assert_eq!(c.version(), Some(7));

        assert_eq!(c.leave(alice.connection_id), SessionState::Draining);
        assert!(c.document().is_some());

        let bob = join(&mut c, "bob");
        assert_eq!(c.state(), SessionState::Active);
        assert!(!c.close().unwrap());

        c.leave(bob.connection_id);
        assert!(c.close().unwrap());
        assert_eq!(c.state(), SessionState::Empty);
        assert!(c.document().is_none());
    }

    #[test]
    fn test_operation_acked_and_broadcast() {
        let mut c = coordinator();
        let mut alice = join(&mut c, "alice");
        let mut bob = join(&mut c, "bob");
        alice.drain();
        bob.drain();

        let op = alice.insert(0, 0, 0, "hi");
        c.handle(alice.connection_id, Message::submit(op.clone())).unwrap();

        assert_eq!(alice.drain(), vec![Message::ack(op.id, 1)]);
        match bob.drain().as_slice() {
            [Message::Operation(payload)] => {
                assert_eq!(payload.version, Some(1));
                assert_eq!(payload.operation.id, op.id);
                assert_eq!(payload.operation.user_id, UserId::new("alice"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(c.content(), Some("hi"));
        assert!(c.is_dirty());
        assert_eq!(c.stats().accepted_operations, 1);
    }

    #[test]
    fn test_duplicate_submission_is_reacknowledged() {
        let mut c = coordinator();
        let mut alice = join(&mut c, "alice");
        let op = alice.insert(0, 0, 0, "x");
        c.handle(alice.connection_id, Message::submit(op.clone())).unwrap();
        c.handle(alice.connection_id, Message::submit(op.clone())).unwrap();

        let acks: Vec<_> = alice
            .drain()
            .into_iter()
            .filter(|m| m.kind() == MessageType::Ack)
            .collect();
        assert_eq!(acks, vec![Message::ack(op.id, 1), Message::ack(op.id, 1)]);
        assert_eq!(c.content(), Some("x"));
    }

    #[test]
    fn test_malformed_operation_rejected_to_sender_only() {
        let mut c = coordinator();
        let mut alice = join(&mut c, "alice");
        let mut bob = join(&mut c, "bob");
        alice.drain();
        bob.drain();

        let bad = alice.insert(0, 4, 0, "x");
        c.handle(alice.connection_id, Message::submit(bad.clone())).unwrap();

        match alice.drain().as_slice() {
            [Message::Error(err)] => {
                assert_eq!(err.code, ErrorCode::MalformedOperation);
                assert_eq!(err.operation_id, Some(bad.id));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(bob.drain().is_empty());
        assert_eq!(c.version(), Some(0));
    }

    #[test]
    fn test_stale_operation_gets_snapshot() {
        let config = SessionConfig {
            history_capacity: 2,
            ..SessionConfig::default()
        };
        let mut c = coordinator_with(Arc::new(MemoryDocumentStore::new()), config);
        let mut alice = join(&mut c, "alice");
        let mut bob = join(&mut c, "bob");
        for i in 0..4usize {
            let op = alice.insert(i as u64, i, i, "a");
            c.handle(alice.connection_id, Message::submit(op)).unwrap();
        }
        bob.drain();

        let stale = bob.insert(1, 1, 0, "b");
        c.handle(bob.connection_id, Message::submit(stale)).unwrap();
        let replies = bob.drain();
        assert_eq!(kinds(&replies), vec![MessageType::Error, MessageType::ResyncResponse]);
        match &replies[1] {
            Message::ResyncResponse(snapshot) => {
                assert_eq!(snapshot.version, 4);
                assert_eq!(snapshot.content, "aaaa");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_roster_and_user_leave() {
        let mut c = coordinator();
        let mut alice = join(&mut c, "alice");
        let mut bob = join(&mut c, "bob");

        assert_eq!(kinds(&alice.drain()), vec![MessageType::UserJoin]);
        assert_eq!(kinds(&bob.drain()), vec![MessageType::UserJoin, MessageType::Presence]);

        // A second tab for bob is not announced again.
        let (tx, _rx) = mpsc::unbounded_channel();
        let second = ConnectionId::next();
        c.join(second, ClientId::new("client-bob-2"), Identity::new(UserId::new("bob"), "bob"), tx)
            .unwrap();
        assert!(alice.drain().is_empty());
        assert_eq!(c.user_count(), 2);
        assert_eq!(c.connection_count(), 3);

        c.leave(bob.connection_id);
        assert!(alice.drain().is_empty());
        c.leave(second);
        assert_eq!(
            alice.drain(),
            vec![Message::UserLeave(UserLeavePayload { user_id: UserId::new("bob") })]
        );
    }

    #[test]
    fn test_presence_relayed_with_authoritative_identity() {
        let mut c = coordinator();
        let mut alice = join(&mut c, "alice");
        let mut bob = join(&mut c, "bob");
        alice.drain();
        bob.drain();

        let mut state = PresenceState::new(UserId::new("mallory"), "Mallory", "#fff");
        state.cursor = Some(3);
        c.handle(alice.connection_id, Message::Presence(state)).unwrap();

        match bob.drain().as_slice() {
            [Message::Presence(relayed)] => {
                assert_eq!(relayed.user_id, UserId::new("alice"));
                assert_eq!(relayed.cursor, Some(3));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(alice.drain().is_empty());
    }

    #[test]
    fn test_resync_replays_missed_and_accepts_queue() {
        let mut c = coordinator();
        let mut alice = join(&mut c, "alice");
        let mut bob = join(&mut c, "bob");
        let remote = alice.insert(0, 0, 0, "abc");
        c.handle(alice.connection_id, Message::submit(remote)).unwrap();
        alice.drain();
        bob.drain();

        let queued = bob.insert(0, 0, 0, "Z");
        c.handle(
            bob.connection_id,
            Message::ResyncRequest(ResyncRequestPayload {
                version: Some(0),
                operations: vec![queued.clone()],
            }),
        )
        .unwrap();

        let replies = bob.drain();
        assert_eq!(kinds(&replies), vec![MessageType::Operation, MessageType::Ack]);
        assert_eq!(replies[1], Message::ack(queued.id, 2));
        assert_eq!(kinds(&alice.drain()), vec![MessageType::Operation]);
        assert_eq!(c.version(), Some(2));
        assert_eq!(c.content().map(|s| s.chars().count()), Some(4));
    }

    #[test]
    fn test_resync_without_version_gets_snapshot() {
        let mut c = coordinator();
        let mut alice = join(&mut c, "alice");
        alice.drain();
        c.handle(alice.connection_id, Message::ResyncRequest(ResyncRequestPayload::default()))
            .unwrap();
        assert_eq!(kinds(&alice.drain()), vec![MessageType::ResyncResponse]);
    }

    #[test]
    fn test_spoofed_client_id_rejected() {
        let mut c = coordinator();
        let mut alice = join(&mut c, "alice");
        alice.drain();
        let mut ops = TextOperation::new();
        ops.insert("x");
        let op = Operation::new(ClientId::new("someone-else"), UserId::new("alice"), 0, ops);
        c.handle(alice.connection_id, Message::submit(op)).unwrap();
        assert_eq!(kinds(&alice.drain()), vec![MessageType::Error]);
        assert_eq!(c.version(), Some(0));
    }

    #[test]
    fn test_session_full() {
        let config = SessionConfig {
            max_participants: 1,
            ..SessionConfig::default()
        };
        let mut c = coordinator_with(Arc::new(MemoryDocumentStore::new()), config);
        let _alice = join(&mut c, "alice");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let err = c
            .join(ConnectionId::next(), ClientId::new("b"), Identity::new(UserId::new("bob"), "bob"), tx)
            .unwrap_err();
        assert_eq!(err, CollabError::SessionFull { max: 1 });
        assert!(matches!(rx.try_recv().unwrap().message, Message::Error(_)));
    }

    #[test]
    fn test_unreachable_connection_is_dropped() {
        let mut c = coordinator();
        let alice = join(&mut c, "alice");
        let bob = join(&mut c, "bob");
        drop(bob.rx);

        let op = alice.insert(0, 0, 0, "x");
        c.handle(alice.connection_id, Message::submit(op)).unwrap();
        assert_eq!(c.connection_count(), 1);
        assert_eq!(c.user_count(), 1);
    }

    #[test]
    fn test_checkpoint_only_when_dirty() {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut c = coordinator_with(store.clone(), SessionConfig::default());
        let alice = join(&mut c, "alice");
        assert!(!c.checkpoint().unwrap());

        c.handle(alice.connection_id, Message::submit(alice.insert(0, 0, 0, "saved")))
            .unwrap();
        assert!(c.checkpoint().unwrap());
        assert!(!c.checkpoint().unwrap());
        let stored = store.load(&SessionId::new("room")).unwrap().unwrap();
        assert_eq!(stored.content, "saved");
        assert_eq!(stored.version, 1);
    }

    #[test]
    fn test_message_before_join_is_rejected() {
        let mut c = coordinator();
        let err = c
            .handle(ConnectionId::next(), Message::ResyncRequest(ResyncRequestPayload::default()))
            .unwrap_err();
        assert_eq!(err, CollabError::NotJoined);
    }

    #[test]
    fn test_applied_operations_survive_reload() {
        let store = Arc::new(MemoryDocumentStore::new());
        let mut c = coordinator_with(store.clone(), SessionConfig::default());
        let alice = join(&mut c, "alice");
        let op = alice.insert(0, 0, 0, "x");
        c.handle(alice.connection_id, Message::submit(op.clone())).unwrap();
        c.leave(alice.connection_id);
        assert!(c.close().unwrap());
        assert!(!store.load(&SessionId::new("room")).unwrap().unwrap().applied.is_empty());

        // The ack was lost; the client reconnects with the operation still queued.
        let mut alice = join(&mut c, "alice");
        alice.drain();
        c.handle(
            alice.connection_id,
            Message::ResyncRequest(ResyncRequestPayload {
                version: Some(0),
                operations: vec![op.clone()],
            }),
        )
        .unwrap();

        match alice.drain().as_slice() {
            [Message::ResyncResponse(payload)] => {
                assert_eq!(payload.version, 1);
                assert_eq!(payload.content, "x");
                assert_eq!(payload.applied_operation_ids, vec![op.id]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(c.content(), Some("x"));
    }
}
