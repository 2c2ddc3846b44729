//! Client sync engine.
//!
//! The engine owns the local view of one shared document and the queue of
//! local operations the server has not acknowledged yet. It is transport
//! agnostic: inbound messages go in through [`SyncEngine::handle_message`],
//! and every method that may need to talk to the server returns the
//! messages to send. Time is passed in explicitly so debounce and typing
//! expiry can be driven deterministically.
//!
//! Invariants kept at every step:
//!
//! - `document == server_content · pending[0] · … · pending[n-1] · buffer`
//! - only the head of `pending` is on the wire during normal operation
//! - a pending operation leaves the queue only when its own id is
//!   acknowledged, or when a snapshot shows the server already applied it

use crate::editor::{Editor, EditorChange};
use crate::error::{CollabError, CollabResult, ErrorCode};
use crate::ids::{ClientId, OperationId, SessionId, UserId};
use crate::message::{
    ErrorPayload, Message, ResyncRequestPayload, ResyncResponsePayload, UserJoinPayload,
};
use crate::observer::{ListenerResult, Observers, Subscription};
use crate::offline::{ConnectionStatus, OfflineStatusInfo};
use crate::operation::{char_len, Operation, TextOperation};
use crate::presence::{Identity, PresenceChange, PresenceState, PresenceTracker, Selection};
use crate::timer::Debouncer;
use crate::transform::{transform, transform_operations, TieBreak};
use crate::undo::UndoManager;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Client-side tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Quiet period after the last keystroke before local edits are sent.
    pub debounce_ms: u64,
    /// Interval between full presence broadcasts.
    pub heartbeat_ms: u64,
    /// Remote typing indicators clear after this long without a refresh.
    pub typing_timeout_ms: u64,
    /// First reconnect delay.
    pub backoff_base_ms: u64,
    /// Reconnect delay cap.
    pub backoff_max_ms: u64,
    /// Reconnect delays are scaled by a random factor in `1 ± jitter`.
    pub backoff_jitter: f64,
    /// Maximum undo depth.
    pub undo_limit: usize,
    /// How many acknowledged ids are remembered to drop duplicate acks.
    pub recent_ack_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 300,
            heartbeat_ms: 3_000,
            typing_timeout_ms: 5_000,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            backoff_jitter: 0.3,
            undo_limit: 100,
            recent_ack_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn backoff(&self) -> crate::offline::Backoff {
        crate::offline::Backoff::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
            self.backoff_jitter,
        )
    }
}

/// Events delivered to subscribers of a [`SyncEngine`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyncEvent {
    /// A remote operation was applied to the local document.
    RemoteOperation {
        operation_id: OperationId,
        user_id: UserId,
        version: u64,
    },
    /// One of our operations was acknowledged.
    Acknowledged {
        operation_id: OperationId,
        version: u64,
    },
    /// The document was replaced from a snapshot. `merged_local` is set when
    /// unacknowledged local edits were carried over onto it.
    Resynced { version: u64, merged_local: bool },
    ParticipantJoined(UserId),
    ParticipantLeft(UserId),
    PresenceChanged(UserId),
    TypingExpired(UserId),
    StatusChanged(ConnectionStatus),
    /// The server refused something we sent.
    Rejected {
        code: ErrorCode,
        message: String,
        operation_id: Option<OperationId>,
    },
}

/// Serializable engine state, for restoring unsent work after a restart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub session_id: SessionId,
    pub client_id: ClientId,
    /// Last server version applied, absent if never synced.
    pub version: Option<u64>,
    pub server_content: String,
    pub document: String,
    pub pending: Vec<Operation>,
    pub buffer: Option<TextOperation>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LocalKind {
    Edit,
    Undo,
    Redo,
}

/// Client-side synchronization state for one session.
pub struct SyncEngine<E: Editor> {
    session_id: SessionId,
    client_id: ClientId,
    identity: Identity,
    config: ClientConfig,
    editor: E,
    /// Local view: server content plus every unacknowledged local edit.
    document: String,
    /// Content at `version` as the server has it.
    server_content: String,
    version: u64,
    synced: bool,
    pending: VecDeque<Operation>,
    /// Number of pending operations at the head that are on the wire.
    in_flight: usize,
    /// Local edits not yet cut into a pending operation.
    buffer: Option<TextOperation>,
    debounce: Debouncer,
    acknowledged: VecDeque<OperationId>,
    undo: UndoManager,
    presence: PresenceTracker,
    local_presence: PresenceState,
    typing_until: Option<Instant>,
    status: ConnectionStatus,
    observers: Observers<SyncEvent>,
}

impl<E: Editor> SyncEngine<E> {
    /// Create an engine around `editor`. Until the first snapshot arrives the
    /// editor's current content is treated as the last known server state.
    pub fn new(
        session_id: SessionId,
        client_id: ClientId,
        identity: Identity,
        editor: E,
        config: ClientConfig,
    ) -> Self {
        let document = editor.value();
        let local_presence = PresenceState::new(
            identity.user_id.clone(),
            identity.display_name.clone(),
            identity.color.clone().unwrap_or_default(),
        );
        Self {
            presence: PresenceTracker::new(identity.user_id.clone(), config.typing_timeout()),
            debounce: Debouncer::new(config.debounce()),
            undo: UndoManager::new(config.undo_limit),
            session_id,
            client_id,
            identity,
            editor,
            server_content: document.clone(),
            document,
            version: 0,
            synced: false,
            pending: VecDeque::new(),
            in_flight: 0,
            buffer: None,
            acknowledged: VecDeque::new(),
            local_presence,
            typing_until: None,
            status: ConnectionStatus::Offline,
            observers: Observers::new(),
            config,
        }
    }

    /// Rebuild an engine from a saved [`SyncState`].
    pub fn restore(state: SyncState, identity: Identity, mut editor: E, config: ClientConfig) -> Self {
        editor.set_value(&state.document);
        let mut engine = Self::new(state.session_id, state.client_id, identity, editor, config);
        engine.synced = state.version.is_some();
        engine.version = state.version.unwrap_or(0);
        engine.server_content = state.server_content;
        engine.document = state.document;
        engine.pending = state.pending.into();
        engine.buffer = state.buffer;
        engine
    }

    /// Snapshot of everything needed to resume without losing local edits.
    pub fn save_state(&self) -> SyncState {
        SyncState {
            session_id: self.session_id.clone(),
            client_id: self.client_id.clone(),
            version: self.synced.then_some(self.version),
            server_content: self.server_content.clone(),
            document: self.document.clone(),
            pending: self.pending.iter().cloned().collect(),
            buffer: self.buffer.clone(),
        }
    }

    // ========== Accessors ==========

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Local document, including unacknowledged edits.
    pub fn document(&self) -> &str {
        &self.document
    }

    /// Last server version applied.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Content at [`Self::version`] as the server has it.
    pub fn server_content(&self) -> &str {
        &self.server_content
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// Unacknowledged local operations, oldest first.
    pub fn pending(&self) -> &VecDeque<Operation> {
        &self.pending
    }

    /// Local edits still inside the debounce window.
    pub fn buffer(&self) -> Option<&TextOperation> {
        self.buffer.as_ref()
    }

    /// Whether anything local has not been acknowledged yet.
    pub fn has_unacknowledged(&self) -> bool {
        !self.pending.is_empty() || self.buffer.is_some()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn status_info(&self) -> OfflineStatusInfo {
        OfflineStatusInfo::new(
            self.status,
            self.pending.len() + usize::from(self.buffer.is_some()),
        )
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    pub fn local_presence(&self) -> &PresenceState {
        &self.local_presence
    }

    pub fn editor(&self) -> &E {
        &self.editor
    }

    pub fn editor_mut(&mut self) -> &mut E {
        &mut self.editor
    }

    pub fn can_undo(&self) -> bool {
        self.undo.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.undo.can_redo()
    }

    // ========== Observers ==========

    pub fn subscribe<F>(&mut self, listener: F) -> Subscription
    where
        F: Fn(&SyncEvent) -> ListenerResult + Send + Sync + 'static,
    {
        self.observers.subscribe(listener)
    }

    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        self.observers.unsubscribe(subscription)
    }

    fn emit(&self, event: SyncEvent) {
        self.observers.notify(&event);
    }

    fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            tracing::debug!(session = %self.session_id, from = ?self.status, to = ?status, "connection status");
            self.status = status;
            self.emit(SyncEvent::StatusChanged(status));
        }
    }

    fn refresh_decorations(&mut self) {
        let cursors = self.presence.remote_cursors();
        self.editor.set_decorations(&cursors);
    }

    // ========== Local edits ==========

    /// Record an edit the user already made in the editor.
    pub fn local_change(&mut self, change: EditorChange, now: Instant) -> CollabResult<()> {
        let op = change.to_operation(char_len(&self.document))?;
        self.apply_local(op, LocalKind::Edit, now)
    }

    /// Record a local edit given as an operation over the current document.
    pub fn local_operation(&mut self, op: TextOperation, now: Instant) -> CollabResult<()> {
        self.apply_local(op, LocalKind::Edit, now)
    }

    fn apply_local(&mut self, op: TextOperation, kind: LocalKind, now: Instant) -> CollabResult<()> {
        let inverse = op.invert(&self.document)?;
        let document = op.apply(&self.document)?;
        let buffer = match &self.buffer {
            Some(buffer) => buffer.compose(&op)?,
            None => op,
        };

        self.document = document;
        self.buffer = Some(buffer);
        match kind {
            LocalKind::Edit => self.undo.record(inverse),
            LocalKind::Undo => self.undo.record_redo(inverse),
            LocalKind::Redo => self.undo.record_undo(inverse),
        }
        self.local_presence.typing = true;
        self.local_presence.touch();
        self.typing_until = Some(now + self.config.typing_timeout());
        self.debounce.touch(now);
        Ok(())
    }

    /// Revert the most recent local edit that has not been undone.
    pub fn undo(&mut self, now: Instant) -> CollabResult<bool> {
        let Some(op) = self.undo.pop_undo() else {
            return Ok(false);
        };
        self.apply_local(op.clone(), LocalKind::Undo, now)?;
        self.push_to_editor(&op);
        Ok(true)
    }

    pub fn redo(&mut self, now: Instant) -> CollabResult<bool> {
        let Some(op) = self.undo.pop_redo() else {
            return Ok(false);
        };
        self.apply_local(op.clone(), LocalKind::Redo, now)?;
        self.push_to_editor(&op);
        Ok(true)
    }

    fn push_to_editor(&mut self, op: &TextOperation) {
        if let Err(err) = self.editor.apply_operation(op) {
            tracing::warn!(session = %self.session_id, %err, "editor diverged, replacing content");
            self.editor.set_value(&self.document);
        }
    }

    /// Update the local caret and selection. Returns a presence update to
    /// send when connected.
    pub fn set_selection(&mut self, selection: Selection) -> Option<Message> {
        self.local_presence.cursor = Some(selection.head);
        self.local_presence
            .set_selection((!selection.is_collapsed()).then_some(selection));
        self.presence_message()
    }

    /// Full local presence, if there is a connection to send it on.
    pub fn presence_message(&self) -> Option<Message> {
        self.status
            .is_connected()
            .then(|| Message::Presence(self.local_presence.clone()))
    }

    // ========== Sending ==========

    /// Cut the debounce buffer into a pending operation and send the queue
    /// head if nothing is in flight.
    pub fn flush(&mut self) -> Option<Message> {
        self.debounce.cancel();
        self.cut_buffer();
        self.next_outgoing()
    }

    fn cut_buffer(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if !buffer.is_noop() {
                self.pending.push_back(Operation::new(
                    self.client_id.clone(),
                    self.identity.user_id.clone(),
                    self.version,
                    buffer,
                ));
            }
        }
    }

    fn next_outgoing(&mut self) -> Option<Message> {
        if !self.status.is_online() || !self.synced || self.in_flight > 0 {
            return None;
        }
        let version = self.version;
        let head = self.pending.front_mut()?;
        head.base_version = version;
        self.in_flight = 1;
        tracing::trace!(operation = %head.id, base_version = version, "sending operation");
        Some(Message::submit(head.clone()))
    }

    /// Drive timers: debounce flush, local typing decay and remote typing
    /// expiry.
    pub fn poll(&mut self, now: Instant) -> Vec<Message> {
        let mut outgoing = Vec::new();
        if self.debounce.take_due(now) {
            outgoing.extend(self.flush());
        }

        if self.typing_until.is_some_and(|deadline| deadline <= now) {
            self.typing_until = None;
            self.local_presence.set_typing(false);
            outgoing.extend(self.presence_message());
        }

        let expired = self.presence.expire_typing(now);
        if !expired.is_empty() {
            self.refresh_decorations();
            for user_id in expired {
                self.emit(SyncEvent::TypingExpired(user_id));
            }
        }
        outgoing
    }

    /// Earliest instant at which [`Self::poll`] has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        [
            self.debounce.deadline(),
            self.typing_until,
            self.presence.next_typing_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    // ========== Connection lifecycle ==========

    /// A transport is up: join and ask the server to catch us up.
    pub fn on_connected(&mut self) -> Vec<Message> {
        let join = Message::UserJoin(UserJoinPayload {
            user_id: self.identity.user_id.clone(),
            display_name: self.identity.display_name.clone(),
            color: self.identity.color.clone(),
            client_id: Some(self.client_id.clone()),
            token: None,
        });
        vec![join, self.resync_request()]
    }

    /// The transport dropped. Pending work stays queued.
    pub fn on_disconnected(&mut self) {
        self.in_flight = 0;
        self.presence.clear();
        self.refresh_decorations();
        self.set_status(ConnectionStatus::Offline);
    }

    /// Waiting for the next reconnect attempt.
    pub fn on_reconnecting(&mut self) {
        self.set_status(ConnectionStatus::Reconnecting);
    }

    /// Ask the server to replay what we missed and accept our queue.
    ///
    /// The whole pending queue goes out as a chain based on our version;
    /// until its acks are back nothing else is sent.
    pub fn resync_request(&mut self) -> Message {
        self.debounce.cancel();
        self.cut_buffer();

        let payload = if self.synced {
            let version = self.version;
            let operations: Vec<Operation> = self
                .pending
                .iter()
                .map(|op| Operation {
                    base_version: version,
                    ..op.clone()
                })
                .collect();
            self.in_flight = operations.len();
            ResyncRequestPayload {
                version: Some(version),
                operations,
            }
        } else {
            self.in_flight = 0;
            ResyncRequestPayload::default()
        };

        self.set_status(ConnectionStatus::Syncing);
        if self.synced && self.in_flight == 0 {
            self.set_status(ConnectionStatus::Online);
        }
        Message::ResyncRequest(payload)
    }

    // ========== Inbound ==========

    /// Process one message from the server and return any replies.
    pub fn handle_message(&mut self, message: Message, now: Instant) -> Vec<Message> {
        let result = match message {
            Message::Operation(payload) => match payload.version {
                Some(version) => self.handle_remote(payload.operation, version),
                None => {
                    tracing::warn!("remote operation without version ignored");
                    Ok(Vec::new())
                }
            },
            Message::Ack(ack) => self.handle_ack(ack.operation_id, ack.version),
            Message::Presence(state) => {
                self.handle_presence(state, now);
                Ok(Vec::new())
            }
            Message::UserJoin(join) => {
                let color = join.color.unwrap_or_default();
                let state = PresenceState::new(join.user_id, join.display_name, color);
                self.handle_presence(state, now);
                Ok(Vec::new())
            }
            Message::UserLeave(leave) => {
                if self.presence.remove(&leave.user_id).is_some() {
                    self.refresh_decorations();
                    self.emit(SyncEvent::ParticipantLeft(leave.user_id));
                }
                Ok(Vec::new())
            }
            Message::ResyncResponse(payload) => Ok(self.handle_resync_response(payload)),
            Message::Error(payload) => Ok(self.handle_error(payload)),
            Message::ResyncRequest(_) => {
                tracing::warn!("unexpected resync-request from server");
                Ok(Vec::new())
            }
        };

        result.unwrap_or_else(|err| {
            tracing::warn!(session = %self.session_id, %err, "local state diverged, requesting resync");
            vec![self.resync_request()]
        })
    }

    fn handle_presence(&mut self, state: PresenceState, now: Instant) {
        match self.presence.update(state, now) {
            PresenceChange::Joined(user_id) => {
                self.refresh_decorations();
                self.emit(SyncEvent::ParticipantJoined(user_id));
            }
            PresenceChange::Updated(user_id) => {
                self.refresh_decorations();
                self.emit(SyncEvent::PresenceChanged(user_id));
            }
            PresenceChange::Ignored => {}
        }
    }

    /// Apply an operation another client made, broadcast at `version`.
    fn handle_remote(&mut self, op: Operation, version: u64) -> CollabResult<Vec<Message>> {
        if !self.synced || version <= self.version {
            return Ok(Vec::new());
        }
        if version != self.version + 1 {
            tracing::debug!(expected = self.version + 1, got = version, "version gap");
            return Ok(vec![self.resync_request()]);
        }

        // Transform on copies so a failure leaves the engine untouched.
        let mut pending = self.pending.clone();
        let mut incoming = op.clone();
        for queued in pending.iter_mut() {
            let (queued_prime, incoming_prime) = transform_operations(queued, &incoming)?;
            *queued = queued_prime;
            incoming = incoming_prime;
        }
        let mut incoming_ops = incoming.ops;
        let buffer = match &self.buffer {
            Some(buffer) => {
                let tie = if self.client_id < op.client_id {
                    TieBreak::FirstAfter
                } else {
                    TieBreak::FirstBefore
                };
                let (buffer_prime, incoming_prime) = transform(buffer, &incoming_ops, tie)?;
                incoming_ops = incoming_prime;
                Some(buffer_prime)
            }
            None => None,
        };
        let server_content = op.ops.apply(&self.server_content)?;
        let document = incoming_ops.apply(&self.document)?;
        let mut undo = self.undo.clone();
        undo.transform(&incoming_ops)?;

        self.pending = pending;
        self.buffer = buffer;
        self.server_content = server_content;
        self.document = document;
        self.undo = undo;
        self.version = version;

        self.push_to_editor(&incoming_ops);
        self.presence.transform_cursors(&incoming_ops);
        self.local_presence.transform(&incoming_ops);
        self.refresh_decorations();
        self.emit(SyncEvent::RemoteOperation {
            operation_id: op.id,
            user_id: op.user_id,
            version,
        });
        Ok(Vec::new())
    }

    /// Retire the acknowledged operation and release the next one.
    fn handle_ack(&mut self, operation_id: OperationId, version: u64) -> CollabResult<Vec<Message>> {
        if self.acknowledged.contains(&operation_id) {
            tracing::debug!(operation = %operation_id, "duplicate ack ignored");
            return Ok(Vec::new());
        }
        match self.pending.front() {
            Some(head) if head.id == operation_id => {}
            _ if self.pending.iter().any(|op| op.id == operation_id) => {
                tracing::warn!(operation = %operation_id, "ack out of queue order");
                return Ok(vec![self.resync_request()]);
            }
            _ => {
                tracing::warn!(operation = %operation_id, "ack for unknown operation ignored");
                return Ok(Vec::new());
            }
        }
        if version != self.version + 1 {
            tracing::debug!(expected = self.version + 1, got = version, "ack skips versions");
            return Ok(vec![self.resync_request()]);
        }

        let server_content = match self.pending.front() {
            Some(head) => head.ops.apply(&self.server_content)?,
            None => return Ok(Vec::new()),
        };
        self.pending.pop_front();
        self.server_content = server_content;
        self.version = version;
        self.in_flight = self.in_flight.saturating_sub(1);
        self.remember_ack(operation_id);

        self.emit(SyncEvent::Acknowledged {
            operation_id,
            version,
        });
        if self.in_flight == 0 && self.status == ConnectionStatus::Syncing {
            self.set_status(ConnectionStatus::Online);
        }
        Ok(self.next_outgoing().into_iter().collect())
    }

    fn remember_ack(&mut self, operation_id: OperationId) {
        self.acknowledged.push_back(operation_id);
        while self.acknowledged.len() > self.config.recent_ack_capacity {
            self.acknowledged.pop_front();
        }
    }

    /// Replace the document with a server snapshot, carrying unacknowledged
    /// local edits over on top of it.
    fn handle_resync_response(&mut self, payload: ResyncResponsePayload) -> Vec<Message> {
        let ResyncResponsePayload {
            version,
            content,
            applied_operation_ids,
        } = payload;

        let merged = self.merge_snapshot(&content, &applied_operation_ids);
        let (document, pending, carried) = match merged {
            Ok(merge) => merge,
            Err(err) => {
                tracing::error!(session = %self.session_id, %err, "local edits could not be merged onto snapshot, discarding them");
                (content.clone(), None, TextOperation::identity(char_len(&self.document)))
            }
        };
        let merged_local = pending.is_some();

        for id in applied_operation_ids {
            if !self.acknowledged.contains(&id) {
                self.remember_ack(id);
            }
        }
        self.server_content = content;
        self.version = version;
        self.synced = true;
        self.pending = pending.into_iter().collect();
        self.buffer = None;
        self.in_flight = 0;
        self.debounce.cancel();

        if carried.base_len() == char_len(&self.document) {
            if self.undo.transform(&carried).is_err() {
                self.undo.clear();
            }
            self.presence.transform_cursors(&carried);
            self.local_presence.transform(&carried);
        } else {
            self.undo.clear();
        }
        self.document = document;
        self.editor.set_value(&self.document);
        self.refresh_decorations();

        self.set_status(ConnectionStatus::Online);
        self.emit(SyncEvent::Resynced {
            version,
            merged_local,
        });
        self.next_outgoing().into_iter().collect()
    }

    /// Returns the new document, the single pending operation carrying local
    /// work (if any) and the operation that maps the old document onto the
    /// new one.
    fn merge_snapshot(
        &self,
        content: &str,
        applied: &[OperationId],
    ) -> CollabResult<(String, Option<Operation>, TextOperation)> {
        // Applied ids form a prefix of the queue: the server accepts a chain in order.
        let retired = self
            .pending
            .iter()
            .rposition(|op| applied.contains(&op.id))
            .map_or(0, |idx| idx + 1);

        let mut base = self.server_content.clone();
        for op in self.pending.iter().take(retired) {
            base = op.ops.apply(&base)?;
        }

        let mut local = TextOperation::identity(char_len(&base));
        for op in self.pending.iter().skip(retired) {
            local = local.compose(&op.ops)?;
        }
        if let Some(buffer) = &self.buffer {
            local = local.compose(buffer)?;
        }

        let remote = TextOperation::diff(&base, content);
        let (local_prime, remote_prime) = transform(&local, &remote, TieBreak::FirstBefore)?;
        let document = local_prime.apply(content)?;
        let pending = (!local_prime.is_noop()).then(|| {
            Operation::new(
                self.client_id.clone(),
                self.identity.user_id.clone(),
                0,
                local_prime,
            )
        });
        Ok((document, pending, remote_prime))
    }

    fn handle_error(&mut self, payload: ErrorPayload) -> Vec<Message> {
        tracing::warn!(code = ?payload.code, message = %payload.message, "server rejected message");
        self.emit(SyncEvent::Rejected {
            code: payload.code,
            message: payload.message.clone(),
            operation_id: payload.operation_id,
        });

        match payload.code {
            // A snapshot follows; local edits are merged onto it.
            ErrorCode::StaleClient => {
                self.set_status(ConnectionStatus::Syncing);
                Vec::new()
            }
            ErrorCode::MalformedOperation if payload.operation_id.is_some() => {
                // Everything queued after the rejected operation depends on it.
                tracing::error!(operation = ?payload.operation_id, "operation rejected, discarding local edits");
                self.pending.clear();
                self.buffer = None;
                self.in_flight = 0;
                self.synced = false;
                self.document = self.server_content.clone();
                self.editor.set_value(&self.document);
                self.refresh_decorations();
                self.undo.clear();
                vec![self.resync_request()]
            }
            _ => Vec::new(),
        }
    }
}

impl<E: Editor> std::fmt::Debug for SyncEngine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("session_id", &self.session_id)
            .field("client_id", &self.client_id)
            .field("version", &self.version)
            .field("pending", &self.pending.len())
            .field("status", &self.status)
            .finish()
    }
}

/// Reject a message that cannot be handled by a sync engine at all.
pub fn ensure_session(engine_session: &SessionId, message_session: &SessionId) -> CollabResult<()> {
    if engine_session == message_session {
        Ok(())
    } else {
        Err(CollabError::MalformedOperation(format!(
            "message for session {message_session} delivered to {engine_session}"
        )))
    }
}
