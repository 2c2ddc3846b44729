//! Test harness: one session coordinator and several sync engines joined by
//! in-memory links whose delivery the test controls step by step.

#![allow(dead_code)]

use code_collab::coordinator::{SessionConfig, SessionCoordinator};
use code_collab::editor::{EditorChange, MemoryEditor};
use code_collab::message::{Envelope, Message};
use code_collab::presence::Identity;
use code_collab::store::{DocumentStore, MemoryDocumentStore, StoredDocument};
use code_collab::sync::{ClientConfig, SyncEngine};
use code_collab::{ClientId, ConnectionId, Editor, SessionId, UserId};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::Instant;

pub const SESSION: &str = "room";

pub struct Link {
    pub connection_id: ConnectionId,
    sender: UnboundedSender<Envelope>,
    downstream: UnboundedReceiver<Envelope>,
    /// Client to server, not yet delivered.
    upstream: VecDeque<Message>,
}

pub struct SimulatedClient {
    pub engine: SyncEngine<MemoryEditor>,
    pub link: Option<Link>,
}

pub struct CollaborationHarness {
    pub coordinator: SessionCoordinator,
    pub clients: Vec<SimulatedClient>,
    pub now: Instant,
    pub store: Arc<MemoryDocumentStore>,
}

impl CollaborationHarness {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default(), "", 0)
    }

    pub fn with_document(content: &str, version: u64) -> Self {
        Self::with_config(SessionConfig::default(), content, version)
    }

    pub fn with_config(config: SessionConfig, content: &str, version: u64) -> Self {
        let store = Arc::new(MemoryDocumentStore::new());
        store
            .save(&StoredDocument::new(SessionId::new(SESSION), content, version))
            .unwrap();
        Self {
            coordinator: SessionCoordinator::new(SessionId::new(SESSION), config, store.clone()),
            clients: Vec::new(),
            now: Instant::now(),
            store,
        }
    }

    /// Add an offline client named `name` (also its user and client id).
    pub fn add_client(&mut self, name: &str) -> usize {
        let engine = SyncEngine::new(
            SessionId::new(SESSION),
            ClientId::new(name),
            Identity::new(UserId::new(name), name),
            MemoryEditor::new(""),
            ClientConfig::default(),
        );
        self.clients.push(SimulatedClient { engine, link: None });
        self.clients.len() - 1
    }

    pub fn engine(&self, idx: usize) -> &SyncEngine<MemoryEditor> {
        &self.clients[idx].engine
    }

    pub fn document(&self, idx: usize) -> &str {
        self.clients[idx].engine.document()
    }

    pub fn connect(&mut self, idx: usize) {
        let (sender, downstream) = mpsc::unbounded_channel();
        let client = &mut self.clients[idx];
        let upstream = client.engine.on_connected().into();
        client.link = Some(Link {
            connection_id: ConnectionId::next(),
            sender,
            downstream,
            upstream,
        });
    }

    /// Drop the link; undelivered messages in both directions are lost.
    pub fn disconnect(&mut self, idx: usize) {
        let client = &mut self.clients[idx];
        if let Some(link) = client.link.take() {
            self.coordinator.leave(link.connection_id);
        }
        client.engine.on_disconnected();
    }

    pub fn queue(&mut self, idx: usize, messages: impl IntoIterator<Item = Message>) {
        if let Some(link) = &mut self.clients[idx].link {
            link.upstream.extend(messages);
        }
    }

    /// The user types `change` into the client's editor.
    pub fn edit(&mut self, idx: usize, change: EditorChange) {
        let now = self.now;
        let engine = &mut self.clients[idx].engine;
        let change = engine.editor_mut().edit(change).unwrap();
        engine.local_change(change, now).unwrap();
    }

    pub fn insert(&mut self, idx: usize, offset: usize, text: &str) {
        self.edit(idx, EditorChange::insert(offset, text));
    }

    pub fn flush(&mut self, idx: usize) {
        let out = self.clients[idx].engine.flush();
        self.queue(idx, out);
    }

    /// Type then flush, as one released operation.
    pub fn type_and_flush(&mut self, idx: usize, offset: usize, text: &str) {
        self.insert(idx, offset, text);
        self.flush(idx);
    }

    /// Deliver everything the client has sent. Returns the message count.
    pub fn deliver_up(&mut self, idx: usize) -> usize {
        let mut count = 0;
        while self.deliver_one_up(idx) {
            count += 1;
        }
        count
    }

    /// Deliver only the oldest undelivered client message.
    pub fn deliver_one_up(&mut self, idx: usize) -> bool {
        let client = &mut self.clients[idx];
        let Some(link) = &mut client.link else {
            return false;
        };
        let Some(message) = link.upstream.pop_front() else {
            return false;
        };
        match message {
            Message::UserJoin(_) => self
                .coordinator
                .join(
                    link.connection_id,
                    client.engine.client_id().clone(),
                    client.engine.identity().clone(),
                    link.sender.clone(),
                )
                .unwrap(),
            other => self.coordinator.handle(link.connection_id, other).unwrap(),
        }
        true
    }

    /// Deliver everything the server has sent the client.
    pub fn deliver_down(&mut self, idx: usize) -> usize {
        let now = self.now;
        let client = &mut self.clients[idx];
        let Some(link) = &mut client.link else {
            return 0;
        };
        let mut count = 0;
        while let Ok(envelope) = link.downstream.try_recv() {
            count += 1;
            let replies = client.engine.handle_message(envelope.message, now);
            link.upstream.extend(replies);
        }
        count
    }

    /// Duplicate every undelivered server message to the client.
    pub fn duplicate_down(&mut self, idx: usize) {
        let Some(link) = &mut self.clients[idx].link else {
            return;
        };
        let mut pending = Vec::new();
        while let Ok(envelope) = link.downstream.try_recv() {
            pending.push(envelope);
        }
        for envelope in pending.iter().chain(pending.iter()) {
            link.sender.send(envelope.clone()).unwrap();
        }
    }

    /// Run every link until no messages move.
    pub fn settle(&mut self) {
        loop {
            let mut moved = 0;
            for idx in 0..self.clients.len() {
                moved += self.deliver_up(idx);
                moved += self.deliver_down(idx);
            }
            if moved == 0 {
                break;
            }
        }
    }

    /// Let time pass and drive every engine's timers.
    pub fn advance(&mut self, millis: u64) {
        self.now += Duration::from_millis(millis);
        let now = self.now;
        for idx in 0..self.clients.len() {
            let out = self.clients[idx].engine.poll(now);
            self.queue(idx, out);
        }
    }

    /// Every connected client matches the server, in content and version.
    pub fn assert_converged(&self) {
        let content = self.coordinator.content().unwrap();
        let version = self.coordinator.version().unwrap();
        for client in self.clients.iter().filter(|c| c.link.is_some()) {
            let engine = &client.engine;
            assert_eq!(engine.document(), content, "client {} diverged", engine.client_id());
            assert_eq!(engine.version(), version, "client {} version", engine.client_id());
            assert_eq!(engine.editor().value(), content, "editor of {}", engine.client_id());
            assert!(engine.pending().is_empty(), "client {} has pending work", engine.client_id());
        }
    }
}
