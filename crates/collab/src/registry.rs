//! Session registry: one actor task per live session.
//!
//! Every session's [`SessionCoordinator`] runs on its own task and is driven
//! through a command channel, so all mutations of one document are
//! serialized while different sessions proceed in parallel. The actor also
//! owns the session's timers: periodic checkpoints and the grace period
//! after the last participant leaves.

use crate::coordinator::{Outbox, SessionConfig, SessionCoordinator, SessionState, SessionStats};
use crate::error::{CollabError, CollabResult};
use crate::ids::{ClientId, ConnectionId, SessionId};
use crate::message::Message;
use crate::presence::Identity;
use crate::store::DocumentStore;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{self, Instant, MissedTickBehavior};

type SessionMap = RwLock<HashMap<SessionId, SessionHandle>>;

/// Commands processed by a session actor.
#[derive(Debug)]
enum SessionCommand {
    Join {
        connection_id: ConnectionId,
        client_id: ClientId,
        identity: Identity,
        sender: Outbox,
        reply: oneshot::Sender<CollabResult<()>>,
    },
    Message {
        connection_id: ConnectionId,
        message: Message,
    },
    Leave {
        connection_id: ConnectionId,
    },
    Stats {
        reply: oneshot::Sender<SessionStats>,
    },
    Checkpoint {
        reply: oneshot::Sender<CollabResult<bool>>,
    },
    Shutdown {
        reply: oneshot::Sender<CollabResult<bool>>,
    },
}

/// Address of a running session actor.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    session_id: SessionId,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    fn send(&self, command: SessionCommand) -> CollabResult<()> {
        self.commands
            .send(command)
            .map_err(|_| CollabError::SessionClosed(self.session_id.clone()))
    }

    /// Forward a client message. Replies go to the connection's outbox.
    pub fn send_message(&self, connection_id: ConnectionId, message: Message) -> CollabResult<()> {
        self.send(SessionCommand::Message {
            connection_id,
            message,
        })
    }

    pub fn leave(&self, connection_id: ConnectionId) -> CollabResult<()> {
        self.send(SessionCommand::Leave { connection_id })
    }

    pub async fn stats(&self) -> CollabResult<SessionStats> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Stats { reply })?;
        rx.await
            .map_err(|_| CollabError::SessionClosed(self.session_id.clone()))
    }

    /// Write a checkpoint now if the document changed.
    pub async fn checkpoint(&self) -> CollabResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Checkpoint { reply })?;
        rx.await
            .map_err(|_| CollabError::SessionClosed(self.session_id.clone()))?
    }

    async fn shutdown(&self) -> CollabResult<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(SessionCommand::Shutdown { reply })?;
        rx.await
            .map_err(|_| CollabError::SessionClosed(self.session_id.clone()))?
    }
}

/// All live sessions of a server.
pub struct SessionRegistry {
    sessions: Arc<SessionMap>,
    store: Arc<dyn DocumentStore>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn DocumentStore>, config: SessionConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            store,
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Join a connection to a session, starting the session if needed.
    pub async fn join(
        &self,
        session_id: SessionId,
        connection_id: ConnectionId,
        client_id: ClientId,
        identity: Identity,
        sender: Outbox,
    ) -> CollabResult<SessionHandle> {
        // A session that is shutting down drops queued commands; retry once
        // against a fresh actor.
        for _ in 0..2 {
            let (reply, rx) = oneshot::channel();
            let command = SessionCommand::Join {
                connection_id,
                client_id: client_id.clone(),
                identity: identity.clone(),
                sender: sender.clone(),
                reply,
            };

            let handle = {
                let mut sessions = self.sessions.write().await;
                let handle = sessions
                    .entry(session_id.clone())
                    .or_insert_with(|| self.spawn(session_id.clone()))
                    .clone();
                // Sent under the lock: the actor takes the same lock before
                // deciding to close, so it will see this command.
                if handle.send(command).is_err() {
                    sessions.remove(&session_id);
                    continue;
                }
                handle
            };

            match rx.await {
                Ok(result) => return result.map(|()| handle),
                Err(_) => continue,
            }
        }
        Err(CollabError::SessionClosed(session_id))
    }

    fn spawn(&self, session_id: SessionId) -> SessionHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator =
            SessionCoordinator::new(session_id.clone(), self.config.clone(), Arc::clone(&self.store));
        tracing::debug!(session = %session_id, "spawning session actor");
        tokio::spawn(run_session(coordinator, rx, Arc::downgrade(&self.sessions)));
        SessionHandle {
            session_id,
            commands: tx,
        }
    }

    pub async fn get(&self, session_id: &SessionId) -> Option<SessionHandle> {
        self.sessions.read().await.get(session_id).cloned()
    }

    pub async fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn stats(&self) -> Vec<SessionStats> {
        let handles: Vec<SessionHandle> = self.sessions.read().await.values().cloned().collect();
        let mut stats = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(s) = handle.stats().await {
                stats.push(s);
            }
        }
        stats.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        stats
    }

    /// Checkpoint and stop every session. Returns the sessions that failed
    /// to persist.
    pub async fn shutdown(&self) -> Vec<(SessionId, CollabError)> {
        let handles: Vec<SessionHandle> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().map(|(_, handle)| handle).collect()
        };
        let mut failures = Vec::new();
        for handle in handles {
            if let Err(err) = handle.shutdown().await {
                tracing::error!(session = %handle.session_id, %err, "final checkpoint failed");
                failures.push((handle.session_id.clone(), err));
            }
        }
        failures
    }
}

/// Process one command; returns false when the actor should stop.
fn handle_command(coordinator: &mut SessionCoordinator, command: SessionCommand) -> bool {
    match command {
        SessionCommand::Join {
            connection_id,
            client_id,
            identity,
            sender,
            reply,
        } => {
            let result = coordinator.join(connection_id, client_id, identity, sender);
            let _ = reply.send(result);
        }
        SessionCommand::Message {
            connection_id,
            message,
        } => {
            if let Err(err) = coordinator.handle(connection_id, message) {
                tracing::debug!(session = %coordinator.session_id(), %connection_id, %err, "message dropped");
            }
        }
        SessionCommand::Leave { connection_id } => {
            coordinator.leave(connection_id);
        }
        SessionCommand::Stats { reply } => {
            let _ = reply.send(coordinator.stats());
        }
        SessionCommand::Checkpoint { reply } => {
            let _ = reply.send(coordinator.checkpoint());
        }
        SessionCommand::Shutdown { reply } => {
            let _ = reply.send(coordinator.checkpoint());
            return false;
        }
    }
    true
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn run_session(
    mut coordinator: SessionCoordinator,
    mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    sessions: Weak<SessionMap>,
) {
    let session_id = coordinator.session_id().clone();
    let grace = coordinator.config().grace_period();
    let period = coordinator.config().checkpoint_interval();
    let mut checkpoints = time::interval_at(Instant::now() + period, period);
    checkpoints.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut grace_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    // Every handle is gone; persist what we have.
                    if let Err(err) = coordinator.checkpoint() {
                        tracing::error!(session = %session_id, %err, "final checkpoint failed");
                    }
                    break;
                };
                if !handle_command(&mut coordinator, command) {
                    break;
                }
                match coordinator.state() {
                    SessionState::Draining if grace_deadline.is_none() => {
                        grace_deadline = Some(Instant::now() + grace);
                    }
                    SessionState::Active => grace_deadline = None,
                    // Nothing loaded and nobody joined, e.g. the store failed.
                    SessionState::Empty if coordinator.connection_count() == 0 => {
                        grace_deadline = Some(Instant::now());
                    }
                    _ => {}
                }
            }
            _ = checkpoints.tick() => {
                if let Err(err) = coordinator.checkpoint() {
                    tracing::error!(session = %session_id, %err, "checkpoint failed");
                }
            }
            _ = sleep_until(grace_deadline) => {
                let Some(map) = sessions.upgrade() else {
                    if let Err(err) = coordinator.close() {
                        tracing::error!(session = %session_id, %err, "final checkpoint failed");
                    }
                    break;
                };
                let mut live = map.write().await;
                if !commands.is_empty() {
                    // Someone raced the grace expiry; handle them first.
                    drop(live);
                    continue;
                }
                let closed = match coordinator.state() {
                    SessionState::Empty => Ok(true),
                    _ => coordinator.close(),
                };
                match closed {
                    Ok(true) => {
                        live.remove(&session_id);
                        break;
                    }
                    Ok(false) => grace_deadline = None,
                    Err(err) => {
                        tracing::error!(session = %session_id, %err, "final checkpoint failed, retrying after grace period");
                        grace_deadline = Some(Instant::now() + grace);
                    }
                }
            }
        }
    }
    tracing::debug!(session = %session_id, "session actor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::UserId;
    use crate::message::Envelope;
    use crate::operation::{Operation, TextOperation};
    use crate::store::{MemoryDocumentStore, StoreError, StoreResult, StoredDocument};
    use std::time::Duration;

    struct UnavailableStore;

    impl DocumentStore for UnavailableStore {
        fn load(&self, _: &SessionId) -> StoreResult<Option<StoredDocument>> {
            Err(StoreError::Io("disk unavailable".to_string()))
        }

        fn save(&self, _: &StoredDocument) -> StoreResult<()> {
            Err(StoreError::Io("disk unavailable".to_string()))
        }

        fn delete(&self, _: &SessionId) -> StoreResult<()> {
            Ok(())
        }

        fn list(&self) -> StoreResult<Vec<SessionId>> {
            Ok(Vec::new())
        }
    }

    fn registry(store: Arc<dyn DocumentStore>) -> SessionRegistry {
        let config = SessionConfig {
            grace_period_ms: 1_000,
            checkpoint_interval_ms: 10_000,
            ..SessionConfig::default()
        };
        SessionRegistry::new(store, config)
    }

    async fn join(
        registry: &SessionRegistry,
        name: &str,
    ) -> (SessionHandle, ConnectionId, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = ConnectionId::next();
        let handle = registry
            .join(
                SessionId::new("room"),
                connection_id,
                ClientId::new(name),
                Identity::new(UserId::new(name), name),
                tx,
            )
            .await
            .unwrap();
        (handle, connection_id, rx)
    }

    fn insert(client: &str, text: &str) -> Operation {
        let mut ops = TextOperation::new();
        ops.insert(text);
        Operation::new(ClientId::new(client), UserId::new(client), 0, ops)
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_closes_after_grace_period() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(store.clone());
        let (handle, conn, mut rx) = join(&registry, "alice").await;

        handle.send_message(conn, Message::submit(insert("alice", "hello"))).unwrap();
        let ack = rx.recv().await.unwrap();
        assert!(matches!(ack.message, Message::Ack(_)));

        handle.leave(conn).unwrap();
        assert_eq!(handle.stats().await.unwrap().state, SessionState::Draining);
        assert_eq!(registry.session_count().await, 1);

        time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(registry.session_count().await, 0);
        let stored = store.load(&SessionId::new("room")).unwrap().unwrap();
        assert_eq!(stored.content, "hello");
        assert_eq!(stored.version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_during_grace_keeps_document() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(store.clone());
        let (handle, conn, mut rx) = join(&registry, "alice").await;
        handle.send_message(conn, Message::submit(insert("alice", "kept"))).unwrap();
        rx.recv().await.unwrap();
        handle.leave(conn).unwrap();

        time::sleep(Duration::from_millis(500)).await;
        let (handle, _conn, _rx) = join(&registry, "bob").await;
        time::sleep(Duration::from_millis(1_000)).await;

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.state, SessionState::Active);
        assert_eq!(stats.version, Some(1));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reactivation_loads_checkpoint() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(store.clone());
        let (handle, conn, mut rx) = join(&registry, "alice").await;
        handle.send_message(conn, Message::submit(insert("alice", "abc"))).unwrap();
        rx.recv().await.unwrap();
        handle.leave(conn).unwrap();
        time::sleep(Duration::from_millis(1_100)).await;
        assert_eq!(registry.session_count().await, 0);

        let (handle, _conn, _rx) = join(&registry, "bob").await;
        assert_eq!(handle.stats().await.unwrap().version, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_checkpoint() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(store.clone());
        let (handle, conn, mut rx) = join(&registry, "alice").await;
        handle.send_message(conn, Message::submit(insert("alice", "x"))).unwrap();
        rx.recv().await.unwrap();
        assert!(store.is_empty());

        time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_checkpoints_all_sessions() {
        let store = Arc::new(MemoryDocumentStore::new());
        let registry = registry(store.clone());
        let (handle, conn, mut rx) = join(&registry, "alice").await;
        handle.send_message(conn, Message::submit(insert("alice", "bye"))).unwrap();
        rx.recv().await.unwrap();

        assert!(registry.shutdown().await.is_empty());
        assert_eq!(registry.session_count().await, 0);
        assert_eq!(store.load(&SessionId::new("room")).unwrap().unwrap().content, "bye");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_first_join_removes_session() {
        let registry = registry(Arc::new(UnavailableStore));
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = registry
            .join(
                SessionId::new("room"),
                ConnectionId::next(),
                ClientId::new("alice"),
                Identity::new(UserId::new("alice"), "alice"),
                tx,
            )
            .await;
        assert!(matches!(result, Err(CollabError::Storage(_))));

        time::sleep(Duration::from_millis(10)).await;
        assert_eq!(registry.session_count().await, 0);
    }
}
