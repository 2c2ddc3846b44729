//! One WebSocket connection on the server side.
//!
//! A connection is idle until it sends `user-join`; after that every frame
//! addressed to the joined session is forwarded to the session actor, and
//! everything the actor sends to the connection's outbox is written back as
//! a text frame.

use super::identity::IdentityProvider;
use crate::coordinator::Outbox;
use crate::error::{CollabError, ErrorCode};
use crate::ids::{ClientId, ConnectionId, SessionId};
use crate::message::{Envelope, ErrorPayload, Message, UserJoinPayload};
use crate::registry::{SessionHandle, SessionRegistry};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{accept_async, tungstenite::Message as Frame};

/// Decrements the live connection count when the connection task ends.
pub(crate) struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    pub(crate) fn new(count: Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        Self(count)
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Connection<P> {
    id: ConnectionId,
    registry: Arc<SessionRegistry>,
    provider: Arc<P>,
    outbox: Outbox,
    session: Option<SessionHandle>,
}

impl<P: IdentityProvider> Connection<P> {
    fn reply(&self, session_id: SessionId, message: Message) {
        let _ = self.outbox.send(Envelope::new(session_id, message));
    }

    async fn on_text(&mut self, text: &str) {
        let envelope = match Envelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(connection = %self.id, %err, "undecodable frame");
                let session_id = self
                    .session
                    .as_ref()
                    .map(|h| h.session_id().clone())
                    .unwrap_or_else(|| SessionId::new(""));
                self.reply(session_id, Message::error(ErrorCode::InvalidMessage, err.to_string()));
                return;
            }
        };

        let Some(handle) = self.session.clone() else {
            match envelope.message {
                Message::UserJoin(join) => self.join(envelope.session_id, join).await,
                _ => self.reply(
                    envelope.session_id,
                    Message::error(ErrorCode::NotJoined, "send user-join first"),
                ),
            }
            return;
        };

        if handle.session_id() != &envelope.session_id {
            self.reply(
                envelope.session_id,
                Message::error(ErrorCode::NotJoined, "connection is joined to another session"),
            );
            return;
        }
        if let Err(err) = handle.send_message(self.id, envelope.message) {
            tracing::warn!(connection = %self.id, %err, "session went away");
            self.session = None;
            self.reply(envelope.session_id, Message::Error(ErrorPayload::from_error(&err, None)));
        }
    }

    async fn join(&mut self, session_id: SessionId, join: UserJoinPayload) {
        let identity = match self.provider.resolve(&join).await {
            Ok(identity) => identity,
            Err(reason) => {
                tracing::warn!(connection = %self.id, user = %join.user_id, %reason, "identity refused");
                self.reply(session_id, Message::error(ErrorCode::NotJoined, reason));
                return;
            }
        };
        let client_id = join.client_id.clone().unwrap_or_else(ClientId::generate);

        match self
            .registry
            .join(session_id.clone(), self.id, client_id, identity, self.outbox.clone())
            .await
        {
            Ok(handle) => {
                tracing::info!(connection = %self.id, session = %session_id, "connection joined session");
                self.session = Some(handle);
            }
            // The coordinator already told the client.
            Err(CollabError::SessionFull { .. }) => {}
            Err(err) => {
                tracing::warn!(connection = %self.id, session = %session_id, %err, "join failed");
                self.reply(session_id, Message::Error(ErrorPayload::from_error(&err, None)));
            }
        }
    }

    fn close(self) {
        if let Some(handle) = self.session {
            let _ = handle.leave(self.id);
        }
    }
}

/// Run a connection to completion.
pub(crate) async fn serve_connection<P: IdentityProvider + 'static>(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    provider: Arc<P>,
    mut shutdown: broadcast::Receiver<()>,
    _guard: ConnectionGuard,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            tracing::error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    let (outbox, mut outgoing_rx) = mpsc::unbounded_channel::<Envelope>();

    let id = ConnectionId::next();
    tracing::debug!(connection = %id, %addr, "connection opened");

    let outgoing = tokio::spawn(async move {
        while let Some(envelope) = outgoing_rx.recv().await {
            match envelope.to_json() {
                Ok(json) => {
                    if ws_tx.send(Frame::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(e) => tracing::error!("Failed to serialize message: {}", e),
            }
        }
        let _ = ws_tx.close().await;
    });

    let mut connection = Connection {
        id,
        registry,
        provider,
        outbox,
        session: None,
    };

    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Frame::Text(text))) => connection.on_text(&text).await,
                Some(Ok(Frame::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(connection = %id, "WebSocket error: {}", e);
                    break;
                }
            },
            _ = shutdown.recv() => {
                tracing::debug!(connection = %id, "closing for shutdown");
                break;
            }
        }
    }

    connection.close();
    outgoing.abort();
    tracing::debug!(connection = %id, %addr, "connection closed");
}
