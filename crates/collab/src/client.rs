//! WebSocket client runtime.
//!
//! Runs a [`SyncEngine`] on a background task: connects to the server,
//! forwards frames both ways, drives the engine's timers, sends presence
//! heartbeats and reconnects with jittered exponential backoff when the
//! connection drops. Local edits keep working while offline and are
//! replayed on the next connection.

use crate::editor::{Editor, EditorChange};
use crate::error::{CollabError, CollabResult};
use crate::ids::SessionId;
use crate::message::{Envelope, Message};
use crate::presence::Selection;
use crate::sync::{ensure_session, SyncEngine, SyncState};
use crate::timer::TimerHandle;
use futures_util::{Sink, SinkExt, StreamExt};
use std::future::Future;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message as Frame};

type Inspect<E> = Box<dyn FnOnce(&mut SyncEngine<E>) + Send>;

enum Command<E: Editor> {
    Edit(EditorChange, oneshot::Sender<CollabResult<()>>),
    Selection(Selection),
    Undo(oneshot::Sender<CollabResult<bool>>),
    Redo(oneshot::Sender<CollabResult<bool>>),
    Flush,
    Inspect(Inspect<E>),
    Shutdown,
}

enum Exit {
    Disconnected,
    Shutdown,
}

/// Handle to a running client. Dropping it stops the client.
pub struct ClientHandle<E: Editor + 'static> {
    commands: mpsc::UnboundedSender<Command<E>>,
    task: Option<JoinHandle<SyncEngine<E>>>,
}

impl<E: Editor + 'static> ClientHandle<E> {
    /// Start the runtime for `engine` against the server at `url`.
    pub fn spawn(url: impl Into<String>, engine: SyncEngine<E>) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(url.into(), engine, rx));
        Self {
            commands,
            task: Some(task),
        }
    }

    fn send(&self, command: Command<E>) -> CollabResult<()> {
        self.commands
            .send(command)
            .map_err(|_| CollabError::Transport("client stopped".to_string()))
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<CollabResult<T>>) -> Command<E>) -> CollabResult<T> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply))?;
        rx.await
            .map_err(|_| CollabError::Transport("client stopped".to_string()))?
    }

    /// Apply an edit to the editor and queue it for the server.
    pub async fn edit(&self, change: EditorChange) -> CollabResult<()> {
        self.request(|reply| Command::Edit(change, reply)).await
    }

    pub fn set_selection(&self, selection: Selection) -> CollabResult<()> {
        self.send(Command::Selection(selection))
    }

    pub async fn undo(&self) -> CollabResult<bool> {
        self.request(Command::Undo).await
    }

    pub async fn redo(&self) -> CollabResult<bool> {
        self.request(Command::Redo).await
    }

    /// Send buffered edits now instead of waiting for the debounce window.
    pub fn flush(&self) -> CollabResult<()> {
        self.send(Command::Flush)
    }

    /// Run `f` against the engine on its own task and return the result.
    pub async fn with_engine<R, F>(&self, f: F) -> CollabResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut SyncEngine<E>) -> R + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Inspect(Box::new(move |engine| {
            let _ = reply.send(f(engine));
        })))?;
        rx.await
            .map_err(|_| CollabError::Transport("client stopped".to_string()))
    }

    pub async fn document(&self) -> CollabResult<String> {
        self.with_engine(|engine| engine.document().to_string()).await
    }

    pub async fn state(&self) -> CollabResult<SyncState> {
        self.with_engine(|engine| engine.save_state()).await
    }

    /// Close the connection and hand back the engine with any unsent work.
    pub async fn shutdown(mut self) -> CollabResult<SyncEngine<E>> {
        let _ = self.commands.send(Command::Shutdown);
        let task = self
            .task
            .take()
            .ok_or_else(|| CollabError::Transport("client already stopped".to_string()))?;
        task.await
            .map_err(|err| CollabError::Transport(err.to_string()))
    }
}

impl<E: Editor + 'static> Drop for ClientHandle<E> {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn apply_command<E: Editor>(engine: &mut SyncEngine<E>, command: Command<E>) -> Vec<Message> {
    let now = Instant::now();
    match command {
        Command::Edit(change, reply) => {
            let result = change
                .to_operation(crate::operation::char_len(engine.document()))
                .and_then(|op| {
                    engine.editor_mut().apply_operation(&op)?;
                    engine.local_operation(op, now)
                });
            let _ = reply.send(result);
            Vec::new()
        }
        Command::Selection(selection) => engine.set_selection(selection).into_iter().collect(),
        Command::Undo(reply) => {
            let _ = reply.send(engine.undo(now));
            Vec::new()
        }
        Command::Redo(reply) => {
            let _ = reply.send(engine.redo(now));
            Vec::new()
        }
        Command::Flush => engine.flush().into_iter().collect(),
        Command::Inspect(f) => {
            f(engine);
            Vec::new()
        }
        Command::Shutdown => Vec::new(),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn send_all<S>(sink: &mut S, session_id: &SessionId, messages: Vec<Message>) -> CollabResult<()>
where
    S: Sink<Frame> + Unpin,
    S::Error: std::fmt::Display,
{
    for message in messages {
        let json = Envelope::new(session_id.clone(), message).to_json()?;
        sink.send(Frame::Text(json))
            .await
            .map_err(|e| CollabError::Transport(e.to_string()))?;
    }
    Ok(())
}

async fn run<E: Editor + 'static>(
    url: String,
    mut engine: SyncEngine<E>,
    mut commands: mpsc::UnboundedReceiver<Command<E>>,
) -> SyncEngine<E> {
    let mut backoff = engine.config().backoff();
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => {
                tracing::info!(session = %engine.session_id(), %url, "connected");
                backoff.reset();
                let exit = drive(&mut engine, ws_stream, &mut commands).await;
                engine.on_disconnected();
                if let Exit::Shutdown = exit {
                    return engine;
                }
            }
            Err(err) => {
                tracing::warn!(session = %engine.session_id(), %url, attempt = backoff.attempt(), %err, "connect failed");
            }
        }

        engine.on_reconnecting();
        let delay = backoff.next_delay();
        tracing::debug!(session = %engine.session_id(), ?delay, "reconnecting after delay");
        if let Exit::Shutdown = wait_offline(&mut engine, &mut commands, time::sleep(delay)).await {
            return engine;
        }
    }
}

/// Keep serving local commands while waiting to reconnect.
async fn wait_offline<E: Editor>(
    engine: &mut SyncEngine<E>,
    commands: &mut mpsc::UnboundedReceiver<Command<E>>,
    delay: impl Future<Output = ()>,
) -> Exit {
    tokio::pin!(delay);
    loop {
        tokio::select! {
            _ = &mut delay => return Exit::Disconnected,
            command = commands.recv() => match command {
                None | Some(Command::Shutdown) => return Exit::Shutdown,
                // Nothing goes out while offline.
                Some(command) => { apply_command(engine, command); }
            },
            _ = sleep_until(engine.next_deadline()) => {
                engine.poll(Instant::now());
            }
        }
    }
}

async fn drive<E, S>(
    engine: &mut SyncEngine<E>,
    ws_stream: S,
    commands: &mut mpsc::UnboundedReceiver<Command<E>>,
) -> Exit
where
    E: Editor,
    S: futures_util::Stream<Item = Result<Frame, tokio_tungstenite::tungstenite::Error>>
        + Sink<Frame, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let session_id = engine.session_id().clone();
    let (mut sink, mut stream) = ws_stream.split();

    if let Err(err) = send_all(&mut sink, &session_id, engine.on_connected()).await {
        tracing::warn!(session = %session_id, %err, "join failed");
        return Exit::Disconnected;
    }

    let (tick_tx, mut ticks) = mpsc::unbounded_channel();
    let _heartbeat = TimerHandle::every(engine.config().heartbeat(), move || {
        let _ = tick_tx.send(());
    });

    loop {
        let outgoing = tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Frame::Text(text))) => match Envelope::from_json(&text) {
                    Ok(envelope) => match ensure_session(&session_id, &envelope.session_id) {
                        Ok(()) => engine.handle_message(envelope.message, Instant::now()),
                        Err(err) => {
                            tracing::warn!(%err, "message for another session dropped");
                            Vec::new()
                        }
                    },
                    Err(err) => {
                        tracing::warn!(session = %session_id, %err, "undecodable frame dropped");
                        Vec::new()
                    }
                },
                Some(Ok(Frame::Close(_))) | None => {
                    tracing::info!(session = %session_id, "server closed the connection");
                    return Exit::Disconnected;
                }
                Some(Ok(_)) => Vec::new(),
                Some(Err(err)) => {
                    tracing::warn!(session = %session_id, %err, "connection lost");
                    return Exit::Disconnected;
                }
            },
            command = commands.recv() => match command {
                None | Some(Command::Shutdown) => {
                    let _ = send_all(&mut sink, &session_id, engine.flush().into_iter().collect()).await;
                    let _ = sink.close().await;
                    return Exit::Shutdown;
                }
                Some(command) => apply_command(engine, command),
            },
            Some(()) = ticks.recv() => engine.presence_message().into_iter().collect(),
            _ = sleep_until(engine.next_deadline()) => engine.poll(Instant::now()),
        };

        if let Err(err) = send_all(&mut sink, &session_id, outgoing).await {
            tracing::warn!(session = %session_id, %err, "send failed");
            return Exit::Disconnected;
        }
    }
}
