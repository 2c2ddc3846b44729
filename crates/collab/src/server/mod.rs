//! WebSocket collaboration server.
//!
//! Accepts WebSocket connections, resolves each `user-join` to an identity
//! and hands the connection to the [`SessionRegistry`], whose per-session
//! actors do the actual coordination.
//!
//! # Architecture
//!
//! Each connection runs in its own task with a separate forwarder task for
//! outgoing frames. Sessions run as actors owned by the registry, so a slow
//! connection never blocks a session and a busy session never blocks the
//! accept loop.
//!
//! # Example
//!
//! ```ignore
//! use code_collab::server::{CollaborationServer, ServerConfig};
//! use code_collab::store::MemoryDocumentStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = CollaborationServer::new(ServerConfig::default(), Arc::new(MemoryDocumentStore::new()));
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod identity;

pub use identity::{IdentityProvider, TokenIdentityProvider, TrustedIdentityProvider};

use crate::coordinator::SessionConfig;
use crate::registry::SessionRegistry;
use crate::store::DocumentStore;
use connection::{serve_connection, ConnectionGuard};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

/// Listener settings plus the defaults every session runs with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface the listener binds.
    pub bind_address: String,
    /// TCP port; 0 picks a free one.
    pub port: u16,
    /// Sockets beyond this are closed right after accept.
    pub max_total_connections: usize,
    /// Directory for document checkpoints; in-memory when unset.
    pub storage_dir: Option<PathBuf>,
    pub session: SessionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
            max_total_connections: 1000,
            storage_dir: None,
            session: SessionConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Defaults, listening on `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// `host:port` as passed to bind.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Accept loop in front of a [`SessionRegistry`].
pub struct CollaborationServer<P: IdentityProvider = TrustedIdentityProvider> {
    config: ServerConfig,
    provider: Arc<P>,
    registry: Arc<SessionRegistry>,
    connections: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
}

impl CollaborationServer<TrustedIdentityProvider> {
    /// Create a server that trusts the identity clients claim.
    pub fn new(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        Self::with_identity(config, store, TrustedIdentityProvider)
    }
}

impl<P: IdentityProvider + 'static> CollaborationServer<P> {
    /// Create a server with a custom identity provider.
    pub fn with_identity(config: ServerConfig, store: Arc<dyn DocumentStore>, provider: P) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = SessionRegistry::new(store, config.session.clone());
        Self {
            config,
            provider: Arc::new(provider),
            registry: Arc::new(registry),
            connections: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Bind to the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr.clone(), e))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown, then checkpoint
    /// every live session.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let local = listener.local_addr().map_err(ServerError::Io)?;
        tracing::info!(%local, "listening for collaboration clients");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connections.load(Ordering::SeqCst) >= self.config.max_total_connections {
                                tracing::warn!(%addr, limit = self.config.max_total_connections, "connection limit reached");
                                continue;
                            }
                            let guard = ConnectionGuard::new(Arc::clone(&self.connections));
                            tokio::spawn(serve_connection(
                                stream,
                                addr,
                                Arc::clone(&self.registry),
                                Arc::clone(&self.provider),
                                self.shutdown_tx.subscribe(),
                                guard,
                            ));
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "accept failed");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("stopping accept loop");
                    break;
                }
            }
        }

        let failures = self.registry.shutdown().await;
        if !failures.is_empty() {
            tracing::error!(sessions = failures.len(), "some sessions could not be saved");
        }
        tracing::info!("all sessions checkpointed, server stopped");
        Ok(())
    }

    /// Live connection and session counts.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.connections.load(Ordering::SeqCst),
            total_sessions: self.registry.session_count().await,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerStats {
    /// Open WebSocket connections.
    pub total_connections: usize,
    /// Sessions currently loaded, including draining ones.
    pub total_sessions: usize,
}

/// Stops the accept loop from another task.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

/// Failures that stop the server itself; per-connection errors are only logged.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(String, std::io::Error),

    #[error("I/O error: {0}")]
    Io(std::io::Error),
}
