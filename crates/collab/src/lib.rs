//! Real-time collaborative code editing over operational transformation.
//!
//! A server-side [`SessionCoordinator`] per shared document assigns a total
//! order to concurrent edits, rebasing each incoming operation over the
//! history it has not seen. Each client runs a [`SyncEngine`] that applies
//! local edits optimistically, keeps unacknowledged work in a pending
//! queue, and transforms incoming remote operations against that queue so
//! every participant converges on the same text.
//!
//! # Modules
//!
//! - `operation`: text operations (retain/insert/delete) with apply, compose,
//!   invert and diff
//! - `transform`: the transform function and index mapping
//! - `document`: authoritative document state with bounded history
//! - `coordinator`: the per-session state machine on the server
//! - `registry`: one actor task per live session, with grace period and
//!   checkpoints
//! - `store`: checkpoint persistence
//! - `sync`: the client sync engine
//! - `presence`: cursors, selections and typing indicators
//! - `message`: the JSON wire protocol
//! - `offline`: connection status and reconnect backoff
//!
//! # Example
//!
//! ```
//! use code_collab::operation::TextOperation;
//! use code_collab::transform::{transform, TieBreak};
//!
//! let mut a = TextOperation::new();
//! a.insert("foo");
//! let mut b = TextOperation::new();
//! b.insert("bar");
//!
//! let (a_prime, b_prime) = transform(&a, &b, TieBreak::FirstAfter).unwrap();
//! let left = b_prime.apply(&a.apply("").unwrap()).unwrap();
//! let right = a_prime.apply(&b.apply("").unwrap()).unwrap();
//! assert_eq!(left, "barfoo");
//! assert_eq!(left, right);
//! ```

pub mod coordinator;
pub mod document;
pub mod editor;
pub mod error;
pub mod ids;
pub mod message;
pub mod observer;
pub mod offline;
pub mod operation;
pub mod presence;
pub mod registry;
pub mod store;
pub mod sync;
pub mod timer;
pub mod transform;
pub mod undo;

/// WebSocket client runtime driving a [`SyncEngine`].
///
/// Only available with the `client` feature.
#[cfg(feature = "client")]
pub mod client;

/// WebSocket collaboration server.
///
/// This module is only available when the `server` feature is enabled.
///
/// # Example
///
/// ```ignore
/// use code_collab::server::{CollaborationServer, ServerConfig};
/// use code_collab::store::MemoryDocumentStore;
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() {
///     let config = ServerConfig::with_port(8080);
///     let server = CollaborationServer::new(config, Arc::new(MemoryDocumentStore::new()));
///     server.run().await.unwrap();
/// }
/// ```
#[cfg(feature = "server")]
pub mod server;

// Re-export commonly used types
pub use coordinator::{SessionConfig, SessionCoordinator, SessionState, SessionStats};
pub use document::{Acceptance, AppliedMark, DocumentState, HistoryEntry};
pub use editor::{Editor, EditorChange, MemoryEditor};
pub use error::{CollabError, CollabResult, ErrorCode};
pub use ids::{ClientId, ConnectionId, OperationId, SessionId, UserId};
pub use message::{Envelope, Message, MessageType};
pub use offline::{Backoff, ConnectionStatus, OfflineStatusInfo};
pub use operation::{Component, Operation, TextOperation};
pub use presence::{Identity, PresenceManager, PresenceState, PresenceTracker, RemoteCursor, Selection};
pub use registry::{SessionHandle, SessionRegistry};
pub use store::{DocumentStore, FileDocumentStore, MemoryDocumentStore, StoredDocument};
pub use sync::{ClientConfig, SyncEngine, SyncEvent, SyncState};
pub use transform::{transform, transform_index, TieBreak};
pub use undo::UndoManager;
