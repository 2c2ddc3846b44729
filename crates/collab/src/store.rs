//! Document persistence for session checkpoints.
//!
//! A session loads its document when it becomes active and writes
//! checkpoints while it runs and once more when it shuts down. Only the
//! content and version are stored: the operation history is in-memory and
//! starts empty after a load, so clients older than the checkpoint resync
//! from a snapshot.

use crate::document::AppliedMark;
use crate::ids::{ClientId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

/// A persisted document state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredDocument {
    pub session_id: SessionId,
    pub content: String,
    pub version: u64,
    pub saved_at: DateTime<Utc>,
    /// Last operation accepted per client, for deduplication after reload.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub applied: HashMap<ClientId, AppliedMark>,
}

impl StoredDocument {
    pub fn new(session_id: SessionId, content: impl Into<String>, version: u64) -> Self {
        Self {
            session_id,
            content: content.into(),
            version,
            saved_at: Utc::now(),
            applied: HashMap::new(),
        }
    }

    pub fn with_applied(mut self, applied: HashMap<ClientId, AppliedMark>) -> Self {
        self.applied = applied;
        self
    }

    /// Starting point for a session nothing was ever stored for.
    pub fn empty(session_id: SessionId) -> Self {
        Self::new(session_id, String::new(), 0)
    }
}

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A lock was poisoned or some other internal invariant broke.
    #[error("Internal storage error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Result type for storage operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Trait for document storage backends.
///
/// Methods take `&self`; implementations use interior mutability and must be
/// safe to share between session actors.
pub trait DocumentStore: Send + Sync {
    /// Load the latest checkpoint, or `None` if the session was never stored.
    fn load(&self, session_id: &SessionId) -> StoreResult<Option<StoredDocument>>;

    /// Persist a checkpoint, replacing any earlier one.
    fn save(&self, document: &StoredDocument) -> StoreResult<()>;

    fn delete(&self, session_id: &SessionId) -> StoreResult<()>;

    fn list(&self) -> StoreResult<Vec<SessionId>>;

    /// Load, or fall back to an empty document.
    fn load_or_empty(&self, session_id: &SessionId) -> StoreResult<StoredDocument> {
        Ok(self
            .load(session_id)?
            .unwrap_or_else(|| StoredDocument::empty(session_id.clone())))
    }
}

/// In-memory implementation of [`DocumentStore`], for development and tests.
#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<SessionId, StoredDocument>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.documents.read().map(|docs| docs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::Internal("store lock poisoned".to_string())
}

impl DocumentStore for MemoryDocumentStore {
    fn load(&self, session_id: &SessionId) -> StoreResult<Option<StoredDocument>> {
        let documents = self.documents.read().map_err(poisoned)?;
        Ok(documents.get(session_id).cloned())
    }

    fn save(&self, document: &StoredDocument) -> StoreResult<()> {
        let mut documents = self.documents.write().map_err(poisoned)?;
        documents.insert(document.session_id.clone(), document.clone());
        Ok(())
    }

    fn delete(&self, session_id: &SessionId) -> StoreResult<()> {
        let mut documents = self.documents.write().map_err(poisoned)?;
        documents.remove(session_id);
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<SessionId>> {
        let documents = self.documents.read().map_err(poisoned)?;
        let mut ids: Vec<SessionId> = documents.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// File-based implementation of [`DocumentStore`].
///
/// Each session is one pretty-printed JSON file under the base directory.
/// Writes go to a temporary file first and are renamed into place, so a
/// crash never leaves a half-written checkpoint behind.
#[derive(Debug)]
pub struct FileDocumentStore {
    base_path: PathBuf,
    write_lock: RwLock<()>,
}

const EXTENSION: &str = "json";

impl FileDocumentStore {
    /// Create a store rooted at `base_path`, creating the directory if needed.
    pub fn new(base_path: impl AsRef<Path>) -> StoreResult<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            write_lock: RwLock::new(()),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn document_path(&self, session_id: &SessionId) -> PathBuf {
        self.base_path
            .join(format!("{}.{EXTENSION}", encode_file_name(session_id.as_str())))
    }
}

/// Session ids are arbitrary strings; keep file names portable.
fn encode_file_name(id: &str) -> String {
    let mut name = String::with_capacity(id.len());
    for byte in id.bytes() {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'_' => name.push(byte as char),
            other => name.push_str(&format!("%{other:02X}")),
        }
    }
    name
}

impl DocumentStore for FileDocumentStore {
    fn load(&self, session_id: &SessionId) -> StoreResult<Option<StoredDocument>> {
        let _guard = self.write_lock.read().map_err(poisoned)?;
        let path = self.document_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let reader = BufReader::new(File::open(&path)?);
        Ok(Some(serde_json::from_reader(reader)?))
    }

    fn save(&self, document: &StoredDocument) -> StoreResult<()> {
        let _guard = self.write_lock.write().map_err(poisoned)?;
        let path = self.document_path(&document.session_id);
        let temp_path = path.with_extension("json.tmp");

        {
            let file = File::create(&temp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer_pretty(&mut writer, document)?;
            writer.flush()?;
        }
        fs::rename(temp_path, path)?;
        Ok(())
    }

    fn delete(&self, session_id: &SessionId) -> StoreResult<()> {
        let _guard = self.write_lock.write().map_err(poisoned)?;
        let path = self.document_path(session_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<SessionId>> {
        let _guard = self.write_lock.read().map_err(poisoned)?;
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.base_path)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let reader = BufReader::new(File::open(&path)?);
            let document: StoredDocument = serde_json::from_reader(reader)?;
            ids.push(document.session_id);
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &dyn DocumentStore) {
        let id = SessionId::new("room/1");
        assert!(store.load(&id).unwrap().is_none());
        assert_eq!(store.load_or_empty(&id).unwrap().version, 0);

        store.save(&StoredDocument::new(id.clone(), "fn main() {}", 12)).unwrap();
        let loaded = store.load(&id).unwrap().unwrap();
        assert_eq!(loaded.content, "fn main() {}");
        assert_eq!(loaded.version, 12);

        store.save(&StoredDocument::new(id.clone(), "fn main() { }", 13)).unwrap();
        assert_eq!(store.load(&id).unwrap().unwrap().version, 13);
        assert_eq!(store.list().unwrap(), vec![id.clone()]);

        store.delete(&id).unwrap();
        assert!(store.load(&id).unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryDocumentStore::new();
        exercise(&store);
        assert!(store.is_empty());
    }

    #[test]
    fn test_file_store() {
        let dir = TempDir::new().unwrap();
        let store = FileDocumentStore::new(dir.path()).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let id = SessionId::new("persist");
        FileDocumentStore::new(dir.path())
            .unwrap()
            .save(&StoredDocument::new(id.clone(), "kept", 3))
            .unwrap();

        let reopened = FileDocumentStore::new(dir.path()).unwrap();
        assert_eq!(reopened.load(&id).unwrap().unwrap().content, "kept");
    }

    #[test]
    fn test_file_names_are_encoded() {
        assert_eq!(encode_file_name("a/b c"), "a%2Fb%20c");
        assert_eq!(encode_file_name("plain-id_1"), "plain-id_1");
    }
}
