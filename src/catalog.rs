//! Message and shared-file catalog.
//!
//! The network services only talk to the [`Catalog`] trait. Workers for
//! different connections call it concurrently, so implementations serialize
//! their own read-modify-write operations.
//!
//! [`FileCatalog`] keeps the message history in a JSON file so it survives
//! restarts and is visible to every `lanlink` process using the same data
//! directory. Shared files are registered per process and never written out.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::SharedFile;

/// File name of the message history inside the data directory
pub const CATALOG_FILE: &str = "catalog.json";

/// A chat message as stored locally
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub sender: String,
    pub content: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    #[serde(default)]
    pub deleted: bool,
}

/// A file or folder offered to peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: String,
    pub filename: String,
    pub path: String,
    pub size: u64,
    pub owner: String,
    pub is_folder: bool,
}

impl From<FileRecord> for SharedFile {
    fn from(record: FileRecord) -> Self {
        SharedFile {
            filename: record.filename,
            path: record.path,
            size: record.size,
            is_folder: record.is_folder,
            owner: record.owner,
        }
    }
}

pub trait Catalog: Send + Sync {
    /// Store a locally written message and return its new id
    fn add_message(&self, sender: &str, content: &str) -> String;

    /// Store a message received from a peer. Returns false when the id is
    /// already present, in which case nothing changes.
    fn add_received_message(&self, id: &str, sender: &str, content: &str, timestamp: u64) -> bool;

    /// Replace the content of a message; false if the id is unknown
    fn edit_message(&self, id: &str, content: &str) -> bool;

    /// Soft delete; false if the id is unknown
    fn delete_message(&self, id: &str) -> bool;

    /// The newest `limit` live messages, oldest first
    fn get_messages(&self, limit: usize) -> Vec<StoredMessage>;

    /// Look up one message, deleted or not
    fn message(&self, id: &str) -> Option<StoredMessage>;

    fn add_file(&self, filename: &str, path: &str, size: u64, owner: &str, is_folder: bool) -> String;

    fn get_files(&self) -> Vec<FileRecord>;
}

#[derive(Default)]
struct CatalogState {
    messages: Vec<StoredMessage>,
    index: HashMap<String, usize>,
    files: Vec<FileRecord>,
}

impl CatalogState {
    fn insert(&mut self, message: StoredMessage) -> bool {
        if self.index.contains_key(&message.id) {
            return false;
        }
        self.index.insert(message.id.clone(), self.messages.len());
        self.messages.push(message);
        true
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut StoredMessage> {
        let slot = *self.index.get(id)?;
        self.messages.get_mut(slot)
    }

    fn replace_messages(&mut self, messages: Vec<StoredMessage>) {
        self.messages.clear();
        self.index.clear();
        for message in messages {
            self.insert(message);
        }
    }

    fn add_message(&mut self, sender: &str, content: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.insert(StoredMessage {
            id: id.clone(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp: now_millis(),
            deleted: false,
        });
        id
    }

    fn add_received(&mut self, id: &str, sender: &str, content: &str, timestamp: u64) -> bool {
        self.insert(StoredMessage {
            id: id.to_string(),
            sender: sender.to_string(),
            content: content.to_string(),
            timestamp,
            deleted: false,
        })
    }

    fn edit(&mut self, id: &str, content: &str) -> bool {
        match self.get_mut(id) {
            Some(message) => {
                message.content = content.to_string();
                true
            }
            None => false,
        }
    }

    fn delete(&mut self, id: &str) -> bool {
        match self.get_mut(id) {
            Some(message) => {
                message.deleted = true;
                true
            }
            None => false,
        }
    }

    fn live_messages(&self, limit: usize) -> Vec<StoredMessage> {
        let mut live: Vec<StoredMessage> = self
            .messages
            .iter()
            .filter(|m| !m.deleted)
            .cloned()
            .collect();
        // stable: equal timestamps keep arrival order
        live.sort_by_key(|m| m.timestamp);
        let skip = live.len().saturating_sub(limit);
        live.split_off(skip)
    }

    fn message(&self, id: &str) -> Option<StoredMessage> {
        self.index.get(id).map(|&slot| self.messages[slot].clone())
    }

    fn add_file(&mut self, filename: &str, path: &str, size: u64, owner: &str, is_folder: bool) -> String {
        let id = Uuid::new_v4().to_string();
        self.files.push(FileRecord {
            id: id.clone(),
            filename: filename.to_string(),
            path: path.to_string(),
            size,
            owner: owner.to_string(),
            is_folder,
        });
        id
    }
}

/// In-process catalog guarded by a single mutex
#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CatalogState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Catalog for MemoryCatalog {
    fn add_message(&self, sender: &str, content: &str) -> String {
        self.lock().add_message(sender, content)
    }

    fn add_received_message(&self, id: &str, sender: &str, content: &str, timestamp: u64) -> bool {
        self.lock().add_received(id, sender, content, timestamp)
    }

    fn edit_message(&self, id: &str, content: &str) -> bool {
        self.lock().edit(id, content)
    }

    fn delete_message(&self, id: &str) -> bool {
        self.lock().delete(id)
    }

    fn get_messages(&self, limit: usize) -> Vec<StoredMessage> {
        self.lock().live_messages(limit)
    }

    fn message(&self, id: &str) -> Option<StoredMessage> {
        self.lock().message(id)
    }

    fn add_file(&self, filename: &str, path: &str, size: u64, owner: &str, is_folder: bool) -> String {
        self.lock().add_file(filename, path, size, owner, is_folder)
    }

    fn get_files(&self) -> Vec<FileRecord> {
        self.lock().files.clone()
    }
}

/// On-disk layout of [`FileCatalog`]
#[derive(Serialize, Deserialize, Default)]
struct Snapshot {
    #[serde(default)]
    messages: Vec<StoredMessage>,
}

/// Catalog whose message history lives in a JSON file.
///
/// Every operation first picks up changes other processes made to the file;
/// every change rewrites it. A failed write is logged, and the change then
/// lasts only until the file is next read.
pub struct FileCatalog {
    path: PathBuf,
    state: Mutex<CatalogState>,
}

impl FileCatalog {
    /// Open the history at `path`, creating its directory if needed. A file
    /// that cannot be parsed is ignored and replaced by the next write.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create catalog directory {:?}", parent))?;
        }

        let mut state = CatalogState::default();
        match read_snapshot(&path) {
            Ok(Some(snapshot)) => state.replace_messages(snapshot.messages),
            Ok(None) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!("Catalog {:?} is corrupt, starting empty: {}", path, e);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read catalog {:?}", path))
            }
        }
        debug!("Opened catalog {:?} with {} message(s)", path, state.messages.len());

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lock the state after refreshing it from disk
    fn lock(&self) -> MutexGuard<'_, CatalogState> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match read_snapshot(&self.path) {
            Ok(Some(snapshot)) => state.replace_messages(snapshot.messages),
            Ok(None) => {}
            Err(e) => warn!("Keeping cached catalog, cannot reload {:?}: {}", self.path, e),
        }
        state
    }

    fn persist(&self, state: &CatalogState) {
        let snapshot = Snapshot {
            messages: state.messages.clone(),
        };
        if let Err(e) = write_snapshot(&self.path, &snapshot) {
            warn!("Failed to save catalog {:?}: {}", self.path, e);
        }
    }
}

impl Catalog for FileCatalog {
    fn add_message(&self, sender: &str, content: &str) -> String {
        let mut state = self.lock();
        let id = state.add_message(sender, content);
        self.persist(&state);
        id
    }

    fn add_received_message(&self, id: &str, sender: &str, content: &str, timestamp: u64) -> bool {
        let mut state = self.lock();
        let added = state.add_received(id, sender, content, timestamp);
        if added {
            self.persist(&state);
        }
        added
    }

    fn edit_message(&self, id: &str, content: &str) -> bool {
        let mut state = self.lock();
        let edited = state.edit(id, content);
        if edited {
            self.persist(&state);
        }
        edited
    }

    fn delete_message(&self, id: &str) -> bool {
        let mut state = self.lock();
        let deleted = state.delete(id);
        if deleted {
            self.persist(&state);
        }
        deleted
    }

    fn get_messages(&self, limit: usize) -> Vec<StoredMessage> {
        self.lock().live_messages(limit)
    }

    fn message(&self, id: &str) -> Option<StoredMessage> {
        self.lock().message(id)
    }

    fn add_file(&self, filename: &str, path: &str, size: u64, owner: &str, is_folder: bool) -> String {
        self.lock().add_file(filename, path, size, owner, is_folder)
    }

    fn get_files(&self) -> Vec<FileRecord> {
        self.lock().files.clone()
    }
}

/// `Ok(None)` when the file does not exist yet
fn read_snapshot(path: &Path) -> io::Result<Option<Snapshot>> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let snapshot = serde_json::from_slice(&raw)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(snapshot))
}

/// Write to a sibling temp file, then rename over the real one
fn write_snapshot(path: &Path, snapshot: &Snapshot) -> io::Result<()> {
    let raw = serde_json::to_vec_pretty(snapshot)?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, raw)?;
    fs::rename(&staging, path)
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    #[test]
    fn test_received_message_is_idempotent() {
        let catalog = MemoryCatalog::new();
        assert!(catalog.add_received_message("m1", "A", "hi", 10));
        assert!(!catalog.add_received_message("m1", "A", "changed", 20));

        let messages = catalog.get_messages(50);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hi");
    }

    #[test]
    fn test_edit_and_delete_unknown_id_are_noops() {
        let catalog = MemoryCatalog::new();
        assert!(!catalog.edit_message("ghost", "boo"));
        assert!(!catalog.delete_message("ghost"));
        assert!(catalog.get_messages(10).is_empty());
    }

    #[test]
    fn test_soft_delete_hides_but_keeps_row() {
        let catalog = MemoryCatalog::new();
        let id = catalog.add_message("me", "oops");
        assert!(catalog.delete_message(&id));

        assert!(catalog.get_messages(10).is_empty());
        let row = catalog.message(&id).unwrap();
        assert!(row.deleted);
        assert_eq!(row.content, "oops");
    }

    #[test]
    fn test_get_messages_returns_newest_ascending() {
        let catalog = MemoryCatalog::new();
        catalog.add_received_message("c", "x", "third", 300);
        catalog.add_received_message("a", "x", "first", 100);
        catalog.add_received_message("b", "x", "second", 200);

        let contents: Vec<String> = catalog
            .get_messages(2)
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["second", "third"]);
    }

    #[test]
    fn test_files_round_trip_into_shared_rows() {
        let catalog = MemoryCatalog::new();
        catalog.add_file("report.pdf", "/srv/report.pdf", 42, "127.0.0.1", false);
        catalog.add_file("photos", "/srv/photos", 0, "127.0.0.1", true);

        let shared: Vec<SharedFile> = catalog.get_files().into_iter().map(Into::into).collect();
        assert_eq!(shared.len(), 2);
        assert_eq!(shared[0].filename, "report.pdf");
        assert!(shared[1].is_folder);
    }

    #[test]
    fn test_concurrent_writers() {
        let catalog = Arc::new(MemoryCatalog::new());
        let workers: Vec<_> = (0..10)
            .map(|n| {
                let catalog = Arc::clone(&catalog);
                thread::spawn(move || {
                    let name = format!("Thread-{}", n);
                    for i in 0..50 {
                        let id = catalog.add_message(&name, &format!("Message {} from {}", i, name));
                        catalog.get_messages(10);
                        catalog.edit_message(&id, &format!("Edited {} by {}", i, name));
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        let messages = catalog.get_messages(1000);
        assert_eq!(messages.len(), 500);
        assert!(messages.iter().all(|m| m.content.starts_with("Edited")));
    }

    #[test]
    fn test_file_catalog_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data").join(CATALOG_FILE);

        let id = {
            let catalog = FileCatalog::open(&path).unwrap();
            let id = catalog.add_message("me", "first draft");
            assert!(catalog.edit_message(&id, "final"));
            assert!(catalog.add_received_message("p1", "Bob", "hey", 1));
            assert!(catalog.add_received_message("p2", "Bob", "gone", 2));
            assert!(catalog.delete_message("p2"));
            catalog.add_file("a.txt", "/srv/a.txt", 1, "me", false);
            id
        };

        let reopened = FileCatalog::open(&path).unwrap();
        let messages = reopened.get_messages(10);
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hey", "final"]);
        assert_eq!(reopened.message(&id).unwrap().sender, "me");
        assert!(reopened.message("p2").unwrap().deleted);
        assert!(!reopened.add_received_message("p1", "Bob", "again", 3));
        // shares belong to the process that registered them
        assert!(reopened.get_files().is_empty());
    }

    #[test]
    fn test_file_catalog_sees_other_writers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CATALOG_FILE);
        let node = FileCatalog::open(&path).unwrap();
        let one_shot = FileCatalog::open(&path).unwrap();

        let id = one_shot.add_message("me", "from the cli");
        assert!(node.add_received_message("p1", "Bob", "from the wire", now_millis() + 1));

        let contents: Vec<String> = one_shot
            .get_messages(10)
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, vec!["from the cli", "from the wire"]);
        assert!(node.edit_message(&id, "edited"));
        assert_eq!(one_shot.message(&id).unwrap().content, "edited");
    }

    #[test]
    fn test_corrupt_catalog_starts_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CATALOG_FILE);
        std::fs::write(&path, b"{ not json").unwrap();

        let catalog = FileCatalog::open(&path).unwrap();
        assert!(catalog.get_messages(10).is_empty());

        catalog.add_message("me", "fresh");
        assert_eq!(FileCatalog::open(&path).unwrap().get_messages(10).len(), 1);
    }
}
