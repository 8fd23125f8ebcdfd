//! Persisted per-project index of last-successful-sync timestamps.
//!
//! Lives at `<project>/.baboon/index`. Per the Open Questions in section 9,
//! this implementation protects the in-memory map with its own mutex
//! rather than relying on the watcher's XMPP event loop to serialise
//! writes, so any thread can update it as soon as a sync batch completes.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::{BaboonError, Result};

const INDEX_RELATIVE_PATH: &str = ".baboon/index";

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    entries: HashMap<String, u64>,
}

/// Maps project-relative path to last-successful-sync timestamp (unix
/// seconds). Opened once per watched project and flushed on every
/// successful sync batch and on shutdown.
pub struct Index {
    project_path: PathBuf,
    entries: Mutex<HashMap<String, u64>>,
}

impl Index {
    fn index_path(project_path: &Path) -> PathBuf {
        project_path.join(INDEX_RELATIVE_PATH)
    }

    /// Creates an empty index file for a freshly-initialized project.
    pub fn init(project_path: &Path) -> Result<Self> {
        let index = Self {
            project_path: project_path.to_path_buf(),
            entries: Mutex::new(HashMap::new()),
        };
        index.flush()?;
        Ok(index)
    }

    /// Opens an existing index, or starts empty if none exists yet (first
    /// startup against a project that was manually placed rather than
    /// created with `init`).
    pub fn open(project_path: &Path) -> Result<Self> {
        let path = Self::index_path(project_path);
        let entries = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let parsed: IndexFile = serde_json::from_str(&raw)
                .map_err(|e| BaboonError::Internal(format!("corrupt index at {}: {e}", path.display())))?;
            parsed.entries
        } else {
            HashMap::new()
        };
        Ok(Self {
            project_path: project_path.to_path_buf(),
            entries: Mutex::new(entries),
        })
    }

    pub fn get(&self, rel_path: &str) -> Option<u64> {
        self.entries.lock().unwrap().get(rel_path).copied()
    }

    pub fn contains(&self, rel_path: &str) -> bool {
        self.entries.lock().unwrap().contains_key(rel_path)
    }

    /// Snapshot of every indexed path, used by startup reconciliation to
    /// find entries whose file has disappeared from the working tree.
    pub fn paths(&self) -> Vec<String> {
        self.entries.lock().unwrap().keys().cloned().collect()
    }

    pub fn set(&self, rel_path: &str, timestamp: u64) {
        self.entries.lock().unwrap().insert(rel_path.to_string(), timestamp);
    }

    pub fn remove(&self, rel_path: &str) {
        self.entries.lock().unwrap().remove(rel_path);
    }

    /// Applies the index mutations implied by one successfully-synced
    /// FileEvent: CREATE/MODIFY set the src path's timestamp; MOVE sets the
    /// dest path's timestamp and removes the src path; DELETE removes the
    /// src path. Entries are never written speculatively — call this only
    /// after the daemon has confirmed the sync.
    pub fn apply_synced_event(&self, event: &crate::event::FileEvent, timestamp: u64) {
        use crate::event::EventKind;
        match event.kind {
            EventKind::Create | EventKind::Modify => self.set(&event.src_path, timestamp),
            EventKind::Move => {
                self.remove(&event.src_path);
                if let Some(dest) = &event.dest_path {
                    self.set(dest, timestamp);
                }
            }
            EventKind::Delete => self.remove(&event.src_path),
        }
    }

    pub fn flush(&self) -> Result<()> {
        let path = Self::index_path(&self.project_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let snapshot = IndexFile {
            entries: self.entries.lock().unwrap().clone(),
        };
        let serialized = serde_json::to_string_pretty(&snapshot)
            .map_err(|e| BaboonError::Internal(format!("failed to serialize index: {e}")))?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serialized)?;
        fs::rename(&tmp_path, &path)?;
        Ok(())
    }

    /// Flushes and drops the index; called on normal shutdown and on the
    /// interrupt path.
    pub fn close(self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn init_creates_empty_index_file() {
        let dir = TempDir::new().unwrap();
        let index = Index::init(dir.path()).unwrap();
        assert!(dir.path().join(INDEX_RELATIVE_PATH).exists());
        assert_eq!(index.get("a.txt"), None);
    }

    #[test]
    fn round_trips_through_flush_and_open() {
        let dir = TempDir::new().unwrap();
        {
            let index = Index::init(dir.path()).unwrap();
            index.set("a.txt", 100);
            index.flush().unwrap();
        }
        let reopened = Index::open(dir.path()).unwrap();
        assert_eq!(reopened.get("a.txt"), Some(100));
    }

    #[test]
    fn apply_synced_event_for_move_relocates_entry() {
        let dir = TempDir::new().unwrap();
        let index = Index::init(dir.path()).unwrap();
        index.set("old.txt", 1);
        let event = crate::event::FileEvent::moved("p", "old.txt", "new.txt");
        index.apply_synced_event(&event, 2);
        assert_eq!(index.get("old.txt"), None);
        assert_eq!(index.get("new.txt"), Some(2));
    }

    #[test]
    fn apply_synced_event_for_delete_removes_entry() {
        let dir = TempDir::new().unwrap();
        let index = Index::init(dir.path()).unwrap();
        index.set("gone.txt", 1);
        let event = crate::event::FileEvent::delete("p", "gone.txt");
        index.apply_synced_event(&event, 2);
        assert_eq!(index.get("gone.txt"), None);
    }

    #[test]
    fn open_without_existing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let index = Index::open(dir.path()).unwrap();
        assert_eq!(index.get("anything"), None);
    }
}
