//! File-event model and the per-project pending set.
//!
//! Grounded on `common/file.py`'s `FileEvent`/`pending` pair, generalized
//! from the original's single global dict into an explicit, mutex-guarded
//! `PendingSet` owned by the monitor (see the Design Notes on removing
//! implicit globals).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Create,
    Modify,
    Move,
    Delete,
}

/// A single observed filesystem change, already classified and expressed in
/// project-relative, forward-slash paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEvent {
    pub project: String,
    pub kind: EventKind,
    pub src_path: String,
    pub dest_path: Option<String>,
}

impl FileEvent {
    pub fn create(project: impl Into<String>, src_path: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            kind: EventKind::Create,
            src_path: src_path.into(),
            dest_path: None,
        }
    }

    pub fn modify(project: impl Into<String>, src_path: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            kind: EventKind::Modify,
            src_path: src_path.into(),
            dest_path: None,
        }
    }

    pub fn delete(project: impl Into<String>, src_path: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            kind: EventKind::Delete,
            src_path: src_path.into(),
            dest_path: None,
        }
    }

    /// A MOVE where source equals destination degrades to a MODIFY of the
    /// destination, per the boundary behaviour in section 8.
    pub fn moved(project: impl Into<String>, src_path: impl Into<String>, dest_path: impl Into<String>) -> Self {
        let project = project.into();
        let src_path = src_path.into();
        let dest_path = dest_path.into();
        if src_path == dest_path {
            return Self::modify(project, dest_path);
        }
        Self {
            project,
            kind: EventKind::Move,
            src_path,
            dest_path: Some(dest_path),
        }
    }
}

/// Ordered, deduplicated collection of events awaiting the next tick, kept
/// per project. Insertion order is preserved so a batch split into wire
/// chunks can be reassembled identically (invariant 6 in section 8).
#[derive(Debug, Default)]
pub struct PendingSet {
    by_project: HashMap<String, Vec<FileEvent>>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an event, deduplicating by structural equality. Returns
    /// `true` if the event was newly inserted.
    pub fn insert(&mut self, event: FileEvent) -> bool {
        let bucket = self.by_project.entry(event.project.clone()).or_default();
        if bucket.contains(&event) {
            return false;
        }
        bucket.push(event);
        true
    }

    /// Atomically drains every non-empty project batch. Events that arrive
    /// while this runs (the caller must hold the same lock for both) land
    /// in the next tick because `drain` only takes what is present now.
    pub fn drain(&mut self) -> Vec<(String, Vec<FileEvent>)> {
        self.by_project
            .drain()
            .filter(|(_, events)| !events.is_empty())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.by_project.values().all(|v| v.is_empty())
    }

    #[cfg(test)]
    pub fn len_for(&self, project: &str) -> usize {
        self.by_project.get(project).map(|v| v.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_on_insert() {
        let mut set = PendingSet::new();
        assert!(set.insert(FileEvent::modify("p", "a.txt")));
        assert!(!set.insert(FileEvent::modify("p", "a.txt")));
        assert_eq!(set.len_for("p"), 1);
    }

    #[test]
    fn drain_preserves_insertion_order() {
        let mut set = PendingSet::new();
        set.insert(FileEvent::create("p", "a.txt"));
        set.insert(FileEvent::modify("p", "b.txt"));
        set.insert(FileEvent::delete("p", "c.txt"));

        let drained = set.drain();
        assert_eq!(drained.len(), 1);
        let (project, events) = &drained[0];
        assert_eq!(project, "p");
        assert_eq!(events[0].src_path, "a.txt");
        assert_eq!(events[1].src_path, "b.txt");
        assert_eq!(events[2].src_path, "c.txt");
    }

    #[test]
    fn drain_is_atomic_and_empties_batches_only() {
        let mut set = PendingSet::new();
        set.insert(FileEvent::modify("p", "a.txt"));
        let drained = set.drain();
        assert_eq!(drained.len(), 1);
        // second drain sees nothing: the batch was consumed.
        assert!(set.drain().is_empty());
    }

    #[test]
    fn move_with_equal_paths_degrades_to_modify() {
        let e = FileEvent::moved("p", "a.txt", "a.txt");
        assert_eq!(e.kind, EventKind::Modify);
        assert_eq!(e.src_path, "a.txt");
        assert_eq!(e.dest_path, None);
    }

    #[test]
    fn move_keeps_both_paths() {
        let e = FileEvent::moved("p", "a.txt", "b.txt");
        assert_eq!(e.kind, EventKind::Move);
        assert_eq!(e.src_path, "a.txt");
        assert_eq!(e.dest_path.as_deref(), Some("b.txt"));
    }
}
