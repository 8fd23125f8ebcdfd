//! File monitor, batch ticker ("Dancer"), and startup reconciliation.
//!
//! Grounded on `baboon/monitor.py`'s `EventHandler`/`Dancer`/`Monitor` and,
//! for the mechanics of wiring up `notify` watchers and debounce threads,
//! on the teacher's `watcher.rs`. Unlike the teacher's per-path
//! last-write-wins `PendingEvents` map, insertion here goes through
//! `PendingSet`, which deduplicates by full structural equality as the
//! data model in section 3 requires.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::{Event as NotifyEvent, EventKind as NotifyEventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::event::{EventKind, FileEvent, PendingSet};
use crate::ignore::IgnoreRuleSet;

pub const DEFAULT_IGNORE_FILE: &str = ".gitignore";
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// A non-empty batch drained from the pending set on one tick.
pub struct Batch {
    pub project: String,
    pub events: Vec<FileEvent>,
}

struct ProjectState {
    project_path: PathBuf,
    rules: IgnoreRuleSet,
}

/// Owns the monitor-wide pending set and the `notify` watchers for every
/// enabled project. `new-rsync` batches are delivered over an mpsc channel
/// rather than a string-keyed event bus, per the Design Notes.
pub struct Monitor {
    pending: Arc<Mutex<PendingSet>>,
    projects: Arc<Mutex<HashMap<String, ProjectState>>>,
    watchers: Vec<RecommendedWatcher>,
    dancer: Option<Dancer>,
    batch_tx: Sender<Batch>,
}

impl Monitor {
    pub fn new(project_paths: Vec<(String, PathBuf)>) -> (Self, Receiver<Batch>) {
        let (batch_tx, batch_rx) = channel();
        let mut projects = HashMap::new();
        for (name, path) in project_paths {
            let rules = load_rules(&path);
            projects.insert(name, ProjectState { project_path: path, rules });
        }
        (
            Self {
                pending: Arc::new(Mutex::new(PendingSet::new())),
                projects: Arc::new(Mutex::new(projects)),
                watchers: Vec::new(),
                dancer: None,
                batch_tx,
            },
            batch_rx,
        )
    }

    /// Starts one recursive `notify` watcher per project plus the dancer
    /// ticker thread.
    pub fn watch(&mut self) -> notify::Result<()> {
        let projects = self.projects.lock().unwrap();
        for (name, state) in projects.iter() {
            let name = name.clone();
            let project_path = state.project_path.clone();
            let pending = self.pending.clone();
            let projects_ref = self.projects.clone();

            let mut watcher = notify::recommended_watcher(move |res: notify::Result<NotifyEvent>| {
                if let Ok(event) = res {
                    handle_raw_event(&name, &project_path, &projects_ref, &pending, event);
                }
            })?;
            watcher.watch(&state.project_path, RecursiveMode::Recursive)?;
            self.watchers.push(watcher);
        }
        drop(projects);

        self.dancer = Some(Dancer::spawn(self.pending.clone(), self.batch_tx.clone(), DEFAULT_TICK));
        Ok(())
    }

    pub fn close(&mut self) {
        self.watchers.clear();
        if let Some(dancer) = self.dancer.take() {
            dancer.close();
        }
    }

    /// Startup reconciliation (section 4.2): for every non-ignored file in
    /// the working tree, compare its mtime against the index. Returns the
    /// synthesized events; the caller is responsible for feeding them into
    /// the same sync path as steady-state events.
    pub fn reconcile(&self, project: &str, index: &crate::index::Index) -> Vec<FileEvent> {
        let projects = self.projects.lock().unwrap();
        let Some(state) = projects.get(project) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        let mut seen = std::collections::HashSet::new();

        for entry in WalkDir::new(&state.project_path)
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 {
                    return true;
                }
                let rel = rel_path(&state.project_path, e.path());
                crate::ignore::should_descend(&state.rules, &rel) || e.file_type().is_file()
            })
            .filter_map(|e| e.ok())
        {
            if entry.file_type().is_dir() {
                continue;
            }
            let rel = rel_path(&state.project_path, entry.path());
            if state.rules.is_ignored(&rel) {
                continue;
            }
            seen.insert(rel.clone());

            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);

            match index.get(&rel) {
                None => events.push(FileEvent::create(project, rel)),
                Some(indexed) if mtime > indexed => events.push(FileEvent::modify(project, rel)),
                Some(_) => {}
            }
        }

        // Every indexed path no longer present on disk is a DELETE.
        for indexed_path in index.paths() {
            if !seen.contains(&indexed_path) {
                events.push(FileEvent::delete(project, indexed_path));
            }
        }

        events
    }

    pub fn pending(&self) -> Arc<Mutex<PendingSet>> {
        self.pending.clone()
    }
}

fn rel_path(project_path: &Path, full: &Path) -> String {
    full.strip_prefix(project_path)
        .unwrap_or(full)
        .to_string_lossy()
        .replace('\\', "/")
}

fn load_rules(project_path: &Path) -> IgnoreRuleSet {
    let ignore_path = project_path.join(DEFAULT_IGNORE_FILE);
    match std::fs::read_to_string(&ignore_path) {
        Ok(contents) => IgnoreRuleSet::compile(&contents),
        Err(_) => IgnoreRuleSet::empty(),
    }
}

fn handle_raw_event(
    project: &str,
    project_path: &Path,
    projects: &Arc<Mutex<HashMap<String, ProjectState>>>,
    pending: &Arc<Mutex<PendingSet>>,
    event: NotifyEvent,
) {
    for path in &event.paths {
        if path.is_dir() {
            continue;
        }
        let rel = rel_path(project_path, path);

        // Rebuild the rule set before processing further, if the ignore
        // file itself just changed (section 4.1: "rebuilt when the ignore
        // file itself changes").
        if crate::ignore::is_ignore_file(&rel, DEFAULT_IGNORE_FILE) {
            let mut projects = projects.lock().unwrap();
            if let Some(state) = projects.get_mut(project) {
                state.rules = load_rules(project_path);
                debug!(project, "ignore rules rebuilt");
            }
        }

        let projects_guard = projects.lock().unwrap();
        let Some(state) = projects_guard.get(project) else { continue };
        if state.rules.is_ignored(&rel) {
            continue;
        }

        // A MODIFY on a path that is now a directory is still reported as
        // MODIFY (edge case in section 4.2): the server detects the type
        // change.
        let file_event = match event.kind {
            NotifyEventKind::Create(_) => Some(FileEvent::create(project, rel)),
            NotifyEventKind::Remove(_) => Some(FileEvent::delete(project, rel)),
            NotifyEventKind::Modify(_) => Some(FileEvent::modify(project, rel)),
            _ => None,
        };
        drop(projects_guard);

        if let Some(fe) = file_event {
            let mut pending = pending.lock().unwrap();
            pending.insert(fe);
        }
    }
}

/// Background ticker: wakes every `tick`, drains the pending set under the
/// same mutex the monitor writes through, and emits one `Batch` per
/// non-empty project.
struct Dancer {
    stop: Arc<Mutex<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl Dancer {
    fn spawn(pending: Arc<Mutex<PendingSet>>, batch_tx: Sender<Batch>, tick: Duration) -> Self {
        let stop = Arc::new(Mutex::new(false));
        let stop_clone = stop.clone();

        let handle = thread::Builder::new()
            .name("dancer".into())
            .spawn(move || loop {
                thread::sleep(tick);
                if *stop_clone.lock().unwrap() {
                    break;
                }
                let drained = {
                    let mut guard = pending.lock().unwrap();
                    guard.drain()
                };
                for (project, events) in drained {
                    if events.is_empty() {
                        continue;
                    }
                    if batch_tx.send(Batch { project, events }).is_err() {
                        return;
                    }
                }
            })
            .expect("failed to spawn dancer thread");

        Self { stop, handle: Some(handle) }
    }

    fn close(self) {
        *self.stop.lock().unwrap() = true;
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

pub fn now_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Index;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn reconcile_flags_new_file_as_create() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let index = Index::init(dir.path()).unwrap();

        let (monitor, _rx) = Monitor::new(vec![("p".into(), dir.path().to_path_buf())]);
        let events = monitor.reconcile("p", &index);
        assert!(events.iter().any(|e| e.kind == EventKind::Create && e.src_path == "a.txt"));
    }

    #[test]
    fn reconcile_flags_stale_file_as_modify() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let index = Index::init(dir.path()).unwrap();
        index.set("a.txt", 0); // ancient timestamp, older than the file's mtime

        let (monitor, _rx) = Monitor::new(vec![("p".into(), dir.path().to_path_buf())]);
        let events = monitor.reconcile("p", &index);
        assert!(events.iter().any(|e| e.kind == EventKind::Modify && e.src_path == "a.txt"));
    }

    #[test]
    fn reconcile_skips_up_to_date_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let index = Index::init(dir.path()).unwrap();
        index.set("a.txt", now_unix_seconds() + 3600); // future timestamp

        let (monitor, _rx) = Monitor::new(vec![("p".into(), dir.path().to_path_buf())]);
        let events = monitor.reconcile("p", &index);
        assert!(events.is_empty());
    }

    #[test]
    fn reconcile_flags_missing_indexed_file_as_delete() {
        let dir = TempDir::new().unwrap();
        let index = Index::init(dir.path()).unwrap();
        index.set("gone.txt", now_unix_seconds());

        let (monitor, _rx) = Monitor::new(vec![("p".into(), dir.path().to_path_buf())]);
        let events = monitor.reconcile("p", &index);
        assert!(events.iter().any(|e| e.kind == EventKind::Delete && e.src_path == "gone.txt"));
    }

    #[test]
    fn reconcile_skips_ignored_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(".gitignore"), "build/*\n").unwrap();
        fs::create_dir(dir.path().join("build")).unwrap();
        fs::write(dir.path().join("build").join("out.o"), "x").unwrap();
        let index = Index::init(dir.path()).unwrap();

        let (monitor, _rx) = Monitor::new(vec![("p".into(), dir.path().to_path_buf())]);
        let events = monitor.reconcile("p", &index);
        assert!(!events.iter().any(|e| e.src_path.contains("out.o")));
    }
}
