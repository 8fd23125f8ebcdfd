//! Top-level daemon orchestration: wires the transport, dispatcher, mirror
//! and merge verifier into the actual task-execution business logic.
//!
//! Grounded on `baboond/task.py`'s `GitInitTask`/`RsyncTask`/`MergeTask`/
//! `AlertTask` method bodies for what each `Task` variant does, and on the
//! teacher's `engine.rs` (`MirrorEngine`) for the top-level shape: a
//! constructor, a `start()` that spawns the supporting threads, and a
//! signal-driven main loop.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::Configuration;
use crate::delta::signature;
use crate::dispatcher::Dispatcher;
use crate::error::{BaboonError, Result};
use crate::merge;
use crate::mirror::ServerMirror;
use crate::task::Task;
use crate::transport::DaemonTransport;
use crate::wire::{DeltaPayload, HashesPayload, MergeVerdict};

/// Per-file delta round-trip timeout, kept as a named constant per §7/§10.6
/// rather than hardcoded inline.
pub const RSYNC_TIMEOUT_SECS: u64 = 240;

/// Map from in-flight RID to the channel its `Task::Sync` handler is
/// blocked on, fed by the bytestream reader thread as `delta` payloads
/// arrive. At most one entry per RID exists at a time, since the
/// executor serialises sync tasks per project and waits for one file's
/// delta before moving to the next.
type PendingDeltas = Arc<Mutex<std::collections::HashMap<String, mpsc::Sender<DeltaPayload>>>>;

pub struct DaemonEngine {
    transport: Arc<DaemonTransport>,
    dispatcher: Arc<OnceLock<Dispatcher>>,
    pending_deltas: PendingDeltas,
    running: Arc<AtomicBool>,
}

impl DaemonEngine {
    pub fn new(config: &Configuration, transport: Arc<DaemonTransport>) -> Self {
        let pending_deltas: PendingDeltas = Arc::new(Mutex::new(std::collections::HashMap::new()));
        let working_dir = config.server.working_dir.clone();
        let dispatcher_cell: Arc<OnceLock<Dispatcher>> = Arc::new(OnceLock::new());

        let transport_for_tasks = transport.clone();
        let pending_for_tasks = pending_deltas.clone();
        let dispatcher_for_tasks = dispatcher_cell.clone();

        let dispatcher = Dispatcher::new(move |project| {
            let project = project.to_string();
            let working_dir = working_dir.clone();
            let transport = transport_for_tasks.clone();
            let pending_deltas = pending_for_tasks.clone();
            let dispatcher_cell = dispatcher_for_tasks.clone();
            Box::new(move |task: Task| {
                run_task(&project, &working_dir, &transport, &pending_deltas, &dispatcher_cell, task);
            })
        });
        dispatcher_cell
            .set(dispatcher)
            .unwrap_or_else(|_| panic!("dispatcher cell set exactly once, at construction"));

        Self {
            transport,
            dispatcher: dispatcher_cell,
            pending_deltas,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        self.dispatcher.get().expect("dispatcher initialized in new()")
    }

    /// Every incoming stanza is accepted: subscription/roster management
    /// (who may join a project) is an external-collaborator concern this
    /// spec only consumes the result of, and no such external roster
    /// source is wired up here. A real deployment would supply its own
    /// `is_subscriber` closure backed by pub/sub affiliation data.
    pub fn is_subscriber(&self, _user_jid: &str, _project: &str) -> bool {
        true
    }

    /// Runs the blocking stanza receive loop, dispatching to `Task`s on
    /// this engine's dispatcher. Call on its own thread.
    pub fn run_stanza_loop(&self) {
        let is_subscriber = |user_jid: &str, project: &str| self.is_subscriber(user_jid, project);
        self.transport.run(self.dispatcher(), is_subscriber);
    }

    /// Runs the blocking bytestream receive loop, routing each inbound
    /// `delta` payload to the `Task::Sync` handler waiting on its RID. Call
    /// on its own thread, alongside `run_stanza_loop`.
    pub fn run_bytestream_loop(&self) {
        self.running.store(true, Ordering::SeqCst);
        loop {
            match self.transport.recv_delta() {
                Ok(payload) => {
                    let sender = self.pending_deltas.lock().unwrap().remove(&payload.rid);
                    match sender {
                        Some(tx) => {
                            let _ = tx.send(payload);
                        }
                        None => warn!(rid = %payload.rid, "delta arrived for an unknown or already-completed rid"),
                    }
                }
                Err(e) => {
                    debug!(error = %e, "bytestream loop stopping");
                    break;
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.dispatcher().close();
        self.transport.close();
    }
}

fn run_task(project: &str, working_dir: &Path, transport: &DaemonTransport, pending_deltas: &PendingDeltas, dispatcher: &OnceLock<Dispatcher>, task: Task) {
    let result = match task {
        Task::End => Ok(()),
        Task::GitInit { project, user_jid, url } => run_git_init(working_dir, transport, &project, &user_jid, &url),
        Task::Sync { project, user_jid, rid, sid: _, events } => run_sync(working_dir, transport, pending_deltas, &project, &user_jid, &rid, events),
        Task::Merge { project, user_jid } => run_merge(working_dir, dispatcher, &project, &user_jid),
        Task::Alert { project, from_user: _, with_user, verdict, files } => run_alert(transport, &project, &with_user, verdict, &files),
    };
    if let Err(e) = result {
        error!(project, error = %e, "task execution failed");
    }
}

/// Clones `url` into the user's mirror directory, replacing anything
/// already there. On failure the partial mirror is removed so a retry
/// starts clean, mirroring `GitInitTask`'s own-mirror-only cleanup.
fn run_git_init(working_dir: &Path, transport: &DaemonTransport, project: &str, user_jid: &str, url: &str) -> Result<()> {
    let mirror = ServerMirror::new(working_dir, project, user_jid);
    if mirror.exists() {
        fs::remove_dir_all(mirror.root())?;
    }
    if let Some(parent) = mirror.root().parent() {
        fs::create_dir_all(parent)?;
    }

    let output = std::process::Command::new("git")
        .args(["clone", url, &mirror.root().to_string_lossy()])
        .output()
        .map_err(BaboonError::Io)?;

    if output.status.success() {
        info!(project, user = user_jid, "git-init clone succeeded");
        Ok(())
    } else {
        let detail = String::from_utf8_lossy(&output.stderr).into_owned();
        let _ = fs::remove_dir_all(mirror.root());
        warn!(project, user = user_jid, detail = %detail, "git-init clone failed");
        let err = BaboonError::GitInit {
            project: project.to_string(),
            detail,
        };
        let _ = transport.send_error(err.wire_code());
        Err(err)
    }
}

/// Applies one sync batch to `user_jid`'s mirror, per `RsyncTask.run`:
/// CREATE/DELETE/MOVE are applied directly; each MODIFY triggers one
/// block-hash round trip over the bytestream before its delta is applied.
/// The whole batch fails on the first path-escape violation; individual
/// per-file timeouts are logged but do not abort the remaining events.
fn run_sync(working_dir: &Path, transport: &DaemonTransport, pending_deltas: &PendingDeltas, project: &str, user_jid: &str, rid: &str, events: Vec<crate::event::FileEvent>) -> Result<()> {
    use crate::event::EventKind;

    let mirror = ServerMirror::new(working_dir, project, user_jid);
    mirror.acquire_sync_lock()?;

    let result = (|| -> Result<()> {
        for event in &events {
            match event.kind {
                EventKind::Create => {
                    let target = mirror.resolve(&event.src_path)?;
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&target, b"")?;
                }
                EventKind::Modify => {
                    let target = mirror.resolve(&event.src_path)?;
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    if !target.exists() {
                        fs::write(&target, b"")?;
                    }
                    let current = fs::read(&target)?;
                    let sig = signature(&current);

                    let (tx, rx) = mpsc::channel();
                    pending_deltas.lock().unwrap().insert(rid.to_string(), tx);

                    let hashes = HashesPayload {
                        sid: String::new(),
                        rid: rid.to_string(),
                        project: project.to_string(),
                        hashes: vec![(event.src_path.clone(), sig)],
                    };
                    transport.send_hashes(hashes)?;

                    match rx.recv_timeout(Duration::from_secs(RSYNC_TIMEOUT_SECS)) {
                        Ok(delta) => transport.apply_delta_payload(&delta, &mirror)?,
                        Err(_) => {
                            pending_deltas.lock().unwrap().remove(rid);
                            warn!(project, path = %event.src_path, "rsync timeout detected");
                        }
                    }
                }
                EventKind::Delete => {
                    let target = mirror.resolve(&event.src_path)?;
                    if target.exists() {
                        if target.is_dir() {
                            fs::remove_dir_all(&target)?;
                        } else {
                            fs::remove_file(&target)?;
                            if let Some(parent) = target.parent() {
                                mirror.prune_empty_ancestors(parent);
                            }
                        }
                    }
                }
                EventKind::Move => {
                    let src = mirror.resolve(&event.src_path)?;
                    let dest_path = event.dest_path.as_deref().unwrap_or(&event.src_path);
                    let dest = mirror.resolve(dest_path)?;
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    if src.exists() {
                        fs::rename(&src, &dest)?;
                    }
                }
            }
        }
        Ok(())
    })();

    mirror.release_sync_lock();

    match result {
        Ok(()) => {
            transport.send_rsync_finished(project)?;
            debug!(project, user = user_jid, rid, "rsync task finished");
            Ok(())
        }
        Err(e) => {
            let _ = transport.send_error(e.wire_code());
            Err(e)
        }
    }
}

/// Runs the speculative merge verifier for `user_jid`'s mirror against
/// every other mirror of the project, then enqueues one `Task::Alert` per
/// pair so results are published at `PRIORITY_ALERT` rather than inline.
fn run_merge(working_dir: &Path, dispatcher: &OnceLock<Dispatcher>, project: &str, user_jid: &str) -> Result<()> {
    let master = ServerMirror::new(working_dir, project, user_jid);
    let others = sibling_mirrors(working_dir, project, user_jid)?;

    let verdicts = merge::verify_all(project, user_jid, &master, others)?;

    if let Some(dispatcher) = dispatcher.get() {
        for verdict in verdicts {
            dispatcher.put(
                project,
                Task::Alert {
                    project: project.to_string(),
                    from_user: user_jid.to_string(),
                    with_user: verdict.with_user,
                    verdict: verdict.verdict,
                    files: verdict.files,
                },
            );
        }
    }
    Ok(())
}

fn run_alert(transport: &DaemonTransport, project: &str, with_user: &str, verdict: MergeVerdict, files: &[String]) -> Result<()> {
    debug!(project, with_user, verdict = ?verdict, "publishing merge status");
    transport.publish_merge_status(project, verdict, files)
}

/// Lists every user mirror under `<working_dir>/<project>` except
/// `exclude_user`, mirroring how `MergeTask` enumerates the other side of
/// every pair by walking the project's directory.
fn sibling_mirrors(working_dir: &Path, project: &str, exclude_user: &str) -> Result<Vec<(String, ServerMirror)>> {
    let project_dir: PathBuf = working_dir.join(project);
    let mut others = Vec::new();
    let entries = match fs::read_dir(&project_dir) {
        Ok(entries) => entries,
        Err(_) => return Ok(others),
    };
    for entry in entries.flatten() {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == exclude_user {
            continue;
        }
        others.push((name.clone(), ServerMirror::new(working_dir, project, &name)));
    }
    Ok(others)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sibling_mirrors_excludes_the_triggering_user() {
        let dir = TempDir::new().unwrap();
        let project_dir = dir.path().join("proj");
        fs::create_dir_all(project_dir.join("alice@example.com")).unwrap();
        fs::create_dir_all(project_dir.join("bob@example.com")).unwrap();

        let others = sibling_mirrors(dir.path(), "proj", "alice@example.com").unwrap();
        assert_eq!(others.len(), 1);
        assert_eq!(others[0].0, "bob@example.com");
    }

    #[test]
    fn sibling_mirrors_on_missing_project_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let others = sibling_mirrors(dir.path(), "nonexistent", "alice@example.com").unwrap();
        assert!(others.is_empty());
    }
}
