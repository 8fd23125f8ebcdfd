//! Top-level watcher orchestration: wires the monitor, per-project index
//! and transport into the steady-state sync loop the `baboon` binary runs.
//!
//! Grounded on `baboon/monitor.py`'s Monitor-to-Transport hookup for what
//! drives a sync batch, and on the teacher's `engine.rs` (`MirrorEngine`)
//! for the top-level shape: a constructor, a `start()` that spawns the
//! supporting threads and runs a signal-driven main loop, and `stop()`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};
use xmpp_parsers::minidom::Element;

use crate::config::Configuration;
use crate::error::{BaboonError, Result};
use crate::event::FileEvent;
use crate::index::Index;
use crate::monitor::{now_unix_seconds, Batch, Monitor};
use crate::transport::{stanza, WatcherTransport};

/// The most recent sync batch sent for a project, keyed by project name, so
/// that when its `rsyncfinished` arrives the index can be updated for
/// exactly the paths that batch carried. At most one batch is ever in
/// flight per project: the main loop only drains the next batch for a
/// project after the previous one's `send_rsync` call has returned.
type PendingBatches = Arc<Mutex<HashMap<String, Vec<FileEvent>>>>;

pub struct WatcherEngine {
    config: Configuration,
    transport: Arc<WatcherTransport>,
    monitor: Monitor,
    batch_rx: Receiver<Batch>,
    indexes: Arc<Mutex<HashMap<String, Index>>>,
    pending_batches: PendingBatches,
    running: Arc<AtomicBool>,
    rid_counter: AtomicU64,
}

impl WatcherEngine {
    pub fn new(config: Configuration, transport: Arc<WatcherTransport>) -> Result<Self> {
        let project_paths: Vec<(String, PathBuf)> = config
            .enabled_projects()
            .map(|p| (p.name.clone(), p.local_path.clone()))
            .collect();

        let mut indexes = HashMap::new();
        for (name, path) in &project_paths {
            indexes.insert(name.clone(), Index::open(path)?);
        }

        let (monitor, batch_rx) = Monitor::new(project_paths);

        Ok(Self {
            config,
            transport,
            monitor,
            batch_rx,
            indexes: Arc::new(Mutex::new(indexes)),
            pending_batches: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            rid_counter: AtomicU64::new(1),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn next_rid(&self) -> String {
        format!("rid-{}", self.rid_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Startup reconciliation (section 4.2): compares every enabled
    /// project's working tree against its index and sends one sync batch
    /// per project with a non-empty diff, before `notify` watching begins.
    fn reconcile_all(&self) -> Result<()> {
        let indexes = self.indexes.lock().unwrap();
        for project in self.config.enabled_projects() {
            let Some(index) = indexes.get(&project.name) else { continue };
            let events = self.monitor.reconcile(&project.name, index);
            if events.is_empty() {
                continue;
            }
            info!(project = %project.name, count = events.len(), "reconciliation found drift, syncing");
            self.send_batch(&project.name, events)?;
        }
        Ok(())
    }

    fn send_batch(&self, project: &str, events: Vec<FileEvent>) -> Result<()> {
        let rid = self.next_rid();
        self.pending_batches.lock().unwrap().insert(project.to_string(), events.clone());
        self.transport.send_rsync(project, &rid, &events, self.config.server.max_stanza_size)
    }

    /// Starts the notify watchers, the stanza receive thread, the
    /// hashes-response thread, and the batch-draining main loop. Blocks
    /// until `stop()` runs, whether from a signal or the transport
    /// disconnecting.
    pub fn start(&mut self) -> Result<()> {
        info!("starting baboon watcher");

        self.reconcile_all()?;
        self.monitor
            .watch()
            .map_err(|e| BaboonError::Internal(format!("failed to start filesystem watcher: {e}")))?;

        self.running.store(true, Ordering::SeqCst);

        self.spawn_stanza_thread();
        self.spawn_hashes_thread();

        let running = self.running.clone();
        ctrlc::set_handler(move || {
            info!("received shutdown signal");
            running.store(false, Ordering::SeqCst);
        })
        .map_err(|e| BaboonError::Internal(format!("failed to install signal handler: {e}")))?;

        self.main_loop();
        Ok(())
    }

    fn spawn_stanza_thread(&self) {
        let transport = self.transport.clone();
        let indexes = self.indexes.clone();
        let pending = self.pending_batches.clone();
        let running = self.running.clone();
        let notify_transport = transport.clone();

        thread::Builder::new()
            .name("baboon-stanza".into())
            .spawn(move || {
                transport.run(move |el| {
                    handle_stanza(&el, &indexes, &pending, &notify_transport);
                    running.load(Ordering::SeqCst)
                });
            })
            .expect("failed to spawn stanza thread");
    }

    fn spawn_hashes_thread(&self) {
        let transport = self.transport.clone();
        let project_roots: HashMap<String, PathBuf> = self
            .config
            .enabled_projects()
            .map(|p| (p.name.clone(), p.local_path.clone()))
            .collect();

        thread::Builder::new()
            .name("baboon-hashes".into())
            .spawn(move || loop {
                match transport.recv_hashes() {
                    Ok(payload) => {
                        let Some(root) = project_roots.get(&payload.project).cloned() else {
                            warn!(project = %payload.project, "hashes arrived for an unknown project");
                            continue;
                        };
                        let result = transport.respond_to_hashes(&payload, |rel_path| {
                            fs::read(root.join(rel_path)).map_err(BaboonError::Io)
                        });
                        if let Err(e) = result {
                            warn!(error = %e, "failed to respond to a hashes payload");
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "hashes loop stopping");
                        break;
                    }
                }
            })
            .expect("failed to spawn hashes thread");
    }

    fn main_loop(&mut self) {
        while self.running.load(Ordering::SeqCst) {
            match self.batch_rx.recv_timeout(Duration::from_millis(500)) {
                Ok(batch) => {
                    if let Err(e) = self.send_batch(&batch.project, batch.events) {
                        error!(project = %batch.project, error = %e, "failed to send sync batch");
                    }
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.stop();
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.monitor.close();
        let indexes = self.indexes.lock().unwrap();
        for (name, index) in indexes.iter() {
            if let Err(e) = index.flush() {
                warn!(project = name, error = %e, "failed to flush index on shutdown");
            }
        }
        self.transport.close();
    }
}

/// Handles one stanza on the watcher's receive loop: an `rsyncfinished`
/// commits the just-sent batch's paths into the project's index and
/// immediately requests merge verification (section 4.3); a `merge_status`
/// or `error` is logged. Everything else is ignored.
fn handle_stanza(el: &Element, indexes: &Arc<Mutex<HashMap<String, Index>>>, pending: &PendingBatches, transport: &Arc<WatcherTransport>) {
    match el.name() {
        "rsyncfinished" => {
            let Ok(project) = stanza::parse_node_only(el) else { return };
            if let Some(events) = pending.lock().unwrap().remove(&project) {
                let indexes = indexes.lock().unwrap();
                if let Some(index) = indexes.get(&project) {
                    let now = now_unix_seconds();
                    for event in &events {
                        index.apply_synced_event(event, now);
                    }
                    if let Err(e) = index.flush() {
                        warn!(project = %project, error = %e, "failed to flush index");
                    }
                }
            }
            if let Err(e) = transport.send_merge_verification(&project) {
                warn!(project = %project, error = %e, "failed to request merge verification");
            }
        }
        "merge_status" => {
            if let Ok((project, status, files)) = stanza::parse_merge_status(el) {
                if status == "conflict" {
                    warn!(project = %project, files = ?files, "merge conflict detected");
                } else {
                    debug!(project = %project, "merge verified clean");
                }
            }
        }
        "error" => {
            if let Some(code) = el.attr("code") {
                warn!(code, "daemon reported an error");
            }
        }
        other => {
            debug!(stanza = other, "watcher ignoring unrecognized stanza");
        }
    }
}
