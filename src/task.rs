//! Task definitions for the per-project executor.
//!
//! Grounded on `baboond/task.py`'s `Task`/`EndTask`/`AlertTask`/
//! `GitInitTask`/`RsyncTask`/`MergeTask` hierarchy, collapsed into one enum
//! since Rust's executor dispatches on a closed set of variants rather than
//! subclassing an abstract `Task`.

use crate::event::FileEvent;
use crate::wire::MergeVerdict;

/// Numeric priority as in section 4.4: lower runs first.
pub const PRIORITY_END: u8 = 1;
pub const PRIORITY_ALERT: u8 = 2;
pub const PRIORITY_GIT_INIT: u8 = 4;
pub const PRIORITY_SYNC: u8 = 4;
pub const PRIORITY_MERGE: u8 = 5;

#[derive(Debug, Clone)]
pub enum Task {
    /// Graceful shutdown sentinel.
    End,
    /// Publish a merge verdict to the project's pub/sub node.
    Alert {
        project: String,
        from_user: String,
        with_user: String,
        verdict: MergeVerdict,
        files: Vec<String>,
    },
    /// First-time clone of a user mirror from a remote URL.
    GitInit {
        project: String,
        user_jid: String,
        url: String,
    },
    /// Apply one sync batch.
    Sync {
        project: String,
        user_jid: String,
        rid: String,
        sid: String,
        events: Vec<FileEvent>,
    },
    /// Run the speculative merge verifier, triggered by `user_jid`.
    Merge { project: String, user_jid: String },
}

impl Task {
    pub fn priority(&self) -> u8 {
        match self {
            Task::End => PRIORITY_END,
            Task::Alert { .. } => PRIORITY_ALERT,
            Task::GitInit { .. } => PRIORITY_GIT_INIT,
            Task::Sync { .. } => PRIORITY_SYNC,
            Task::Merge { .. } => PRIORITY_MERGE,
        }
    }

    pub fn project(&self) -> Option<&str> {
        match self {
            Task::End => None,
            Task::Alert { project, .. }
            | Task::GitInit { project, .. }
            | Task::Sync { project, .. }
            | Task::Merge { project, .. } => Some(project),
        }
    }
}
