//! Tagged error kind shared by the watcher and the daemon.
//!
//! Internal call sites that don't care about the wire-visible kind (process
//! spawn, filesystem walks) keep using `anyhow::Result`; they convert to a
//! `BaboonError` only at a boundary where the tag matters: exit code
//! selection, or mapping to a wire error code (see `wire::ErrorCode`).

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BaboonError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed for {jid}")]
    Auth { jid: String },

    #[error("{who} is not a subscriber of project {project}")]
    Forbidden { who: String, project: String },

    #[error("mirror for project {project} is corrupted or quarantined: {detail}")]
    Corrupt { project: String, detail: String },

    #[error("path {path} escapes mirror root {root}")]
    PathEscape { path: String, root: PathBuf },

    #[error("rsync of {path} timed out after {secs}s")]
    Timeout { path: String, secs: u64 },

    #[error("git-init of project {project} failed: {detail}")]
    GitInit { project: String, detail: String },

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BaboonError {
    /// Wire error code per the external interface table in section 6.
    pub fn wire_code(&self) -> u16 {
        match self {
            BaboonError::Config(_) => 500,
            BaboonError::Auth { .. } => 503,
            BaboonError::Forbidden { .. } => 503,
            BaboonError::Corrupt { .. } => 503,
            BaboonError::PathEscape { .. } => 500,
            BaboonError::Timeout { .. } => 500,
            BaboonError::GitInit { .. } => 409,
            BaboonError::Internal(_) => 500,
            BaboonError::Io(_) => 500,
        }
    }

    /// Process-scope errors trigger graceful shutdown; everything else is
    /// batch- or task-scope and must not bring the process down.
    pub fn is_process_scope(&self) -> bool {
        matches!(self, BaboonError::Config(_) | BaboonError::Auth { .. })
    }
}

pub type Result<T> = std::result::Result<T, BaboonError>;
