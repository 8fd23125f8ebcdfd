//! Server-side mirror layout, path-safety, and sentinel files.
//!
//! Grounded on `baboond/task.py`'s `_verify_path` and `_clean_directory`,
//! and the sentinel handling scattered across `task.py`/`transport.py`
//! (`.baboon.lock` for sync-in-progress, `.lock` for quarantine).

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{BaboonError, Result};

pub const SYNC_LOCK_FILE: &str = ".baboon.lock";
pub const QUARANTINE_FILE: &str = ".lock";

/// `<working_dir>/<project>/<userJID>/`: one user's server-side checkout.
#[derive(Clone)]
pub struct ServerMirror {
    root: PathBuf,
}

impl ServerMirror {
    pub fn new(working_dir: &Path, project: &str, user_jid: &str) -> Self {
        Self {
            root: working_dir.join(project).join(user_jid),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn exists(&self) -> bool {
        self.root.exists()
    }

    /// Resolves a project-relative path against the mirror root, enforcing
    /// the path-safety invariant in section 4.3: `normalize(mirrorRoot +
    /// relPath)` must remain strictly under `mirrorRoot`. Returns the
    /// `BaboonError::PathEscape` the whole sync batch must fail with on
    /// violation.
    pub fn resolve(&self, rel_path: &str) -> Result<PathBuf> {
        if rel_path.is_empty() {
            return Err(BaboonError::PathEscape {
                path: rel_path.to_string(),
                root: self.root.clone(),
            });
        }
        let mut normalized = PathBuf::new();
        for component in Path::new(rel_path).components() {
            use std::path::Component;
            match component {
                Component::Normal(part) => normalized.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(BaboonError::PathEscape {
                        path: rel_path.to_string(),
                        root: self.root.clone(),
                    });
                }
            }
        }
        if normalized.as_os_str().is_empty() {
            return Err(BaboonError::PathEscape {
                path: rel_path.to_string(),
                root: self.root.clone(),
            });
        }
        Ok(self.root.join(normalized))
    }

    pub fn sync_lock_path(&self) -> PathBuf {
        self.root.join(SYNC_LOCK_FILE)
    }

    pub fn quarantine_path(&self) -> PathBuf {
        self.root.join(QUARANTINE_FILE)
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_lock_path().exists()
    }

    pub fn is_quarantined(&self) -> bool {
        self.quarantine_path().exists()
    }

    pub fn acquire_sync_lock(&self) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.sync_lock_path(), b"")?;
        Ok(())
    }

    /// Best-effort removal, per the cancellation policy in section 5: a
    /// stale lock left by an interrupted process is tolerated and the
    /// mirror is quarantined on next start rather than treated as fatal
    /// here.
    pub fn release_sync_lock(&self) {
        let _ = fs::remove_file(self.sync_lock_path());
    }

    pub fn quarantine(&self, reason: &str) -> Result<()> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.quarantine_path(), reason)?;
        Ok(())
    }

    /// Removes a now-empty directory and its now-empty ancestors, up to
    /// but not including the mirror root, mirroring `_clean_directory` in
    /// `task.py`.
    pub fn prune_empty_ancestors(&self, start_dir: &Path) {
        let mut current = start_dir.to_path_buf();
        while current != self.root && current.starts_with(&self.root) {
            let is_empty = fs::read_dir(&current)
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false);
            if !is_empty || fs::remove_dir(&current).is_err() {
                break;
            }
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resolve_keeps_normal_paths_under_root() {
        let dir = TempDir::new().unwrap();
        let mirror = ServerMirror::new(dir.path(), "proj", "alice@example.com");
        let resolved = mirror.resolve("src/a.txt").unwrap();
        assert!(resolved.starts_with(mirror.root()));
    }

    #[test]
    fn resolve_rejects_parent_dir_escape() {
        let dir = TempDir::new().unwrap();
        let mirror = ServerMirror::new(dir.path(), "proj", "alice@example.com");
        let err = mirror.resolve("../../etc/passwd").unwrap_err();
        assert!(matches!(err, BaboonError::PathEscape { .. }));
    }

    #[test]
    fn resolve_rejects_absolute_path() {
        let dir = TempDir::new().unwrap();
        let mirror = ServerMirror::new(dir.path(), "proj", "alice@example.com");
        let err = mirror.resolve("/etc/passwd").unwrap_err();
        assert!(matches!(err, BaboonError::PathEscape { .. }));
    }

    #[test]
    fn sync_lock_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mirror = ServerMirror::new(dir.path(), "proj", "alice@example.com");
        assert!(!mirror.is_syncing());
        mirror.acquire_sync_lock().unwrap();
        assert!(mirror.is_syncing());
        mirror.release_sync_lock();
        assert!(!mirror.is_syncing());
    }

    #[test]
    fn quarantine_lifecycle() {
        let dir = TempDir::new().unwrap();
        let mirror = ServerMirror::new(dir.path(), "proj", "alice@example.com");
        assert!(!mirror.is_quarantined());
        mirror.quarantine("corrupt checkout").unwrap();
        assert!(mirror.is_quarantined());
    }

    #[test]
    fn prune_empty_ancestors_stops_at_root() {
        let dir = TempDir::new().unwrap();
        let mirror = ServerMirror::new(dir.path(), "proj", "alice@example.com");
        let nested = mirror.root().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();
        mirror.prune_empty_ancestors(&nested);
        assert!(!mirror.root().join("a").exists());
        // root itself is never removed by this call.
        assert!(mirror.root().exists());
    }
}
