//! Speculative merge verifier.
//!
//! Grounded on `baboond/task.py`'s `MergeTask`: for the mirror that just
//! synced (*M*) and every other mirror of the project (*U*), add *M* as a
//! remote inside *U*, fetch, diff *M* against the merge-base, and check
//! whether that diff applies cleanly in *U*. Per the Open Questions in
//! section 9, each *U* is checked against a disposable local clone rather
//! than mutating *U*'s own remote table directly, so concurrent merges
//! against the same *U* never collide on a remote name. A linked worktree
//! (`git worktree add`) would not do this: it shares its `.git/config` —
//! and therefore its remote table — with the repository it was created
//! from, so two pair checks against the same *U* would still race on the
//! same `remote add`. A real clone gets its own `.git` entirely. The final
//! `apply --check`, though, runs against *U*'s real checkout rather than
//! the clone, since a clone only carries committed history and `git apply`
//! matches context against on-disk file content — running it against the
//! clone would silently ignore any of *U*'s own uncommitted changes.

use std::fs;
use std::path::Path;
use std::process::Command;
use std::thread;

use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{BaboonError, Result};
use crate::mirror::ServerMirror;
use crate::wire::MergeVerdict;

#[derive(Debug, Clone)]
pub struct PairVerdict {
    pub with_user: String,
    pub verdict: MergeVerdict,
    pub files: Vec<String>,
}

/// Runs a git command in `cwd`, returning stdout on success.
fn git(cwd: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .output()
        .map_err(BaboonError::Io)?;
    if !output.status.success() {
        return Err(BaboonError::Internal(format!(
            "git {:?} failed in {}: {}",
            args,
            cwd.display(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn is_valid_checkout(path: &Path) -> bool {
    Command::new("git")
        .args(["rev-parse", "--is-inside-work-tree"])
        .current_dir(path)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Verifies one (*M*, *U*) pair. *U*'s own checkout is never mutated: the
/// remote/fetch/merge-base dance runs against a disposable local clone, but
/// the final `apply --check` runs directly against *U*'s real working tree
/// so it's tested against *U*'s actual (possibly uncommitted) file content,
/// not a clean checkout of committed history. `--check` never writes, so
/// this stays read-only. A quarantined *U* is skipped entirely (`Ok(None)`)
/// rather than reported as clean: its working tree is already known-corrupt,
/// so an "Ok" verdict here would be a false negative hiding a real conflict.
fn verify_pair(project: &str, master: &ServerMirror, with_user: &str, other: &ServerMirror) -> Result<Option<PairVerdict>> {
    if other.is_quarantined() {
        debug!(project, user = with_user, "skipping quarantined mirror");
        return Ok(None);
    }
    if !is_valid_checkout(other.root()) {
        return Err(BaboonError::Corrupt {
            project: project.to_string(),
            detail: format!("{} is not a valid checkout", other.root().display()),
        });
    }

    let scratch = TempDir::new().map_err(BaboonError::Io)?;
    let clone = scratch.path().join("clone");
    git(
        scratch.path(),
        &["clone", "--no-hardlinks", "--quiet", other.root().to_str().unwrap(), clone.to_str().unwrap()],
    )?;

    // A fresh clone leaves HEAD attached to the default branch, unlike a
    // detached `worktree add` checkout.
    let branch = git(&clone, &["symbolic-ref", "--short", "HEAD"])?.trim().to_string();

    let remote_name = format!("baboon-master-{with_user}");
    git(&clone, &["remote", "add", &remote_name, master.root().to_str().unwrap()])?;
    git(&clone, &["fetch", "--quiet", &remote_name])?;

    let remote_ref = format!("{remote_name}/{branch}");

    let merge_base = git(&clone, &["merge-base", "HEAD", &remote_ref])?.trim().to_string();

    let patch = git(master.root(), &["diff", "--binary", "--full-index", &merge_base])?;

    if patch.trim().is_empty() {
        return Ok(Some(PairVerdict {
            with_user: with_user.to_string(),
            verdict: MergeVerdict::Ok,
            files: vec![],
        }));
    }

    let patch_path = scratch.path().join("candidate.patch");
    fs::write(&patch_path, &patch).map_err(BaboonError::Io)?;

    let check = Command::new("git")
        .args(["apply", "--check", patch_path.to_str().unwrap()])
        .current_dir(other.root())
        .output()
        .map_err(BaboonError::Io)?;

    if check.status.success() {
        Ok(Some(PairVerdict {
            with_user: with_user.to_string(),
            verdict: MergeVerdict::Ok,
            files: vec![],
        }))
    } else {
        let stderr = String::from_utf8_lossy(&check.stderr);
        Ok(Some(PairVerdict {
            with_user: with_user.to_string(),
            verdict: MergeVerdict::Conflict,
            files: parse_conflict_files(&stderr),
        }))
    }
}

/// `git apply --check`'s error output names each failing file on every
/// even-indexed line of the form `error: patch failed: path/to/file:NN` /
/// `error: path/to/file: patch does not apply`, per the original's
/// even-indexed-line parsing convention. We extract the path token that
/// follows `error:` on each such line rather than depending on exact line
/// parity, since the real message format varies by git version; this is
/// the supplemental, more robust replacement grounded in the same intent.
fn parse_conflict_files(stderr: &str) -> Vec<String> {
    let mut files = Vec::new();
    for line in stderr.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("error: patch failed: ") {
            if let Some((path, _)) = rest.split_once(':') {
                files.push(path.to_string());
            }
        } else if let Some(rest) = line.strip_prefix("error: ") {
            if let Some(path) = rest.strip_suffix(": patch does not apply") {
                files.push(path.to_string());
            }
        }
    }
    files.sort();
    files.dedup();
    files
}

/// Runs the full verifier for one project: *M* is the mirror whose sync
/// just triggered this, `others` is every other user's mirror. Pairs run
/// concurrently and are joined before the combined result is returned.
pub fn verify_all(project: &str, master_user: &str, master: &ServerMirror, others: Vec<(String, ServerMirror)>) -> Result<Vec<PairVerdict>> {
    if master.is_syncing() {
        return Err(BaboonError::Corrupt {
            project: project.to_string(),
            detail: "sync in progress on master mirror".into(),
        });
    }
    if master.is_quarantined() {
        return Err(BaboonError::Corrupt {
            project: project.to_string(),
            detail: "master mirror is quarantined".into(),
        });
    }
    if !is_valid_checkout(master.root()) {
        return Err(BaboonError::Forbidden {
            who: master_user.to_string(),
            project: project.to_string(),
        });
    }

    let project = project.to_string();
    let handles: Vec<_> = others
        .into_iter()
        .map(|(with_user, other)| {
            let project = project.clone();
            let master = master.clone();
            thread::spawn(move || verify_pair(&project, &master, &with_user, &other))
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        match handle.join() {
            Ok(Ok(Some(verdict))) => results.push(verdict),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!(error = %e, "merge pair verification failed"),
            Err(_) => warn!("merge pair verification thread panicked"),
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_conflict_files_extracts_paths() {
        let stderr = "error: patch failed: README.md:10\nerror: README.md: patch does not apply\n";
        let files = parse_conflict_files(stderr);
        assert_eq!(files, vec!["README.md".to_string()]);
    }

    #[test]
    fn parse_conflict_files_handles_multiple() {
        let stderr = "error: patch failed: a.txt:1\nerror: a.txt: patch does not apply\nerror: patch failed: b.txt:5\nerror: b.txt: patch does not apply\n";
        let files = parse_conflict_files(stderr);
        assert_eq!(files, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }
}
