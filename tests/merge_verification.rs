//! End-to-end exercise of the speculative merge verifier against real git
//! repositories, mirroring the clean-sync and detected-conflict scenarios.

use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

use baboon::merge::verify_all;
use baboon::mirror::ServerMirror;
use baboon::wire::MergeVerdict;

fn git(cwd: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_AUTHOR_NAME", "test")
        .env("GIT_AUTHOR_EMAIL", "test@example.com")
        .env("GIT_COMMITTER_NAME", "test")
        .env("GIT_COMMITTER_EMAIL", "test@example.com")
        .status()
        .expect("failed to run git");
    assert!(status.success(), "git {args:?} failed in {}", cwd.display());
}

/// Builds an `origin` repo with one commit, then clones it twice so both
/// mirrors share history without either ever committing again afterward —
/// matching how the real system never commits on users' mirrors, only
/// rewrites their working trees directly.
fn setup_project(working_dir: &Path, project: &str) -> (ServerMirror, ServerMirror) {
    let origin = working_dir.join("origin");
    fs::create_dir_all(&origin).unwrap();
    git(&origin, &["init", "--quiet", "--initial-branch=main"]);
    fs::write(origin.join("file.txt"), "line1\nline2\nline3\n").unwrap();
    git(&origin, &["add", "."]);
    git(&origin, &["commit", "--quiet", "-m", "initial"]);

    let alice = ServerMirror::new(working_dir, project, "alice@example.com");
    let bob = ServerMirror::new(working_dir, project, "bob@example.com");

    fs::create_dir_all(alice.root().parent().unwrap()).unwrap();
    fs::create_dir_all(bob.root().parent().unwrap()).unwrap();
    git(working_dir, &["clone", "--quiet", origin.to_str().unwrap(), alice.root().to_str().unwrap()]);
    git(working_dir, &["clone", "--quiet", origin.to_str().unwrap(), bob.root().to_str().unwrap()]);

    (alice, bob)
}

#[test]
fn clean_sync_yields_no_conflicts() {
    let tmp = TempDir::new().unwrap();
    let (alice, bob) = setup_project(tmp.path(), "proj");

    let results = verify_all("proj", "alice@example.com", &alice, vec![("bob@example.com".to_string(), bob)]).unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].with_user, "bob@example.com");
    assert_eq!(results[0].verdict, MergeVerdict::Ok);
    assert!(results[0].files.is_empty());
}

#[test]
fn overlapping_edits_are_flagged_as_conflicts() {
    let tmp = TempDir::new().unwrap();
    let (alice, bob) = setup_project(tmp.path(), "proj");

    // Neither side commits; rsync-applied edits just overwrite the
    // working-tree file in place, same as the daemon does in `daemon.rs`.
    fs::write(alice.root().join("file.txt"), "line1\nALICE WAS HERE\nline3\n").unwrap();
    fs::write(bob.root().join("file.txt"), "line1\nbob was here instead\nline3\n").unwrap();

    let results = verify_all("proj", "alice@example.com", &alice, vec![("bob@example.com".to_string(), bob)]).unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].with_user, "bob@example.com");
    assert_eq!(results[0].verdict, MergeVerdict::Conflict);
    assert_eq!(results[0].files, vec!["file.txt".to_string()]);
}

#[test]
fn disjoint_edits_to_different_files_do_not_conflict() {
    let tmp = TempDir::new().unwrap();
    let (alice, bob) = setup_project(tmp.path(), "proj");

    fs::write(alice.root().join("file.txt"), "line1\nALICE WAS HERE\nline3\n").unwrap();
    fs::write(bob.root().join("other.txt"), "unrelated\n").unwrap();

    let results = verify_all("proj", "alice@example.com", &alice, vec![("bob@example.com".to_string(), bob)]).unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].verdict, MergeVerdict::Ok);
    assert!(results[0].files.is_empty());
}

#[test]
fn quarantined_sibling_is_skipped_without_error() {
    let tmp = TempDir::new().unwrap();
    let (alice, bob) = setup_project(tmp.path(), "proj");
    bob.quarantine("corrupt checkout").unwrap();

    fs::write(alice.root().join("file.txt"), "line1\nALICE WAS HERE\nline3\n").unwrap();

    let results = verify_all("proj", "alice@example.com", &alice, vec![("bob@example.com".to_string(), bob)]).unwrap();

    assert!(results.is_empty(), "quarantined sibling must be skipped, not reported Ok");
}
