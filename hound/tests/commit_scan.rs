//! Commit-replay tests over fixture repositories built with the git CLI.

use githound::dig::scan_repo_history;
use githound::rules::load_default_rules;
use githound::scan;
use std::path::Path;
use std::process::{Command, Stdio};

fn git(root: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .env("GIT_AUTHOR_NAME", "Test")
        .env("GIT_AUTHOR_EMAIL", "test@test.invalid")
        .env("GIT_COMMITTER_NAME", "Test")
        .env("GIT_COMMITTER_EMAIL", "test@test.invalid")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .expect("git not runnable");
    assert!(status.success(), "git {args:?} failed");
}

fn commit_all(root: &Path, message: &str) {
    git(root, &["add", "-A"]);
    git(root, &["commit", "-m", message]);
}

#[test]
fn secrets_in_past_commits_are_found() {
    scan::init_rules(load_default_rules());
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    git(root, &["init", "-q"]);

    std::fs::write(root.join("app.cfg"), "key = placeholder\n").unwrap();
    commit_all(root, "initial");

    // The secret lands in commit two and is scrubbed again in commit three —
    // exactly the case the history replay exists for.
    std::fs::write(root.join("app.cfg"), "key = AKIA1234567890ABCDEF\n").unwrap();
    commit_all(root, "configure deploy key");

    std::fs::write(root.join("app.cfg"), "key = REDACTED\n").unwrap();
    commit_all(root, "remove key");

    let matches = scan_repo_history(root);
    let hit = matches
        .iter()
        .find(|m| m.text == "AKIA1234567890ABCDEF")
        .expect("scrubbed secret should surface from the diff replay");
    assert!(!hit.commit.is_empty(), "commit matches carry their sha");
    assert_eq!(hit.commit.len(), 40);
}

#[test]
fn single_commit_history_yields_no_diffs() {
    scan::init_rules(load_default_rules());
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    git(root, &["init", "-q"]);
    std::fs::write(root.join("only.txt"), "AKIA0987654321FEDCBA\n").unwrap();
    commit_all(root, "only commit");

    // One commit means no pairwise diffs, so the replay finds nothing; the
    // file-walk mode is responsible for the tree itself.
    assert!(scan_repo_history(root).is_empty());
}

#[test]
fn missing_repository_is_empty_not_fatal() {
    scan::init_rules(load_default_rules());
    let dir = tempfile::tempdir().unwrap();
    assert!(scan_repo_history(&dir.path().join("nope")).is_empty());
}
