//! Shared fixtures: throwaway git repositories for integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::process::Command;

/// Run a git command in `dir`, panicking on failure, returning stdout.
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("failed to run git {args:?}: {e}"));
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Run a git command in `dir`, returning whether it succeeded.
pub fn git_ok(dir: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Initialize a repository with a committer identity and signing disabled.
pub fn init_repo(dir: &Path) {
    git(dir, &["init", "--quiet"]);
    git(dir, &["config", "user.name", "Test User"]);
    git(dir, &["config", "user.email", "test@example.com"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
}

/// Write a file, commit it, and return the new commit's full hash.
pub fn commit_file(dir: &Path, name: &str, content: &str, message: &str) -> String {
    std::fs::write(dir.join(name), content).expect("write file");
    git(dir, &["add", "."]);
    git(dir, &["commit", "--quiet", "-m", message]);
    git(dir, &["rev-parse", "HEAD"]).trim().to_string()
}

/// Branch names matching `gctm-backup-*`.
pub fn backup_branches(dir: &Path) -> Vec<String> {
    git(dir, &["branch", "--list", "--format=%(refname:short)", "gctm-backup-*"])
        .lines()
        .map(str::to_string)
        .collect()
}
