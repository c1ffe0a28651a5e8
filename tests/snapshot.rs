//! Snapshot lifecycle against real throwaway repositories.

mod common;

use common::{commit_file, git, init_repo};
use gctm::Repo;
use gctm::snapshot::{CreateOptions, Error, RestoreOptions, SnapshotManager};

#[test]
fn restore_rejects_traversal_id_before_touching_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    init_repo(dir);
    commit_file(dir, "f.txt", "one\n", "first");

    let repo = Repo::discover(dir).unwrap();
    let manager = SnapshotManager::new(&repo);

    let err = manager
        .restore("../../../etc/passwd", &RestoreOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::InvalidBackupId(_)));
    assert!(err.to_string().contains("Invalid backup ID format"));

    let err = manager.delete("..\\..\\evil").unwrap_err();
    assert!(err.to_string().contains("Invalid backup ID format"));

    // Validation failed before any snapshot storage was created.
    assert!(!dir.join(".gctm").exists());
}

#[test]
fn snapshot_without_uncommitted_changes_records_branch_and_head() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    init_repo(dir);
    let head = commit_file(dir, "f.txt", "one\n", "first");

    let repo = Repo::discover(dir).unwrap();
    let manager = SnapshotManager::new(&repo);
    let snapshot = manager
        .create(&CreateOptions {
            description: Some("before rewrite".to_string()),
            include_uncommitted: false,
        })
        .unwrap();

    assert_eq!(snapshot.commit_hash, head);
    assert!(snapshot.stash_ref.is_none());
    assert!(!snapshot.has_staged_changes);
    assert!(!snapshot.has_working_changes);

    // Metadata and log dump are on disk.
    assert!(dir.join(".gctm/snapshots").join(format!("{}.json", snapshot.id)).exists());
    assert!(dir.join(".gctm/snapshots").join(&snapshot.id).join("log.json").exists());
}

#[test]
fn snapshot_roundtrip_restores_uncommitted_changes_byte_identical() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    init_repo(dir);
    commit_file(dir, "a.txt", "original a\n", "base a");
    let head = commit_file(dir, "b.txt", "original b\n", "base b");

    // One working-tree edit, one staged edit, one untracked file.
    std::fs::write(dir.join("a.txt"), "edited a, not staged\n").unwrap();
    std::fs::write(dir.join("b.txt"), "edited b, staged\n").unwrap();
    git(dir, &["add", "b.txt"]);
    std::fs::write(dir.join("new.txt"), "brand new\n").unwrap();

    let repo = Repo::discover(dir).unwrap();
    let manager = SnapshotManager::new(&repo);
    let snapshot = manager
        .create(&CreateOptions {
            description: None,
            include_uncommitted: true,
        })
        .unwrap();

    assert_eq!(snapshot.commit_hash, head);
    assert!(snapshot.stash_ref.is_some());
    assert!(snapshot.has_staged_changes);
    assert!(snapshot.has_working_changes);

    // Creation parks the uncommitted work in the stash; the tree is clean.
    assert!(git(dir, &["status", "--porcelain"]).trim().is_empty());
    assert_eq!(
        std::fs::read_to_string(dir.join("a.txt")).unwrap(),
        "original a\n"
    );

    let report = manager
        .restore(&snapshot.id, &RestoreOptions::default())
        .unwrap();
    assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
    assert_eq!(report.commit_hash, head);

    // Byte-identical working tree, staged state included.
    assert_eq!(
        std::fs::read_to_string(dir.join("a.txt")).unwrap(),
        "edited a, not staged\n"
    );
    assert_eq!(
        std::fs::read_to_string(dir.join("b.txt")).unwrap(),
        "edited b, staged\n"
    );
    assert_eq!(
        std::fs::read_to_string(dir.join("new.txt")).unwrap(),
        "brand new\n"
    );
    let staged = git(dir, &["diff", "--cached", "--name-only"]);
    assert!(staged.lines().any(|l| l == "b.txt"), "staged: {staged}");

    // A cleanly applied stash is dropped, not left to pile up.
    assert!(git(dir, &["stash", "list"]).trim().is_empty());
}

#[test]
fn conflicting_stash_apply_warns_and_preserves_the_stash() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    init_repo(dir);
    let c1 = commit_file(dir, "f.txt", "line one\n", "first");

    std::fs::write(dir.join("f.txt"), "line one edited\n").unwrap();
    let repo = Repo::discover(dir).unwrap();
    let manager = SnapshotManager::new(&repo);
    let snapshot = manager
        .create(&CreateOptions {
            description: None,
            include_uncommitted: true,
        })
        .unwrap();

    // Rewrite the same line and retarget the snapshot at the new commit, so
    // the stash no longer applies cleanly.
    let c2 = commit_file(dir, "f.txt", "line one committed\n", "second");
    let meta = dir
        .join(".gctm/snapshots")
        .join(format!("{}.json", snapshot.id));
    let json = std::fs::read_to_string(&meta).unwrap().replace(&c1, &c2);
    std::fs::write(&meta, json).unwrap();

    let report = manager
        .restore(&snapshot.id, &RestoreOptions::default())
        .unwrap();
    let warning = report
        .warnings
        .iter()
        .find(|w| w.contains("conflict"))
        .expect("conflict warning");
    assert!(warning.contains("git stash drop"), "warning: {warning}");

    // The stash entry stays put for manual recovery.
    assert!(!git(dir, &["stash", "list"]).trim().is_empty());
}

#[test]
fn patch_files_restore_changes_when_the_stash_is_gone() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    init_repo(dir);
    commit_file(dir, "a.txt", "alpha\n", "base a");
    commit_file(dir, "b.txt", "beta\n", "base b");

    std::fs::write(dir.join("a.txt"), "alpha working\n").unwrap();
    std::fs::write(dir.join("b.txt"), "beta staged\n").unwrap();
    git(dir, &["add", "b.txt"]);

    let repo = Repo::discover(dir).unwrap();
    let manager = SnapshotManager::new(&repo);
    let snapshot = manager
        .create(&CreateOptions {
            description: None,
            include_uncommitted: true,
        })
        .unwrap();

    // Lose the stash entry and break the recorded handle; only the saved
    // patch files remain.
    git(dir, &["stash", "drop", "--quiet"]);
    let stash = snapshot.stash_ref.clone().unwrap();
    let meta = dir
        .join(".gctm/snapshots")
        .join(format!("{}.json", snapshot.id));
    let json = std::fs::read_to_string(&meta)
        .unwrap()
        .replace(&stash, &"0".repeat(40));
    std::fs::write(&meta, json).unwrap();

    manager
        .restore(&snapshot.id, &RestoreOptions::default())
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(dir.join("a.txt")).unwrap(),
        "alpha working\n"
    );
    assert_eq!(
        std::fs::read_to_string(dir.join("b.txt")).unwrap(),
        "beta staged\n"
    );
    let staged = git(dir, &["diff", "--cached", "--name-only"]);
    assert!(staged.lines().any(|l| l == "b.txt"), "staged: {staged}");
}

#[test]
fn forced_restore_discards_conflicting_edits_across_branches() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    init_repo(dir);
    commit_file(dir, "f.txt", "base\n", "first");
    let trunk = git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).trim().to_string();
    git(dir, &["checkout", "--quiet", "-b", "feature"]);
    commit_file(dir, "f.txt", "feature version\n", "feature change");

    let repo = Repo::discover(dir).unwrap();
    let manager = SnapshotManager::new(&repo);
    let snapshot = manager.create(&CreateOptions::default()).unwrap();

    // A dirty edit on another branch that the checkout back to `feature`
    // would refuse to overwrite.
    git(dir, &["checkout", "--quiet", &trunk]);
    std::fs::write(dir.join("f.txt"), "dirty conflicting edit\n").unwrap();

    let report = manager
        .restore(&snapshot.id, &RestoreOptions { force: true })
        .unwrap();
    assert_eq!(report.branch, "feature");
    assert_eq!(
        git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]).trim(),
        "feature"
    );
    assert_eq!(
        std::fs::read_to_string(dir.join("f.txt")).unwrap(),
        "feature version\n"
    );
}

#[test]
fn restore_refuses_dirty_tree_without_force() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    init_repo(dir);
    commit_file(dir, "f.txt", "one\n", "first");

    let repo = Repo::discover(dir).unwrap();
    let manager = SnapshotManager::new(&repo);
    let snapshot = manager.create(&CreateOptions::default()).unwrap();

    std::fs::write(dir.join("f.txt"), "uncommitted edit\n").unwrap();
    let err = manager
        .restore(&snapshot.id, &RestoreOptions::default())
        .unwrap_err();
    assert!(matches!(err, Error::DirtyTree));
    // The edit is still there.
    assert_eq!(
        std::fs::read_to_string(dir.join("f.txt")).unwrap(),
        "uncommitted edit\n"
    );

    // With force, the restore proceeds and the tree matches the snapshot.
    manager
        .restore(&snapshot.id, &RestoreOptions { force: true })
        .unwrap();
    assert_eq!(std::fs::read_to_string(dir.join("f.txt")).unwrap(), "one\n");
}

#[test]
fn list_is_newest_first_and_skips_corrupt_metadata() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    init_repo(dir);
    commit_file(dir, "f.txt", "one\n", "first");

    let repo = Repo::discover(dir).unwrap();
    let manager = SnapshotManager::new(&repo);
    let first = manager.create(&CreateOptions::default()).unwrap();
    let second = manager.create(&CreateOptions::default()).unwrap();

    // Plant a corrupted metadata file next to the real ones.
    std::fs::write(
        dir.join(".gctm/snapshots/backup-corrupted-entry.json"),
        "{ not json",
    )
    .unwrap();

    let listed = manager.list().unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id, second.id);
    assert_eq!(listed[1].id, first.id);
}

#[test]
fn cleanup_applies_count_retention() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    init_repo(dir);
    commit_file(dir, "f.txt", "one\n", "first");

    let repo = Repo::discover(dir).unwrap();
    let manager = SnapshotManager::new(&repo);
    for _ in 0..3 {
        manager.create(&CreateOptions::default()).unwrap();
    }

    let deleted = manager.cleanup(Some(1), None).unwrap();
    assert_eq!(deleted.len(), 2);
    assert_eq!(manager.list().unwrap().len(), 1);
}

#[test]
fn delete_unknown_snapshot_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    init_repo(dir);
    commit_file(dir, "f.txt", "one\n", "first");

    let repo = Repo::discover(dir).unwrap();
    let manager = SnapshotManager::new(&repo);
    let err = manager.delete("backup-never-created").unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
