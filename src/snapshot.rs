//! Recovery points for protected operations.
//!
//! A snapshot records the current branch and commit, and optionally captures
//! uncommitted changes as patch files plus a git stash. Metadata is one JSON
//! file per snapshot under `.gctm/snapshots/` in the repository root, written
//! synchronously before any destructive step relies on it.
//!
//! The stash handle recorded at creation time is the *commit hash* of the
//! stash entry, not its positional `stash@{N}` name. Positions shift as new
//! stashes are pushed; the hash does not.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::process::Repo;
use crate::validate::{is_valid_backup_id, is_valid_hash};

const SNAPSHOT_SUBDIR: &str = ".gctm/snapshots";

/// How many log entries are dumped alongside each snapshot.
const LOG_DUMP_LIMIT: usize = 200;

/// Metadata for one recovery point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub description: String,
    pub branch: String,
    pub commit_hash: String,
    /// Commit hash of the stash entry capturing uncommitted changes, if any.
    pub stash_ref: Option<String>,
    pub has_staged_changes: bool,
    pub has_working_changes: bool,
}

/// Options for [`SnapshotManager::create`].
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub description: Option<String>,
    /// Capture staged and working-tree changes (patches + stash). The
    /// working tree is left clean afterwards; `restore` brings the changes
    /// back.
    pub include_uncommitted: bool,
}

/// Options for [`SnapshotManager::restore`].
#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Discard uncommitted changes in the current tree instead of refusing.
    pub force: bool,
}

/// Outcome of a restore. `warnings` carries conditions that need manual
/// follow-up, like a stash that applied with conflicts.
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub branch: String,
    pub commit_hash: String,
    pub warnings: Vec<String>,
}

/// Creates, lists, restores and deletes snapshots for one repository.
pub struct SnapshotManager<'a> {
    repo: &'a Repo,
    dir: PathBuf,
}

impl<'a> SnapshotManager<'a> {
    pub fn new(repo: &'a Repo) -> Self {
        let dir = repo.root().join(SNAPSHOT_SUBDIR);
        Self { repo, dir }
    }

    /// Create a recovery point for the current repository state.
    pub fn create(&self, opts: &CreateOptions) -> Result<Snapshot, Error> {
        let id = generate_id();
        debug_assert!(is_valid_backup_id(&id));

        let branch = self.repo.current_branch()?;
        let commit_hash = self.repo.head_hash()?;
        let status = self.repo.status_porcelain()?;
        let (has_staged_changes, has_working_changes) = classify_status(&status);

        self.ensure_storage()?;
        let snapshot_dir = self.dir.join(&id);
        fs::create_dir_all(&snapshot_dir).map_err(|source| Error::Io {
            path: snapshot_dir.display().to_string(),
            source,
        })?;

        let mut stash_ref = None;
        if opts.include_uncommitted && (has_staged_changes || has_working_changes) {
            self.write_patches(&snapshot_dir)?;
            stash_ref = Some(self.push_stash(&id)?);
        }
        self.write_log_dump(&snapshot_dir)?;

        let snapshot = Snapshot {
            id: id.clone(),
            created_at: Utc::now(),
            description: opts
                .description
                .clone()
                .unwrap_or_else(|| "manual snapshot".to_string()),
            branch,
            commit_hash,
            stash_ref,
            has_staged_changes,
            has_working_changes,
        };

        let meta_path = self.metadata_path(&id);
        let json = serde_json::to_string_pretty(&snapshot).map_err(|source| Error::Metadata {
            id: id.clone(),
            source,
        })?;
        fs::write(&meta_path, json).map_err(|source| Error::Io {
            path: meta_path.display().to_string(),
            source,
        })?;

        info!(id = %snapshot.id, branch = %snapshot.branch, "snapshot created");
        Ok(snapshot)
    }

    /// Restore the repository to a recovery point.
    ///
    /// Refuses to run over uncommitted changes unless `force` is set. A stash
    /// that applies cleanly is dropped afterwards; one that applies with
    /// conflicts is reported as a warning and never discarded.
    pub fn restore(&self, id: &str, opts: &RestoreOptions) -> Result<RestoreReport, Error> {
        let snapshot = self.load(id)?;

        let status = self.repo.status_porcelain()?;
        if !status.trim().is_empty() {
            if !opts.force {
                return Err(Error::DirtyTree);
            }
            // Forced: discard local edits now, or a branch checkout below
            // would refuse over files it needs to overwrite.
            self.repo.reset_hard("HEAD")?;
        }

        if snapshot.branch != "HEAD" {
            if self.repo.ref_exists(&snapshot.branch) {
                self.repo.checkout(&snapshot.branch)?;
            } else {
                self.repo
                    .checkout_new_branch(&snapshot.branch, &snapshot.commit_hash)?;
            }
        }
        self.repo.reset_hard(&snapshot.commit_hash)?;

        let mut warnings = Vec::new();
        if snapshot.stash_ref.is_some() || snapshot.has_staged_changes || snapshot.has_working_changes
        {
            self.restore_uncommitted(&snapshot, &mut warnings)?;
        }

        info!(id = %snapshot.id, commit = %snapshot.commit_hash, "snapshot restored");
        Ok(RestoreReport {
            branch: snapshot.branch,
            commit_hash: snapshot.commit_hash,
            warnings,
        })
    }

    /// All snapshots, newest first. Corrupted metadata files are skipped
    /// with a warning rather than failing the whole listing.
    pub fn list(&self) -> Result<Vec<Snapshot>, Error> {
        let mut snapshots = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(snapshots),
            Err(source) => {
                return Err(Error::Io {
                    path: self.dir.display().to_string(),
                    source,
                });
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable snapshot metadata");
                    continue;
                }
            };
            match serde_json::from_str::<Snapshot>(&content) {
                Ok(snapshot) if is_valid_backup_id(&snapshot.id) => snapshots.push(snapshot),
                Ok(snapshot) => {
                    warn!(id = %snapshot.id, "skipping snapshot with malformed id");
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping corrupted snapshot metadata");
                }
            }
        }

        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(snapshots)
    }

    /// Delete a snapshot's metadata and payload directory.
    pub fn delete(&self, id: &str) -> Result<(), Error> {
        if !is_valid_backup_id(id) {
            return Err(Error::InvalidBackupId(id.to_string()));
        }

        let meta = self.metadata_path(id);
        let payload = self.dir.join(id);
        if !meta.exists() && !payload.exists() {
            return Err(Error::NotFound(id.to_string()));
        }
        if meta.exists() {
            fs::remove_file(&meta).map_err(|source| Error::Io {
                path: meta.display().to_string(),
                source,
            })?;
        }
        if payload.exists() {
            fs::remove_dir_all(&payload).map_err(|source| Error::Io {
                path: payload.display().to_string(),
                source,
            })?;
        }
        info!(id, "snapshot deleted");
        Ok(())
    }

    /// Retention pass: keep the newest `keep_last` snapshots and drop
    /// anything older than `max_age`. Returns the ids that were deleted.
    pub fn cleanup(
        &self,
        keep_last: Option<usize>,
        max_age: Option<Duration>,
    ) -> Result<Vec<String>, Error> {
        let snapshots = self.list()?;
        let now = Utc::now();
        let mut deleted = Vec::new();

        for (index, snapshot) in snapshots.iter().enumerate() {
            let past_count = keep_last.is_some_and(|keep| index >= keep);
            let past_age = max_age.is_some_and(|max| {
                let age = now.signed_duration_since(snapshot.created_at);
                age.num_seconds() >= 0 && age.num_seconds() as u64 > max.as_secs()
            });
            if past_count || past_age {
                self.delete(&snapshot.id)?;
                deleted.push(snapshot.id.clone());
            }
        }
        Ok(deleted)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    /// Create the storage root and keep it out of git's view, so snapshots
    /// never show up as untracked files or end up inside a stash.
    fn ensure_storage(&self) -> Result<(), Error> {
        let base = self.repo.root().join(".gctm");
        fs::create_dir_all(&base).map_err(|source| Error::Io {
            path: base.display().to_string(),
            source,
        })?;
        let ignore = base.join(".gitignore");
        if !ignore.exists() {
            fs::write(&ignore, "*\n").map_err(|source| Error::Io {
                path: ignore.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    fn load(&self, id: &str) -> Result<Snapshot, Error> {
        // The id becomes a path component; reject anything suspicious before
        // any filesystem access.
        if !is_valid_backup_id(id) {
            return Err(Error::InvalidBackupId(id.to_string()));
        }
        let path = self.metadata_path(id);
        let content = fs::read_to_string(&path).map_err(|_| Error::NotFound(id.to_string()))?;
        serde_json::from_str(&content).map_err(|source| Error::Metadata {
            id: id.to_string(),
            source,
        })
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn write_patches(&self, snapshot_dir: &std::path::Path) -> Result<(), Error> {
        let staged = self.repo.run(&["diff", "--cached"])?;
        if staged.success() && !staged.stdout.is_empty() {
            let path = snapshot_dir.join("staged.patch");
            fs::write(&path, &staged.stdout).map_err(|source| Error::Io {
                path: path.display().to_string(),
                source,
            })?;
        }
        let working = self.repo.run(&["diff"])?;
        if working.success() && !working.stdout.is_empty() {
            let path = snapshot_dir.join("working.patch");
            fs::write(&path, &working.stdout).map_err(|source| Error::Io {
                path: path.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }

    fn write_log_dump(&self, snapshot_dir: &std::path::Path) -> Result<(), Error> {
        let entries = self.repo.log_entries(LOG_DUMP_LIMIT)?;
        let path = snapshot_dir.join("log.json");
        let json = serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_string());
        fs::write(&path, json).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Stash uncommitted changes and return the stash entry's commit hash.
    fn push_stash(&self, id: &str) -> Result<String, Error> {
        let message = format!("gctm snapshot {id}");
        let out = self
            .repo
            .run(&["stash", "push", "--include-untracked", "-m", &message])?;
        if !out.success() {
            return Err(Error::Stash(out.stderr.trim().to_string()));
        }
        // Resolve the exact handle immediately; stash@{0} is only reliable
        // right now, before anything else is pushed.
        let resolved = self.repo.run(&["rev-parse", "stash@{0}"])?;
        if !resolved.success() {
            return Err(Error::Stash(resolved.stderr.trim().to_string()));
        }
        Ok(resolved.trimmed().to_string())
    }

    fn restore_uncommitted(
        &self,
        snapshot: &Snapshot,
        warnings: &mut Vec<String>,
    ) -> Result<(), Error> {
        // Tier 1: the exact stash hash captured at creation time.
        if let Some(stash) = &snapshot.stash_ref {
            match self.apply_stash(stash)? {
                StashApply::Applied => {
                    self.drop_stash(stash, warnings);
                    return Ok(());
                }
                StashApply::Conflict => {
                    warnings.push(conflict_warning(stash));
                    return Ok(());
                }
                StashApply::NotFound => {}
            }
        }

        // Tier 2: scan the stash list for an entry carrying the snapshot id.
        if let Some(positional) = self.find_stash_by_message(&snapshot.id)? {
            match self.apply_stash(&positional)? {
                StashApply::Applied => {
                    self.drop_stash(&positional, warnings);
                    return Ok(());
                }
                StashApply::Conflict => {
                    warnings.push(conflict_warning(&positional));
                    return Ok(());
                }
                StashApply::NotFound => {}
            }
        }

        // Tier 3: the saved patch files.
        let snapshot_dir = self.dir.join(&snapshot.id);
        let mut any_applied = false;
        let staged = snapshot_dir.join("staged.patch");
        if staged.exists() {
            let path = staged.display().to_string();
            let out = self.repo.run(&["apply", "--index", &path])?;
            if out.success() {
                any_applied = true;
            } else {
                warnings.push(format!(
                    "staged patch did not apply cleanly: {}",
                    out.stderr.trim()
                ));
            }
        }
        let working = snapshot_dir.join("working.patch");
        if working.exists() {
            let path = working.display().to_string();
            let out = self.repo.run(&["apply", &path])?;
            if out.success() {
                any_applied = true;
            } else {
                warnings.push(format!(
                    "working patch did not apply cleanly: {}",
                    out.stderr.trim()
                ));
            }
        }

        if !any_applied && (snapshot.has_staged_changes || snapshot.has_working_changes) {
            warnings.push(format!(
                "uncommitted changes recorded with snapshot '{}' could not be restored; \
                 inspect `git stash list` and the patch files under {}",
                snapshot.id,
                snapshot_dir.display()
            ));
        }
        Ok(())
    }

    fn apply_stash(&self, stash: &str) -> Result<StashApply, Error> {
        // `stash` comes from on-disk metadata or stash-list output: accept
        // only a commit hash or a positional stash name.
        if !is_valid_hash(stash) && !is_stash_position(stash) {
            return Ok(StashApply::NotFound);
        }
        let out = self.repo.run(&["stash", "apply", "--index", stash])?;
        if out.success() {
            return Ok(StashApply::Applied);
        }
        let combined = format!("{}\n{}", out.stdout, out.stderr);
        if combined.contains("CONFLICT") || combined.contains("conflict") {
            return Ok(StashApply::Conflict);
        }
        // Plain `apply` succeeds where `--index` cannot reinstate the index.
        let out = self.repo.run(&["stash", "apply", stash])?;
        if out.success() {
            return Ok(StashApply::Applied);
        }
        let combined = format!("{}\n{}", out.stdout, out.stderr);
        if combined.contains("CONFLICT") || combined.contains("conflict") {
            return Ok(StashApply::Conflict);
        }
        Ok(StashApply::NotFound)
    }

    /// Drop a stash entry after a clean apply, so restored snapshots do not
    /// pile up in `git stash list`. Best effort; a leftover entry is
    /// reported, never fatal.
    fn drop_stash(&self, handle: &str, warnings: &mut Vec<String>) {
        let position = if is_stash_position(handle) {
            Some(handle.to_string())
        } else {
            // `stash drop` wants a positional name, not a commit hash.
            self.find_stash_by_hash(handle)
        };
        let Some(position) = position else {
            warnings.push(format!(
                "applied stash {handle} but could not locate it in the stash list; \
                 drop it manually with `git stash drop`"
            ));
            return;
        };
        match self.repo.run(&["stash", "drop", &position]) {
            Ok(out) if out.success() => {}
            _ => warnings.push(format!(
                "applied stash {handle} but could not drop it; remove it with \
                 `git stash drop {position}`"
            )),
        }
    }

    fn find_stash_by_hash(&self, hash: &str) -> Option<String> {
        let out = self.repo.run(&["stash", "list", "--format=%gd\x1f%H"]).ok()?;
        if !out.success() {
            return None;
        }
        for line in out.stdout.lines() {
            let mut parts = line.split('\x1f');
            if let (Some(position), Some(h)) = (parts.next(), parts.next()) {
                if h == hash {
                    return Some(position.to_string());
                }
            }
        }
        None
    }

    fn find_stash_by_message(&self, id: &str) -> Result<Option<String>, Error> {
        let out = self.repo.run(&["stash", "list", "--format=%gd\x1f%gs"])?;
        if !out.success() {
            return Ok(None);
        }
        for line in out.stdout.lines() {
            let mut parts = line.split('\x1f');
            let (Some(position), Some(message)) = (parts.next(), parts.next()) else {
                continue;
            };
            if message.contains(id) {
                return Ok(Some(position.to_string()));
            }
        }
        Ok(None)
    }
}

enum StashApply {
    Applied,
    Conflict,
    NotFound,
}

fn is_stash_position(s: &str) -> bool {
    s.strip_prefix("stash@{")
        .and_then(|rest| rest.strip_suffix('}'))
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

fn conflict_warning(stash: &str) -> String {
    format!(
        "stash {stash} applied with conflicts; resolve them manually, then run \
         `git stash drop {stash}` once the changes are recovered"
    )
}

/// Generate a fresh snapshot id: `backup-<ISO8601 with dashes>-<hex suffix>`.
fn generate_id() -> String {
    let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S");
    let suffix: u16 = rand::random();
    format!("backup-{stamp}-{suffix:04x}")
}

/// Interpret `git status --porcelain` into (staged, working) change flags.
fn classify_status(status: &str) -> (bool, bool) {
    let mut staged = false;
    let mut working = false;
    for line in status.lines() {
        let mut chars = line.chars();
        let x = chars.next().unwrap_or(' ');
        let y = chars.next().unwrap_or(' ');
        if x == '?' {
            working = true;
            continue;
        }
        if x != ' ' {
            staged = true;
        }
        if y != ' ' {
            working = true;
        }
    }
    (staged, working)
}

/// Errors from snapshot operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid backup ID format: '{0}'")]
    InvalidBackupId(String),

    #[error("snapshot '{0}' not found")]
    NotFound(String),

    #[error("uncommitted changes present; pass force to overwrite them")]
    DirtyTree,

    #[error("failed to stash uncommitted changes: {0}")]
    Stash(String),

    #[error("snapshot storage error at '{path}'")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot metadata for '{id}' is corrupted")]
    Metadata {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Git(#[from] crate::process::Error),
}
