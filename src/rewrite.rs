//! The transactional history-rewrite engine.
//!
//! Both mutating operations follow the same outer protocol: create an
//! ephemeral backup branch, walk the target commits rebuilding history, and
//! on success delete the backup. A run-fatal error (failing to create the
//! backup or to retrieve the commit list) resets the working branch back to
//! the backup and preserves it for manual inspection.
//!
//! Per-commit mechanics: the earliest affected commit is rewritten in place
//! with `reset --hard` + `commit --amend`; every later commit is replayed
//! onto the rebuilt tip with its dates carried through the environment, since
//! amending an ancestor invalidates the recorded parents of everything above
//! it. Failures before the branch moves are logged and skipped; a failure
//! while replaying is fatal, because a skipped replay would drop that commit
//! from the rebuilt history.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, Utc};
use tracing::{debug, info, warn};

use crate::process::Repo;
use crate::sanitize::{self, ReplacementRule};
use crate::validate::{is_valid_branch_name, is_valid_hash, is_valid_path};

/// Prefix for ephemeral undo-anchor branches.
const BACKUP_BRANCH_PREFIX: &str = "gctm-backup";

/// Prefix for ephemeral scratch directories used during content rewrites.
const TEMP_DIR_PREFIX: &str = ".gctm-temp";

/// Commit-count threshold above which a full-history rewrite warns.
pub const DEFAULT_WARN_THRESHOLD: usize = 10_000;

/// One commit to rewrite: a (possibly abbreviated) hash plus the new
/// metadata to stamp onto it.
#[derive(Debug, Clone)]
pub struct CommitRef {
    pub hash: String,
    pub new_date: Option<DateTime<FixedOffset>>,
    pub new_message: Option<String>,
}

impl CommitRef {
    pub fn new(hash: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            new_date: None,
            new_message: None,
        }
    }

    pub fn with_date(mut self, date: DateTime<FixedOffset>) -> Self {
        self.new_date = Some(date);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.new_message = Some(message.into());
        self
    }
}

/// Structured outcome of every mutating operation.
///
/// `processed` counts commits that were successfully rewritten before any
/// engine-triggered rollback; callers must check `success` and inspect
/// `warnings` for partial-success conditions.
#[derive(Debug, Clone)]
pub struct RewriteResult {
    pub success: bool,
    pub processed: usize,
    pub total: usize,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

impl RewriteResult {
    fn ok(processed: usize, total: usize, warnings: Vec<String>) -> Self {
        Self {
            success: true,
            processed,
            total,
            error: None,
            warnings,
        }
    }
}

/// Tunables for a rewrite run.
#[derive(Debug, Clone)]
pub struct RewriteOptions {
    /// Only consider the most recent N commits during content replacement.
    pub commit_limit: Option<usize>,
    /// Warn (but proceed) when the commit list exceeds this many entries.
    pub warn_threshold: usize,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            commit_limit: None,
            warn_threshold: DEFAULT_WARN_THRESHOLD,
        }
    }
}

/// Rewrites committed history for a single repository.
///
/// Runs are strictly synchronous and assume exclusive access to the
/// repository; callers must serialize concurrent invocations themselves.
pub struct HistoryRewriter<'a> {
    repo: &'a Repo,
    options: RewriteOptions,
}

impl<'a> HistoryRewriter<'a> {
    pub fn new(repo: &'a Repo) -> Self {
        Self {
            repo,
            options: RewriteOptions::default(),
        }
    }

    pub fn with_options(repo: &'a Repo, options: RewriteOptions) -> Self {
        Self { repo, options }
    }

    /// Re-stamp author and committer dates (and optionally messages) on the
    /// given commits.
    ///
    /// The caller-supplied order is reversed internally so processing starts
    /// from the earliest affected commit. A bad hash or a failed base amend
    /// skips that commit and continues; a failed replay (a merge commit, or
    /// a pick that conflicts) aborts the run and rolls back, since the
    /// commit would otherwise vanish from the rebuilt history.
    pub fn change_dates(&self, commits: &[CommitRef]) -> RewriteResult {
        let total = commits.len();
        if total == 0 {
            return RewriteResult::ok(0, 0, Vec::new());
        }

        self.with_backup(total, |backup| {
            let mut warnings = Vec::new();
            let mut processed = 0usize;

            // Oldest first; drop invalid hashes up front so they can never
            // reach an argument vector.
            let mut targets: Vec<&CommitRef> = Vec::new();
            for commit in commits.iter().rev() {
                if is_valid_hash(&commit.hash) {
                    targets.push(commit);
                } else {
                    warn!(hash = %commit.hash, "skipping commit with invalid hash");
                    warnings.push(format!("invalid commit hash '{}' skipped", commit.hash));
                }
            }

            // Rewrite the earliest reachable target in place.
            let mut iter = targets.into_iter().peekable();
            let mut base = None;
            while let Some(target) = iter.next() {
                match self.rewrite_base(target) {
                    Ok(()) => {
                        processed += 1;
                        base = Some(target.hash.clone());
                        break;
                    }
                    Err(e) => {
                        warn!(hash = %target.hash, error = %e, "could not rewrite commit, skipping");
                        warnings.push(format!("commit {}: {e}", target.hash));
                    }
                }
            }
            let Some(base) = base else {
                // Nothing was reachable; the branch is untouched.
                return Ok(RewriteResult::ok(processed, total, warnings));
            };

            let remaining: Vec<&CommitRef> = iter.collect();

            // Replay everything above the rewritten base, re-stamping the
            // commits named in the plan and carrying original dates for the
            // rest.
            let chain = self
                .repo
                .rev_list_range(&base, backup)
                .map_err(|e| Fatal::new(format!("failed to list commits above {base}: {e}"), processed, total, warnings.clone()))?;

            for original in &chain {
                let target = remaining
                    .iter()
                    .find(|t| original.starts_with(&t.hash.to_lowercase()));
                let outcome = match target {
                    Some(t) => self.replay_target(original, t),
                    None => self.replay_unchanged(original),
                };
                match outcome {
                    Ok(()) => {
                        if target.is_some() {
                            processed += 1;
                        }
                    }
                    // Skipping here would drop the commit from the rebuilt
                    // history entirely. Abort and roll back instead.
                    Err(e) => {
                        return Err(Fatal::new(
                            format!("could not replay commit {original}: {e}"),
                            processed,
                            total,
                            warnings.clone(),
                        ));
                    }
                }
            }

            info!(processed, total, "date rewrite finished");
            Ok(RewriteResult::ok(processed, total, warnings))
        })
    }

    /// Rewrite file content across history according to the replacement
    /// rules, amending only commits whose trees actually match.
    ///
    /// Commits below the earliest match keep their hashes. Scan and amend
    /// errors are logged and skipped; a failed replay aborts and rolls back,
    /// as does backup-branch or commit-list acquisition failure.
    pub fn replace_content(&self, rules: &[ReplacementRule]) -> RewriteResult {
        if rules.is_empty() {
            // Fail fast, before any subprocess or branch is touched.
            return RewriteResult {
                success: false,
                processed: 0,
                total: 0,
                error: Some("at least one replacement rule is required".to_string()),
                warnings: Vec::new(),
            };
        }

        self.with_backup(0, |backup| {
            let mut warnings = Vec::new();
            let mut processed = 0usize;

            let newest_first = self
                .repo
                .rev_list(self.options.commit_limit)
                .map_err(|e| Fatal::new(format!("failed to list commits: {e}"), 0, 0, Vec::new()))?;
            let total = newest_first.len();
            if total > self.options.warn_threshold {
                warnings.push(format!(
                    "history has {total} commits (threshold {}); this run may take a while",
                    self.options.warn_threshold
                ));
                warn!(total, "large history, proceeding anyway");
            }

            let mut oldest_first = newest_first;
            oldest_first.reverse();

            // Find the earliest commit whose tree matches any rule; history
            // below it is left untouched. `git grep` pre-filters literal
            // needles without moving the branch; regex rules use our own
            // engine, which means resetting onto each commit to scan it.
            let literal_only = rules.iter().all(ReplacementRule::is_literal);
            let mut first_match = None;
            for (index, hash) in oldest_first.iter().enumerate() {
                let scanned = if literal_only {
                    self.commit_matches(hash, rules)
                } else {
                    self.repo
                        .reset_hard(hash)
                        .and_then(|()| self.checkout_matches(rules))
                };
                match scanned {
                    Ok(true) => {
                        first_match = Some(index);
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        warn!(hash = %hash, error = %e, "could not scan commit, skipping");
                        warnings.push(format!("commit {hash}: {e}"));
                    }
                }
            }
            let Some(start) = first_match else {
                debug!("no commit matches any rule; nothing to do");
                if !literal_only {
                    // The scan moved the branch; put it back before the
                    // backup is cleaned up.
                    self.repo.reset_hard(backup).map_err(|e| {
                        Fatal::new(
                            format!("failed to reset back to {backup}: {e}"),
                            0,
                            total,
                            warnings.clone(),
                        )
                    })?;
                }
                return Ok(RewriteResult::ok(0, total, warnings));
            };

            let scratch = TempWorkdir::create(self.repo.root()).map_err(|e| {
                Fatal::new(
                    format!("failed to create scratch directory: {e}"),
                    0,
                    total,
                    warnings.clone(),
                )
            })?;

            // Rewrite the first matching commit in place, then replay and
            // re-sanitize everything above it.
            let base = &oldest_first[start];
            self.repo.reset_hard(base).map_err(|e| {
                Fatal::new(
                    format!("failed to reset to {base}: {e}"),
                    0,
                    total,
                    warnings.clone(),
                )
            })?;
            match self.sanitize_checkout(rules, &scratch, &mut warnings) {
                Ok(true) => {
                    let committer = self.head_committer_date(base, &mut warnings);
                    if let Err(e) = self.amend_in_place(&committer) {
                        warn!(hash = %base, error = %e, "amend failed, skipping");
                        warnings.push(format!("commit {base}: {e}"));
                    } else {
                        processed += 1;
                    }
                }
                Ok(false) => {}
                Err(e) => warnings.push(format!("commit {base}: {e}")),
            }

            for original in &oldest_first[start + 1..] {
                // Skipping a failed replay would drop the commit from the
                // rebuilt history entirely. Abort and roll back instead.
                if let Err(e) = self.replay_unchanged(original) {
                    return Err(Fatal::new(
                        format!("could not replay commit {original}: {e}"),
                        processed,
                        total,
                        warnings.clone(),
                    ));
                }
                match self.sanitize_checkout(rules, &scratch, &mut warnings) {
                    Ok(true) => {
                        let committer = self.head_committer_date(original, &mut warnings);
                        if let Err(e) = self.amend_in_place(&committer) {
                            warn!(hash = %original, error = %e, "amend failed, skipping");
                            warnings.push(format!("commit {original}: {e}"));
                        } else {
                            processed += 1;
                        }
                    }
                    Ok(false) => {}
                    Err(e) => warnings.push(format!("commit {original}: {e}")),
                }
            }

            drop(scratch);
            info!(processed, total, "content rewrite finished");
            Ok(RewriteResult::ok(processed, total, warnings))
        })
    }

    // -------------------------------------------------------------------------
    // Outer protocol
    // -------------------------------------------------------------------------

    /// Run `f` under the backup-branch protocol: the backup is deleted on
    /// success and preserved (after resetting back to it) on a fatal error.
    fn with_backup<F>(&self, total: usize, f: F) -> RewriteResult
    where
        F: FnOnce(&str) -> Result<RewriteResult, Fatal>,
    {
        let backup = match self.create_backup_branch() {
            Ok(name) => name,
            Err(e) => {
                return RewriteResult {
                    success: false,
                    processed: 0,
                    total,
                    error: Some(format!("failed to create backup branch: {e}")),
                    warnings: Vec::new(),
                };
            }
        };
        info!(branch = %backup, "created backup branch");

        match f(&backup) {
            Ok(mut result) => {
                if let Err(e) = self.repo.delete_branch(&backup) {
                    result
                        .warnings
                        .push(format!("could not delete backup branch {backup}: {e}"));
                }
                result
            }
            Err(fatal) => {
                let mut warnings = fatal.warnings;
                if let Err(e) = self.repo.reset_hard(&backup) {
                    warnings.push(format!(
                        "rollback to {backup} failed ({e}); recover manually with \
                         `git reset --hard {backup}`"
                    ));
                } else {
                    warnings.push(format!(
                        "rolled back; backup branch {backup} preserved for inspection"
                    ));
                }
                warn!(error = %fatal.error, branch = %backup, "run aborted, backup preserved");
                RewriteResult {
                    success: false,
                    processed: fatal.processed,
                    total: if total == 0 { fatal.total } else { total },
                    error: Some(fatal.error),
                    warnings,
                }
            }
        }
    }

    fn create_backup_branch(&self) -> Result<String, crate::process::Error> {
        let name = format!("{BACKUP_BRANCH_PREFIX}-{}", Utc::now().timestamp_millis());
        debug_assert!(is_valid_branch_name(&name));
        self.repo.create_branch(&name, "HEAD")?;
        Ok(name)
    }

    // -------------------------------------------------------------------------
    // Per-commit steps
    // -------------------------------------------------------------------------

    /// Move the branch onto `target` and amend it in place with its new
    /// metadata.
    fn rewrite_base(&self, target: &CommitRef) -> Result<(), crate::process::Error> {
        self.repo.reset_hard(&target.hash)?;
        let (date_flag, env) = date_env(target);
        self.repo
            .amend(&env, date_flag.as_deref(), target.new_message.as_deref())
    }

    /// Cherry-pick a plan commit onto the tip, then amend its dates/message.
    fn replay_target(
        &self,
        original: &str,
        target: &CommitRef,
    ) -> Result<(), crate::process::Error> {
        let (date_flag, env) = date_env(target);
        self.repo.cherry_pick(original, &env)?;
        self.repo
            .amend(&env, date_flag.as_deref(), target.new_message.as_deref())
    }

    /// Cherry-pick a commit onto the tip preserving its committer date.
    fn replay_unchanged(&self, original: &str) -> Result<(), crate::process::Error> {
        let (_, committer) = self.repo.commit_dates(original)?;
        let env = vec![("GIT_COMMITTER_DATE".to_string(), committer)];
        self.repo.cherry_pick(original, &env)
    }

    /// Check whether any rule's needle appears in the tree of `hash`.
    fn commit_matches(
        &self,
        hash: &str,
        rules: &[ReplacementRule],
    ) -> Result<bool, crate::process::Error> {
        for rule in rules {
            let paths = self
                .repo
                .grep_paths_at(hash, rule.needle(), rule.is_literal())?;
            if !paths.is_empty() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Apply the rules to every matching file at the current checkout.
    /// Returns whether anything changed.
    fn sanitize_checkout(
        &self,
        rules: &[ReplacementRule],
        scratch: &TempWorkdir,
        warnings: &mut Vec<String>,
    ) -> Result<bool, crate::process::Error> {
        // Literal needles narrow the candidate set via `git grep`; any regex
        // rule widens it to every tracked file, scanned with our own engine.
        let mut candidates: Vec<String> = Vec::new();
        if rules.iter().all(ReplacementRule::is_literal) {
            for rule in rules {
                for path in self.repo.grep_paths(rule.needle(), true)? {
                    if !candidates.contains(&path) {
                        candidates.push(path);
                    }
                }
            }
        } else {
            candidates = self.repo.tracked_files()?;
        }

        let mut changed = false;
        for rel in candidates {
            if !is_valid_path(&rel) {
                warnings.push(format!("suspicious path '{rel}' left untouched"));
                continue;
            }
            let full = self.repo.root().join(&rel);
            let content = match fs::read_to_string(&full) {
                Ok(c) => c,
                Err(e) => {
                    debug!(path = %rel, error = %e, "skipping unreadable file");
                    continue;
                }
            };
            let outcome = sanitize::apply(&content, rules);
            if outcome.applied == 0 {
                continue;
            }
            if let Err(e) = scratch.stage_write(&full, &outcome.content) {
                warnings.push(format!("could not rewrite '{rel}': {e}"));
                continue;
            }
            debug!(path = %rel, replaced = outcome.applied, "sanitized file");
            changed = true;
        }
        Ok(changed)
    }

    /// Check whether any tracked file at the current checkout matches a rule.
    fn checkout_matches(
        &self,
        rules: &[ReplacementRule],
    ) -> Result<bool, crate::process::Error> {
        for rel in self.repo.tracked_files()? {
            if !is_valid_path(&rel) {
                continue;
            }
            let Ok(content) = fs::read_to_string(self.repo.root().join(&rel)) else {
                continue;
            };
            for rule in rules {
                let hit = match &rule.pattern {
                    crate::sanitize::Pattern::Literal(needle) => content.contains(needle.as_str()),
                    crate::sanitize::Pattern::Regex(re) => re.is_match(&content),
                };
                if hit {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Committer date of `HEAD`, or empty (amend falls back to the current
    /// time) with a warning when it cannot be read.
    fn head_committer_date(&self, label: &str, warnings: &mut Vec<String>) -> String {
        match self.repo.commit_dates("HEAD") {
            Ok((_, committer)) => committer,
            Err(e) => {
                warnings.push(format!("commit {label}: could not read committer date: {e}"));
                String::new()
            }
        }
    }

    /// Stage the sanitized tree and amend `HEAD`, keeping its committer date.
    fn amend_in_place(&self, committer_date: &str) -> Result<(), crate::process::Error> {
        self.repo.add_all()?;
        let env = if committer_date.is_empty() {
            Vec::new()
        } else {
            vec![("GIT_COMMITTER_DATE".to_string(), committer_date.to_string())]
        };
        self.repo.amend(&env, None, None)
    }
}

/// Date flag plus environment for stamping a plan commit.
fn date_env(target: &CommitRef) -> (Option<String>, Vec<(String, String)>) {
    match &target.new_date {
        Some(date) => {
            let stamp = date.to_rfc3339();
            (
                Some(stamp.clone()),
                vec![
                    ("GIT_AUTHOR_DATE".to_string(), stamp.clone()),
                    ("GIT_COMMITTER_DATE".to_string(), stamp),
                ],
            )
        }
        None => (None, Vec::new()),
    }
}

/// A run-fatal error carrying the partial progress made before it.
struct Fatal {
    error: String,
    processed: usize,
    total: usize,
    warnings: Vec<String>,
}

impl Fatal {
    fn new(error: String, processed: usize, total: usize, warnings: Vec<String>) -> Self {
        Self {
            error,
            processed,
            total,
            warnings,
        }
    }
}

/// Scratch directory for staged file rewrites, removed on drop regardless of
/// how the run ends.
struct TempWorkdir {
    path: PathBuf,
    counter: std::cell::Cell<usize>,
}

impl TempWorkdir {
    fn create(root: &Path) -> std::io::Result<Self> {
        let path = root.join(format!("{TEMP_DIR_PREFIX}-{}", Utc::now().timestamp_millis()));
        fs::create_dir_all(&path)?;
        // Keep scratch files invisible to `git add .` during the run.
        fs::write(path.join(".gitignore"), "*\n")?;
        Ok(Self {
            path,
            counter: std::cell::Cell::new(0),
        })
    }

    /// Write `content` to a scratch file, then move it over `target` so the
    /// target is never left half-written.
    fn stage_write(&self, target: &Path, content: &str) -> std::io::Result<()> {
        let n = self.counter.get();
        self.counter.set(n + 1);
        let staging = self.path.join(format!("stage-{n}"));
        fs::write(&staging, content)?;
        fs::rename(&staging, target)
    }
}

impl Drop for TempWorkdir {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "could not remove scratch directory");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("run git");
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo(dir: &Path) -> Repo {
        git(dir, &["init", "--quiet"]);
        git(dir, &["config", "user.name", "Test"]);
        git(dir, &["config", "user.email", "test@example.com"]);
        git(dir, &["config", "commit.gpgsign", "false"]);
        std::fs::write(dir.join("a.txt"), "one\n").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", "first", "--quiet"]);
        std::fs::write(dir.join("a.txt"), "two\n").unwrap();
        git(dir, &["add", "."]);
        git(dir, &["commit", "-m", "second", "--quiet"]);
        Repo::discover(dir).expect("discover repo")
    }

    #[test]
    fn fatal_error_rolls_back_and_preserves_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        let head_before = repo.head_hash().unwrap();

        let rewriter = HistoryRewriter::new(&repo);
        let result = rewriter.with_backup(3, |_backup| {
            Err(Fatal::new("simulated failure".to_string(), 1, 3, Vec::new()))
        });

        assert!(!result.success);
        assert_eq!(result.processed, 1);
        assert_eq!(result.total, 3);
        assert!(result.error.as_deref().unwrap().contains("simulated failure"));
        assert_eq!(repo.head_hash().unwrap(), head_before);

        // The undo anchor must survive a failed run.
        let out = Command::new("git")
            .args(["branch", "--list", "gctm-backup-*"])
            .current_dir(tmp.path())
            .output()
            .unwrap();
        let listing = String::from_utf8_lossy(&out.stdout);
        assert!(listing.contains("gctm-backup-"), "backup branch missing: {listing}");
    }

    #[test]
    fn successful_run_leaves_no_backup_branch() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());

        let rewriter = HistoryRewriter::new(&repo);
        let result =
            rewriter.with_backup(0, |_backup| Ok(RewriteResult::ok(0, 0, Vec::new())));
        assert!(result.success);

        let out = Command::new("git")
            .args(["branch", "--list", "gctm-backup-*"])
            .current_dir(tmp.path())
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&out.stdout).trim().is_empty());
    }

    #[test]
    fn empty_rule_set_fails_before_any_side_effect() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = init_repo(tmp.path());
        let rewriter = HistoryRewriter::new(&repo);
        let result = rewriter.replace_content(&[]);
        assert!(!result.success);
        assert!(result.error.unwrap().contains("at least one replacement rule"));
        // No backup branch was ever created.
        let out = Command::new("git")
            .args(["branch", "--list", "gctm-backup-*"])
            .current_dir(tmp.path())
            .output()
            .unwrap();
        assert!(String::from_utf8_lossy(&out.stdout).trim().is_empty());
    }

    #[test]
    fn scratch_dir_is_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let scratch = TempWorkdir::create(tmp.path()).unwrap();
        let path = scratch.path.clone();
        assert!(path.exists());
        drop(scratch);
        assert!(!path.exists());
    }
}
