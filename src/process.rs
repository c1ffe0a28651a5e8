//! Git repository handle and subprocess execution.
//!
//! All external commands run through [`Repo::run_with`]: argument vectors
//! only, never a shell, with a hard timeout after which the child is killed.
//! A non-zero exit status is not an error at this layer — callers inspect
//! [`CommandOutput::success`] and decide. Ref-shaped arguments are validated
//! before they reach the argument vector.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use crate::validate::{is_valid_branch_name, is_valid_hash};

/// Default timeout for a single git command.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Timeout for commands that walk the full history of a repository.
pub const SCAN_TIMEOUT: Duration = Duration::from_secs(300);

/// Options for a single subprocess invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub timeout: Duration,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            env: Vec::new(),
        }
    }
}

impl RunOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push((key.to_string(), value.to_string()));
        self
    }
}

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code; `None` when the child was terminated by a signal.
    pub code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout with surrounding whitespace trimmed.
    pub fn trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

/// A git repository handle that provides common operations.
pub struct Repo {
    root: PathBuf,
}

impl Repo {
    /// Find the git repository root starting from the given path.
    pub fn discover(start: &Path) -> Result<Self, Error> {
        let start_dir = if start.is_dir() {
            start
        } else {
            start
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."))
        };

        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(start_dir)
            .output()
            .map_err(|e| Error::Spawn {
                command: "git rev-parse".to_string(),
                source: e,
            })?;

        if !output.status.success() {
            return Err(Error::NotARepo(start_dir.display().to_string()));
        }

        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Self {
            root: PathBuf::from(root),
        })
    }

    /// Get the repository root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run a git command with default options.
    pub fn run(&self, args: &[&str]) -> Result<CommandOutput, Error> {
        self.run_with(args, &RunOptions::default())
    }

    /// Run a git command, killing it if it outlives the timeout.
    ///
    /// Stdout and stderr are drained on separate threads so a chatty child
    /// cannot block on a full pipe while we wait for it to exit.
    pub fn run_with(&self, args: &[&str], opts: &RunOptions) -> Result<CommandOutput, Error> {
        let cmdline = format!("git {}", args.join(" "));
        debug!(command = %cmdline, "running");

        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (k, v) in &opts.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| Error::Spawn {
            command: cmdline.clone(),
            source: e,
        })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = wait_with_timeout(&mut child, opts.timeout).ok_or_else(|| Error::Timeout {
            command: cmdline,
            secs: opts.timeout.as_secs(),
        })?;

        Ok(CommandOutput {
            stdout: stdout.join().unwrap_or_default(),
            stderr: stderr.join().unwrap_or_default(),
            code: status.code(),
        })
    }

    // -------------------------------------------------------------------------
    // Read-only queries
    // -------------------------------------------------------------------------

    /// Hash of `HEAD`.
    pub fn head_hash(&self) -> Result<String, Error> {
        let out = self.run(&["rev-parse", "HEAD"])?;
        if !out.success() {
            return Err(Error::Failed {
                command: "git rev-parse HEAD".to_string(),
                stderr: out.stderr,
            });
        }
        Ok(out.trimmed().to_string())
    }

    /// Name of the currently checked-out branch, or `HEAD` when detached.
    pub fn current_branch(&self) -> Result<String, Error> {
        let out = self.run(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        if !out.success() {
            return Err(Error::Failed {
                command: "git rev-parse --abbrev-ref HEAD".to_string(),
                stderr: out.stderr,
            });
        }
        Ok(out.trimmed().to_string())
    }

    /// Check if a branch or ref exists.
    pub fn ref_exists(&self, refname: &str) -> bool {
        if !is_valid_branch_name(refname) && !is_valid_hash(refname) {
            return false;
        }
        self.run(&["rev-parse", "--verify", "--quiet", refname])
            .map(|o| o.success())
            .unwrap_or(false)
    }

    /// Full commit list reachable from `HEAD`, newest first.
    pub fn rev_list(&self, limit: Option<usize>) -> Result<Vec<String>, Error> {
        let count;
        let mut args = vec!["rev-list", "HEAD"];
        if let Some(n) = limit {
            count = format!("--max-count={n}");
            args.push(&count);
        }
        let out = self.run_with(&args, &RunOptions::with_timeout(SCAN_TIMEOUT))?;
        if !out.success() {
            return Err(Error::Failed {
                command: "git rev-list HEAD".to_string(),
                stderr: out.stderr,
            });
        }
        Ok(out.stdout.lines().map(str::to_string).collect())
    }

    /// Commits strictly after `base` up to `tip`, oldest first.
    pub fn rev_list_range(&self, base: &str, tip: &str) -> Result<Vec<String>, Error> {
        check_ref(base)?;
        check_ref(tip)?;
        let range = format!("{base}..{tip}");
        let out = self.run_with(
            &["rev-list", "--reverse", &range],
            &RunOptions::with_timeout(SCAN_TIMEOUT),
        )?;
        if !out.success() {
            return Err(Error::Failed {
                command: format!("git rev-list --reverse {range}"),
                stderr: out.stderr,
            });
        }
        Ok(out.stdout.lines().map(str::to_string).collect())
    }

    /// Author and committer dates of a commit, in strict ISO 8601.
    pub fn commit_dates(&self, hash: &str) -> Result<(String, String), Error> {
        check_ref(hash)?;
        let out = self.run(&["show", "-s", "--format=%aI%n%cI", hash])?;
        if !out.success() {
            return Err(Error::Failed {
                command: format!("git show -s {hash}"),
                stderr: out.stderr,
            });
        }
        let mut lines = out.stdout.lines();
        let author = lines.next().unwrap_or_default().to_string();
        let committer = lines.next().unwrap_or_default().to_string();
        Ok((author, committer))
    }

    /// `git status --porcelain` output.
    pub fn status_porcelain(&self) -> Result<String, Error> {
        let out = self.run(&["status", "--porcelain"])?;
        if !out.success() {
            return Err(Error::Failed {
                command: "git status --porcelain".to_string(),
                stderr: out.stderr,
            });
        }
        Ok(out.stdout)
    }

    /// Paths of tracked files whose content matches a pattern at the current
    /// checkout. `literal` controls fixed-string vs. extended-regex matching.
    pub fn grep_paths(&self, pattern: &str, literal: bool) -> Result<Vec<String>, Error> {
        let mode = if literal { "--fixed-strings" } else { "-E" };
        let out = self.run_with(
            &["grep", "-l", "-I", mode, "-e", pattern, "--", "."],
            &RunOptions::with_timeout(SCAN_TIMEOUT),
        )?;
        // Exit code 1 means "no matches", which is not a failure.
        if !out.success() && out.code != Some(1) {
            return Err(Error::Failed {
                command: "git grep -l".to_string(),
                stderr: out.stderr,
            });
        }
        Ok(out.stdout.lines().map(str::to_string).collect())
    }

    /// All tracked paths at the current checkout, relative to the root.
    pub fn tracked_files(&self) -> Result<Vec<String>, Error> {
        let out = self.run_with(&["ls-files"], &RunOptions::with_timeout(SCAN_TIMEOUT))?;
        if !out.success() {
            return Err(Error::Failed {
                command: "git ls-files".to_string(),
                stderr: out.stderr,
            });
        }
        Ok(out.stdout.lines().map(str::to_string).collect())
    }

    /// Paths whose content matches a pattern in the tree of `commit`,
    /// without checking it out. Paths are returned relative to the root.
    pub fn grep_paths_at(
        &self,
        commit: &str,
        pattern: &str,
        literal: bool,
    ) -> Result<Vec<String>, Error> {
        check_ref(commit)?;
        let mode = if literal { "--fixed-strings" } else { "-E" };
        let out = self.run_with(
            &["grep", "-l", "-I", mode, "-e", pattern, commit, "--", "."],
            &RunOptions::with_timeout(SCAN_TIMEOUT),
        )?;
        if !out.success() && out.code != Some(1) {
            return Err(Error::Failed {
                command: format!("git grep -l at {commit}"),
                stderr: out.stderr,
            });
        }
        // Lines look like `<commit>:path`; strip the ref prefix.
        Ok(out
            .stdout
            .lines()
            .map(|line| match line.split_once(':') {
                Some((_, path)) => path.to_string(),
                None => line.to_string(),
            })
            .collect())
    }

    /// Recent commit log as structured entries, newest first.
    pub fn log_entries(&self, limit: usize) -> Result<Vec<LogEntry>, Error> {
        let max = format!("--max-count={limit}");
        let out = self.run(&["log", "--format=%H%x1f%aI%x1f%s", &max])?;
        if !out.success() {
            return Err(Error::Failed {
                command: "git log".to_string(),
                stderr: out.stderr,
            });
        }
        let entries = out
            .stdout
            .lines()
            .filter_map(|line| {
                let mut parts = line.split('\x1f');
                Some(LogEntry {
                    hash: parts.next()?.to_string(),
                    date: parts.next()?.to_string(),
                    subject: parts.next().unwrap_or_default().to_string(),
                })
            })
            .collect();
        Ok(entries)
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Move the current branch (and working tree) to `target`.
    pub fn reset_hard(&self, target: &str) -> Result<(), Error> {
        check_ref(target)?;
        self.expect_ok(&["reset", "--hard", target])
    }

    /// Checkout an existing branch.
    pub fn checkout(&self, branch: &str) -> Result<(), Error> {
        check_branch(branch)?;
        self.expect_ok(&["checkout", branch])
    }

    /// Create (or move) a branch at a starting point and check it out.
    pub fn checkout_new_branch(&self, branch: &str, start: &str) -> Result<(), Error> {
        check_branch(branch)?;
        check_ref(start)?;
        self.expect_ok(&["checkout", "-B", branch, start])
    }

    /// Create a branch without checking it out.
    pub fn create_branch(&self, branch: &str, at: &str) -> Result<(), Error> {
        check_branch(branch)?;
        check_ref(at)?;
        self.expect_ok(&["branch", branch, at])
    }

    /// Delete a branch, even if unmerged.
    pub fn delete_branch(&self, branch: &str) -> Result<(), Error> {
        check_branch(branch)?;
        self.expect_ok(&["branch", "-D", branch])
    }

    /// Stage every change under the repository root.
    pub fn add_all(&self) -> Result<(), Error> {
        self.expect_ok(&["add", "."])
    }

    /// Amend the commit at `HEAD` without opening an editor.
    ///
    /// The committer date travels through `env` (`GIT_COMMITTER_DATE`); the
    /// author date needs the `--date` flag because `--amend` reuses the
    /// original author info and ignores `GIT_AUTHOR_DATE`. `message`
    /// replaces the commit message when present.
    pub fn amend(
        &self,
        env: &[(String, String)],
        date: Option<&str>,
        message: Option<&str>,
    ) -> Result<(), Error> {
        let mut args: Vec<&str> = vec!["commit", "--amend", "--allow-empty"];
        let date_flag;
        if let Some(d) = date {
            date_flag = format!("--date={d}");
            args.push(&date_flag);
        }
        match message {
            Some(msg) => {
                args.push("-m");
                args.push(msg);
            }
            None => args.push("--no-edit"),
        }
        let opts = RunOptions {
            timeout: DEFAULT_TIMEOUT,
            env: env.to_vec(),
        };
        let out = self.run_with(&args, &opts)?;
        if !out.success() {
            return Err(Error::Failed {
                command: "git commit --amend".to_string(),
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    /// Replay a commit onto the current tip, keeping the original committer
    /// date via the environment.
    ///
    /// Targets are always commit hashes; a branch name here would be a bug
    /// in the caller.
    pub fn cherry_pick(&self, hash: &str, env: &[(String, String)]) -> Result<(), Error> {
        if !is_valid_hash(hash) {
            return Err(Error::InvalidRef(hash.to_string()));
        }
        let opts = RunOptions {
            timeout: DEFAULT_TIMEOUT,
            env: env.to_vec(),
        };
        let out = self.run_with(
            &["cherry-pick", "--allow-empty", "--allow-empty-message", hash],
            &opts,
        )?;
        if !out.success() {
            // Leave the tree usable for the next step.
            let _ = self.run(&["cherry-pick", "--abort"]);
            return Err(Error::Failed {
                command: format!("git cherry-pick {hash}"),
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    fn expect_ok(&self, args: &[&str]) -> Result<(), Error> {
        let out = self.run(args)?;
        if !out.success() {
            return Err(Error::Failed {
                command: format!("git {}", args.join(" ")),
                stderr: out.stderr,
            });
        }
        Ok(())
    }
}

/// One entry of the commit log dump stored with each snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub hash: String,
    pub date: String,
    pub subject: String,
}

fn check_ref(s: &str) -> Result<(), Error> {
    if is_valid_hash(s) || is_valid_branch_name(s) {
        Ok(())
    } else {
        Err(Error::InvalidRef(s.to_string()))
    }
}

fn check_branch(s: &str) -> Result<(), Error> {
    if is_valid_branch_name(s) {
        Ok(())
    } else {
        Err(Error::InvalidRef(s.to_string()))
    }
}

fn drain(pipe: Option<impl Read + Send + 'static>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Poll the child until it exits or the timeout elapses; kill on expiry.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Option<std::process::ExitStatus> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return None;
                }
                thread::sleep(Duration::from_millis(25));
            }
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                return None;
            }
        }
    }
}

/// Errors from subprocess execution.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to execute {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} timed out after {secs}s and was killed")]
    Timeout { command: String, secs: u64 },

    #[error("not a git repository (searched from '{0}')")]
    NotARepo(String),

    #[error("refusing to pass invalid ref '{0}' to git")]
    InvalidRef(String),

    #[error("{command} failed: {stderr}")]
    Failed { command: String, stderr: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_refs_never_reach_git() {
        let repo = Repo {
            root: PathBuf::from("/nonexistent"),
        };
        // These fail in validation, before any spawn against the bogus root.
        assert!(matches!(
            repo.reset_hard("$(reboot)"),
            Err(Error::InvalidRef(_))
        ));
        assert!(matches!(
            repo.delete_branch("../evil"),
            Err(Error::InvalidRef(_))
        ));
        assert!(matches!(
            repo.cherry_pick("not-a-hash", &[]),
            Err(Error::InvalidRef(_))
        ));
    }

    #[test]
    fn timeout_kills_hung_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()
            .expect("spawn sleep");
        let status = wait_with_timeout(&mut child, Duration::from_millis(100));
        assert!(status.is_none());
    }
}
