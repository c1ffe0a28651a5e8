use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gctm::rewrite::RewriteOptions;
use gctm::snapshot::{CreateOptions, RestoreOptions, SnapshotManager};
use gctm::{CommitRef, HistoryRewriter, Repo, ReplacementRule, RewriteResult, sanitize};

#[derive(Parser)]
#[command(name = "gctm")]
#[command(about = "Bulk, undoable rewriting of committed git history")]
struct Cli {
    /// Repository path (defaults to the current directory)
    #[arg(short = 'C', long, global = true)]
    repo: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Re-stamp commit dates: each entry is HASH=DATE, newest first
    Redate {
        /// HASH=DATE pairs (RFC 3339 or YYYY-MM-DD)
        entries: Vec<String>,

        /// Sort the supplied dates so history order stays chronological
        #[arg(long)]
        preserve_order: bool,
    },

    /// Rewrite file content across history
    Redact {
        /// Literal replacement, PATTERN=REPLACEMENT (repeatable)
        #[arg(long = "replace", value_name = "PAT=REP")]
        replace: Vec<String>,

        /// Regex replacement, PATTERN=REPLACEMENT (repeatable)
        #[arg(long = "replace-regex", value_name = "PAT=REP")]
        replace_regex: Vec<String>,

        /// Only consider the most recent N commits
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Scan working-tree files for sensitive data without mutating anything
    Scan {
        /// Files to scan
        paths: Vec<PathBuf>,
    },

    /// Manage recovery points
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Create a recovery point for the current repository state
    Create {
        #[arg(long)]
        description: Option<String>,

        /// Also capture staged and working-tree changes
        #[arg(long)]
        include_uncommitted: bool,
    },

    /// List recovery points, newest first
    List,

    /// Restore the repository to a recovery point
    Restore {
        id: String,

        /// Overwrite uncommitted changes in the current tree
        #[arg(long)]
        force: bool,
    },

    /// Delete a recovery point
    Delete { id: String },

    /// Apply retention: keep the newest N, drop anything too old
    Cleanup {
        #[arg(long, default_value_t = 10)]
        keep_last: usize,

        #[arg(long, default_value_t = 30)]
        max_age_days: u64,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let start = cli.repo.unwrap_or_else(|| PathBuf::from("."));
    let repo = Repo::discover(&start)?;

    match cli.command {
        Command::Redate {
            entries,
            preserve_order,
        } => {
            let plan = parse_plan(&entries, preserve_order)?;
            let result = HistoryRewriter::new(&repo).change_dates(&plan);
            report(result)
        }
        Command::Redact {
            replace,
            replace_regex,
            limit,
        } => {
            let mut rules = Vec::new();
            for raw in &replace {
                let (pat, rep) = split_rule(raw)?;
                rules.push(ReplacementRule::literal(pat, rep)?);
            }
            for raw in &replace_regex {
                let (pat, rep) = split_rule(raw)?;
                rules.push(ReplacementRule::regex(pat, rep)?);
            }
            let options = RewriteOptions {
                commit_limit: limit,
                ..RewriteOptions::default()
            };
            let result = HistoryRewriter::with_options(&repo, options).replace_content(&rules);
            report(result)
        }
        Command::Scan { paths } => {
            for path in &paths {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                let found = sanitize::detect(&content);
                if found.is_empty() {
                    println!("{}: clean", path.display());
                    continue;
                }
                println!("{}:", path.display());
                for (category, matches) in &found {
                    println!("  {category}: {} match(es)", matches.len());
                    for m in matches {
                        println!("    {m}");
                    }
                }
            }
            Ok(())
        }
        Command::Snapshot { action } => {
            let manager = SnapshotManager::new(&repo);
            match action {
                SnapshotAction::Create {
                    description,
                    include_uncommitted,
                } => {
                    let snapshot = manager.create(&CreateOptions {
                        description,
                        include_uncommitted,
                    })?;
                    println!("created {}", snapshot.id);
                    Ok(())
                }
                SnapshotAction::List => {
                    for snapshot in manager.list()? {
                        println!(
                            "{}  {}  {}@{}  {}",
                            snapshot.id,
                            snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
                            snapshot.branch,
                            &snapshot.commit_hash[..8.min(snapshot.commit_hash.len())],
                            snapshot.description,
                        );
                    }
                    Ok(())
                }
                SnapshotAction::Restore { id, force } => {
                    let outcome = manager.restore(&id, &RestoreOptions { force })?;
                    println!("restored {} at {}", outcome.branch, outcome.commit_hash);
                    for warning in &outcome.warnings {
                        eprintln!("warning: {warning}");
                    }
                    Ok(())
                }
                SnapshotAction::Delete { id } => {
                    manager.delete(&id)?;
                    println!("deleted {id}");
                    Ok(())
                }
                SnapshotAction::Cleanup {
                    keep_last,
                    max_age_days,
                } => {
                    let deleted = manager.cleanup(
                        Some(keep_last),
                        Some(Duration::from_secs(max_age_days * 24 * 60 * 60)),
                    )?;
                    println!("deleted {} snapshot(s)", deleted.len());
                    Ok(())
                }
            }
        }
    }
}

/// Parse `HASH=DATE` entries into a rewrite plan, newest first.
fn parse_plan(entries: &[String], preserve_order: bool) -> anyhow::Result<Vec<CommitRef>> {
    let mut hashes = Vec::new();
    let mut dates = Vec::new();
    for entry in entries {
        let Some((hash, date)) = entry.split_once('=') else {
            bail!("expected HASH=DATE, got '{entry}'");
        };
        hashes.push(hash.to_string());
        dates.push(parse_date(date)?);
    }

    if preserve_order {
        // The entry list is newest first, so chronological order means the
        // latest date goes to the first entry.
        dates.sort();
        dates.reverse();
    }

    Ok(hashes
        .into_iter()
        .zip(dates)
        .map(|(hash, date)| CommitRef::new(hash).with_date(date))
        .collect())
}

fn parse_date(s: &str) -> anyhow::Result<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt);
    }
    let day: NaiveDate = s
        .parse()
        .with_context(|| format!("'{s}' is neither RFC 3339 nor YYYY-MM-DD"))?;
    let noon = NaiveTime::from_hms_opt(12, 0, 0).unwrap();
    Ok(day.and_time(noon).and_utc().fixed_offset())
}

fn split_rule(raw: &str) -> anyhow::Result<(&str, &str)> {
    raw.split_once('=')
        .ok_or_else(|| anyhow::anyhow!("expected PATTERN=REPLACEMENT, got '{raw}'"))
}

fn report(result: RewriteResult) -> anyhow::Result<()> {
    for warning in &result.warnings {
        eprintln!("warning: {warning}");
    }
    println!("processed {}/{} commit(s)", result.processed, result.total);
    if !result.success {
        bail!(
            "{}",
            result.error.unwrap_or_else(|| "rewrite failed".to_string())
        );
    }
    Ok(())
}
