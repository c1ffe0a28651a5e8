//! gctm: bulk, undoable rewriting of committed git history.
//!
//! gctm re-stamps commit dates, rewrites tracked-file content across many
//! historical commits, and redacts sensitive strings, while guaranteeing
//! that every mutating run can be undone if it fails partway: state is
//! anchored to an ephemeral backup branch before anything moves, and a
//! fatal error rolls back to it.
//!
//! # Architecture
//!
//! - **validate**: allow-list checks for every external identifier
//! - **process**: timeout-bounded git invocation, argument vectors only
//! - **sanitize**: sensitive-data detectors and replacement rules
//! - **snapshot**: named recovery points (branch + commit + stash)
//! - **rewrite**: the transactional reset+amend engine

pub mod process;
pub mod rewrite;
pub mod sanitize;
pub mod snapshot;
pub mod validate;

pub use process::Repo;
pub use rewrite::{CommitRef, HistoryRewriter, RewriteOptions, RewriteResult};
pub use sanitize::{Category, Pattern, ReplacementRule};
pub use snapshot::{CreateOptions, RestoreOptions, Snapshot, SnapshotManager};
