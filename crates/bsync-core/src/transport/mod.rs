//! Version-control transport.
//!
//! The store only needs a handful of primitives: compare-and-swap commits of
//! a flat file tree onto a branch, reading a tree back, fetching other
//! branches and publishing one's own. Two implementations are provided:
//!
//! - [`GitTransport`]: a local git repository with an optional remote.
//! - [`MemoryTransport`]: in-process, with fault injection, for tests.
//!
//! Each transport distinguishes local branches (writable, CAS-protected)
//! from remote-tracking branches (the remote's state as of the last fetch).
//! [`TimeoutTransport`] wraps any transport with a per-call deadline.

mod git;
mod memory;
mod timeout;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;

pub use git::GitTransport;
pub use memory::{MemoryRemote, MemoryTransport};
pub use timeout::TimeoutTransport;

/// File name to content, flat (no directories).
pub type FileTree = BTreeMap<String, Vec<u8>>;

/// Opaque identifier of one committed version.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First ten characters, for display.
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..10).unwrap_or(&self.0)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A new version to write onto a local branch.
#[derive(Debug, Clone)]
pub struct CommitRequest {
    pub branch: String,
    /// Parents of the new version. Two parents record a reconciliation of a
    /// local and a remote line of history.
    pub parents: Vec<VersionId>,
    /// Required current tip of the local branch; `None` requires that the
    /// branch does not exist yet.
    pub expected: Option<VersionId>,
    pub tree: FileTree,
    pub message: String,
    pub author: String,
}

/// One entry of a branch's history, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub version: VersionId,
    pub author: String,
    pub time: DateTime<Utc>,
    pub message: String,
}

/// Local branch relative to its remote-tracking counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BranchRelation {
    Equal,
    Ahead { commits: usize },
    Behind { commits: usize },
    Diverged { ahead: usize, behind: usize },
    LocalOnly,
    RemoteOnly,
    Missing,
}

impl BranchRelation {
    /// Relation from ahead/behind counts of two existing tips.
    #[must_use]
    pub const fn from_counts(ahead: usize, behind: usize) -> Self {
        match (ahead, behind) {
            (0, 0) => Self::Equal,
            (commits, 0) => Self::Ahead { commits },
            (0, commits) => Self::Behind { commits },
            (ahead, behind) => Self::Diverged { ahead, behind },
        }
    }
}

impl fmt::Display for BranchRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Equal => f.write_str("up to date"),
            Self::Ahead { commits } => write!(f, "ahead by {commits}"),
            Self::Behind { commits } => write!(f, "behind by {commits}"),
            Self::Diverged { ahead, behind } => write!(f, "diverged (+{ahead} -{behind})"),
            Self::LocalOnly => f.write_str("not published"),
            Self::RemoteOnly => f.write_str("remote only"),
            Self::Missing => f.write_str("no branch"),
        }
    }
}

/// Version-control capability the state store is built on.
pub trait Transport: Send + Sync {
    /// Tip of a local branch.
    fn local_tip(&self, branch: &str) -> Result<Option<VersionId>>;

    /// Tip of the remote-tracking branch, as of the last fetch.
    fn remote_tip(&self, branch: &str) -> Result<Option<VersionId>>;

    /// Names of local and remote-tracking branches starting with `prefix`.
    fn list_branches(&self, prefix: &str) -> Result<BTreeSet<String>>;

    /// Write a version and move the local branch to it, atomically
    /// checking `expected`. Fails with `WriteConflict` on a mismatch.
    fn commit(&self, request: CommitRequest) -> Result<VersionId>;

    /// Files of a version. `NotFound` if the version does not exist.
    fn read_tree(&self, version: &VersionId) -> Result<FileTree>;

    /// Update remote-tracking branches under `prefix` and fast-forward local
    /// branches that are strictly behind. A transport without a remote
    /// succeeds without doing anything.
    fn fetch(&self, prefix: &str) -> Result<()>;

    /// Publish a local branch. A non-fast-forward update is rejected with
    /// `WriteConflict`; the remote branch is never overwritten.
    fn publish(&self, branch: &str) -> Result<()>;

    /// Up to `limit` versions reachable from `tip`, newest first.
    fn history(&self, tip: &VersionId, limit: usize) -> Result<Vec<HistoryEntry>>;

    /// Local branch vs. its remote-tracking branch.
    fn relation(&self, branch: &str) -> Result<BranchRelation>;

    /// Number of versions reachable from `tip` but not from `base`.
    fn count_between(&self, base: &VersionId, tip: &VersionId) -> Result<usize>;

    /// Whether a remote is configured.
    fn has_remote(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relation_from_counts() {
        assert_eq!(BranchRelation::from_counts(0, 0), BranchRelation::Equal);
        assert_eq!(BranchRelation::from_counts(2, 0), BranchRelation::Ahead { commits: 2 });
        assert_eq!(BranchRelation::from_counts(0, 1), BranchRelation::Behind { commits: 1 });
        assert_eq!(
            BranchRelation::from_counts(1, 3),
            BranchRelation::Diverged { ahead: 1, behind: 3 }
        );
    }

    #[test]
    fn short_version_is_prefix() {
        let v = VersionId::new("0123456789abcdef");
        assert_eq!(v.short(), "0123456789");
        assert_eq!(VersionId::new("abc").short(), "abc");
    }
}
