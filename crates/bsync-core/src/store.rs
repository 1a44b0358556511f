//! Per-user state store.
//!
//! Every user owns one branch, `bsync/<user>`, holding a linear sequence of
//! full snapshots. Writes are compare-and-swap on the branch tip; reads
//! decode a snapshot and report, rather than fail on, corrupt records.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::codec::{decode_snapshot, encode_snapshot};
use crate::error::{Result, SyncError};
use crate::snapshot::{ChangeCounts, Snapshot};
use crate::transport::{BranchRelation, CommitRequest, HistoryEntry, Transport, VersionId};

pub const BRANCH_PREFIX: &str = "bsync/";

#[must_use]
pub fn branch_name(user: &str) -> String {
    format!("{BRANCH_PREFIX}{user}")
}

/// The user owning `branch`, if it is a bsync branch.
#[must_use]
pub fn user_of(branch: &str) -> Option<&str> {
    branch.strip_prefix(BRANCH_PREFIX).filter(|u| !u.is_empty())
}

/// Commit summary, e.g. `bsync(alice): +2 ~1 -0`.
#[must_use]
pub fn commit_message(user: &str, counts: ChangeCounts) -> String {
    format!(
        "bsync({user}): +{} ~{} -{}",
        counts.added, counts.modified, counts.deleted
    )
}

/// A decoded snapshot and the problems met while decoding it.
#[derive(Debug)]
pub struct LoadedSnapshot {
    pub snapshot: Snapshot,
    pub version: VersionId,
    /// Records left out because they are corrupt.
    pub skipped: Vec<SyncError>,
    /// Records loaded with a fallback stamp.
    pub repaired: Vec<SyncError>,
}

#[derive(Clone)]
pub struct StateStore {
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Latest known version of `user`'s branch: the local branch if there
    /// is one, else the remote-tracking branch.
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn tip(&self, user: &str) -> Result<Option<VersionId>> {
        let branch = branch_name(user);
        match self.transport.local_tip(&branch)? {
            Some(tip) => Ok(Some(tip)),
            None => self.transport.remote_tip(&branch),
        }
    }

    /// Tip of the local branch only.
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn local_tip(&self, user: &str) -> Result<Option<VersionId>> {
        self.transport.local_tip(&branch_name(user))
    }

    /// Tip of the remote-tracking branch only.
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn remote_tip(&self, user: &str) -> Result<Option<VersionId>> {
        self.transport.remote_tip(&branch_name(user))
    }

    /// Write `snapshot` as the next version of `user`'s branch.
    ///
    /// `expected_parent` must be the current local tip. When the
    /// remote-tracking branch holds versions the local branch lacks, the
    /// remote tip becomes a second parent: the caller is expected to have
    /// folded those versions into `snapshot`.
    ///
    /// # Errors
    ///
    /// `WriteConflict` if the local tip is not `expected_parent`.
    #[instrument(skip(self, snapshot), fields(sequence = snapshot.sequence))]
    pub fn commit_snapshot(
        &self,
        user: &str,
        snapshot: &Snapshot,
        expected_parent: Option<&VersionId>,
    ) -> Result<VersionId> {
        let branch = branch_name(user);
        let mut parents: Vec<VersionId> = expected_parent.into_iter().cloned().collect();
        if let Some(remote) = self.transport.remote_tip(&branch)? {
            let unseen = match expected_parent {
                Some(local) if *local == remote => 0,
                Some(local) => self.transport.count_between(local, &remote)?,
                None => 1,
            };
            if unseen > 0 {
                parents.push(remote);
            }
        }

        let base = match parents.first() {
            Some(parent) => self.read_snapshot(user, Some(parent))?.snapshot.artifacts,
            None => crate::snapshot::ArtifactSet::default(),
        };
        let counts = snapshot.artifacts.diff_counts(&base);
        let message = commit_message(user, counts);

        let tree = encode_snapshot(snapshot)?;
        let version = self.transport.commit(CommitRequest {
            branch,
            parents,
            expected: expected_parent.cloned(),
            tree,
            message: message.clone(),
            author: user.to_string(),
        })?;
        info!(%version, %message, "committed snapshot");
        Ok(version)
    }

    /// Read `user`'s snapshot at `version`, or at the tip when `None`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the user has no branch or the version does not exist.
    #[instrument(skip(self))]
    pub fn read_snapshot(&self, user: &str, version: Option<&VersionId>) -> Result<LoadedSnapshot> {
        let version = match version {
            Some(v) => v.clone(),
            None => self
                .tip(user)?
                .ok_or_else(|| SyncError::NotFound(format!("user `{user}` has no branch")))?,
        };
        let tree = self.transport.read_tree(&version)?;
        let decoded = decode_snapshot(user, &tree);
        for err in &decoded.skipped {
            warn!(%user, %version, error = %err, "skipped corrupt record");
        }
        if !decoded.repaired.is_empty() {
            debug!(%user, %version, count = decoded.repaired.len(), "records loaded with fallback stamps");
        }
        Ok(LoadedSnapshot {
            snapshot: decoded.snapshot,
            version,
            skipped: decoded.skipped,
            repaired: decoded.repaired,
        })
    }

    /// Every user with a local or remote-tracking branch.
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn list_users(&self) -> Result<BTreeSet<String>> {
        Ok(self
            .transport
            .list_branches(BRANCH_PREFIX)?
            .iter()
            .filter_map(|b| user_of(b))
            .map(str::to_string)
            .collect())
    }

    /// Newest-first history of `user`'s branch.
    ///
    /// # Errors
    ///
    /// `NotFound` if the user has no branch.
    pub fn history(&self, user: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let tip = self
            .tip(user)?
            .ok_or_else(|| SyncError::NotFound(format!("user `{user}` has no branch")))?;
        self.transport.history(&tip, limit)
    }

    /// Fetch every user's branch from the remote.
    ///
    /// # Errors
    ///
    /// `RemoteUnavailable` if the remote cannot be reached.
    #[instrument(skip(self))]
    pub fn fetch(&self) -> Result<()> {
        self.transport.fetch(BRANCH_PREFIX)
    }

    /// Publish `user`'s branch.
    ///
    /// # Errors
    ///
    /// `WriteConflict` if the remote branch moved; `RemoteUnavailable` if it
    /// cannot be reached.
    #[instrument(skip(self))]
    pub fn publish(&self, user: &str) -> Result<()> {
        self.transport.publish(&branch_name(user))
    }

    /// Local vs. remote state of `user`'s branch.
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn relation(&self, user: &str) -> Result<BranchRelation> {
        self.transport.relation(&branch_name(user))
    }

    /// Versions on `tip` that `base` does not include.
    ///
    /// # Errors
    ///
    /// Transport failures.
    pub fn versions_between(&self, base: &VersionId, tip: &VersionId) -> Result<usize> {
        if base == tip {
            return Ok(0);
        }
        self.transport.count_between(base, tip)
    }
}
