//! Merged views and pull scopes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::artifact::{AnyArtifact, ArtifactKind};
use crate::error::{Result, SyncError};
use crate::merge::{Merged, Outcome, Resolution};
use crate::snapshot::{ArtifactSet, Stored};
use crate::transport::VersionId;

/// Which users' branches a pull or view merges. The caller's own branch is
/// always included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Scope {
    #[default]
    All,
    Users(BTreeSet<String>),
}

impl Scope {
    pub fn users<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Users(users.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn includes(&self, user: &str) -> bool {
        match self {
            Self::All => true,
            Self::Users(users) => users.contains(user),
        }
    }

    /// Users of `available` selected by this scope, plus `me`.
    #[must_use]
    pub fn select(&self, available: &BTreeSet<String>, me: &str) -> BTreeSet<String> {
        let mut selected: BTreeSet<String> = available
            .iter()
            .filter(|u| self.includes(u))
            .cloned()
            .collect();
        selected.insert(me.to_string());
        selected
    }
}

/// A record left out of a view because it failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedRecord {
    pub user: String,
    pub code: &'static str,
    pub message: String,
}

impl SkippedRecord {
    #[must_use]
    pub fn new(user: &str, err: &SyncError) -> Self {
        Self {
            user: user.to_string(),
            code: err.code().code(),
            message: err.to_string(),
        }
    }
}

/// Result of merging the selected branches. Never persisted; every pull
/// computes a fresh one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergedView {
    /// Winners per key. Deleted keys are kept as tombstones.
    pub artifacts: ArtifactSet,
    pub log: Vec<Resolution>,
    /// Version merged per user.
    pub sources: BTreeMap<String, VersionId>,
    /// Pending local edits folded into the view.
    pub pending_edits: usize,
    pub skipped: Vec<SkippedRecord>,
    /// Set when the remote could not be reached and the view may lag.
    pub stale: bool,
    pub computed_at: DateTime<Utc>,
}

impl Default for MergedView {
    fn default() -> Self {
        Self::new(Merged::default())
    }
}

impl MergedView {
    #[must_use]
    pub fn new(merged: Merged) -> Self {
        Self {
            artifacts: merged.set,
            log: merged.log,
            sources: BTreeMap::new(),
            pending_edits: 0,
            skipped: Vec::new(),
            stale: false,
            computed_at: Utc::now(),
        }
    }

    /// Live value for `key`.
    #[must_use]
    pub fn get<A: Stored>(&self, key: &A::Key) -> Option<&A> {
        self.artifacts.live(key)
    }

    /// Live artifact by runtime kind and rendered key.
    ///
    /// # Errors
    ///
    /// `InvalidKey` if `key` does not parse for `kind`.
    pub fn find(&self, kind: ArtifactKind, key: &str) -> Result<Option<AnyArtifact>> {
        Ok(self.artifacts.find(kind, key)?.and_then(|t| t.value))
    }

    /// Resolution recorded for `kind`/`key`.
    #[must_use]
    pub fn resolution(&self, kind: ArtifactKind, key: &str) -> Option<&Resolution> {
        self.log.iter().find(|r| r.kind == kind && r.key == key)
    }

    /// Keys settled by a tie-break between different payloads.
    pub fn tie_breaks(&self) -> impl Iterator<Item = &Resolution> {
        self.log.iter().filter(|r| r.ambiguous)
    }

    #[must_use]
    pub fn outcome_counts(&self) -> BTreeMap<Outcome, usize> {
        let mut counts = BTreeMap::new();
        for r in &self.log {
            *counts.entry(r.outcome).or_insert(0) += 1;
        }
        counts
    }

    #[must_use]
    pub fn live_counts(&self) -> BTreeMap<ArtifactKind, usize> {
        self.artifacts.live_counts()
    }

    /// The same view, marked as possibly out of date.
    #[must_use]
    pub fn into_stale(mut self) -> Self {
        self.stale = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Addr, Comment, FunctionHeader, LastChange};
    use crate::merge::merge_sets;

    #[test]
    fn scope_always_selects_the_caller() {
        let available: BTreeSet<String> = ["alice", "bob", "carol"].map(String::from).into();
        assert_eq!(Scope::All.select(&available, "alice").len(), 3);

        let only_bob = Scope::users(["bob"]).select(&available, "dave");
        assert_eq!(only_bob, ["bob", "dave"].map(String::from).into());
    }

    #[test]
    fn view_hides_tombstones() {
        let mut a = ArtifactSet::default();
        a.put(FunctionHeader::new(Addr(0x1000), "main"), LastChange::new("amy", 1));
        a.put(Comment::new(Addr(0x1000), "x"), LastChange::new("amy", 1));
        let mut b = ArtifactSet::default();
        b.put_tombstone::<Comment>(Addr(0x1000), LastChange::new("bob", 2));

        let view = MergedView::new(merge_sets(&[&a, &b]));
        assert!(view.get::<FunctionHeader>(&Addr(0x1000)).is_some());
        assert!(view.get::<Comment>(&Addr(0x1000)).is_none());
        assert!(view.find(ArtifactKind::Comment, "0x1000").unwrap().is_none());
        assert_eq!(
            view.resolution(ArtifactKind::Comment, "0x1000").map(|r| r.outcome),
            Some(Outcome::Deleted)
        );
        assert_eq!(view.outcome_counts()[&Outcome::Resolved], 1);
        assert!(!view.stale);
        assert!(view.into_stale().stale);
    }

    #[test]
    fn skipped_records_carry_error_codes() {
        let err = SyncError::corrupt(ArtifactKind::Function, "0x10", "name", "missing");
        let rec = SkippedRecord::new("bob", &err);
        assert_eq!(rec.code, "E3001");
        assert!(rec.message.contains("0x10"));
    }
}
