//! Deterministic merge of per-user artifact sets.
//!
//! Every key resolves on its own: the candidates from all inputs are ordered
//! by the [`Tracked`] total order and the greatest wins. The outcome records
//! *why* it won so that the adapter can surface genuine conflicts.
//!
//! Struct and enum members resolve one level down, see [`composite`].
//!
//! The result keeps winning tombstones, so a merged set can be merged again
//! and a later pass still sees the deletes.

mod composite;

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::artifact::{
    ArtifactKind, Comment, Enum, FunctionHeader, GlobalVariable, LastChange, Patch, StackVariable,
    Struct, Tracked,
};
use crate::snapshot::{ArtifactSet, Stored};

/// How a key was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// One live candidate, or every live candidate agrees.
    Resolved,
    /// The winner is strictly newer than every differing candidate.
    ResolvedByRecency,
    /// Differing candidates share the winning timestamp; the author order
    /// decided.
    ResolvedByTiebreak,
    /// The winner is a tombstone.
    Deleted,
}

impl Outcome {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resolved => "resolved",
            Self::ResolvedByRecency => "recency",
            Self::ResolvedByTiebreak => "tiebreak",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change-log entry for one resolved key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub kind: ArtifactKind,
    /// Rendered key; members use `Container.member`.
    pub key: String,
    pub outcome: Outcome,
    pub winner: LastChange,
    /// Stamps of live candidates that lost with a different payload.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub overridden: Vec<LastChange>,
    /// Set when a tie-break picked between different payloads.
    pub ambiguous: bool,
}

/// Merged tables plus the change log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Merged {
    pub set: ArtifactSet,
    pub log: Vec<Resolution>,
}

impl Merged {
    /// Resolutions whose tie-break chose between different payloads.
    pub fn ambiguous(&self) -> impl Iterator<Item = &Resolution> {
        self.log.iter().filter(|r| r.ambiguous)
    }
}

/// Choice among the candidates for one key.
#[derive(Debug)]
pub(crate) struct Decision {
    pub(crate) winner: usize,
    pub(crate) outcome: Outcome,
    pub(crate) overridden: Vec<LastChange>,
    pub(crate) ambiguous: bool,
}

impl Decision {
    pub(crate) fn record(self, kind: ArtifactKind, key: String, winner: &LastChange) -> Resolution {
        Resolution {
            kind,
            key,
            ambiguous: self.ambiguous,
            outcome: self.outcome,
            winner: winner.clone(),
            overridden: self.overridden,
        }
    }
}

/// Pick the winner among `candidates` and classify the outcome. `same`
/// decides payload equality for classification only.
///
/// `candidates` must not be empty.
pub(crate) fn decide<A>(candidates: &[&Tracked<A>], same: impl Fn(&A, &A) -> bool) -> Decision
where
    A: Ord,
{
    let winner = candidates
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.cmp(b))
        .map_or(0, |(i, _)| i);
    let best = candidates[winner];

    let Some(value) = best.value() else {
        // A delete that beat a live edit only on author order is still a
        // tie-break.
        let mut tied: Vec<LastChange> = candidates
            .iter()
            .filter(|c| !c.is_tombstone() && c.last_change.timestamp == best.last_change.timestamp)
            .map(|c| c.last_change.clone())
            .collect();
        tied.sort();
        return Decision {
            winner,
            outcome: Outcome::Deleted,
            ambiguous: !tied.is_empty(),
            overridden: tied,
        };
    };

    let differing: Vec<&LastChange> = candidates
        .iter()
        .filter_map(|c| c.value().map(|v| (v, &c.last_change)))
        .filter(|(v, _)| !same(v, value))
        .map(|(_, stamp)| stamp)
        .collect();

    let outcome = if differing.is_empty() {
        Outcome::Resolved
    } else if differing.iter().all(|s| s.timestamp < best.last_change.timestamp) {
        Outcome::ResolvedByRecency
    } else {
        Outcome::ResolvedByTiebreak
    };
    let mut overridden: Vec<LastChange> = differing.into_iter().cloned().collect();
    overridden.sort();
    Decision {
        winner,
        ambiguous: outcome == Outcome::ResolvedByTiebreak,
        outcome,
        overridden,
    }
}

fn keys<A: Stored>(inputs: &[&ArtifactSet]) -> BTreeSet<A::Key> {
    inputs
        .iter()
        .flat_map(|set| A::table(set).keys().cloned())
        .collect()
}

/// Merge one flat kind.
fn merge_table<A: Stored>(inputs: &[&ArtifactSet], out: &mut Merged) {
    for key in keys::<A>(inputs) {
        let candidates: Vec<&Tracked<A>> =
            inputs.iter().filter_map(|set| A::table(set).get(&key)).collect();
        let decision = decide(&candidates, A::same_payload);
        let winner = candidates[decision.winner];
        out.log.push(decision.record(A::KIND, key.to_string(), &winner.last_change));
        A::table_mut(&mut out.set).insert(key, winner.clone());
    }
}

/// Merge `inputs` key by key.
///
/// The result depends only on the set of inputs, never on their order or on
/// which one belongs to the caller.
#[must_use]
#[instrument(skip_all, fields(inputs = inputs.len()))]
pub fn merge_sets(inputs: &[&ArtifactSet]) -> Merged {
    let mut out = Merged::default();
    merge_table::<FunctionHeader>(inputs, &mut out);
    merge_table::<StackVariable>(inputs, &mut out);
    composite::merge_composite::<Struct>(inputs, &mut out);
    composite::merge_composite::<Enum>(inputs, &mut out);
    merge_table::<GlobalVariable>(inputs, &mut out);
    merge_table::<Comment>(inputs, &mut out);
    merge_table::<Patch>(inputs, &mut out);

    let ambiguous = out.ambiguous().count();
    debug!(keys = out.log.len(), ambiguous, "merged artifact sets");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::Addr;

    fn stamp(author: &str, ts: u64) -> LastChange {
        LastChange::new(author, ts)
    }

    fn func_set(name: &str, author: &str, ts: u64) -> ArtifactSet {
        let mut set = ArtifactSet::default();
        set.put(FunctionHeader::new(Addr(0x40_1000), name), stamp(author, ts));
        set
    }

    fn only(merged: &Merged) -> &Resolution {
        assert_eq!(merged.log.len(), 1);
        &merged.log[0]
    }

    #[test]
    fn newer_rename_wins_by_recency() {
        let alice = func_set("parse_header", "alice", 100);
        let bob = func_set("parse_hdr", "bob", 150);
        let merged = merge_sets(&[&alice, &bob]);

        let name = merged.set.live::<FunctionHeader>(&Addr(0x40_1000)).map(|f| f.name.as_str());
        assert_eq!(name, Some("parse_hdr"));
        let res = only(&merged);
        assert_eq!(res.outcome, Outcome::ResolvedByRecency);
        assert_eq!(res.winner.author, "bob");
        assert_eq!(res.overridden, vec![stamp("alice", 100)]);
        assert!(!res.ambiguous);
    }

    #[test]
    fn equal_timestamps_tie_break_by_author() {
        let amy = func_set("amy_name", "amy", 100);
        let zed = func_set("zed_name", "zed", 100);
        let merged = merge_sets(&[&zed, &amy]);

        let name = merged.set.live::<FunctionHeader>(&Addr(0x40_1000)).map(|f| f.name.as_str());
        assert_eq!(name, Some("zed_name"));
        let res = only(&merged);
        assert_eq!(res.outcome, Outcome::ResolvedByTiebreak);
        assert!(res.ambiguous);
        assert_eq!(merged.ambiguous().count(), 1);
    }

    #[test]
    fn identical_payloads_collapse() {
        let a = func_set("main", "amy", 100);
        let b = func_set("main", "bob", 300);
        let merged = merge_sets(&[&a, &b]);
        let res = only(&merged);
        assert_eq!(res.outcome, Outcome::Resolved);
        assert_eq!(res.winner, stamp("bob", 300));
        assert!(res.overridden.is_empty());
    }

    #[test]
    fn newer_tombstone_deletes() {
        let live = func_set("main", "amy", 100);
        let mut gone = ArtifactSet::default();
        gone.put_tombstone::<FunctionHeader>(Addr(0x40_1000), stamp("bob", 200));

        let merged = merge_sets(&[&live, &gone]);
        assert!(merged.set.live::<FunctionHeader>(&Addr(0x40_1000)).is_none());
        assert!(merged.set.get::<FunctionHeader>(&Addr(0x40_1000)).is_some());
        assert_eq!(only(&merged).outcome, Outcome::Deleted);
        assert!(!only(&merged).ambiguous);
    }

    #[test]
    fn tombstone_winning_on_author_order_is_ambiguous() {
        let live = func_set("main", "amy", 200);
        let mut gone = ArtifactSet::default();
        gone.put_tombstone::<FunctionHeader>(Addr(0x40_1000), stamp("zed", 200));

        let merged = merge_sets(&[&live, &gone]);
        assert!(merged.set.live::<FunctionHeader>(&Addr(0x40_1000)).is_none());
        let res = only(&merged);
        assert_eq!(res.outcome, Outcome::Deleted);
        assert_eq!(res.winner, stamp("zed", 200));
        assert!(res.ambiguous);
        assert_eq!(res.overridden, vec![stamp("amy", 200)]);
        assert_eq!(merged.ambiguous().count(), 1);
    }

    #[test]
    fn newer_edit_survives_older_tombstone() {
        let live = func_set("main", "amy", 300);
        let mut gone = ArtifactSet::default();
        gone.put_tombstone::<FunctionHeader>(Addr(0x40_1000), stamp("bob", 200));

        let merged = merge_sets(&[&gone, &live]);
        assert!(merged.set.live::<FunctionHeader>(&Addr(0x40_1000)).is_some());
        assert_eq!(only(&merged).outcome, Outcome::Resolved);
    }

    #[test]
    fn comments_merge_apart_from_functions_at_same_address() {
        let mut a = func_set("main", "amy", 100);
        a.put(Comment::new(Addr(0x40_1000), "old note"), stamp("amy", 100));
        let mut b = ArtifactSet::default();
        b.put(Comment::new(Addr(0x40_1000), "new note"), stamp("bob", 120));

        let merged = merge_sets(&[&a, &b]);
        assert_eq!(
            merged.set.live::<Comment>(&Addr(0x40_1000)).map(|c| c.text.as_str()),
            Some("new note")
        );
        assert_eq!(
            merged.set.live::<FunctionHeader>(&Addr(0x40_1000)).map(|f| f.name.as_str()),
            Some("main")
        );
    }

    #[test]
    fn single_input_is_reproduced() {
        let mut a = func_set("main", "amy", 100);
        a.put_tombstone::<Patch>(Addr(0x10), stamp("amy", 50));
        let merged = merge_sets(&[&a]);
        assert_eq!(merged.set, a);
    }

    #[test]
    fn no_inputs_merge_to_nothing() {
        let merged = merge_sets(&[]);
        assert!(merged.set.is_empty());
        assert!(merged.log.is_empty());
    }
}
