//! Struct and enum merging.
//!
//! The container stamp decides between a delete and a live type. Among the
//! live candidates that order after the newest container tombstone, the
//! header fields resolve on their own stamp and members merge per member
//! key, so a member edit never reverts a concurrent resize, a delete clears
//! the membership, and a re-created type starts from its new definition.

use std::collections::BTreeSet;

use super::{Merged, decide};
use crate::artifact::{Artifact, Composite, LastChange, Tracked};
use crate::snapshot::{ArtifactSet, Stored};

pub(super) fn merge_composite<C>(inputs: &[&ArtifactSet], out: &mut Merged)
where
    C: Stored + Composite,
{
    let keys: BTreeSet<String> = inputs
        .iter()
        .flat_map(|set| C::table(set).keys().cloned())
        .collect();

    for key in keys {
        let candidates: Vec<&Tracked<C>> =
            inputs.iter().filter_map(|set| C::table(set).get(&key)).collect();
        let decision = decide(&candidates, C::header_eq);
        let winner = candidates[decision.winner];
        if winner.is_tombstone() {
            out.log.push(decision.record(C::KIND, key.clone(), &winner.last_change));
            C::table_mut(&mut out.set).insert(key, winner.clone());
            continue;
        }

        let newest_delete = candidates.iter().filter(|c| c.is_tombstone()).max();
        let sources: Vec<(&C, &LastChange)> = candidates
            .iter()
            .copied()
            .filter(|c| newest_delete.is_none_or(|dead| *c > *dead))
            .filter_map(|c| c.value().map(|v| (v, header_stamp(v, &c.last_change))))
            .collect();

        let headers: Vec<Tracked<&C>> =
            sources.iter().map(|(c, at)| Tracked::live(*c, (*at).clone())).collect();
        let header_refs: Vec<&Tracked<&C>> = headers.iter().collect();
        let decision = decide(&header_refs, |a: &&C, b: &&C| a.header_eq(b));
        let (header, header_at) = sources[decision.winner];
        out.log.push(decision.record(C::KIND, key.clone(), header_at));

        let mut merged = header.clone();
        merged.members_mut().clear();
        let member_keys: BTreeSet<_> = sources
            .iter()
            .flat_map(|(c, _)| c.members().keys().cloned())
            .collect();
        for member_key in member_keys {
            let member_candidates: Vec<_> = sources
                .iter()
                .filter_map(|(c, _)| c.members().get(&member_key))
                .collect();
            let decision = decide(&member_candidates, <C::Member as Artifact>::same_payload);
            let member = member_candidates[decision.winner];
            out.log.push(decision.record(
                <C::Member as Artifact>::KIND,
                format!("{key}.{member_key}"),
                &member.last_change,
            ));
            merged.members_mut().insert(member_key, member.clone());
        }

        C::table_mut(&mut out.set).insert(key, Tracked::live(merged, winner.last_change.clone()));
    }
}

/// Header stamp of `c`, or the container stamp for records written before
/// headers were stamped separately.
fn header_stamp<'a, C: Composite>(c: &'a C, container: &'a LastChange) -> &'a LastChange {
    if c.header_change().is_unstamped() {
        container
    } else {
        c.header_change()
    }
}
