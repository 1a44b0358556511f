//! One user's artifact set, as committed to their branch.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::artifact::{
    AnyArtifact, Artifact, ArtifactKind, Comment, Enum, FunctionHeader, GlobalVariable,
    LastChange, Patch, StackVariable, Struct, Tracked,
};
use crate::error::{Result, SyncError};

/// Records of one kind, keyed by identity.
pub type Table<A> = BTreeMap<<A as Artifact>::Key, Tracked<A>>;

/// Run `$body` once per top-level kind with `$alias` bound to the kind's type.
macro_rules! for_each_kind {
    ($alias:ident => $body:block) => {{
        {
            type $alias = $crate::artifact::FunctionHeader;
            $body
        }
        {
            type $alias = $crate::artifact::StackVariable;
            $body
        }
        {
            type $alias = $crate::artifact::Struct;
            $body
        }
        {
            type $alias = $crate::artifact::Enum;
            $body
        }
        {
            type $alias = $crate::artifact::GlobalVariable;
            $body
        }
        {
            type $alias = $crate::artifact::Comment;
            $body
        }
        {
            type $alias = $crate::artifact::Patch;
            $body
        }
    }};
}

/// Evaluate `$body` with `$alias` bound to the type of a runtime kind.
/// Member kinds have no table of their own and take the `members` arm.
macro_rules! with_kind {
    ($kind:expr, $alias:ident => $body:expr, members => $members:expr) => {
        match $kind {
            $crate::artifact::ArtifactKind::Function => {
                type $alias = $crate::artifact::FunctionHeader;
                $body
            }
            $crate::artifact::ArtifactKind::StackVariable => {
                type $alias = $crate::artifact::StackVariable;
                $body
            }
            $crate::artifact::ArtifactKind::Struct => {
                type $alias = $crate::artifact::Struct;
                $body
            }
            $crate::artifact::ArtifactKind::Enum => {
                type $alias = $crate::artifact::Enum;
                $body
            }
            $crate::artifact::ArtifactKind::GlobalVariable => {
                type $alias = $crate::artifact::GlobalVariable;
                $body
            }
            $crate::artifact::ArtifactKind::Comment => {
                type $alias = $crate::artifact::Comment;
                $body
            }
            $crate::artifact::ArtifactKind::Patch => {
                type $alias = $crate::artifact::Patch;
                $body
            }
            $crate::artifact::ArtifactKind::StructMember
            | $crate::artifact::ArtifactKind::EnumMember => $members,
        }
    };
}

pub(crate) use {for_each_kind, with_kind};

/// Top-level kinds stored in their own table and file.
pub trait Stored: Artifact {
    /// File name inside a snapshot tree.
    const FILE: &'static str;

    fn table(set: &ArtifactSet) -> &Table<Self>;
    fn table_mut(set: &mut ArtifactSet) -> &mut Table<Self>;

    /// Parse a rendered key, reporting `InvalidKey` on failure.
    fn parse_key(raw: &str) -> Result<Self::Key> {
        raw.parse::<Self::Key>().map_err(|_| SyncError::InvalidKey {
            kind: Self::KIND,
            key: raw.to_string(),
        })
    }
}

macro_rules! stored {
    ($($ty:ty => $field:ident, $file:literal;)*) => {
        $(
            impl Stored for $ty {
                const FILE: &'static str = $file;

                fn table(set: &ArtifactSet) -> &Table<Self> {
                    &set.$field
                }

                fn table_mut(set: &mut ArtifactSet) -> &mut Table<Self> {
                    &mut set.$field
                }
            }
        )*
    };
}

stored! {
    FunctionHeader => functions, "functions.toml";
    StackVariable => stack_vars, "stack_vars.toml";
    Struct => structs, "structs.toml";
    Enum => enums, "enums.toml";
    GlobalVariable => globals, "globals.toml";
    Comment => comments, "comments.toml";
    Patch => patches, "patches.toml";
}

/// Tables of every top-level kind. Used for snapshots, the dirty set and
/// merged views alike.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ArtifactSet {
    pub functions: Table<FunctionHeader>,
    pub stack_vars: Table<StackVariable>,
    pub structs: Table<Struct>,
    pub enums: Table<Enum>,
    pub globals: Table<GlobalVariable>,
    pub comments: Table<Comment>,
    pub patches: Table<Patch>,
}

/// Added / modified / deleted counts between two sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChangeCounts {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

impl ChangeCounts {
    #[must_use]
    pub const fn total(self) -> usize {
        self.added + self.modified + self.deleted
    }

    fn tally<A: Artifact>(&mut self, new: &Table<A>, base: &Table<A>) {
        for (key, tracked) in new {
            let before = base.get(key).and_then(Tracked::value);
            match (before, tracked.value()) {
                (None, Some(_)) => self.added += 1,
                (Some(_), None) => self.deleted += 1,
                (Some(a), Some(b)) if !a.same_payload(b) => self.modified += 1,
                _ => {}
            }
        }
    }
}

impl ArtifactSet {
    #[must_use]
    pub fn get<A: Stored>(&self, key: &A::Key) -> Option<&Tracked<A>> {
        A::table(self).get(key)
    }

    /// Live value for `key`, if present and not deleted.
    #[must_use]
    pub fn live<A: Stored>(&self, key: &A::Key) -> Option<&A> {
        self.get(key).and_then(Tracked::value)
    }

    pub fn put<A: Stored>(&mut self, value: A, last_change: LastChange) {
        A::table_mut(self).insert(value.key(), Tracked::live(value, last_change));
    }

    pub fn put_tombstone<A: Stored>(&mut self, key: A::Key, last_change: LastChange) {
        A::table_mut(self).insert(key, Tracked::tombstone(last_change));
    }

    /// Record count, tombstones included.
    #[must_use]
    pub fn len(&self) -> usize {
        let mut n = 0;
        for_each_kind!(A => {
            n += A::table(self).len();
        });
        n
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live record count per kind; kinds with no live records are omitted.
    #[must_use]
    pub fn live_counts(&self) -> BTreeMap<ArtifactKind, usize> {
        let mut counts = BTreeMap::new();
        for_each_kind!(A => {
            let n = A::table(self).values().filter(|t| !t.is_tombstone()).count();
            if n > 0 {
                counts.insert(A::KIND, n);
            }
        });
        counts
    }

    /// Rendered keys of live records, per kind.
    #[must_use]
    pub fn live_keys(&self) -> BTreeMap<ArtifactKind, BTreeSet<String>> {
        let mut keys = BTreeMap::new();
        for_each_kind!(A => {
            let live: BTreeSet<String> = A::table(self)
                .iter()
                .filter(|(_, t)| !t.is_tombstone())
                .map(|(k, _)| k.to_string())
                .collect();
            if !live.is_empty() {
                keys.insert(A::KIND, live);
            }
        });
        keys
    }

    /// Greatest `last_change.timestamp` anywhere in the set, members included.
    #[must_use]
    pub fn max_timestamp(&self) -> u64 {
        let mut max = 0;
        for_each_kind!(A => {
            for tracked in A::table(self).values() {
                max = max.max(tracked.last_change.timestamp);
            }
        });
        for s in self.structs.values().filter_map(Tracked::value) {
            max = max.max(s.header_change.timestamp);
            for m in s.members.values() {
                max = max.max(m.last_change.timestamp);
            }
        }
        for e in self.enums.values().filter_map(Tracked::value) {
            max = max.max(e.header_change.timestamp);
            for m in e.members.values() {
                max = max.max(m.last_change.timestamp);
            }
        }
        max
    }

    /// Copy every record of `other` over this set.
    pub fn overlay(&mut self, other: &Self) {
        for_each_kind!(A => {
            let table = A::table_mut(self);
            for (key, tracked) in A::table(other) {
                table.insert(key.clone(), tracked.clone());
            }
        });
    }

    /// Drop records whose state already matches `base`. A tombstone for a
    /// key `base` lacks is kept: another branch may hold the key even if it
    /// has not been fetched. Returns how many records were dropped.
    pub fn retain_changed(&mut self, base: &Self) -> usize {
        let mut dropped = 0;
        for_each_kind!(A => {
            let base_table = A::table(base);
            let table = A::table_mut(self);
            let before = table.len();
            table.retain(|key, tracked| {
                base_table.get(key).is_none_or(|prev| !prev.same_state(tracked))
            });
            dropped += before - table.len();
        });
        dropped
    }

    /// Remove records identical to the ones in `taken`; records changed
    /// since `taken` was cloned stay.
    pub fn remove_settled(&mut self, taken: &Self) {
        for_each_kind!(A => {
            let table = A::table_mut(self);
            for (key, tracked) in A::table(taken) {
                if table.get(key) == Some(tracked) {
                    table.remove(key);
                }
            }
        });
    }

    /// Give every record `stamp`. Struct and enum headers and members keep
    /// their stamp unless `author` wrote it after `floor`, i.e. it marks an
    /// edit not yet committed.
    pub fn restamp(&mut self, author: &str, floor: u64, stamp: &LastChange) {
        for_each_kind!(A => {
            for tracked in A::table_mut(self).values_mut() {
                tracked.last_change = stamp.clone();
            }
        });
        let fresh = |m: &LastChange| m.author == author && m.timestamp > floor;
        for s in self.structs.values_mut().filter_map(|t| t.value.as_mut()) {
            if fresh(&s.header_change) {
                s.header_change = stamp.clone();
            }
            for m in s.members.values_mut().filter(|m| fresh(&m.last_change)) {
                m.last_change = stamp.clone();
            }
        }
        for e in self.enums.values_mut().filter_map(|t| t.value.as_mut()) {
            if fresh(&e.header_change) {
                e.header_change = stamp.clone();
            }
            for m in e.members.values_mut().filter(|m| fresh(&m.last_change)) {
                m.last_change = stamp.clone();
            }
        }
    }

    /// Kind and rendered key of the last record in table order.
    #[must_use]
    pub fn last_key(&self) -> Option<(ArtifactKind, String)> {
        let mut last = None;
        for_each_kind!(A => {
            if let Some(key) = A::table(self).keys().next_back() {
                last = Some((A::KIND, key.to_string()));
            }
        });
        last
    }

    /// Change counts of this set relative to `base`.
    #[must_use]
    pub fn diff_counts(&self, base: &Self) -> ChangeCounts {
        let mut counts = ChangeCounts::default();
        for_each_kind!(A => {
            counts.tally::<A>(A::table(self), A::table(base));
        });
        counts
    }

    /// Look up a record by runtime kind and rendered key.
    ///
    /// # Errors
    ///
    /// `InvalidKey` if `key` does not parse for `kind`, or `kind` is a
    /// member kind.
    pub fn find(&self, kind: ArtifactKind, key: &str) -> Result<Option<Tracked<AnyArtifact>>> {
        with_kind!(kind, A => {
            let key = A::parse_key(key)?;
            Ok(self.get::<A>(&key).map(|t| Tracked {
                last_change: t.last_change.clone(),
                value: t.value.clone().map(AnyArtifact::from),
            }))
        }, members => Err(SyncError::InvalidKey { kind, key: key.to_string() }))
    }
}

/// Bookkeeping for the most recent push, kept in the snapshot metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushInfo {
    pub timestamp: u64,
    pub kind: ArtifactKind,
    pub key: String,
}

/// One user's complete artifact state at a version of their branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub user: String,
    /// Number of commits on the user's branch that produced this state.
    pub sequence: u64,
    pub last_push: Option<PushInfo>,
    pub artifacts: ArtifactSet,
}

impl Snapshot {
    #[must_use]
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            sequence: 0,
            last_push: None,
            artifacts: ArtifactSet::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::{Addr, StructMember, TypeRef};

    fn stamp(author: &str, ts: u64) -> LastChange {
        LastChange::new(author, ts)
    }

    #[test]
    fn counts_cover_every_table() {
        let mut set = ArtifactSet::default();
        set.put(FunctionHeader::new(Addr(0x1000), "main"), stamp("amy", 1));
        set.put(Comment::new(Addr(0x1000), "entry"), stamp("amy", 1));
        set.put_tombstone::<Struct>("Packet".into(), stamp("amy", 2));
        assert_eq!(set.len(), 3);
        assert_eq!(set.live_counts().get(&ArtifactKind::Struct), None);
        assert_eq!(set.live_counts()[&ArtifactKind::Comment], 1);
        assert_eq!(set.max_timestamp(), 2);
    }

    #[test]
    fn retain_changed_drops_entries_equal_to_base() {
        let mut base = ArtifactSet::default();
        base.put(FunctionHeader::new(Addr(0x1000), "main"), stamp("amy", 1));

        let mut dirty = ArtifactSet::default();
        dirty.put(FunctionHeader::new(Addr(0x1000), "main"), LastChange::default());
        dirty.put(FunctionHeader::new(Addr(0x2000), "helper"), LastChange::default());
        dirty.put_tombstone::<Comment>(Addr(0x3000), LastChange::default());

        assert_eq!(dirty.retain_changed(&base), 1);
        assert_eq!(dirty.len(), 2);
        assert!(dirty.live::<FunctionHeader>(&Addr(0x2000)).is_some());
    }

    #[test]
    fn retain_changed_keeps_deletes_of_keys_the_base_never_held() {
        let mut base = ArtifactSet::default();
        base.put_tombstone::<Comment>(Addr(0x3000), stamp("amy", 1));

        let mut dirty = ArtifactSet::default();
        dirty.put_tombstone::<Comment>(Addr(0x3000), LastChange::default());
        dirty.put_tombstone::<Comment>(Addr(0x4000), LastChange::default());

        assert_eq!(dirty.retain_changed(&base), 1);
        assert_eq!(dirty.len(), 1);
        assert!(dirty.get::<Comment>(&Addr(0x4000)).is_some_and(Tracked::is_tombstone));
    }

    #[test]
    fn remove_settled_keeps_entries_edited_meanwhile() {
        let mut dirty = ArtifactSet::default();
        dirty.put(FunctionHeader::new(Addr(0x1000), "a"), LastChange::default());
        dirty.put(FunctionHeader::new(Addr(0x2000), "b"), LastChange::default());
        let taken = dirty.clone();
        dirty.put(FunctionHeader::new(Addr(0x2000), "b2"), LastChange::default());

        dirty.remove_settled(&taken);
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty.live::<FunctionHeader>(&Addr(0x2000)).map(|f| f.name.as_str()), Some("b2"));
    }

    #[test]
    fn restamp_touches_only_fresh_members() {
        let mut packet = Struct::new("Packet", 8)
            .with_member(StructMember::new(Addr(0), "len", TypeRef::primitive("u32"), 4))
            .with_member(StructMember::new(Addr(4), "flags", TypeRef::primitive("u32"), 4));
        packet.members.get_mut(&Addr(0)).unwrap().last_change = stamp("bob", 50);
        packet.members.get_mut(&Addr(4)).unwrap().last_change = stamp("amy", 120);
        packet.header_change = stamp("bob", 50);

        let mut dirty = ArtifactSet::default();
        dirty.put(packet, stamp("amy", 120));
        dirty.put(Comment::new(Addr(0x10), "x"), stamp("amy", 121));
        let mut color = Enum::new("Color");
        color.header_change = stamp("amy", 130);
        dirty.put(color, stamp("amy", 130));

        let pushed = stamp("amy", 200);
        dirty.restamp("amy", 100, &pushed);

        let packet = &dirty.structs["Packet"];
        assert_eq!(packet.last_change, pushed);
        let members = &packet.value().unwrap().members;
        assert_eq!(members[&Addr(0)].last_change, stamp("bob", 50));
        assert_eq!(members[&Addr(4)].last_change, pushed);
        assert_eq!(packet.value().unwrap().header_change, stamp("bob", 50));
        assert_eq!(dirty.enums["Color"].value().unwrap().header_change, pushed);
        assert_eq!(dirty.comments[&Addr(0x10)].last_change, pushed);
        assert_eq!(dirty.last_key(), Some((ArtifactKind::Comment, "0x10".to_string())));
    }

    #[test]
    fn diff_counts_classify_changes() {
        let mut base = ArtifactSet::default();
        base.put(FunctionHeader::new(Addr(0x1000), "a"), stamp("amy", 1));
        base.put(FunctionHeader::new(Addr(0x2000), "b"), stamp("amy", 1));

        let mut next = base.clone();
        next.put(FunctionHeader::new(Addr(0x1000), "renamed"), stamp("amy", 2));
        next.put_tombstone::<FunctionHeader>(Addr(0x2000), stamp("amy", 2));
        next.put(
            Struct::new("Packet", 8).with_member(StructMember::new(
                Addr(0),
                "len",
                TypeRef::primitive("u32"),
                4,
            )),
            stamp("amy", 2),
        );

        let counts = next.diff_counts(&base);
        assert_eq!(counts, ChangeCounts { added: 1, modified: 1, deleted: 1 });
        assert_eq!(counts.total(), 3);
    }

    #[test]
    fn find_parses_keys_per_kind() {
        let mut set = ArtifactSet::default();
        set.put(Comment::new(Addr(0x1000), "entry"), stamp("amy", 1));

        let found = set.find(ArtifactKind::Comment, "0x1000").unwrap();
        assert!(matches!(found.and_then(|t| t.value), Some(AnyArtifact::Comment(_))));
        assert!(set.find(ArtifactKind::Function, "0x1000").unwrap().is_none());
        assert!(matches!(
            set.find(ArtifactKind::Comment, "nope"),
            Err(SyncError::InvalidKey { .. })
        ));
        assert!(set.find(ArtifactKind::StructMember, "0x0").is_err());
    }
}
