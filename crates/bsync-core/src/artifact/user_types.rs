//! User-defined types: structs and enums with individually tracked members.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{Addr, Artifact, ArtifactKind, LastChange, Tracked, TypeRef};

/// Container artifacts whose members merge independently.
pub trait Composite: Artifact<Key = String> {
    type Member: Artifact;

    fn members(&self) -> &BTreeMap<<Self::Member as Artifact>::Key, Tracked<Self::Member>>;

    fn members_mut(
        &mut self,
    ) -> &mut BTreeMap<<Self::Member as Artifact>::Key, Tracked<Self::Member>>;

    /// Equality of the container's own fields, members excluded.
    fn header_eq(&self, other: &Self) -> bool;

    /// Stamp of the last change to the container's own fields.
    fn header_change(&self) -> &LastChange;

    fn header_change_mut(&mut self) -> &mut LastChange;

    /// Members that are not tombstoned.
    fn live_members(&self) -> impl Iterator<Item = &Self::Member> {
        self.members().values().filter_map(Tracked::value)
    }

    /// Stamp a freshly reported container against `base`.
    ///
    /// The header keeps the stamp of `base` when its fields are unchanged.
    /// Members whose payload differs from `base` (or are new) receive
    /// `stamp`; unchanged members keep their previous stamp; members live in
    /// `base` but missing from `self` become tombstones stamped `stamp`.
    /// Returns the number of members that received the new stamp.
    fn stamp_members(&mut self, base: Option<&Self>, stamp: &LastChange) -> usize {
        let header = base
            .filter(|b| b.header_eq(self))
            .map_or_else(|| stamp.clone(), |b| b.header_change().clone());
        *self.header_change_mut() = header;

        let mut touched = 0;
        let empty = BTreeMap::new();
        let base_members = base.map_or(&empty, |b| b.members());

        for (key, tracked) in self.members_mut().iter_mut() {
            match base_members.get(key) {
                Some(prev) if prev.same_state(tracked) => {
                    tracked.last_change = prev.last_change.clone();
                }
                _ => {
                    tracked.last_change = stamp.clone();
                    touched += 1;
                }
            }
        }

        for (key, prev) in base_members {
            if self.members().contains_key(key) {
                continue;
            }
            let removed = if prev.is_tombstone() {
                prev.clone()
            } else {
                touched += 1;
                Tracked::tombstone(stamp.clone())
            };
            self.members_mut().insert(key.clone(), removed);
        }
        touched
    }
}

fn live_members_equal<K: Ord, M: Artifact>(
    a: &BTreeMap<K, Tracked<M>>,
    b: &BTreeMap<K, Tracked<M>>,
) -> bool {
    fn live<K, M>(m: &BTreeMap<K, Tracked<M>>) -> Vec<(&K, &M)> {
        m.iter()
            .filter_map(|(k, t)| t.value().map(|v| (k, v)))
            .collect()
    }
    let (a, b) = (live(a), live(b));
    a.len() == b.len()
        && a
            .iter()
            .zip(&b)
            .all(|((ka, va), (kb, vb))| ka == kb && va.same_payload(vb))
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StructMember {
    pub offset: Addr,
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeRef,
    pub size: u64,
}

impl StructMember {
    #[must_use]
    pub fn new(offset: Addr, name: impl Into<String>, ty: TypeRef, size: u64) -> Self {
        Self {
            offset,
            name: name.into(),
            ty,
            size,
        }
    }
}

impl Artifact for StructMember {
    type Key = Addr;
    const KIND: ArtifactKind = ArtifactKind::StructMember;

    fn key(&self) -> Addr {
        self.offset
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Struct {
    pub name: String,
    pub size: u64,
    pub members: BTreeMap<Addr, Tracked<StructMember>>,
    /// Set by the sync client; members carry their own stamps.
    #[serde(skip_serializing_if = "LastChange::is_unstamped")]
    pub header_change: LastChange,
}

impl Struct {
    #[must_use]
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            members: BTreeMap::new(),
            header_change: LastChange::default(),
        }
    }

    /// Add an unstamped member.
    #[must_use]
    pub fn with_member(mut self, member: StructMember) -> Self {
        self.members.insert(member.offset, Tracked::pending(member));
        self
    }

    #[must_use]
    pub fn member(&self, offset: Addr) -> Option<&StructMember> {
        self.members.get(&offset).and_then(Tracked::value)
    }
}

impl Artifact for Struct {
    type Key = String;
    const KIND: ArtifactKind = ArtifactKind::Struct;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn same_payload(&self, other: &Self) -> bool {
        self.header_eq(other) && live_members_equal(&self.members, &other.members)
    }
}

impl Composite for Struct {
    type Member = StructMember;

    fn members(&self) -> &BTreeMap<Addr, Tracked<StructMember>> {
        &self.members
    }

    fn members_mut(&mut self) -> &mut BTreeMap<Addr, Tracked<StructMember>> {
        &mut self.members
    }

    fn header_eq(&self, other: &Self) -> bool {
        self.name == other.name && self.size == other.size
    }

    fn header_change(&self) -> &LastChange {
        &self.header_change
    }

    fn header_change_mut(&mut self) -> &mut LastChange {
        &mut self.header_change
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EnumMember {
    pub name: String,
    pub value: i64,
}

impl EnumMember {
    #[must_use]
    pub fn new(name: impl Into<String>, value: i64) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

impl Artifact for EnumMember {
    type Key = String;
    const KIND: ArtifactKind = ArtifactKind::EnumMember;

    fn key(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Enum {
    pub name: String,
    pub members: BTreeMap<String, Tracked<EnumMember>>,
    #[serde(skip_serializing_if = "LastChange::is_unstamped")]
    pub header_change: LastChange,
}

impl Enum {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: BTreeMap::new(),
            header_change: LastChange::default(),
        }
    }

    #[must_use]
    pub fn with_member(mut self, name: impl Into<String>, value: i64) -> Self {
        let member = EnumMember::new(name, value);
        self.members.insert(member.name.clone(), Tracked::pending(member));
        self
    }

    #[must_use]
    pub fn value_of(&self, name: &str) -> Option<i64> {
        self.members.get(name).and_then(Tracked::value).map(|m| m.value)
    }
}

impl Artifact for Enum {
    type Key = String;
    const KIND: ArtifactKind = ArtifactKind::Enum;

    fn key(&self) -> String {
        self.name.clone()
    }

    fn same_payload(&self, other: &Self) -> bool {
        self.header_eq(other) && live_members_equal(&self.members, &other.members)
    }
}

impl Composite for Enum {
    type Member = EnumMember;

    fn members(&self) -> &BTreeMap<String, Tracked<EnumMember>> {
        &self.members
    }

    fn members_mut(&mut self) -> &mut BTreeMap<String, Tracked<EnumMember>> {
        &mut self.members
    }

    fn header_eq(&self, other: &Self) -> bool {
        self.name == other.name
    }

    fn header_change(&self) -> &LastChange {
        &self.header_change
    }

    fn header_change_mut(&mut self) -> &mut LastChange {
        &mut self.header_change
    }
}
