//! Reverse-engineering artifact model.
//!
//! Every artifact kind is a plain value type with a stable identity key.
//! Change metadata lives beside the value in [`Tracked`], which also
//! represents deletions: a tombstone is a `Tracked` whose value is `None`
//! but which still carries the `last_change` of the delete, so that a
//! deletion can be merged against a concurrent edit.
//!
//! # Ordering
//!
//! `Tracked<A>` derives `Ord` with `last_change` first, so records sort by
//! `(timestamp, author, note, value)`. This is the total order the merge
//! engine uses to pick winners:
//!
//! 1. Higher logical timestamp wins.
//! 2. Equal timestamps: lexicographically greater author wins.
//! 3. Same author and timestamp: a live value beats a tombstone, then the
//!    greater payload wins. This step only exists to make the order total.

mod data;
mod function;
mod keys;
mod type_ref;
mod user_types;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

pub use data::{Comment, GlobalVariable, Patch};
pub use function::{FunctionArg, FunctionHeader, StackVariable};
pub use keys::{Addr, KeyParseError, StackSlot};
pub use type_ref::{TypeParseError, TypeRef};
pub use user_types::{Composite, Enum, EnumMember, Struct, StructMember};

/// Every artifact kind the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Function,
    StackVariable,
    Struct,
    StructMember,
    Enum,
    EnumMember,
    GlobalVariable,
    Comment,
    Patch,
}

impl ArtifactKind {
    /// Top-level kinds, in on-disk order. Members live inside their container.
    pub const TOP_LEVEL: [Self; 7] = [
        Self::Function,
        Self::StackVariable,
        Self::Struct,
        Self::Enum,
        Self::GlobalVariable,
        Self::Comment,
        Self::Patch,
    ];

    /// Stable lowercase name used in file names, logs and metadata tables.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::StackVariable => "stack_variable",
            Self::Struct => "struct",
            Self::StructMember => "struct_member",
            Self::Enum => "enum",
            Self::EnumMember => "enum_member",
            Self::GlobalVariable => "global_variable",
            Self::Comment => "comment",
            Self::Patch => "patch",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArtifactKind {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "function" | "func" => Self::Function,
            "stack_variable" | "stack_var" => Self::StackVariable,
            "struct" => Self::Struct,
            "struct_member" => Self::StructMember,
            "enum" => Self::Enum,
            "enum_member" => Self::EnumMember,
            "global_variable" | "global" => Self::GlobalVariable,
            "comment" => Self::Comment,
            "patch" => Self::Patch,
            _ => return Err(KeyParseError::new(s, "unknown artifact kind")),
        };
        Ok(kind)
    }
}

/// Who changed an artifact and when.
///
/// `timestamp` is a logical clock in microseconds, monotonic per writer
/// (see [`crate::clock`]). A default `LastChange` is "unstamped": the
/// sync client stamps it when the edit is pushed.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct LastChange {
    pub timestamp: u64,
    pub author: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl LastChange {
    #[must_use]
    pub fn new(author: impl Into<String>, timestamp: u64) -> Self {
        Self {
            timestamp,
            author: author.into(),
            note: None,
        }
    }

    #[must_use]
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// True until the sync client stamps this change.
    #[must_use]
    pub fn is_unstamped(&self) -> bool {
        self.timestamp == 0 && self.author.is_empty()
    }
}

/// Identity key of an artifact kind.
pub trait ArtifactKey:
    Clone + Ord + fmt::Debug + fmt::Display + FromStr + Send + Sync + 'static
{
}

impl<T> ArtifactKey for T where
    T: Clone + Ord + fmt::Debug + fmt::Display + FromStr + Send + Sync + 'static
{
}

/// Capability shared by every top-level artifact kind.
pub trait Artifact: Clone + fmt::Debug + Eq + Ord + Serialize + Send + Sync + 'static {
    type Key: ArtifactKey;
    const KIND: ArtifactKind;

    /// Identity key, unique within the kind.
    fn key(&self) -> Self::Key;

    /// Payload equality, ignoring any nested change metadata.
    fn same_payload(&self, other: &Self) -> bool {
        self == other
    }
}

/// A value or a tombstone, plus its change metadata.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Tracked<A> {
    pub last_change: LastChange,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<A>,
}

impl<A> Tracked<A> {
    #[must_use]
    pub const fn live(value: A, last_change: LastChange) -> Self {
        Self {
            last_change,
            value: Some(value),
        }
    }

    #[must_use]
    pub const fn tombstone(last_change: LastChange) -> Self {
        Self {
            last_change,
            value: None,
        }
    }

    /// A live value awaiting its stamp.
    #[must_use]
    pub fn pending(value: A) -> Self {
        Self::live(value, LastChange::default())
    }

    #[must_use]
    pub const fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    #[must_use]
    pub const fn value(&self) -> Option<&A> {
        self.value.as_ref()
    }
}

impl<A: Artifact> Tracked<A> {
    /// Same liveness and same payload; change metadata is ignored.
    #[must_use]
    pub fn same_state(&self, other: &Self) -> bool {
        match (&self.value, &other.value) {
            (Some(a), Some(b)) => a.same_payload(b),
            (None, None) => true,
            _ => false,
        }
    }
}

/// Any top-level artifact, as reported by a decompiler adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnyArtifact {
    Function(FunctionHeader),
    StackVariable(StackVariable),
    Struct(Struct),
    Enum(Enum),
    GlobalVariable(GlobalVariable),
    Comment(Comment),
    Patch(Patch),
}

impl AnyArtifact {
    #[must_use]
    pub const fn kind(&self) -> ArtifactKind {
        match self {
            Self::Function(_) => ArtifactKind::Function,
            Self::StackVariable(_) => ArtifactKind::StackVariable,
            Self::Struct(_) => ArtifactKind::Struct,
            Self::Enum(_) => ArtifactKind::Enum,
            Self::GlobalVariable(_) => ArtifactKind::GlobalVariable,
            Self::Comment(_) => ArtifactKind::Comment,
            Self::Patch(_) => ArtifactKind::Patch,
        }
    }

    /// Rendered identity key.
    #[must_use]
    pub fn key_string(&self) -> String {
        match self {
            Self::Function(a) => a.key().to_string(),
            Self::StackVariable(a) => a.key().to_string(),
            Self::Struct(a) => a.key(),
            Self::Enum(a) => a.key(),
            Self::GlobalVariable(a) => a.key().to_string(),
            Self::Comment(a) => a.key().to_string(),
            Self::Patch(a) => a.key().to_string(),
        }
    }
}

macro_rules! any_artifact_from {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for AnyArtifact {
                fn from(value: $ty) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

any_artifact_from! {
    Function => FunctionHeader,
    StackVariable => StackVariable,
    Struct => Struct,
    Enum => Enum,
    GlobalVariable => GlobalVariable,
    Comment => Comment,
    Patch => Patch,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(text: &str) -> Comment {
        Comment::new(Addr(0x401000), text)
    }

    #[test]
    fn later_timestamp_orders_higher() {
        let older = Tracked::live(comment("a"), LastChange::new("zed", 100));
        let newer = Tracked::live(comment("b"), LastChange::new("amy", 150));
        assert!(newer > older);
    }

    #[test]
    fn equal_timestamps_order_by_author() {
        let amy = Tracked::live(comment("a"), LastChange::new("amy", 100));
        let bob = Tracked::live(comment("b"), LastChange::new("bob", 100));
        assert!(bob > amy);
    }

    #[test]
    fn live_beats_tombstone_on_exact_tie() {
        let stamp = LastChange::new("amy", 100);
        let live = Tracked::live(comment("a"), stamp.clone());
        let dead: Tracked<Comment> = Tracked::tombstone(stamp);
        assert!(live > dead);
    }

    #[test]
    fn same_state_ignores_change_metadata() {
        let a = Tracked::live(comment("x"), LastChange::new("amy", 1));
        let b = Tracked::live(comment("x"), LastChange::new("bob", 9));
        assert!(a.same_state(&b));
        let gone: Tracked<Comment> = Tracked::tombstone(LastChange::new("bob", 9));
        assert!(!a.same_state(&gone));
    }

    #[test]
    fn kind_names_round_trip() {
        for kind in ArtifactKind::TOP_LEVEL {
            assert_eq!(kind.as_str().parse::<ArtifactKind>().ok(), Some(kind));
        }
        assert!("widget".parse::<ArtifactKind>().is_err());
    }

    #[test]
    fn default_change_is_unstamped() {
        assert!(LastChange::default().is_unstamped());
        assert!(!LastChange::new("amy", 1).is_unstamped());
    }
}
