use std::collections::BTreeMap;

use serde::Serialize;

use super::{Addr, Artifact, ArtifactKind, StackSlot, TypeRef};

/// Signature-level facts about a function.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FunctionHeader {
    pub addr: Addr,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_type: Option<TypeRef>,
    /// Arguments by position.
    pub args: BTreeMap<u32, FunctionArg>,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FunctionArg {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeRef,
    pub size: u64,
}

impl FunctionHeader {
    #[must_use]
    pub fn new(addr: Addr, name: impl Into<String>) -> Self {
        Self {
            addr,
            name: name.into(),
            return_type: None,
            args: BTreeMap::new(),
            size: 0,
        }
    }

    #[must_use]
    pub fn with_return_type(mut self, ty: TypeRef) -> Self {
        self.return_type = Some(ty);
        self
    }

    #[must_use]
    pub fn with_arg(mut self, index: u32, name: impl Into<String>, ty: TypeRef, size: u64) -> Self {
        self.args.insert(
            index,
            FunctionArg {
                name: name.into(),
                ty,
                size,
            },
        );
        self
    }

    #[must_use]
    pub const fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Whether `addr` falls inside this function's body.
    #[must_use]
    pub const fn contains(&self, addr: Addr) -> bool {
        addr.0 >= self.addr.0 && addr.0 < self.addr.0.saturating_add(self.size)
    }
}

impl Artifact for FunctionHeader {
    type Key = Addr;
    const KIND: ArtifactKind = ArtifactKind::Function;

    fn key(&self) -> Addr {
        self.addr
    }
}

/// A named slot in a function's stack frame.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StackVariable {
    pub func: Addr,
    pub offset: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeRef,
    pub size: u64,
}

impl StackVariable {
    #[must_use]
    pub fn new(func: Addr, offset: i64, name: impl Into<String>, ty: TypeRef, size: u64) -> Self {
        Self {
            func,
            offset,
            name: name.into(),
            ty,
            size,
        }
    }
}

impl Artifact for StackVariable {
    type Key = StackSlot;
    const KIND: ArtifactKind = ArtifactKind::StackVariable;

    fn key(&self) -> StackSlot {
        StackSlot::new(self.func, self.offset)
    }
}
