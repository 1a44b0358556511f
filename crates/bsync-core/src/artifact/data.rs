use serde::Serialize;

use super::{Addr, Artifact, ArtifactKind, TypeRef};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct GlobalVariable {
    pub addr: Addr,
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub ty: Option<TypeRef>,
    pub size: u64,
}

impl GlobalVariable {
    #[must_use]
    pub fn new(addr: Addr, name: impl Into<String>, ty: Option<TypeRef>, size: u64) -> Self {
        Self {
            addr,
            name: name.into(),
            ty,
            size,
        }
    }
}

impl Artifact for GlobalVariable {
    type Key = Addr;
    const KIND: ArtifactKind = ArtifactKind::GlobalVariable;

    fn key(&self) -> Addr {
        self.addr
    }
}

/// Free-form comment at an address.
///
/// Comments merge independently of any function or variable at the same
/// address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Comment {
    pub addr: Addr,
    pub text: String,
    /// Shown in the decompiler output rather than the disassembly.
    pub decompiled: bool,
}

impl Comment {
    #[must_use]
    pub fn new(addr: Addr, text: impl Into<String>) -> Self {
        Self {
            addr,
            text: text.into(),
            decompiled: false,
        }
    }

    #[must_use]
    pub const fn decompiled(mut self) -> Self {
        self.decompiled = true;
        self
    }
}

impl Artifact for Comment {
    type Key = Addr;
    const KIND: ArtifactKind = ArtifactKind::Comment;

    fn key(&self) -> Addr {
        self.addr
    }
}

/// Replacement bytes at a file offset of a loaded object.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Patch {
    pub offset: Addr,
    pub object: String,
    pub bytes: Vec<u8>,
}

impl Patch {
    #[must_use]
    pub fn new(object: impl Into<String>, offset: Addr, bytes: Vec<u8>) -> Self {
        Self {
            offset,
            object: object.into(),
            bytes,
        }
    }

    /// Lowercase hex rendering used on disk.
    #[must_use]
    pub fn hex_bytes(&self) -> String {
        use std::fmt::Write as _;
        self.bytes.iter().fold(String::with_capacity(self.bytes.len() * 2), |mut out, b| {
            let _ = write!(out, "{b:02x}");
            out
        })
    }

    /// Parse a hex byte string; `None` on odd length or non-hex digits.
    #[must_use]
    pub fn parse_hex(raw: &str) -> Option<Vec<u8>> {
        let raw = raw.trim();
        if raw.len() % 2 != 0 {
            return None;
        }
        (0..raw.len())
            .step_by(2)
            .map(|i| raw.get(i..i + 2).and_then(|pair| u8::from_str_radix(pair, 16).ok()))
            .collect()
    }
}

impl Artifact for Patch {
    type Key = Addr;
    const KIND: ArtifactKind = ArtifactKind::Patch;

    fn key(&self) -> Addr {
        self.offset
    }
}
