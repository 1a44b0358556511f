//! Structural type representation.
//!
//! Decompilers describe types as free-form strings. The engine parses them
//! into a small recursive sum type so two edits of a type field compare
//! structurally rather than textually (`char *` and `char*` are the same
//! type). The canonical string form is C-like and round-trips:
//!
//! ```text
//! u32              Primitive("u32")
//! char*            Pointer(Primitive("char"))
//! u8[16]           Array { element: Primitive("u8"), len: 16 }
//! struct Packet*   Pointer(Struct("Packet"))
//! enum Color       Enum("Color")
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

/// A type string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid type `{input}`: {reason}")]
pub struct TypeParseError {
    pub input: String,
    pub reason: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TypeRef {
    Primitive(String),
    Pointer(Box<TypeRef>),
    Array { element: Box<TypeRef>, len: u64 },
    Struct(String),
    Enum(String),
}

impl TypeRef {
    #[must_use]
    pub fn primitive(name: impl Into<String>) -> Self {
        Self::Primitive(name.into())
    }

    #[must_use]
    pub fn pointer_to(self) -> Self {
        Self::Pointer(Box::new(self))
    }

    #[must_use]
    pub fn array_of(self, len: u64) -> Self {
        Self::Array {
            element: Box::new(self),
            len,
        }
    }

    /// Name of the struct or enum this type ultimately refers to, if any.
    #[must_use]
    pub fn referenced_type(&self) -> Option<&str> {
        match self {
            Self::Primitive(_) => None,
            Self::Pointer(inner) | Self::Array { element: inner, .. } => inner.referenced_type(),
            Self::Struct(name) | Self::Enum(name) => Some(name),
        }
    }

    fn parse_inner(raw: &str, input: &str) -> Result<Self, TypeParseError> {
        let err = |reason| TypeParseError {
            input: input.to_string(),
            reason,
        };
        let s = raw.trim();
        if s.is_empty() {
            return Err(err("empty type"));
        }
        if s == "struct" || s == "enum" {
            return Err(err("missing type name"));
        }
        if let Some(rest) = s.strip_suffix('*') {
            return Ok(Self::parse_inner(rest, input)?.pointer_to());
        }
        if let Some(rest) = s.strip_suffix(']') {
            let open = rest.rfind('[').ok_or_else(|| err("unbalanced `]`"))?;
            let len_str = rest[open + 1..].trim();
            let len = match len_str.strip_prefix("0x") {
                Some(hex) => u64::from_str_radix(hex, 16),
                None => len_str.parse::<u64>(),
            }
            .map_err(|_| err("array length must be an integer"))?;
            return Ok(Self::parse_inner(&rest[..open], input)?.array_of(len));
        }
        if let Some(name) = s.strip_prefix("struct ") {
            return Ok(Self::Struct(Self::ident(name, input)?));
        }
        if let Some(name) = s.strip_prefix("enum ") {
            return Ok(Self::Enum(Self::ident(name, input)?));
        }
        let words: Vec<&str> = s.split_whitespace().collect();
        for word in &words {
            Self::ident(word, input)?;
        }
        Ok(Self::Primitive(words.join(" ")))
    }

    fn ident(raw: &str, input: &str) -> Result<String, TypeParseError> {
        let name = raw.trim();
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '$' | '@' | '.'));
        if valid {
            Ok(name.to_string())
        } else {
            Err(TypeParseError {
                input: input.to_string(),
                reason: "type names may only contain identifier characters",
            })
        }
    }
}

impl fmt::Display for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primitive(name) => f.write_str(name),
            Self::Pointer(inner) => write!(f, "{inner}*"),
            Self::Array { element, len } => write!(f, "{element}[{len}]"),
            Self::Struct(name) => write!(f, "struct {name}"),
            Self::Enum(name) => write!(f, "enum {name}"),
        }
    }
}

impl FromStr for TypeRef {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_inner(s, s)
    }
}

impl Serialize for TypeRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
