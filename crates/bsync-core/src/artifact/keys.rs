//! Identity keys rendered as stable, diff-friendly strings.

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

/// A key string that could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid key `{input}`: {reason}")]
pub struct KeyParseError {
    pub input: String,
    pub reason: &'static str,
}

impl KeyParseError {
    pub(crate) fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// An address or offset. Rendered as `0x`-prefixed lowercase hex.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Addr(pub u64);

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl FromStr for Addr {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => trimmed.parse::<u64>(),
        };
        parsed
            .map(Self)
            .map_err(|_| KeyParseError::new(s, "expected 0x-prefixed hex or decimal address"))
    }
}

impl From<u64> for Addr {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Serialize for Addr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A stack variable slot: owning function plus signed frame offset.
///
/// Rendered as `0x401000:-0x10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StackSlot {
    pub func: Addr,
    pub offset: i64,
}

impl StackSlot {
    #[must_use]
    pub const fn new(func: Addr, offset: i64) -> Self {
        Self { func, offset }
    }
}

impl fmt::Display for StackSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.offset < 0 { "-" } else { "" };
        write!(f, "{}:{sign}{:#x}", self.func, self.offset.unsigned_abs())
    }
}

impl FromStr for StackSlot {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (func, offset) = s
            .split_once(':')
            .ok_or_else(|| KeyParseError::new(s, "expected `<func>:<offset>`"))?;
        let func = func.parse::<Addr>()?;
        let offset = offset.trim();
        let (negative, magnitude) = match offset.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, offset),
        };
        let magnitude = magnitude
            .parse::<Addr>()
            .map_err(|_| KeyParseError::new(s, "expected signed hex stack offset"))?;
        let magnitude = i64::try_from(magnitude.0)
            .map_err(|_| KeyParseError::new(s, "stack offset out of range"))?;
        Ok(Self {
            func,
            offset: if negative { -magnitude } else { magnitude },
        })
    }
}

impl Serialize for StackSlot {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
