//! Snapshot <-> file tree encoding.
//!
//! A snapshot is a flat tree of TOML files: one per top-level kind, keyed by
//! the rendered identity key, plus `metadata.toml` holding the user,
//! sequence number, last push and every record's `last_change`. Tombstones
//! exist only in the metadata, as entries with `deleted = true`. Member
//! stamps nest under their container's metadata entry:
//!
//! ```toml
//! # structs.toml
//! [Packet]
//! size = 16
//!
//! [Packet.members."0x0"]
//! name = "len"
//! type = "u32"
//! size = 4
//!
//! # metadata.toml
//! [struct.Packet]
//! author = "alice"
//! timestamp = 1700000000000000
//!
//! [struct.Packet.members."0x4"]
//! author = "alice"
//! timestamp = 1700000000000100
//! deleted = true
//! ```
//!
//! Tables are `BTreeMap`-backed, so output is sorted and byte-stable.
//!
//! Decoding never fails as a whole. A record that cannot be decoded is
//! left out and reported in [`Decoded::skipped`]; a record whose stamp is
//! missing or unreadable is loaded with a fallback stamp (branch owner,
//! timestamp 0) and reported in [`Decoded::repaired`].

use std::fmt::Display;
use std::io;

use toml::Value;

use crate::artifact::{
    Addr, Artifact, ArtifactKind, Comment, Composite, Enum, EnumMember, FunctionArg,
    FunctionHeader, GlobalVariable, LastChange, Patch, StackSlot, StackVariable, Struct,
    StructMember, Tracked, TypeRef,
};
use crate::error::{Result, SyncError};
use crate::snapshot::{PushInfo, Snapshot, Stored, Table, for_each_kind};
use crate::transport::FileTree;

pub const METADATA_FILE: &str = "metadata.toml";

/// Result of decoding a file tree.
#[derive(Debug)]
pub struct Decoded {
    pub snapshot: Snapshot,
    /// Records left out because they could not be decoded.
    pub skipped: Vec<SyncError>,
    /// Records loaded with a fallback stamp.
    pub repaired: Vec<SyncError>,
}

/// Field-level access to one encoded record, with errors naming the field.
pub struct RecordReader<'a> {
    kind: ArtifactKind,
    key: &'a str,
    prefix: String,
    table: &'a toml::Table,
}

impl<'a> RecordReader<'a> {
    #[must_use]
    pub const fn new(kind: ArtifactKind, key: &'a str, table: &'a toml::Table) -> Self {
        Self {
            kind,
            key,
            prefix: String::new(),
            table,
        }
    }

    /// Reader for a nested table; field names are reported as `field.sub`.
    fn child(&self, field: &str, value: &'a Value) -> Result<Self> {
        let path = format!("{}{field}", self.prefix);
        let table = value
            .as_table()
            .ok_or_else(|| SyncError::corrupt(self.kind, self.key, &path, "expected a table"))?;
        Ok(Self {
            kind: self.kind,
            key: self.key,
            prefix: format!("{path}."),
            table,
        })
    }

    fn err(&self, field: &str, reason: impl Display) -> SyncError {
        SyncError::corrupt(self.kind, self.key, format!("{}{field}", self.prefix), reason)
    }

    pub fn str(&self, field: &str) -> Result<String> {
        self.opt_str(field)?
            .ok_or_else(|| self.err(field, "missing required field"))
    }

    pub fn opt_str(&self, field: &str) -> Result<Option<String>> {
        match self.table.get(field) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(other) => Err(self.err(field, format!("expected string, found {}", other.type_str()))),
        }
    }

    /// Non-negative integer; `0x` strings are accepted too.
    pub fn u64_or(&self, field: &str, default: u64) -> Result<u64> {
        match self.table.get(field) {
            None => Ok(default),
            Some(Value::Integer(n)) => {
                u64::try_from(*n).map_err(|_| self.err(field, "expected non-negative integer"))
            }
            Some(Value::String(s)) => s
                .parse::<Addr>()
                .map(|a| a.0)
                .map_err(|_| self.err(field, format!("`{s}` is not an integer"))),
            Some(other) => Err(self.err(field, format!("expected integer, found {}", other.type_str()))),
        }
    }

    pub fn i64(&self, field: &str) -> Result<i64> {
        match self.table.get(field) {
            Some(Value::Integer(n)) => Ok(*n),
            Some(other) => Err(self.err(field, format!("expected integer, found {}", other.type_str()))),
            None => Err(self.err(field, "missing required field")),
        }
    }

    pub fn bool_or(&self, field: &str, default: bool) -> Result<bool> {
        match self.table.get(field) {
            None => Ok(default),
            Some(Value::Boolean(b)) => Ok(*b),
            Some(other) => Err(self.err(field, format!("expected boolean, found {}", other.type_str()))),
        }
    }

    pub fn type_ref(&self, field: &str) -> Result<TypeRef> {
        self.opt_type_ref(field)?
            .ok_or_else(|| self.err(field, "missing required field"))
    }

    pub fn opt_type_ref(&self, field: &str) -> Result<Option<TypeRef>> {
        self.opt_str(field)?
            .map(|raw| raw.parse::<TypeRef>().map_err(|e| self.err(field, e)))
            .transpose()
    }

    pub fn table(&self, field: &str) -> Result<Option<&'a toml::Table>> {
        match self.table.get(field) {
            None => Ok(None),
            Some(Value::Table(t)) => Ok(Some(t)),
            Some(other) => Err(self.err(field, format!("expected table, found {}", other.type_str()))),
        }
    }
}

/// Builds one encoded record.
struct RecordWriter {
    kind: ArtifactKind,
    key: String,
    table: toml::Table,
}

impl RecordWriter {
    fn new(kind: ArtifactKind, key: impl Display) -> Self {
        Self {
            kind,
            key: key.to_string(),
            table: toml::Table::new(),
        }
    }

    fn str(&mut self, field: &str, value: impl Into<String>) -> &mut Self {
        self.table.insert(field.to_string(), Value::String(value.into()));
        self
    }

    fn u64(&mut self, field: &str, value: u64) -> Result<&mut Self> {
        let n = i64::try_from(value)
            .map_err(|_| SyncError::corrupt(self.kind, &self.key, field, "value exceeds 63 bits"))?;
        self.table.insert(field.to_string(), Value::Integer(n));
        Ok(self)
    }

    fn table(&mut self, field: &str, table: toml::Table) -> &mut Self {
        if !table.is_empty() {
            self.table.insert(field.to_string(), Value::Table(table));
        }
        self
    }

    fn finish(&mut self) -> toml::Table {
        std::mem::take(&mut self.table)
    }
}

/// Per-kind record encoding.
pub trait Record: Stored {
    /// Encode the payload. The key is not part of the body.
    fn encode(&self) -> Result<toml::Table>;

    /// Decode a payload stored under `key`. Corrupt sub-records (struct or
    /// enum members) are pushed to `skipped` rather than failing the record.
    fn decode(key: &Self::Key, record: &RecordReader<'_>, skipped: &mut Vec<SyncError>)
    -> Result<Self>;

    /// Write member stamps into the container's metadata entry.
    fn encode_member_stamps(&self, _entry: &mut toml::Table) -> Result<()> {
        Ok(())
    }

    /// Restore member stamps and member tombstones from the container's
    /// metadata entry.
    fn decode_member_stamps(
        &mut self,
        _entry: Option<&toml::Table>,
        _fallback: &LastChange,
        _out: &mut Issues,
    ) {
    }
}

/// Problems gathered while decoding.
#[derive(Debug, Default)]
pub struct Issues {
    pub skipped: Vec<SyncError>,
    pub repaired: Vec<SyncError>,
}

impl Record for FunctionHeader {
    fn encode(&self) -> Result<toml::Table> {
        let mut w = RecordWriter::new(Self::KIND, self.addr);
        w.str("name", &self.name);
        if let Some(ret) = &self.return_type {
            w.str("return_type", ret.to_string());
        }
        w.u64("size", self.size)?;
        let mut args = toml::Table::new();
        for (index, arg) in &self.args {
            let mut a = RecordWriter::new(Self::KIND, self.addr);
            a.str("name", &arg.name).str("type", arg.ty.to_string());
            a.u64("size", arg.size)?;
            args.insert(index.to_string(), Value::Table(a.finish()));
        }
        w.table("args", args);
        Ok(w.finish())
    }

    fn decode(key: &Addr, r: &RecordReader<'_>, _skipped: &mut Vec<SyncError>) -> Result<Self> {
        let mut func = Self::new(*key, r.str("name")?);
        func.return_type = r.opt_type_ref("return_type")?;
        func.size = r.u64_or("size", 0)?;
        for (index, raw) in r.table("args")?.into_iter().flatten() {
            let position = index
                .parse::<u32>()
                .map_err(|_| r.err("args", format!("argument index `{index}` is not an integer")))?;
            let arg = r.child(&format!("args.{index}"), raw)?;
            func.args.insert(
                position,
                FunctionArg {
                    name: arg.str("name")?,
                    ty: arg.type_ref("type")?,
                    size: arg.u64_or("size", 0)?,
                },
            );
        }
        Ok(func)
    }
}

impl Record for StackVariable {
    fn encode(&self) -> Result<toml::Table> {
        let mut w = RecordWriter::new(Self::KIND, self.key());
        w.str("name", &self.name).str("type", self.ty.to_string());
        w.u64("size", self.size)?;
        Ok(w.finish())
    }

    fn decode(key: &StackSlot, r: &RecordReader<'_>, _skipped: &mut Vec<SyncError>) -> Result<Self> {
        Ok(Self::new(
            key.func,
            key.offset,
            r.str("name")?,
            r.type_ref("type")?,
            r.u64_or("size", 0)?,
        ))
    }
}

impl Record for GlobalVariable {
    fn encode(&self) -> Result<toml::Table> {
        let mut w = RecordWriter::new(Self::KIND, self.addr);
        w.str("name", &self.name);
        if let Some(ty) = &self.ty {
            w.str("type", ty.to_string());
        }
        w.u64("size", self.size)?;
        Ok(w.finish())
    }

    fn decode(key: &Addr, r: &RecordReader<'_>, _skipped: &mut Vec<SyncError>) -> Result<Self> {
        Ok(Self::new(
            *key,
            r.str("name")?,
            r.opt_type_ref("type")?,
            r.u64_or("size", 0)?,
        ))
    }
}

impl Record for Comment {
    fn encode(&self) -> Result<toml::Table> {
        let mut w = RecordWriter::new(Self::KIND, self.addr);
        w.str("text", &self.text);
        if self.decompiled {
            w.table.insert("decompiled".to_string(), Value::Boolean(true));
        }
        Ok(w.finish())
    }

    fn decode(key: &Addr, r: &RecordReader<'_>, _skipped: &mut Vec<SyncError>) -> Result<Self> {
        Ok(Self {
            addr: *key,
            text: r.str("text")?,
            decompiled: r.bool_or("decompiled", false)?,
        })
    }
}

impl Record for Patch {
    fn encode(&self) -> Result<toml::Table> {
        let mut w = RecordWriter::new(Self::KIND, self.offset);
        w.str("object", &self.object).str("bytes", self.hex_bytes());
        Ok(w.finish())
    }

    fn decode(key: &Addr, r: &RecordReader<'_>, _skipped: &mut Vec<SyncError>) -> Result<Self> {
        let raw = r.str("bytes")?;
        let bytes = Self::parse_hex(&raw).ok_or_else(|| r.err("bytes", "expected an even-length hex string"))?;
        Ok(Self::new(r.str("object")?, *key, bytes))
    }
}

impl Record for Struct {
    fn encode(&self) -> Result<toml::Table> {
        let mut w = RecordWriter::new(Self::KIND, &self.name);
        w.u64("size", self.size)?;
        let mut members = toml::Table::new();
        for member in self.live_members() {
            let mut m = RecordWriter::new(Self::KIND, &self.name);
            m.str("name", &member.name).str("type", member.ty.to_string());
            m.u64("size", member.size)?;
            members.insert(member.offset.to_string(), Value::Table(m.finish()));
        }
        w.table("members", members);
        Ok(w.finish())
    }

    fn decode(key: &String, r: &RecordReader<'_>, skipped: &mut Vec<SyncError>) -> Result<Self> {
        let mut ty = Self::new(key.clone(), r.u64_or("size", 0)?);
        for (raw_offset, raw) in r.table("members")?.into_iter().flatten() {
            let member = raw_offset
                .parse::<Addr>()
                .map_err(|e| r.err(&format!("members.{raw_offset}"), e))
                .and_then(|offset| {
                    let m = r.child(&format!("members.{raw_offset}"), raw)?;
                    Ok(StructMember::new(offset, m.str("name")?, m.type_ref("type")?, m.u64_or("size", 0)?))
                });
            match member {
                Ok(member) => {
                    ty.members.insert(member.offset, Tracked::pending(member));
                }
                Err(err) => skipped.push(err),
            }
        }
        Ok(ty)
    }

    fn encode_member_stamps(&self, entry: &mut toml::Table) -> Result<()> {
        encode_members(self, entry)
    }

    fn decode_member_stamps(&mut self, entry: Option<&toml::Table>, fallback: &LastChange, out: &mut Issues) {
        decode_members(self, entry, fallback, out);
    }
}

impl Record for Enum {
    fn encode(&self) -> Result<toml::Table> {
        let mut w = RecordWriter::new(Self::KIND, &self.name);
        let members: toml::Table = self
            .live_members()
            .map(|m| (m.name.clone(), Value::Integer(m.value)))
            .collect();
        w.table("members", members);
        Ok(w.finish())
    }

    fn decode(key: &String, r: &RecordReader<'_>, skipped: &mut Vec<SyncError>) -> Result<Self> {
        let mut ty = Self::new(key.clone());
        if let Some(members) = r.table("members")? {
            let values = RecordReader {
                kind: ArtifactKind::EnumMember,
                key: r.key,
                prefix: "members.".to_string(),
                table: members,
            };
            for name in members.keys() {
                match values.i64(name) {
                    Ok(value) => {
                        ty.members
                            .insert(name.clone(), Tracked::pending(EnumMember::new(name, value)));
                    }
                    Err(err) => skipped.push(err),
                }
            }
        }
        Ok(ty)
    }

    fn encode_member_stamps(&self, entry: &mut toml::Table) -> Result<()> {
        encode_members(self, entry)
    }

    fn decode_member_stamps(&mut self, entry: Option<&toml::Table>, fallback: &LastChange, out: &mut Issues) {
        decode_members(self, entry, fallback, out);
    }
}

fn encode_stamp(kind: ArtifactKind, key: &str, stamp: &LastChange, deleted: bool) -> Result<toml::Table> {
    let mut w = RecordWriter::new(kind, key);
    w.str("author", &stamp.author);
    w.u64("timestamp", stamp.timestamp)?;
    if let Some(note) = &stamp.note {
        w.str("note", note);
    }
    if deleted {
        w.table.insert("deleted".to_string(), Value::Boolean(true));
    }
    Ok(w.finish())
}

fn decode_stamp(kind: ArtifactKind, key: &str, entry: &toml::Table) -> Result<(LastChange, bool)> {
    let r = RecordReader::new(kind, key, entry);
    let timestamp = match entry.get("timestamp") {
        Some(_) => r.u64_or("timestamp", 0)?,
        None => return Err(r.err("timestamp", "missing required field")),
    };
    let stamp = LastChange {
        timestamp,
        author: r.str("author")?,
        note: r.opt_str("note")?,
    };
    Ok((stamp, r.bool_or("deleted", false)?))
}

fn encode_members<C: Composite>(container: &C, entry: &mut toml::Table) -> Result<()> {
    let header = container.header_change();
    if !header.is_unstamped() {
        let stamp = encode_stamp(C::KIND, &container.key(), header, false)?;
        entry.insert("header".to_string(), Value::Table(stamp));
    }
    let mut members = toml::Table::new();
    for (key, tracked) in container.members() {
        let rendered = key.to_string();
        let path = format!("{}.{rendered}", container.key());
        let stamp = encode_stamp(C::Member::KIND, &path, &tracked.last_change, tracked.is_tombstone())?;
        members.insert(rendered, Value::Table(stamp));
    }
    if !members.is_empty() {
        entry.insert("members".to_string(), Value::Table(members));
    }
    Ok(())
}

fn decode_members<C: Composite>(
    container: &mut C,
    entry: Option<&toml::Table>,
    fallback: &LastChange,
    out: &mut Issues,
) {
    let name = container.key();
    // Absent for records written before headers carried their own stamp;
    // the merge then falls back to the container stamp.
    match entry.and_then(|e| e.get("header")) {
        None => {}
        Some(Value::Table(t)) => match decode_stamp(C::KIND, &name, t) {
            Ok((stamp, _)) => *container.header_change_mut() = stamp,
            Err(err) => out.repaired.push(err),
        },
        Some(_) => out.repaired.push(SyncError::corrupt(C::KIND, name.as_str(), "header", "expected a table")),
    }
    let stamps = entry
        .and_then(|e| e.get("members"))
        .and_then(Value::as_table);

    for (key, tracked) in container.members_mut().iter_mut() {
        let rendered = key.to_string();
        let path = format!("{name}.{rendered}");
        let found = stamps.and_then(|s| s.get(&rendered)).and_then(Value::as_table);
        tracked.last_change = match found.map(|t| decode_stamp(C::Member::KIND, &path, t)) {
            Some(Ok((stamp, _))) => stamp,
            Some(Err(err)) => {
                out.repaired.push(err);
                fallback.clone()
            }
            None => {
                out.repaired.push(SyncError::corrupt(
                    C::Member::KIND,
                    path,
                    "last_change",
                    "missing metadata entry",
                ));
                fallback.clone()
            }
        };
    }

    for (rendered, raw) in stamps.into_iter().flatten() {
        let path = format!("{name}.{rendered}");
        let Ok(key) = rendered.parse::<<C::Member as Artifact>::Key>() else {
            out.skipped.push(SyncError::corrupt(C::Member::KIND, path, "key", "unparsable member key"));
            continue;
        };
        if container.members().contains_key(&key) {
            continue;
        }
        let Some(table) = raw.as_table() else {
            out.skipped.push(SyncError::corrupt(C::Member::KIND, path, "last_change", "expected a table"));
            continue;
        };
        match decode_stamp(C::Member::KIND, &path, table) {
            Ok((stamp, true)) => {
                container.members_mut().insert(key, Tracked::tombstone(stamp));
            }
            // Body was corrupt and has already been reported.
            Ok((_, false)) => {}
            Err(err) => out.skipped.push(err),
        }
    }
}

fn invalid_data(err: impl Display) -> SyncError {
    SyncError::Io(io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
}

fn encode_table<A: Record>(table: &Table<A>, tree: &mut FileTree, meta: &mut toml::Table) -> Result<()> {
    let mut body = toml::Table::new();
    let mut stamps = toml::Table::new();
    for (key, tracked) in table {
        let rendered = key.to_string();
        let mut entry = encode_stamp(A::KIND, &rendered, &tracked.last_change, tracked.is_tombstone())?;
        if let Some(value) = tracked.value() {
            body.insert(rendered.clone(), Value::Table(value.encode()?));
            value.encode_member_stamps(&mut entry)?;
        }
        stamps.insert(rendered, Value::Table(entry));
    }
    if !stamps.is_empty() {
        meta.insert(A::KIND.as_str().to_string(), Value::Table(stamps));
    }
    let text = toml::to_string(&body).map_err(invalid_data)?;
    tree.insert(A::FILE.to_string(), text.into_bytes());
    Ok(())
}

/// Encode a snapshot as a file tree.
///
/// # Errors
///
/// `CorruptArtifact` if a numeric field does not fit the on-disk integer
/// range.
pub fn encode_snapshot(snapshot: &Snapshot) -> Result<FileTree> {
    let mut tree = FileTree::new();
    let mut meta = toml::Table::new();
    meta.insert("user".to_string(), Value::String(snapshot.user.clone()));
    let sequence = i64::try_from(snapshot.sequence).map_err(invalid_data)?;
    meta.insert("sequence".to_string(), Value::Integer(sequence));
    if let Some(push) = &snapshot.last_push {
        let mut w = RecordWriter::new(push.kind, &push.key);
        w.u64("timestamp", push.timestamp)?;
        w.str("kind", push.kind.as_str()).str("key", &push.key);
        meta.insert("last_push".to_string(), Value::Table(w.finish()));
    }

    for_each_kind!(A => {
        encode_table::<A>(A::table(&snapshot.artifacts), &mut tree, &mut meta)?;
    });

    let text = toml::to_string(&meta).map_err(invalid_data)?;
    tree.insert(METADATA_FILE.to_string(), text.into_bytes());
    Ok(tree)
}

fn parse_file(tree: &FileTree, name: &str, kind: ArtifactKind) -> Result<Option<toml::Table>> {
    let Some(bytes) = tree.get(name) else {
        return Ok(None);
    };
    let text = std::str::from_utf8(bytes).map_err(|e| SyncError::corrupt(kind, "*", name, e))?;
    toml::from_str::<toml::Table>(text)
        .map(Some)
        .map_err(|e| SyncError::corrupt(kind, "*", name, e.message()))
}

fn decode_table<A: Record>(
    tree: &FileTree,
    meta: &toml::Table,
    fallback: &LastChange,
    table: &mut Table<A>,
    out: &mut Issues,
) {
    let body = match parse_file(tree, A::FILE, A::KIND) {
        Ok(body) => body.unwrap_or_default(),
        Err(err) => {
            out.skipped.push(err);
            toml::Table::new()
        }
    };
    let stamps = meta.get(A::KIND.as_str()).and_then(Value::as_table);

    for (rendered, raw) in &body {
        let key = match A::parse_key(rendered) {
            Ok(key) => key,
            Err(err) => {
                out.skipped.push(SyncError::corrupt(A::KIND, rendered, "key", err));
                continue;
            }
        };
        let Some(fields) = raw.as_table() else {
            out.skipped.push(SyncError::corrupt(A::KIND, rendered, "record", "expected a table"));
            continue;
        };
        let reader = RecordReader::new(A::KIND, rendered, fields);
        let mut value = match A::decode(&key, &reader, &mut out.skipped) {
            Ok(value) => value,
            Err(err) => {
                out.skipped.push(err);
                continue;
            }
        };
        let entry = stamps.and_then(|s| s.get(rendered)).and_then(Value::as_table);
        let stamp = match entry.map(|e| decode_stamp(A::KIND, rendered, e)) {
            Some(Ok((stamp, _))) => stamp,
            Some(Err(err)) => {
                out.repaired.push(err);
                fallback.clone()
            }
            None => {
                out.repaired.push(SyncError::corrupt(A::KIND, rendered, "last_change", "missing metadata entry"));
                fallback.clone()
            }
        };
        value.decode_member_stamps(entry, fallback, out);
        table.insert(key, Tracked::live(value, stamp));
    }

    for (rendered, raw) in stamps.into_iter().flatten() {
        if body.contains_key(rendered) {
            continue;
        }
        let decoded = raw
            .as_table()
            .ok_or_else(|| SyncError::corrupt(A::KIND, rendered, "last_change", "expected a table"))
            .and_then(|entry| decode_stamp(A::KIND, rendered, entry));
        match decoded {
            Ok((stamp, true)) => match A::parse_key(rendered) {
                Ok(key) => {
                    table.insert(key, Tracked::tombstone(stamp));
                }
                Err(err) => out.skipped.push(SyncError::corrupt(A::KIND, rendered, "key", err)),
            },
            Ok((_, false)) => {
                tracing::debug!(kind = %A::KIND, key = %rendered, "stamp without a record body");
            }
            Err(err) => out.skipped.push(err),
        }
    }
}

fn decode_push_info(meta: &toml::Table) -> Result<Option<PushInfo>> {
    let Some(raw) = meta.get("last_push") else {
        return Ok(None);
    };
    let table = raw
        .as_table()
        .ok_or_else(|| SyncError::corrupt(ArtifactKind::Function, "last_push", "last_push", "expected a table"))?;
    let r = RecordReader::new(ArtifactKind::Function, "last_push", table);
    let kind = r
        .str("kind")?
        .parse::<ArtifactKind>()
        .map_err(|e| r.err("kind", e))?;
    Ok(Some(PushInfo {
        timestamp: r.u64_or("timestamp", 0)?,
        kind,
        key: r.str("key")?,
    }))
}

/// Decode the file tree of `owner`'s branch.
#[must_use]
pub fn decode_snapshot(owner: &str, tree: &FileTree) -> Decoded {
    let mut out = Issues::default();
    let mut snapshot = Snapshot::new(owner);
    let fallback = LastChange::new(owner, 0);

    let meta = match parse_file(tree, METADATA_FILE, ArtifactKind::Function) {
        Ok(meta) => meta.unwrap_or_default(),
        Err(err) => {
            out.repaired.push(err);
            toml::Table::new()
        }
    };
    if let Some(Value::Integer(seq)) = meta.get("sequence") {
        snapshot.sequence = u64::try_from(*seq).unwrap_or(0);
    }
    match decode_push_info(&meta) {
        Ok(info) => snapshot.last_push = info,
        Err(err) => out.repaired.push(err),
    }

    for_each_kind!(A => {
        decode_table::<A>(tree, &meta, &fallback, A::table_mut(&mut snapshot.artifacts), &mut out);
    });

    Decoded {
        snapshot,
        skipped: out.skipped,
        repaired: out.repaired,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(ts: u64) -> LastChange {
        LastChange::new("alice", ts)
    }

    fn sample() -> Snapshot {
        let mut snap = Snapshot::new("alice");
        snap.sequence = 3;
        snap.last_push = Some(PushInfo {
            timestamp: 42,
            kind: ArtifactKind::Function,
            key: "0x401000".into(),
        });
        let set = &mut snap.artifacts;
        set.put(
            FunctionHeader::new(Addr(0x40_1000), "parse_header")
                .with_return_type(TypeRef::primitive("int"))
                .with_arg(0, "buf", TypeRef::primitive("char").pointer_to(), 8)
                .with_size(0x80),
            stamp(100).with_note("from ghidra"),
        );
        set.put(
            StackVariable::new(Addr(0x40_1000), -0x10, "len", TypeRef::primitive("u32"), 4),
            stamp(101),
        );
        let mut packet = Struct::new("Packet", 16)
            .with_member(StructMember::new(Addr(0), "len", TypeRef::primitive("u32"), 4))
            .with_member(StructMember::new(Addr(4), "data", TypeRef::primitive("u8").array_of(12), 12));
        packet.stamp_members(None, &stamp(102));
        packet.members.insert(Addr(8), Tracked::tombstone(stamp(103)));
        set.put(packet, stamp(103));
        let mut color = Enum::new("Color").with_member("RED", 0).with_member("BLUE", -1);
        color.stamp_members(None, &stamp(104));
        set.put(color, stamp(104));
        set.put(GlobalVariable::new(Addr(0x60_0000), "g_state", None, 8), stamp(105));
        set.put(Comment::new(Addr(0x40_1004), "checks magic").decompiled(), stamp(106));
        set.put(Patch::new("a.out", Addr(0x1234), vec![0x90, 0x90]), stamp(107));
        set.put_tombstone::<Comment>(Addr(0x40_2000), stamp(108));
        snap
    }

    fn text(tree: &FileTree, name: &str) -> String {
        String::from_utf8(tree[name].clone()).unwrap()
    }

    #[test]
    fn decode_restores_what_was_encoded() {
        let snap = sample();
        let tree = encode_snapshot(&snap).unwrap();
        let decoded = decode_snapshot("alice", &tree);
        assert!(decoded.skipped.is_empty(), "{:?}", decoded.skipped);
        assert!(decoded.repaired.is_empty(), "{:?}", decoded.repaired);
        assert_eq!(decoded.snapshot, snap);
    }

    #[test]
    fn encoding_is_byte_stable() {
        let a = encode_snapshot(&sample()).unwrap();
        let b = encode_snapshot(&sample()).unwrap();
        assert_eq!(a, b);
        assert!(a.contains_key("functions.toml"));
        assert!(a.contains_key("patches.toml"));
        assert!(a.contains_key(METADATA_FILE));
    }

    #[test]
    fn tombstones_live_only_in_metadata() {
        let tree = encode_snapshot(&sample()).unwrap();
        assert!(!text(&tree, "comments.toml").contains("0x402000"));
        let meta = text(&tree, METADATA_FILE);
        assert!(meta.contains("0x402000"));
        assert!(meta.contains("deleted = true"));
    }

    #[test]
    fn keys_render_as_hex() {
        let tree = encode_snapshot(&sample()).unwrap();
        assert!(text(&tree, "functions.toml").contains("[0x401000]"));
        assert!(text(&tree, "stack_vars.toml").contains("0x401000:-0x10"));
        assert!(text(&tree, "structs.toml").contains("[Packet]"));
    }

    #[test]
    fn corrupt_record_is_skipped_and_the_rest_loads() {
        let mut tree = encode_snapshot(&sample()).unwrap();
        let bad = "[\"0x401000\"]\nname = \"ok\"\n\n[\"0x500000\"]\nname = \"broken\"\nreturn_type = \"int (*)(void)\"\n";
        tree.insert("functions.toml".into(), bad.as_bytes().to_vec());

        let decoded = decode_snapshot("alice", &tree);
        assert_eq!(decoded.skipped.len(), 1);
        match &decoded.skipped[0] {
            SyncError::CorruptArtifact { kind, key, field, .. } => {
                assert_eq!(*kind, ArtifactKind::Function);
                assert_eq!(key, "0x500000");
                assert_eq!(field, "return_type");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(decoded.snapshot.artifacts.live::<FunctionHeader>(&Addr(0x40_1000)).is_some());
        assert_eq!(decoded.snapshot.artifacts.structs.len(), 1);
    }

    #[test]
    fn unparsable_file_skips_only_that_kind() {
        let mut tree = encode_snapshot(&sample()).unwrap();
        tree.insert("enums.toml".into(), b"[[[".to_vec());
        let decoded = decode_snapshot("alice", &tree);
        assert_eq!(decoded.skipped.len(), 1);
        assert!(decoded.snapshot.artifacts.enums.is_empty());
        assert_eq!(decoded.snapshot.artifacts.functions.len(), 1);
    }

    #[test]
    fn missing_metadata_falls_back_to_owner_stamp() {
        let mut tree = encode_snapshot(&sample()).unwrap();
        tree.remove(METADATA_FILE);
        let decoded = decode_snapshot("alice", &tree);
        assert!(decoded.skipped.is_empty());
        assert!(!decoded.repaired.is_empty());
        let func = decoded.snapshot.artifacts.get::<FunctionHeader>(&Addr(0x40_1000)).unwrap();
        assert_eq!(func.last_change, LastChange::new("alice", 0));
        // Tombstones exist only in metadata, so they are gone too.
        assert!(decoded.snapshot.artifacts.comments.get(&Addr(0x40_2000)).is_none());
    }

    #[test]
    fn corrupt_member_is_skipped_inside_healthy_struct() {
        let mut tree = encode_snapshot(&sample()).unwrap();
        let structs = "[Packet]\nsize = 16\n\n[Packet.members.\"0x0\"]\nname = \"len\"\ntype = \"u32\"\nsize = 4\n\n[Packet.members.\"0x4\"]\nname = \"data\"\n";
        tree.insert("structs.toml".into(), structs.as_bytes().to_vec());
        let decoded = decode_snapshot("alice", &tree);
        assert_eq!(decoded.skipped.len(), 1);
        let packet = decoded.snapshot.artifacts.live::<Struct>(&"Packet".to_string()).unwrap();
        assert!(packet.member(Addr(0)).is_some());
        assert!(packet.member(Addr(4)).is_none());
    }

    #[test]
    fn struct_header_stamp_is_kept_apart_from_the_container_stamp() {
        let mut tree = encode_snapshot(&sample()).unwrap();
        let decoded = decode_snapshot("alice", &tree);
        let packet = decoded.snapshot.artifacts.get::<Struct>(&"Packet".to_string()).unwrap();
        assert_eq!(packet.last_change, stamp(103));
        assert_eq!(packet.value().unwrap().header_change, stamp(102));

        // Metadata without a header stamp loads with an unstamped header.
        let mut meta: toml::Table = toml::from_str(&text(&tree, METADATA_FILE)).unwrap();
        let structs = meta.get_mut("struct").and_then(Value::as_table_mut).unwrap();
        let entry = structs.get_mut("Packet").and_then(Value::as_table_mut).unwrap();
        assert!(entry.remove("header").is_some());
        tree.insert(METADATA_FILE.into(), toml::to_string(&meta).unwrap().into_bytes());

        let decoded = decode_snapshot("alice", &tree);
        assert!(decoded.repaired.is_empty(), "{:?}", decoded.repaired);
        let packet = decoded.snapshot.artifacts.live::<Struct>(&"Packet".to_string()).unwrap();
        assert!(packet.header_change.is_unstamped());
        assert_eq!(packet.members[&Addr(0)].last_change, stamp(102));
    }

    #[test]
    fn bad_patch_bytes_name_the_field() {
        let mut tree = encode_snapshot(&sample()).unwrap();
        tree.insert("patches.toml".into(), b"[\"0x10\"]\nobject = \"a.out\"\nbytes = \"9\"\n".to_vec());
        let decoded = decode_snapshot("alice", &tree);
        assert!(matches!(
            &decoded.skipped[0],
            SyncError::CorruptArtifact { field, .. } if field == "bytes"
        ));
    }
}
