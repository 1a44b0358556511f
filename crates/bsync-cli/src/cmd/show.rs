//! `bsync show`: one artifact of the merged view and how it was resolved.

use crate::cmd::pull::PullArgs;
use crate::cmd::{open_client, parse_kind};
use crate::output::{CliError, OutputMode, pretty_kv, pretty_section, render};
use anyhow::Result;
use bsync_core::Resolution;
use bsync_core::artifact::{AnyArtifact, ArtifactKind};
use clap::Args;
use serde::Serialize;
use std::io::{self, Write};
use std::path::Path;

#[derive(Args, Debug)]
pub struct ShowArgs {
    /// Artifact kind (function, stack_var, struct, struct_member, enum,
    /// enum_member, global, comment, patch).
    #[arg(value_parser = parse_kind)]
    pub kind: ArtifactKind,

    /// Rendered key: `0x401000`, `0x401000:-0x10`, `Packet`, `Packet.0x4`.
    pub key: String,

    #[command(flatten)]
    pub scope: PullArgs,
}

#[derive(Debug, Serialize)]
struct ShowReport {
    kind: ArtifactKind,
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<AnyArtifact>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolution: Option<Resolution>,
    stale: bool,
}

const fn is_member(kind: ArtifactKind) -> bool {
    matches!(kind, ArtifactKind::StructMember | ArtifactKind::EnumMember)
}

fn describe(value: &AnyArtifact, w: &mut dyn Write) -> io::Result<()> {
    match value {
        AnyArtifact::Function(f) => {
            let ret = f.return_type.as_ref().map_or_else(|| "?".to_string(), ToString::to_string);
            let args: Vec<String> = f.args.values().map(|a| format!("{} {}", a.ty, a.name)).collect();
            writeln!(w, "{ret} {}({})", f.name, args.join(", "))
        }
        AnyArtifact::StackVariable(v) => writeln!(w, "{} {} [{}{:+}]", v.ty, v.name, v.func, v.offset),
        AnyArtifact::Struct(s) => {
            writeln!(w, "struct {} (size {})", s.name, s.size)?;
            for m in s.members.values().filter_map(|t| t.value.as_ref()) {
                writeln!(w, "  {} {} {}", m.offset, m.ty, m.name)?;
            }
            Ok(())
        }
        AnyArtifact::Enum(e) => {
            writeln!(w, "enum {}", e.name)?;
            for m in e.members.values().filter_map(|t| t.value.as_ref()) {
                writeln!(w, "  {} = {}", m.name, m.value)?;
            }
            Ok(())
        }
        AnyArtifact::GlobalVariable(g) => {
            let ty = g.ty.as_ref().map_or_else(|| "?".to_string(), ToString::to_string);
            writeln!(w, "{ty} {} @ {}", g.name, g.addr)
        }
        AnyArtifact::Comment(c) => writeln!(w, "{}", c.text),
        AnyArtifact::Patch(p) => writeln!(w, "{}+{}: {}", p.object, p.offset, p.hex_bytes()),
    }
}

/// Execute `bsync show`.
///
/// # Errors
///
/// `InvalidKey` for a malformed key; an error if the merged view has
/// neither a value nor a resolution for the key.
pub fn run_show(args: &ShowArgs, workspace: &Path, mode: OutputMode) -> Result<()> {
    let client = open_client(workspace)?;
    let view = client.pull(&args.scope.scope())?.view;

    let value = if is_member(args.kind) {
        None
    } else {
        view.find(args.kind, &args.key)?
    };
    let key = value.as_ref().map_or_else(|| args.key.clone(), AnyArtifact::key_string);
    let resolution = view.resolution(args.kind, &key).cloned();
    if value.is_none() && resolution.is_none() {
        return Err(CliError::new(format!("no {} `{}` in the merged view", args.kind, args.key)).into());
    }

    let report = ShowReport {
        kind: args.kind,
        key,
        value,
        resolution,
        stale: view.stale,
    };
    render(mode, &report, |r, w| {
        if mode.is_pretty() {
            pretty_section(w, &format!("{} {}", r.kind, r.key))?;
        }
        match &r.value {
            Some(value) => describe(value, w)?,
            None if is_member(r.kind) => {}
            None => writeln!(w, "(deleted)")?,
        }
        if let Some(res) = &r.resolution {
            pretty_kv(w, "outcome", res.outcome.as_str())?;
            pretty_kv(
                w,
                "winner",
                format!("{} @ {}", res.winner.author, res.winner.timestamp),
            )?;
            for o in &res.overridden {
                pretty_kv(w, "overrode", format!("{} @ {}", o.author, o.timestamp))?;
            }
        }
        Ok(())
    })
}
