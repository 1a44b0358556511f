//! `bsync push`: publish committed state that has not reached the remote.

use crate::cmd::open_client;
use crate::output::{OutputMode, pretty_kv, render};
use anyhow::Result;
use bsync_core::PushReport;
use std::io::{self, Write};
use std::path::Path;

pub fn write_push(report: &PushReport, w: &mut dyn Write) -> io::Result<()> {
    match &report.version {
        Some(v) => writeln!(w, "committed {} record(s) as {}", report.committed, v.short())?,
        None => writeln!(w, "nothing to commit")?,
    }
    pretty_kv(w, "attempts", report.attempts.to_string())?;
    pretty_kv(
        w,
        "published",
        if report.published { "yes" } else { "no" },
    )
}

/// Execute `bsync push`.
///
/// Each invocation is a fresh client, so there are no pending edits to
/// commit here; this publishes commits left behind by an offline push.
///
/// # Errors
///
/// Config, lock or store failures; `PushFailed` after repeated conflicts.
pub fn run_push(workspace: &Path, mode: OutputMode) -> Result<()> {
    let client = open_client(workspace)?;
    let report = client.push()?;
    render(mode, &report, |r, w| write_push(r, w))
}
