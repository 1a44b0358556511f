//! `bsync status`: own branch, pending edits, and other users' progress.

use crate::cmd::{fetch_or_warn, open_client};
use crate::output::{OutputMode, pretty_kv, pretty_section, render};
use anyhow::Result;
use clap::Args;
use std::io::Write as _;
use std::path::Path;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Skip fetching; report against the last fetched branches.
    #[arg(long)]
    pub offline: bool,
}

/// Execute `bsync status`.
///
/// # Errors
///
/// Config, lock or store failures.
pub fn run_status(args: &StatusArgs, workspace: &Path, mode: OutputMode) -> Result<()> {
    let client = open_client(workspace)?;
    if !args.offline {
        fetch_or_warn(&client)?;
    }
    let report = client.status()?;

    render(mode, &report, |r, w| {
        if mode.is_pretty() {
            pretty_section(w, &format!("Status for {}", r.user))?;
        }
        pretty_kv(w, "branch", r.branch.to_string())?;
        pretty_kv(w, "pending", r.dirty.len().to_string())?;
        for entry in &r.dirty {
            let op = if entry.deleted { "delete" } else { "edit" };
            writeln!(w, "  {op} {} {}", entry.kind, entry.key)?;
        }
        for user in &r.users {
            let tip = user.tip.as_ref().map_or("-", |v| v.short());
            if user.behind == 0 {
                writeln!(w, "  {:<16} {tip}", user.user)?;
            } else {
                writeln!(w, "  {:<16} {tip} ({} new)", user.user, user.behind)?;
            }
        }
        if let Some(push) = &r.last_push {
            pretty_kv(w, "last push", push.at.to_rfc3339())?;
        }
        Ok(())
    })
}
