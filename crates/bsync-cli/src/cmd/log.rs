//! `bsync log`: history of one user's branch.

use crate::cmd::{fetch_or_warn, open_client};
use crate::output::{OutputMode, render};
use anyhow::Result;
use clap::Args;
use std::io::Write as _;
use std::path::Path;

#[derive(Args, Debug)]
pub struct LogArgs {
    /// Whose branch to show. Defaults to your own.
    pub user: Option<String>,

    /// Maximum number of entries to show.
    #[arg(short = 'n', long, default_value = "20")]
    pub limit: usize,
}

/// Execute `bsync log`.
///
/// # Errors
///
/// `NotFound` if the user has no branch; config, lock or store failures.
pub fn run_log(args: &LogArgs, workspace: &Path, mode: OutputMode) -> Result<()> {
    let client = open_client(workspace)?;
    fetch_or_warn(&client)?;
    let user = args.user.as_deref().unwrap_or_else(|| client.user());
    let history = client.store().history(user, args.limit)?;

    render(mode, &history, |entries, w| {
        for entry in entries {
            writeln!(
                w,
                "{} {} {:<10} {}",
                entry.version.short(),
                entry.time.format("%Y-%m-%d %H:%M:%S"),
                entry.author,
                entry.message
            )?;
        }
        Ok(())
    })
}
