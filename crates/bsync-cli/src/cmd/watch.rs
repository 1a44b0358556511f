//! `bsync watch`: run the background scheduler in the foreground.

use crate::cmd::pull::{PullArgs, ViewSummary};
use crate::cmd::{load_config, open_with};
use crate::output::{OutputMode, pretty_kv, render};
use anyhow::Result;
use bsync_core::MergedView;
use bsync_core::adapter::Adapter;
use bsync_core::scheduler::{Scheduler, SchedulerOptions};
use clap::Args;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::warn;

const POLL: Duration = Duration::from_millis(100);

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Seconds between sync cycles. Defaults to the configured interval.
    #[arg(long, value_name = "SECS")]
    pub interval: Option<u64>,

    /// Push pending edits after each pull.
    #[arg(long)]
    pub auto_push: bool,

    /// Stop after this many cycles. Runs until interrupted when omitted.
    #[arg(long, value_name = "N")]
    pub cycles: Option<u64>,

    #[command(flatten)]
    pub scope: PullArgs,
}

fn print_view(mode: OutputMode, view: &MergedView) -> io::Result<()> {
    let summary = ViewSummary::new(view);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    if mode.is_json() {
        serde_json::to_writer(&mut out, &summary)?;
        writeln!(out)
    } else {
        summary.write_human(&mut out, false)
    }
}

/// Execute `bsync watch`.
///
/// # Errors
///
/// Config or lock failures, or a scheduler thread that cannot start.
/// Failed cycles are logged and counted, not returned.
pub fn run_watch(args: &WatchArgs, workspace: &Path, mode: OutputMode) -> Result<()> {
    let config = load_config(workspace)?;
    let client = Arc::new(open_with(&config)?);
    let options = SchedulerOptions {
        interval: Duration::from_secs(args.interval.unwrap_or(config.interval_secs).max(1)),
        auto_push: args.auto_push || config.auto_push,
        scope: args.scope.scope(),
    };

    let adapter: Box<dyn Adapter> = Box::new(move |view: &MergedView| -> bsync_core::Result<()> {
        if let Err(e) = print_view(mode, view) {
            warn!(error = %e, "failed to write view summary");
        }
        Ok(())
    });
    let mut scheduler = Scheduler::start(Arc::clone(&client), options, Some(adapter))?;

    loop {
        thread::sleep(POLL);
        let stats = scheduler.stats();
        let done = stats.completed + stats.skipped + stats.failed;
        if args.cycles.is_some_and(|n| done >= n) || !scheduler.is_running() {
            break;
        }
    }
    scheduler.stop();

    let stats = scheduler.stats();
    if mode.is_json() {
        // One summary line per cycle came before; keep stdout line-delimited.
        let stdout = io::stdout();
        let mut out = stdout.lock();
        serde_json::to_writer(&mut out, &stats)?;
        writeln!(out)?;
        return Ok(());
    }
    render(mode, &stats, |s, w| {
        pretty_kv(w, "completed", s.completed.to_string())?;
        pretty_kv(w, "skipped", s.skipped.to_string())?;
        pretty_kv(w, "failed", s.failed.to_string())?;
        pretty_kv(w, "pushes", s.pushes.to_string())
    })
}
