//! `bsync pull`: fetch every branch and print the merged view's summary.

use crate::cmd::open_client;
use crate::output::{OutputMode, pretty_kv, pretty_section, render};
use anyhow::Result;
use bsync_core::artifact::ArtifactKind;
use bsync_core::view::SkippedRecord;
use bsync_core::{MergedView, Outcome, Resolution, Scope};
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::Path;

#[derive(Args, Debug)]
pub struct PullArgs {
    /// Merge only these users' branches (your own is always included).
    #[arg(long = "from", value_name = "USER")]
    pub users: Vec<String>,
}

impl PullArgs {
    pub fn scope(&self) -> Scope {
        if self.users.is_empty() {
            Scope::All
        } else {
            Scope::users(self.users.iter().cloned())
        }
    }
}

/// What a merged view holds, without the artifacts themselves.
#[derive(Debug, Serialize)]
pub struct ViewSummary {
    pub computed_at: DateTime<Utc>,
    pub stale: bool,
    pub sources: BTreeMap<String, String>,
    pub live: BTreeMap<ArtifactKind, usize>,
    pub outcomes: BTreeMap<Outcome, usize>,
    pub pending_edits: usize,
    pub tie_breaks: Vec<Resolution>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedRecord>,
}

impl ViewSummary {
    pub fn new(view: &MergedView) -> Self {
        Self {
            computed_at: view.computed_at,
            stale: view.stale,
            sources: view
                .sources
                .iter()
                .map(|(user, v)| (user.clone(), v.short().to_string()))
                .collect(),
            live: view.live_counts(),
            outcomes: view.outcome_counts(),
            pending_edits: view.pending_edits,
            tie_breaks: view.tie_breaks().cloned().collect(),
            skipped: view.skipped.clone(),
        }
    }

    pub fn write_human(&self, w: &mut dyn Write, pretty: bool) -> io::Result<()> {
        if pretty {
            let title = if self.stale { "Merged view (stale)" } else { "Merged view" };
            pretty_section(w, title)?;
            let sources: Vec<String> = self
                .sources
                .iter()
                .map(|(user, v)| format!("{user}@{v}"))
                .collect();
            pretty_kv(w, "sources", sources.join(", "))?;
            for (kind, n) in &self.live {
                pretty_kv(w, kind.as_str(), n.to_string())?;
            }
            if self.pending_edits > 0 {
                pretty_kv(w, "pending", self.pending_edits.to_string())?;
            }
        } else {
            let live: usize = self.live.values().sum();
            writeln!(
                w,
                "merged {} sources, {live} live records{}",
                self.sources.len(),
                if self.stale { " (stale)" } else { "" }
            )?;
        }
        for r in &self.tie_breaks {
            writeln!(
                w,
                "tie-break {} {}: kept {}@{}, overrode {}",
                r.kind,
                r.key,
                r.winner.author,
                r.winner.timestamp,
                r.overridden.len()
            )?;
        }
        for s in &self.skipped {
            writeln!(w, "skipped [{}] {}: {}", s.code, s.user, s.message)?;
        }
        Ok(())
    }
}

/// Execute `bsync pull`.
///
/// # Errors
///
/// Config, lock or store failures. An unreachable remote is reported as a
/// stale view, not an error.
pub fn run_pull(args: &PullArgs, workspace: &Path, mode: OutputMode) -> Result<()> {
    let client = open_client(workspace)?;
    let report = client.pull(&args.scope())?;
    let summary = ViewSummary::new(&report.view);
    render(mode, &summary, |s, w| s.write_human(w, mode.is_pretty()))
}
