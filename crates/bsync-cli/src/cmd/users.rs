//! `bsync users`: who publishes to the shared repository, and what.

use crate::cmd::{fetch_or_warn, open_client};
use crate::output::{OutputMode, pretty_section, render};
use anyhow::Result;
use bsync_core::Scope;
use bsync_core::artifact::ArtifactKind;
use bsync_core::transport::VersionId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;

#[derive(Debug, Serialize)]
struct UserRow {
    user: String,
    me: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tip: Option<String>,
    records: usize,
    kinds: BTreeMap<ArtifactKind, usize>,
}

/// Execute `bsync users`.
///
/// # Errors
///
/// Config, lock or store failures.
pub fn run_users(workspace: &Path, mode: OutputMode) -> Result<()> {
    let client = open_client(workspace)?;
    fetch_or_warn(&client)?;

    let mut rows = Vec::new();
    for (user, keys) in client.tally(&Scope::All)? {
        let kinds: BTreeMap<ArtifactKind, usize> =
            keys.iter().map(|(kind, set)| (*kind, set.len())).collect();
        rows.push(UserRow {
            me: user == client.user(),
            tip: client.store().tip(&user)?.as_ref().map(|v| VersionId::short(v).to_string()),
            records: kinds.values().sum(),
            kinds,
            user,
        });
    }

    render(mode, &rows, |rows, w| {
        if mode.is_pretty() {
            pretty_section(w, &format!("Users ({})", rows.len()))?;
        }
        for row in rows {
            let marker = if row.me { "*" } else { " " };
            writeln!(
                w,
                "{marker} {:<16} {:<10} {} records",
                row.user,
                row.tip.as_deref().unwrap_or("-"),
                row.records
            )?;
        }
        Ok(())
    })
}
