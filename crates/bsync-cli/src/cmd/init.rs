//! `bsync init`: prepare a workspace repository and its project config.

use crate::output::{OutputMode, pretty_kv, render};
use anyhow::{Context as _, Result};
use bsync_core::config::{ConfigFile, project_config_path, validate_user, write_project_config};
use bsync_core::store::branch_name;
use bsync_core::transport::GitTransport;
use clap::Args;
use serde::Serialize;
use std::io::Write as _;
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// User name; publishes to the branch `bsync/<user>`.
    #[arg(long)]
    pub user: Option<String>,

    /// URL or path of the shared repository.
    #[arg(long)]
    pub remote_url: Option<String>,

    /// Name of the git remote to add.
    #[arg(long, default_value = "origin")]
    pub remote_name: String,

    /// Overwrite an existing `.bsync/config.toml`.
    #[arg(long)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
struct InitReport {
    workspace: PathBuf,
    config: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remote: Option<String>,
}

/// Execute `bsync init`.
///
/// Opens (or creates) the git repository at `workspace`, adds the remote
/// when a URL is given, and writes `.bsync/config.toml`.
///
/// # Errors
///
/// Fails if the config already exists without `--force`, if the user name
/// is not a valid branch segment, or if git setup fails.
pub fn run_init(args: &InitArgs, workspace: &Path, mode: OutputMode) -> Result<()> {
    let config_path = project_config_path(workspace);
    if config_path.exists() && !args.force {
        anyhow::bail!(".bsync/config.toml already exists. Use `bsync init --force` to reinitialize.");
    }
    if let Some(user) = &args.user {
        validate_user(user)?;
    }

    let remote = args
        .remote_url
        .as_deref()
        .map(|url| (args.remote_name.as_str(), url));
    GitTransport::init(workspace, remote)
        .with_context(|| format!("Failed to initialize repository at {}", workspace.display()))?;

    let config = ConfigFile {
        user: args.user.clone(),
        remote: args.remote_url.as_ref().map(|_| args.remote_name.clone()),
        sync: None,
    };
    let written = write_project_config(workspace, &config)?;

    let report = InitReport {
        workspace: workspace.to_path_buf(),
        config: written,
        user: args.user.clone(),
        remote: args.remote_url.clone(),
    };
    render(mode, &report, |r, w| {
        writeln!(w, "Initialized bsync workspace at {}", r.workspace.display())?;
        pretty_kv(w, "config", r.config.display().to_string())?;
        if let Some(user) = &r.user {
            pretty_kv(w, "branch", branch_name(user))?;
        }
        if let Some(remote) = &r.remote {
            pretty_kv(w, "remote", remote)?;
        }
        Ok(())
    })
}
