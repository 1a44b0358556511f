pub mod edit;
pub mod init;
pub mod log;
pub mod pull;
pub mod push;
pub mod show;
pub mod status;
pub mod users;
pub mod watch;

use crate::output::CliError;
use anyhow::{Context as _, Result};
use bsync_core::artifact::ArtifactKind;
use bsync_core::config::{EffectiveConfig, project_config_path, resolve_config};
use bsync_core::{ErrorCode, SyncClient, SyncError};
use std::path::Path;
use tracing::warn;

/// Resolved configuration of an initialized workspace.
pub fn load_config(workspace: &Path) -> Result<EffectiveConfig> {
    if !project_config_path(workspace).exists() {
        let code = ErrorCode::NotInitialized;
        return Err(CliError::with_details(
            format!("{}: {}", code.message(), workspace.display()),
            code.hint(),
            code.code(),
        )
        .into());
    }
    resolve_config(workspace)
}

/// Open the workspace's sync client, holding its lock until dropped.
pub fn open_client(workspace: &Path) -> Result<SyncClient> {
    let config = load_config(workspace)?;
    open_with(&config)
}

pub fn open_with(config: &EffectiveConfig) -> Result<SyncClient> {
    SyncClient::open(config)
        .with_context(|| format!("Failed to open workspace {}", config.workspace.display()))
}

/// Fetch other users' branches; an unreachable remote only warns.
/// Returns `false` when the fetch did not happen.
pub fn fetch_or_warn(client: &SyncClient) -> Result<bool> {
    match client.store().fetch() {
        Ok(()) => Ok(true),
        Err(SyncError::RemoteUnavailable(reason)) => {
            warn!(%reason, "remote unavailable, using local branches");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// `value_parser` for artifact kind arguments.
pub fn parse_kind(s: &str) -> Result<ArtifactKind, String> {
    s.parse().map_err(|e: bsync_core::artifact::KeyParseError| e.to_string())
}
