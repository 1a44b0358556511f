use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings file shape, shared by the project and the user config. Every
/// field is optional; unset fields fall through to the next layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync: Option<SyncSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_push: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_timeout_secs: Option<u64>,
}

/// Fully resolved settings of one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    pub workspace: PathBuf,
    pub user: String,
    pub remote: String,
    pub interval_secs: u64,
    pub auto_push: bool,
    pub push_attempts: u32,
    pub transport_timeout_secs: u64,
    pub lock_timeout_secs: u64,
}

impl EffectiveConfig {
    /// Defaults for `user` in `workspace`, ignoring every config file.
    #[must_use]
    pub fn new(workspace: impl Into<PathBuf>, user: impl Into<String>) -> Self {
        Self {
            workspace: workspace.into(),
            user: user.into(),
            remote: default_remote(),
            interval_secs: DEFAULT_INTERVAL_SECS,
            auto_push: false,
            push_attempts: DEFAULT_PUSH_ATTEMPTS,
            transport_timeout_secs: DEFAULT_TRANSPORT_TIMEOUT_SECS,
            lock_timeout_secs: DEFAULT_LOCK_TIMEOUT_SECS,
        }
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub const fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.transport_timeout_secs)
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    fn apply(&mut self, file: &ConfigFile) {
        if let Some(user) = &file.user {
            self.user.clone_from(user);
        }
        if let Some(remote) = &file.remote {
            self.remote.clone_from(remote);
        }
        let Some(sync) = &file.sync else {
            return;
        };
        if let Some(v) = sync.interval_secs {
            self.interval_secs = v;
        }
        if let Some(v) = sync.auto_push {
            self.auto_push = v;
        }
        if let Some(v) = sync.push_attempts {
            self.push_attempts = v.max(1);
        }
        if let Some(v) = sync.transport_timeout_secs {
            self.transport_timeout_secs = v;
        }
        if let Some(v) = sync.lock_timeout_secs {
            self.lock_timeout_secs = v;
        }
    }
}

pub const DEFAULT_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_PUSH_ATTEMPTS: u32 = 3;
pub const DEFAULT_TRANSPORT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_LOCK_TIMEOUT_SECS: u64 = 5;

fn default_remote() -> String {
    "origin".to_string()
}

#[must_use]
pub fn project_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".bsync/config.toml")
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<ConfigFile>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

pub fn load_project_config(workspace: &Path) -> Result<ConfigFile> {
    read_config_file(&project_config_path(workspace))
}

pub fn load_user_config() -> Result<ConfigFile> {
    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    read_config_file(&config_dir.join("bsync/config.toml"))
}

/// Write the project config, creating `.bsync/` as needed.
pub fn write_project_config(workspace: &Path, config: &ConfigFile) -> Result<PathBuf> {
    let path = project_config_path(workspace);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Resolve the configuration of `workspace`.
///
/// Precedence, lowest first: built-in defaults, user config, project
/// config, `BSYNC_USER` / `BSYNC_REMOTE`. Without a configured user the
/// login name (`USER` / `USERNAME`) is used.
pub fn resolve_config(workspace: &Path) -> Result<EffectiveConfig> {
    let user = load_user_config()?;
    let project = load_project_config(workspace)?;
    resolve_layers(workspace, &user, &project, |key| env::var(key).ok())
}

fn resolve_layers(
    workspace: &Path,
    user_file: &ConfigFile,
    project_file: &ConfigFile,
    env_var: impl Fn(&str) -> Option<String>,
) -> Result<EffectiveConfig> {
    let mut config = EffectiveConfig::new(workspace, String::new());
    config.apply(user_file);
    config.apply(project_file);

    if let Some(user) = env_var("BSYNC_USER").filter(|u| !u.trim().is_empty()) {
        config.user = user;
    }
    if let Some(remote) = env_var("BSYNC_REMOTE").filter(|r| !r.trim().is_empty()) {
        config.remote = remote;
    }
    if config.user.is_empty() {
        config.user = env_var("USER")
            .or_else(|| env_var("USERNAME"))
            .unwrap_or_default();
    }

    config.user = config.user.trim().to_string();
    validate_user(&config.user)?;
    Ok(config)
}

/// User names become branch names, so they must be plain path segments.
pub fn validate_user(user: &str) -> Result<()> {
    if user.is_empty() {
        bail!("No user configured; set BSYNC_USER or `user` in .bsync/config.toml");
    }
    let valid = user
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !user.starts_with('.')
        && !user.ends_with(".lock");
    if !valid {
        bail!("Invalid user name `{user}`: use letters, digits, '-', '_' or '.'");
    }
    Ok(())
}
