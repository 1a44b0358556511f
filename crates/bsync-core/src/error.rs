use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::artifact::ArtifactKind;

/// Machine-readable error codes for adapter- and operator-friendly decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    NotFound,
    InvalidKey,
    CorruptArtifact,
    WriteConflict,
    PushFailed,
    MergeAmbiguous,
    RemoteUnavailable,
    Busy,
    LockContention,
    Cancelled,
    GitFailure,
    IoFailure,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::NotFound => "E2001",
            Self::InvalidKey => "E2002",
            Self::CorruptArtifact => "E3001",
            Self::WriteConflict => "E4001",
            Self::PushFailed => "E4002",
            Self::MergeAmbiguous => "E4003",
            Self::RemoteUnavailable => "E5001",
            Self::Busy => "E5002",
            Self::LockContention => "E5003",
            Self::Cancelled => "E5004",
            Self::GitFailure => "E5005",
            Self::IoFailure => "E5006",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Workspace not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::NotFound => "User, branch or version not found",
            Self::InvalidKey => "Invalid artifact key",
            Self::CorruptArtifact => "Corrupt artifact record",
            Self::WriteConflict => "Branch tip moved during commit",
            Self::PushFailed => "Push failed after retries",
            Self::MergeAmbiguous => "Merge resolved by tie-break",
            Self::RemoteUnavailable => "Remote unavailable",
            Self::Busy => "Workspace busy",
            Self::LockContention => "Lock contention",
            Self::Cancelled => "Operation cancelled",
            Self::GitFailure => "Git operation failed",
            Self::IoFailure => "I/O failure",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and adapters.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `bsync init` to initialize this workspace."),
            Self::ConfigParseError => Some("Fix syntax in .bsync/config.toml and retry."),
            Self::NotFound => None,
            Self::InvalidKey => Some("Use 0x-prefixed addresses or a type name as the key."),
            Self::CorruptArtifact => {
                Some("The record was skipped; re-push it from a healthy decompiler database.")
            }
            Self::WriteConflict => Some("Reload the branch tip and retry the commit."),
            Self::PushFailed => Some("Pull, then push again once the branch settles."),
            Self::MergeAmbiguous => Some("Inspect the tie-break in the merge log if it matters."),
            Self::RemoteUnavailable => Some("Check network access and the configured remote."),
            Self::Busy => Some("Retry after the in-flight pull or push completes."),
            Self::LockContention => Some("Another bsync client holds this workspace; close it first."),
            Self::Cancelled => None,
            Self::GitFailure => Some("Run `git status` in the workspace to inspect the repository."),
            Self::IoFailure => Some("Check disk space and write permissions."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Result alias used throughout the engine.
pub type Result<T, E = SyncError> = std::result::Result<T, E>;

/// Errors surfaced by the store, merge engine and sync client.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A record on disk could not be decoded.
    #[error("corrupt {kind} record `{key}` (field `{field}`): {reason}")]
    CorruptArtifact {
        kind: ArtifactKind,
        key: String,
        field: String,
        reason: String,
    },

    /// User branch or version does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The branch tip moved underneath the caller.
    #[error("write conflict on `{branch}`: expected {expected}, found {found}")]
    WriteConflict {
        branch: String,
        expected: String,
        found: String,
    },

    /// The transport could not be reached within its deadline.
    #[error("remote unavailable: {0}")]
    RemoteUnavailable(String),

    /// Another pull/push/status holds the workspace.
    #[error("workspace busy: {0} in progress")]
    Busy(String),

    /// Push gave up after the bounded number of conflict retries.
    #[error("push failed after {attempts} attempts: {reason}")]
    PushFailed { attempts: u32, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    /// Adapter supplied a key that does not parse for its kind.
    #[error("invalid {kind} key `{key}`")]
    InvalidKey { kind: ArtifactKind, key: String },

    #[error("workspace lock at {path} timed out")]
    Lock { path: PathBuf },

    #[error("git: {0}")]
    Git(#[from] git2::Error),

    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("config: {0}")]
    Config(String),
}

impl SyncError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::CorruptArtifact { .. } => ErrorCode::CorruptArtifact,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::WriteConflict { .. } => ErrorCode::WriteConflict,
            Self::RemoteUnavailable(_) => ErrorCode::RemoteUnavailable,
            Self::Busy(_) => ErrorCode::Busy,
            Self::PushFailed { .. } => ErrorCode::PushFailed,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::InvalidKey { .. } => ErrorCode::InvalidKey,
            Self::Lock { .. } => ErrorCode::LockContention,
            Self::Git(_) => ErrorCode::GitFailure,
            Self::Io(_) => ErrorCode::IoFailure,
            Self::Config(_) => ErrorCode::ConfigParseError,
        }
    }

    /// Optional remediation hint for operators and adapters.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }

    /// Whether retrying the same call later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WriteConflict { .. } | Self::RemoteUnavailable(_) | Self::Busy(_) | Self::Lock { .. }
        )
    }

    pub(crate) fn corrupt(
        kind: ArtifactKind,
        key: impl Into<String>,
        field: impl Into<String>,
        reason: impl fmt::Display,
    ) -> Self {
        Self::CorruptArtifact {
            kind,
            key: key.into(),
            field: field.into(),
            reason: reason.to_string(),
        }
    }
}
