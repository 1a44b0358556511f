//! Git-backed transport.
//!
//! Snapshots are commits whose tree is the flat set of snapshot files; a
//! user's history is the branch `refs/heads/<branch>`. Other users'
//! branches are read from `refs/remotes/<remote>/<branch>` after a fetch.
//! The repository is opened per call, so the transport itself is `Sync`.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use git2::{
    BranchType, Cred, ErrorClass, FetchOptions, ObjectType, Oid, PushOptions, RemoteCallbacks,
    Repository, Signature, Sort,
};
use tracing::{debug, info};

use super::{BranchRelation, CommitRequest, FileTree, HistoryEntry, Transport, VersionId};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone)]
pub struct GitTransport {
    path: PathBuf,
    remote: Option<String>,
}

fn parse_oid(version: &VersionId) -> Result<Oid> {
    Oid::from_str(version.as_str()).map_err(|_| SyncError::NotFound(format!("version {version}")))
}

fn version(oid: Oid) -> VersionId {
    VersionId::new(oid.to_string())
}

fn local_ref(branch: &str) -> String {
    format!("refs/heads/{branch}")
}

fn callbacks<'a>(repo: &Repository) -> RemoteCallbacks<'a> {
    let cfg = repo.config().ok();
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username_from_url, allowed| {
        if allowed.is_ssh_key()
            && let Some(user) = username_from_url
        {
            return Cred::ssh_key_from_agent(user);
        }
        if allowed.is_user_pass_plaintext()
            && let Some(ref cfg) = cfg
            && let Ok(cred) = Cred::credential_helper(cfg, url, username_from_url)
        {
            return Ok(cred);
        }
        Cred::default()
    });
    callbacks
}

fn is_network(err: &git2::Error) -> bool {
    matches!(
        err.class(),
        ErrorClass::Net | ErrorClass::Ssh | ErrorClass::Http | ErrorClass::Ssl | ErrorClass::Os
    )
}

fn is_non_fast_forward(message: &str) -> bool {
    message.contains("non-fast-forward")
        || message.contains("non-fastforward")
        || message.contains("not present locally")
        || message.contains("fetch first")
        || message.contains("cannot lock ref")
        || message.contains("failed to update ref")
}

impl GitTransport {
    /// Open an existing repository. `remote` is used only if the repository
    /// has a remote of that name.
    ///
    /// # Errors
    ///
    /// `Git` if the path is not a git repository.
    pub fn open(path: impl Into<PathBuf>, remote: &str) -> Result<Self> {
        let path = path.into();
        let repo = Repository::open(&path)?;
        let remote = repo.find_remote(remote).ok().map(|_| remote.to_string());
        if remote.is_none() {
            debug!(path = %path.display(), "no remote configured, running local-only");
        }
        Ok(Self { path, remote })
    }

    /// Initialize (or reopen) a repository at `path`, optionally adding a
    /// remote `(name, url)`.
    ///
    /// # Errors
    ///
    /// `Git` if the repository cannot be created or the remote added.
    pub fn init(path: impl Into<PathBuf>, remote: Option<(&str, &str)>) -> Result<Self> {
        let path = path.into();
        let repo = match Repository::open(&path) {
            Ok(repo) => repo,
            Err(_) => {
                info!(path = %path.display(), "initializing git repository");
                Repository::init(&path)?
            }
        };
        let remote = match remote {
            Some((name, url)) => {
                if repo.find_remote(name).is_err() {
                    repo.remote(name, url)?;
                }
                Some(name.to_string())
            }
            None => None,
        };
        Ok(Self { path, remote })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.path)?)
    }

    fn tracking_ref(&self, branch: &str) -> Option<String> {
        self.remote
            .as_ref()
            .map(|remote| format!("refs/remotes/{remote}/{branch}"))
    }

    fn tracking_oid(&self, repo: &Repository, branch: &str) -> Option<Oid> {
        self.tracking_ref(branch)
            .and_then(|name| repo.refname_to_id(&name).ok())
    }

    fn fast_forward_locals(&self, repo: &Repository, prefix: &str) -> Result<()> {
        for entry in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = entry?;
            let Some(name) = branch.name()?.map(str::to_string) else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }
            let (Some(local), Some(remote)) =
                (branch.get().target(), self.tracking_oid(repo, &name))
            else {
                continue;
            };
            if local != remote && repo.graph_descendant_of(remote, local)? {
                debug!(branch = %name, "fast-forwarding local branch");
                repo.reference_matching(&local_ref(&name), remote, true, local, "bsync: fast-forward")?;
            }
        }
        Ok(())
    }
}

impl Transport for GitTransport {
    fn local_tip(&self, branch: &str) -> Result<Option<VersionId>> {
        let repo = self.repo()?;
        Ok(repo.refname_to_id(&local_ref(branch)).ok().map(version))
    }

    fn remote_tip(&self, branch: &str) -> Result<Option<VersionId>> {
        let repo = self.repo()?;
        Ok(self.tracking_oid(&repo, branch).map(version))
    }

    fn list_branches(&self, prefix: &str) -> Result<BTreeSet<String>> {
        let repo = self.repo()?;
        let mut names = BTreeSet::new();
        for entry in repo.branches(None)? {
            let (branch, kind) = entry?;
            let Some(name) = branch.name()? else {
                continue;
            };
            let name = match (kind, &self.remote) {
                (BranchType::Local, _) => Some(name),
                (BranchType::Remote, Some(remote)) => name
                    .strip_prefix(remote.as_str())
                    .and_then(|rest| rest.strip_prefix('/')),
                (BranchType::Remote, None) => None,
            };
            if let Some(name) = name.filter(|n| n.starts_with(prefix)) {
                names.insert(name.to_string());
            }
        }
        Ok(names)
    }

    fn commit(&self, request: CommitRequest) -> Result<VersionId> {
        let repo = self.repo()?;
        let refname = local_ref(&request.branch);
        let current = repo.refname_to_id(&refname).ok();
        let expected = request.expected.as_ref().map(parse_oid).transpose()?;
        let conflict = |found: Option<Oid>| SyncError::WriteConflict {
            branch: request.branch.clone(),
            expected: expected.map_or_else(|| "<none>".to_string(), |o| o.to_string()),
            found: found.map_or_else(|| "<none>".to_string(), |o| o.to_string()),
        };
        if current != expected {
            return Err(conflict(current));
        }

        let mut builder = repo.treebuilder(None)?;
        for (name, content) in &request.tree {
            let blob = repo.blob(content)?;
            builder.insert(name, blob, 0o100_644)?;
        }
        let tree = repo.find_tree(builder.write()?)?;

        let parents = request
            .parents
            .iter()
            .map(|p| Ok(repo.find_commit(parse_oid(p)?)?))
            .collect::<Result<Vec<_>>>()?;
        let parent_refs: Vec<_> = parents.iter().collect();

        let sig = Signature::now(&request.author, &format!("{}@bsync", request.author))?;
        let oid = repo.commit(None, &sig, &sig, &request.message, &tree, &parent_refs)?;

        let log = format!("bsync: {}", request.message);
        let updated = match expected {
            Some(old) => repo.reference_matching(&refname, oid, true, old, &log),
            None => repo.reference(&refname, oid, false, &log),
        };
        match updated {
            Ok(_) => Ok(version(oid)),
            Err(err)
                if matches!(
                    err.code(),
                    git2::ErrorCode::Modified | git2::ErrorCode::Exists | git2::ErrorCode::Locked
                ) =>
            {
                Err(conflict(repo.refname_to_id(&refname).ok()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn read_tree(&self, version: &VersionId) -> Result<FileTree> {
        let repo = self.repo()?;
        let commit = repo
            .find_commit(parse_oid(version)?)
            .map_err(|_| SyncError::NotFound(format!("version {version}")))?;
        let tree = commit.tree()?;
        let mut files = FileTree::new();
        for entry in &tree {
            if entry.kind() != Some(ObjectType::Blob) {
                continue;
            }
            let Some(name) = entry.name() else {
                continue;
            };
            let blob = repo.find_blob(entry.id())?;
            files.insert(name.to_string(), blob.content().to_vec());
        }
        Ok(files)
    }

    fn fetch(&self, prefix: &str) -> Result<()> {
        let Some(remote_name) = &self.remote else {
            return Ok(());
        };
        let repo = self.repo()?;
        let mut remote = repo
            .find_remote(remote_name)
            .map_err(|e| SyncError::RemoteUnavailable(e.message().to_string()))?;
        let refspec = format!("+refs/heads/{prefix}*:refs/remotes/{remote_name}/{prefix}*");
        let mut options = FetchOptions::new();
        options.remote_callbacks(callbacks(&repo));
        remote
            .fetch(&[refspec.as_str()], Some(&mut options), None)
            .map_err(|e| SyncError::RemoteUnavailable(format!("fetch {remote_name}: {}", e.message())))?;
        self.fast_forward_locals(&repo, prefix)
    }

    fn publish(&self, branch: &str) -> Result<()> {
        let Some(remote_name) = &self.remote else {
            return Ok(());
        };
        let repo = self.repo()?;
        let head = repo
            .refname_to_id(&local_ref(branch))
            .map_err(|_| SyncError::NotFound(format!("branch {branch}")))?;
        let mut remote = repo
            .find_remote(remote_name)
            .map_err(|e| SyncError::RemoteUnavailable(e.message().to_string()))?;

        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        let rejected: RefCell<Option<String>> = RefCell::new(None);
        {
            let mut cbs = callbacks(&repo);
            cbs.push_update_reference(|_name, status| {
                if let Some(msg) = status {
                    *rejected.borrow_mut() = Some(msg.to_string());
                }
                Ok(())
            });
            let mut options = PushOptions::new();
            options.remote_callbacks(cbs);

            if let Err(err) = remote.push(&[refspec.as_str()], Some(&mut options)) {
                let message = err.message().to_string();
                if err.code() == git2::ErrorCode::NotFastForward || is_non_fast_forward(&message) {
                    return Err(SyncError::WriteConflict {
                        branch: branch.to_string(),
                        expected: head.to_string(),
                        found: "remote tip".to_string(),
                    });
                }
                if is_network(&err) {
                    return Err(SyncError::RemoteUnavailable(format!("push {remote_name}: {message}")));
                }
                return Err(err.into());
            }
        }

        if let Some(message) = rejected.into_inner() {
            if is_non_fast_forward(&message) {
                return Err(SyncError::WriteConflict {
                    branch: branch.to_string(),
                    expected: head.to_string(),
                    found: "remote tip".to_string(),
                });
            }
            return Err(SyncError::RemoteUnavailable(format!("push rejected: {message}")));
        }

        if let Some(tracking) = self.tracking_ref(branch) {
            repo.reference(&tracking, head, true, "bsync: publish")?;
        }
        Ok(())
    }

    fn history(&self, tip: &VersionId, limit: usize) -> Result<Vec<HistoryEntry>> {
        let repo = self.repo()?;
        let mut walk = repo.revwalk()?;
        walk.push(parse_oid(tip)?)
            .map_err(|_| SyncError::NotFound(format!("version {tip}")))?;
        walk.simplify_first_parent()?;
        walk.set_sorting(Sort::TOPOLOGICAL)?;

        let mut entries = Vec::new();
        for oid in walk.take(limit) {
            let commit = repo.find_commit(oid?)?;
            entries.push(HistoryEntry {
                version: version(commit.id()),
                author: commit.author().name().unwrap_or_default().to_string(),
                time: DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0).unwrap_or_default(),
                message: commit.summary().unwrap_or_default().to_string(),
            });
        }
        Ok(entries)
    }

    fn relation(&self, branch: &str) -> Result<BranchRelation> {
        let repo = self.repo()?;
        let local = repo.refname_to_id(&local_ref(branch)).ok();
        let tracking = self.tracking_oid(&repo, branch);
        Ok(match (local, tracking) {
            (None, None) => BranchRelation::Missing,
            (Some(_), None) => BranchRelation::LocalOnly,
            (None, Some(_)) => BranchRelation::RemoteOnly,
            (Some(local), Some(tracking)) => {
                let (ahead, behind) = repo.graph_ahead_behind(local, tracking)?;
                BranchRelation::from_counts(ahead, behind)
            }
        })
    }

    fn count_between(&self, base: &VersionId, tip: &VersionId) -> Result<usize> {
        let repo = self.repo()?;
        let (ahead, _) = repo.graph_ahead_behind(parse_oid(tip)?, parse_oid(base)?)?;
        Ok(ahead)
    }

    fn has_remote(&self) -> bool {
        self.remote.is_some()
    }
}
