//! In-process transport.
//!
//! A [`MemoryRemote`] plays the shared server. Every [`MemoryTransport`] is
//! one participant's clone of it, with its own local and remote-tracking
//! branches, so divergence and non-fast-forward rejections behave as they
//! do with git. The remote can be made unavailable or slow, and a
//! transport can be told to fail its next commits with `WriteConflict`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use super::{BranchRelation, CommitRequest, FileTree, HistoryEntry, Transport, VersionId};
use crate::error::{Result, SyncError};

#[derive(Debug, Clone)]
struct StoredCommit {
    parents: Vec<VersionId>,
    tree: FileTree,
    message: String,
    author: String,
    time: chrono::DateTime<Utc>,
}

type Commits = HashMap<VersionId, StoredCommit>;

#[derive(Debug, Default)]
struct RemoteState {
    commits: Commits,
    refs: BTreeMap<String, VersionId>,
    available: bool,
    delay: Duration,
}

/// Shared "server" side.
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RemoteState {
                available: true,
                ..RemoteState::default()
            })),
        }
    }

    /// Simulate the network going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Delay every fetch and publish by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().delay = delay;
    }

    /// Tip of a branch on the remote.
    #[must_use]
    pub fn tip(&self, branch: &str) -> Option<VersionId> {
        self.state.lock().refs.get(branch).cloned()
    }

    fn connect(&self) -> Result<()> {
        let delay = {
            let state = self.state.lock();
            if !state.available {
                return Err(SyncError::RemoteUnavailable("memory remote is offline".into()));
            }
            state.delay
        };
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct LocalState {
    commits: Commits,
    heads: BTreeMap<String, VersionId>,
    tracking: BTreeMap<String, VersionId>,
}

/// Salt for version ids, unique across every transport in the process.
static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// One participant's view of a [`MemoryRemote`].
#[derive(Debug, Default)]
pub struct MemoryTransport {
    remote: Option<MemoryRemote>,
    local: Mutex<LocalState>,
    forced_conflicts: AtomicU32,
}

impl MemoryTransport {
    /// A transport with no remote: fetch and publish are no-ops.
    #[must_use]
    pub fn local_only() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn connected(remote: &MemoryRemote) -> Self {
        Self {
            remote: Some(remote.clone()),
            ..Self::default()
        }
    }

    /// Make the next `n` commits fail with `WriteConflict`.
    pub fn force_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// Versions reachable from `tip`, breadth first.
fn reachable(commits: &Commits, tip: &VersionId) -> Vec<VersionId> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let mut queue = VecDeque::from([tip.clone()]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(commit) = commits.get(&id) {
            queue.extend(commit.parents.iter().cloned());
        }
        order.push(id);
    }
    order
}

fn count_between(commits: &Commits, base: &VersionId, tip: &VersionId) -> usize {
    let excluded: HashSet<VersionId> = reachable(commits, base).into_iter().collect();
    reachable(commits, tip)
        .into_iter()
        .filter(|id| !excluded.contains(id))
        .count()
}

fn is_ancestor(commits: &Commits, ancestor: &VersionId, descendant: &VersionId) -> bool {
    reachable(commits, descendant).contains(ancestor)
}

impl Transport for MemoryTransport {
    fn local_tip(&self, branch: &str) -> Result<Option<VersionId>> {
        Ok(self.local.lock().heads.get(branch).cloned())
    }

    fn remote_tip(&self, branch: &str) -> Result<Option<VersionId>> {
        Ok(self.local.lock().tracking.get(branch).cloned())
    }

    fn list_branches(&self, prefix: &str) -> Result<BTreeSet<String>> {
        let local = self.local.lock();
        Ok(local
            .heads
            .keys()
            .chain(local.tracking.keys())
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn commit(&self, request: CommitRequest) -> Result<VersionId> {
        let mut local = self.local.lock();
        let current = local.heads.get(&request.branch).cloned();
        if current != request.expected || self.take_forced_conflict() {
            return Err(SyncError::WriteConflict {
                branch: request.branch,
                expected: request
                    .expected
                    .map_or_else(|| "<none>".to_string(), |v| v.to_string()),
                found: current.map_or_else(|| "<none>".to_string(), |v| v.to_string()),
            });
        }

        let salt = NEXT_VERSION.fetch_add(1, Ordering::Relaxed);
        let mut hasher = blake3::Hasher::new();
        hasher.update(request.branch.as_bytes());
        hasher.update(&salt.to_le_bytes());
        for parent in &request.parents {
            hasher.update(parent.as_str().as_bytes());
        }
        for (name, content) in &request.tree {
            hasher.update(name.as_bytes());
            hasher.update(content);
        }
        hasher.update(request.message.as_bytes());
        let id = VersionId::new(hasher.finalize().to_hex().to_string());

        local.commits.insert(
            id.clone(),
            StoredCommit {
                parents: request.parents,
                tree: request.tree,
                message: request.message,
                author: request.author,
                time: Utc::now(),
            },
        );
        local.heads.insert(request.branch, id.clone());
        Ok(id)
    }

    fn read_tree(&self, version: &VersionId) -> Result<FileTree> {
        self.local
            .lock()
            .commits
            .get(version)
            .map(|c| c.tree.clone())
            .ok_or_else(|| SyncError::NotFound(format!("version {version}")))
    }

    fn fetch(&self, prefix: &str) -> Result<()> {
        let Some(remote) = &self.remote else {
            return Ok(());
        };
        remote.connect()?;
        let (commits, refs) = {
            let state = remote.state.lock();
            let refs: BTreeMap<String, VersionId> = state
                .refs
                .iter()
                .filter(|(name, _)| name.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (state.commits.clone(), refs)
        };

        let mut local = self.local.lock();
        for (id, commit) in commits {
            local.commits.entry(id).or_insert(commit);
        }
        for (branch, tip) in refs {
            if let Some(head) = local.heads.get(&branch).cloned()
                && head != tip
                && is_ancestor(&local.commits, &head, &tip)
            {
                local.heads.insert(branch.clone(), tip.clone());
            }
            local.tracking.insert(branch, tip);
        }
        Ok(())
    }

    fn publish(&self, branch: &str) -> Result<()> {
        let Some(remote) = &self.remote else {
            return Ok(());
        };
        remote.connect()?;
        let (head, commits) = {
            let local = self.local.lock();
            let head = local
                .heads
                .get(branch)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(format!("branch {branch}")))?;
            let ids = reachable(&local.commits, &head);
            let commits: Vec<(VersionId, StoredCommit)> = ids
                .into_iter()
                .filter_map(|id| local.commits.get(&id).cloned().map(|c| (id, c)))
                .collect();
            (head, commits)
        };

        {
            let mut state = remote.state.lock();
            for (id, commit) in commits {
                state.commits.entry(id).or_insert(commit);
            }
            if let Some(current) = state.refs.get(branch)
                && *current != head
                && !is_ancestor(&state.commits, current, &head)
            {
                return Err(SyncError::WriteConflict {
                    branch: branch.to_string(),
                    expected: head.to_string(),
                    found: current.to_string(),
                });
            }
            state.refs.insert(branch.to_string(), head.clone());
        }
        self.local.lock().tracking.insert(branch.to_string(), head);
        Ok(())
    }

    fn history(&self, tip: &VersionId, limit: usize) -> Result<Vec<HistoryEntry>> {
        let local = self.local.lock();
        if !local.commits.contains_key(tip) {
            return Err(SyncError::NotFound(format!("version {tip}")));
        }
        let mut entries = Vec::new();
        let mut next = Some(tip.clone());
        while let Some(id) = next {
            if entries.len() >= limit {
                break;
            }
            let Some(commit) = local.commits.get(&id) else {
                break;
            };
            entries.push(HistoryEntry {
                version: id.clone(),
                author: commit.author.clone(),
                time: commit.time,
                message: commit.message.clone(),
            });
            next = commit.parents.first().cloned();
        }
        Ok(entries)
    }

    fn relation(&self, branch: &str) -> Result<BranchRelation> {
        let local = self.local.lock();
        let relation = match (local.heads.get(branch), local.tracking.get(branch)) {
            (None, None) => BranchRelation::Missing,
            (Some(_), None) => BranchRelation::LocalOnly,
            (None, Some(_)) => BranchRelation::RemoteOnly,
            (Some(head), Some(tracking)) => BranchRelation::from_counts(
                count_between(&local.commits, tracking, head),
                count_between(&local.commits, head, tracking),
            ),
        };
        Ok(relation)
    }

    fn count_between(&self, base: &VersionId, tip: &VersionId) -> Result<usize> {
        Ok(count_between(&self.local.lock().commits, base, tip))
    }

    fn has_remote(&self) -> bool {
        self.remote.is_some()
    }
}
