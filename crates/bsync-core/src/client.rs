//! Sync client: one user's session against the shared store.
//!
//! The client owns the user's pending edits (the dirty set) and turns them
//! into commits on `bsync/<user>`, and it merges every selected branch into
//! a [`MergedView`] for the adapter.
//!
//! Pull, push and status are mutually exclusive; a second one started while
//! another runs fails fast with `Busy`. Edits can be reported at any time,
//! including during a push.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::artifact::{AnyArtifact, Artifact, ArtifactKind, Composite, LastChange, Tracked};
use crate::clock::LogicalClock;
use crate::config::EffectiveConfig;
use crate::error::{Result, SyncError};
use crate::lock::WorkspaceLock;
use crate::merge::{Outcome, Resolution, merge_sets};
use crate::snapshot::{ArtifactSet, PushInfo, Snapshot, Stored, with_kind};
use crate::store::StateStore;
use crate::transport::{BranchRelation, GitTransport, TimeoutTransport, Transport, VersionId};
use crate::view::{MergedView, Scope, SkippedRecord};

/// What the client is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Idle,
    Pulling,
    Merging,
    Pushing,
    Reporting,
}

impl ClientState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pulling => "pull",
            Self::Merging => "merge",
            Self::Pushing => "push",
            Self::Reporting => "status",
        }
    }
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cooperative cancellation, checked between the phases of a pull or push.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// # Errors
    ///
    /// `Cancelled` once [`CancelToken::cancel`] was called.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct PullReport {
    pub view: Arc<MergedView>,
    /// True when the remote was unreachable and `view` is the last good one.
    pub stale: bool,
    pub outcomes: BTreeMap<Outcome, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushReport {
    /// New version of the caller's branch, if anything was committed.
    pub version: Option<VersionId>,
    /// Records written by the commit.
    pub committed: usize,
    pub attempts: u32,
    /// The branch reached the remote during this push.
    pub published: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub report: PushReport,
}

/// One pending edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirtyEntry {
    pub kind: ArtifactKind,
    pub key: String,
    pub deleted: bool,
}

/// Where another user's branch stands relative to the last merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserStatus {
    pub user: String,
    pub tip: Option<VersionId>,
    pub merged: Option<VersionId>,
    /// Versions on `tip` not yet part of a merged view.
    pub behind: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub user: String,
    pub dirty: Vec<DirtyEntry>,
    pub branch: BranchRelation,
    pub users: Vec<UserStatus>,
    pub tie_breaks: Vec<Resolution>,
    pub last_pull: Option<DateTime<Utc>>,
    pub last_push: Option<PushRecord>,
}

/// Per user, the live keys they provide for each kind.
pub type Tally = BTreeMap<String, BTreeMap<ArtifactKind, BTreeSet<String>>>;

#[derive(Debug, Default)]
struct Session {
    last_pull: Option<DateTime<Utc>>,
    last_push: Option<PushRecord>,
}

/// Exclusive hold on the session for one pull, push or status call.
struct Active<'a> {
    state: &'a Mutex<ClientState>,
    session: MutexGuard<'a, Session>,
}

impl Active<'_> {
    fn enter(&self, state: ClientState) {
        *self.state.lock() = state;
    }
}

impl Drop for Active<'_> {
    fn drop(&mut self) {
        *self.state.lock() = ClientState::Idle;
    }
}

pub struct SyncClient {
    user: String,
    store: StateStore,
    clock: LogicalClock,
    push_attempts: u32,
    state: Mutex<ClientState>,
    session: Mutex<Session>,
    dirty: Mutex<ArtifactSet>,
    last_view: Mutex<Option<Arc<MergedView>>>,
    workspace_lock: Option<WorkspaceLock>,
}

impl fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncClient")
            .field("user", &self.user)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

impl SyncClient {
    #[must_use]
    pub fn new(user: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            user: user.into(),
            store: StateStore::new(transport),
            clock: LogicalClock::system(),
            push_attempts: crate::config::DEFAULT_PUSH_ATTEMPTS,
            state: Mutex::new(ClientState::Idle),
            session: Mutex::new(Session::default()),
            dirty: Mutex::new(ArtifactSet::default()),
            last_view: Mutex::new(None),
            workspace_lock: None,
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: LogicalClock) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_push_attempts(mut self, attempts: u32) -> Self {
        self.push_attempts = attempts.max(1);
        self
    }

    /// Client for the git workspace described by `config`, holding the
    /// workspace lock for its lifetime.
    ///
    /// # Errors
    ///
    /// `Lock` if another client holds the workspace; `Git` if the workspace
    /// is not a repository.
    pub fn open(config: &EffectiveConfig) -> Result<Self> {
        let lock = WorkspaceLock::acquire(&config.workspace, config.lock_timeout())?;
        let git = GitTransport::open(&config.workspace, &config.remote)?;
        let transport = TimeoutTransport::new(Arc::new(git), config.transport_timeout());
        let mut client = Self::new(config.user.clone(), Arc::new(transport))
            .with_push_attempts(config.push_attempts);
        client.workspace_lock = Some(lock);
        info!(user = %config.user, workspace = %config.workspace.display(), "sync client opened");
        Ok(client)
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Lock file held by a client opened on a workspace.
    #[must_use]
    pub fn lock_path(&self) -> Option<&std::path::Path> {
        self.workspace_lock.as_ref().map(WorkspaceLock::path)
    }

    #[must_use]
    pub const fn store(&self) -> &StateStore {
        &self.store
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    /// Most recent view produced by a pull.
    #[must_use]
    pub fn last_view(&self) -> Option<Arc<MergedView>> {
        self.last_view.lock().clone()
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        !self.dirty.lock().is_empty()
    }

    /// Pending edits, in table order.
    #[must_use]
    pub fn pending(&self) -> Vec<DirtyEntry> {
        dirty_entries(&self.dirty.lock())
    }

    fn begin(&self, state: ClientState) -> Result<Active<'_>> {
        let Some(session) = self.session.try_lock() else {
            let current = *self.state.lock();
            let what = if current == ClientState::Idle {
                "another operation".to_string()
            } else {
                current.to_string()
            };
            return Err(SyncError::Busy(what));
        };
        let active = Active {
            state: &self.state,
            session,
        };
        active.enter(state);
        Ok(active)
    }

    fn stamp(&self) -> LastChange {
        LastChange::new(self.user.clone(), self.clock.tick())
    }

    /// Record an edit reported by the adapter.
    ///
    /// Structs and enums are compared member by member against the newest
    /// version this client knows (pending edit, last merged view, own
    /// branch) so that only changed members carry the new stamp.
    ///
    /// # Errors
    ///
    /// Store failures while looking up the previous version.
    pub fn report_edit(&self, artifact: AnyArtifact) -> Result<()> {
        let kind = artifact.kind();
        let key = artifact.key_string();
        match artifact {
            AnyArtifact::Function(a) => self.stage(a),
            AnyArtifact::StackVariable(a) => self.stage(a),
            AnyArtifact::Struct(a) => self.stage_composite(a)?,
            AnyArtifact::Enum(a) => self.stage_composite(a)?,
            AnyArtifact::GlobalVariable(a) => self.stage(a),
            AnyArtifact::Comment(a) => self.stage(a),
            AnyArtifact::Patch(a) => self.stage(a),
        }
        debug!(%kind, %key, "edit reported");
        Ok(())
    }

    /// Record a deletion.
    ///
    /// # Errors
    ///
    /// `InvalidKey` if `key` does not parse for `kind`, or `kind` is a
    /// member kind (report the edited container instead).
    pub fn report_delete(&self, kind: ArtifactKind, key: &str) -> Result<()> {
        with_kind!(kind, A => {
            let parsed = A::parse_key(key)?;
            let stamp = self.stamp();
            self.dirty.lock().put_tombstone::<A>(parsed, stamp);
        }, members => return Err(SyncError::InvalidKey { kind, key: key.to_string() }));
        debug!(%kind, %key, "delete reported");
        Ok(())
    }

    fn stage<A: Stored>(&self, value: A) {
        let stamp = self.stamp();
        self.dirty.lock().put(value, stamp);
    }

    fn stage_composite<C: Stored + Composite>(&self, mut value: C) -> Result<()> {
        let key = value.key();
        let pending = self.dirty.lock().live::<C>(&key).cloned();
        let base = match pending {
            Some(p) => Some(p),
            None => match self.last_view().and_then(|v| v.get::<C>(&key).cloned()) {
                Some(v) => Some(v),
                None => self.own_record::<C>(&key)?,
            },
        };
        let stamp = self.stamp();
        value.stamp_members(base.as_ref(), &stamp);
        self.dirty.lock().put(value, stamp);
        Ok(())
    }

    fn own_record<A: Stored>(&self, key: &A::Key) -> Result<Option<A>> {
        match self.store.read_snapshot(&self.user, None) {
            Ok(loaded) => Ok(loaded.snapshot.artifacts.live::<A>(key).cloned()),
            Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fetch, merge `scope` with the caller's own state and pending edits,
    /// and publish the result as the new last view.
    ///
    /// # Errors
    ///
    /// `Busy` if another operation is in flight. An unreachable remote is
    /// not an error: the last good view comes back marked stale.
    pub fn pull(&self, scope: &Scope) -> Result<PullReport> {
        self.pull_with(scope, &CancelToken::new())
    }

    /// [`SyncClient::pull`] with cancellation.
    ///
    /// # Errors
    ///
    /// As [`SyncClient::pull`], plus `Cancelled`.
    #[instrument(skip_all, fields(user = %self.user))]
    pub fn pull_with(&self, scope: &Scope, cancel: &CancelToken) -> Result<PullReport> {
        let mut active = self.begin(ClientState::Pulling)?;
        cancel.check()?;

        let stale = match self.store.fetch() {
            Ok(()) => false,
            Err(SyncError::RemoteUnavailable(reason)) => {
                warn!(%reason, "remote unavailable, serving last good view");
                true
            }
            Err(e) => return Err(e),
        };
        cancel.check()?;

        if stale && let Some(last) = self.last_view() {
            let view = Arc::new(MergedView::clone(&last).into_stale());
            return Ok(PullReport {
                outcomes: view.outcome_counts(),
                view,
                stale,
            });
        }

        active.enter(ClientState::Merging);
        let mut view = self.merge_scope(scope)?;
        view.stale = stale;
        cancel.check()?;

        let view = Arc::new(view);
        *self.last_view.lock() = Some(Arc::clone(&view));
        active.session.last_pull = Some(view.computed_at);
        info!(
            sources = view.sources.len(),
            keys = view.log.len(),
            tie_breaks = view.tie_breaks().count(),
            stale,
            "pull complete"
        );
        Ok(PullReport {
            outcomes: view.outcome_counts(),
            view,
            stale,
        })
    }

    /// Merge from already-fetched branches. Touches neither the network nor
    /// the last view.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn get_merged_view(&self, scope: &Scope) -> Result<MergedView> {
        self.merge_scope(scope)
    }

    fn merge_scope(&self, scope: &Scope) -> Result<MergedView> {
        let users = scope.select(&self.store.list_users()?, &self.user);
        let mut loaded = Vec::with_capacity(users.len() + 1);
        for user in &users {
            match self.store.read_snapshot(user, None) {
                Ok(snapshot) => loaded.push(snapshot),
                Err(SyncError::NotFound(_)) => debug!(%user, "no branch yet"),
                Err(e) => return Err(e),
            }
        }
        // Versions of the own branch published elsewhere but not merged in.
        if let BranchRelation::Diverged { .. } = self.store.relation(&self.user)?
            && let Some(remote) = self.store.remote_tip(&self.user)?
        {
            loaded.push(self.store.read_snapshot(&self.user, Some(&remote))?);
        }

        let dirty = self.dirty.lock().clone();
        let mut inputs: Vec<&ArtifactSet> = loaded.iter().map(|l| &l.snapshot.artifacts).collect();
        inputs.push(&dirty);

        let mut view = MergedView::new(merge_sets(&inputs));
        for l in &loaded {
            view.sources
                .entry(l.snapshot.user.clone())
                .or_insert_with(|| l.version.clone());
            view.skipped
                .extend(l.skipped.iter().map(|e| SkippedRecord::new(&l.snapshot.user, e)));
        }
        view.pending_edits = dirty.len();
        self.clock.observe(view.artifacts.max_timestamp());
        Ok(view)
    }

    /// Commit the pending edits on top of the caller's branch and publish.
    ///
    /// # Errors
    ///
    /// `Busy` if another operation is in flight; `PushFailed` when every
    /// attempt lost a race for the branch.
    pub fn push(&self) -> Result<PushReport> {
        self.push_with(&CancelToken::new())
    }

    /// [`SyncClient::push`] with cancellation.
    ///
    /// # Errors
    ///
    /// As [`SyncClient::push`], plus `Cancelled` (never after a commit).
    #[instrument(skip_all, fields(user = %self.user))]
    pub fn push_with(&self, cancel: &CancelToken) -> Result<PushReport> {
        let mut active = self.begin(ClientState::Pushing)?;
        let taken = self.dirty.lock().clone();

        let mut report = PushReport {
            version: None,
            committed: 0,
            attempts: 0,
            published: false,
        };
        loop {
            report.attempts += 1;
            if report.version.is_none() {
                cancel.check()?;
            }
            match self.push_once(&taken, &mut report) {
                Ok(()) => break,
                Err(e @ SyncError::WriteConflict { .. }) => {
                    if report.attempts >= self.push_attempts {
                        warn!(attempts = report.attempts, error = %e, "push gave up");
                        return Err(SyncError::PushFailed {
                            attempts: report.attempts,
                            reason: e.to_string(),
                        });
                    }
                    warn!(attempt = report.attempts, error = %e, "push conflict, refetching");
                    self.store.fetch()?;
                }
                Err(e) => return Err(e),
            }
        }

        active.session.last_push = Some(PushRecord {
            at: Utc::now(),
            report: report.clone(),
        });
        info!(
            version = report.version.as_ref().map(VersionId::short),
            committed = report.committed,
            attempts = report.attempts,
            published = report.published,
            "push complete"
        );
        Ok(report)
    }

    /// One attempt: commit `taken` (and any unmerged remote versions of the
    /// own branch) if needed, then publish if the branch is ahead.
    fn push_once(&self, taken: &ArtifactSet, report: &mut PushReport) -> Result<()> {
        let local = self.store.local_tip(&self.user)?;
        let remote = self.store.remote_tip(&self.user)?;
        let unmerged_remote = match (&local, &remote) {
            (Some(l), Some(r)) => self.store.versions_between(l, r)? > 0,
            _ => false,
        };

        let base = match local.as_ref().or(remote.as_ref()) {
            Some(v) => self.store.read_snapshot(&self.user, Some(v))?.snapshot,
            None => Snapshot::new(self.user.clone()),
        };
        let mut next = base.clone();
        if unmerged_remote && let Some(r) = &remote {
            let theirs = self.store.read_snapshot(&self.user, Some(r))?.snapshot;
            next.artifacts = merge_sets(&[&base.artifacts, &theirs.artifacts]).set;
            next.sequence = base.sequence.max(theirs.sequence);
        }

        let mut changes = taken.clone();
        changes.retain_changed(&next.artifacts);
        if !changes.is_empty() || unmerged_remote {
            let stamp = self.stamp();
            changes.restamp(&self.user, base.artifacts.max_timestamp(), &stamp);
            if let Some((kind, key)) = changes.last_key() {
                next.last_push = Some(PushInfo {
                    timestamp: stamp.timestamp,
                    kind,
                    key,
                });
            }
            next.artifacts.overlay(&changes);
            next.sequence += 1;
            next.user.clone_from(&self.user);

            let version = self.store.commit_snapshot(&self.user, &next, local.as_ref())?;
            self.dirty.lock().remove_settled(taken);
            report.committed += changes.len();
            report.version = Some(version);
        } else {
            self.dirty.lock().remove_settled(taken);
        }

        if !self.store.transport().has_remote() {
            return Ok(());
        }
        match self.store.relation(&self.user)? {
            BranchRelation::Ahead { .. } | BranchRelation::LocalOnly => {
                match self.store.publish(&self.user) {
                    Ok(()) => report.published = true,
                    Err(SyncError::RemoteUnavailable(reason)) => {
                        warn!(%reason, "remote unavailable, commit kept locally");
                    }
                    Err(e) => return Err(e),
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Pending edits, the own branch, and how far each user's branch has
    /// moved since the last merge.
    ///
    /// # Errors
    ///
    /// `Busy` if another operation is in flight.
    pub fn status(&self) -> Result<StatusReport> {
        let active = self.begin(ClientState::Reporting)?;
        let last_view = self.last_view();

        let mut users = Vec::new();
        for user in self.store.list_users()? {
            let tip = self.store.tip(&user)?;
            let merged = last_view.as_ref().and_then(|v| v.sources.get(&user).cloned());
            let behind = match (&merged, &tip) {
                (Some(m), Some(t)) => self.store.versions_between(m, t)?,
                (None, Some(_)) => self.store.history(&user, usize::MAX)?.len(),
                (_, None) => 0,
            };
            users.push(UserStatus {
                user,
                tip,
                merged,
                behind,
            });
        }

        Ok(StatusReport {
            user: self.user.clone(),
            dirty: self.pending(),
            branch: self.store.relation(&self.user)?,
            users,
            tie_breaks: last_view
                .map(|v| v.tie_breaks().cloned().collect())
                .unwrap_or_default(),
            last_pull: active.session.last_pull,
            last_push: active.session.last_push.clone(),
        })
    }

    /// Which keys each user in `scope` currently provides.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub fn tally(&self, scope: &Scope) -> Result<Tally> {
        let mut tally = Tally::new();
        for user in scope.select(&self.store.list_users()?, &self.user) {
            match self.store.read_snapshot(&user, None) {
                Ok(loaded) => {
                    tally.insert(user, loaded.snapshot.artifacts.live_keys());
                }
                Err(SyncError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(tally)
    }
}

fn dirty_entries(set: &ArtifactSet) -> Vec<DirtyEntry> {
    let mut entries = Vec::new();
    crate::snapshot::for_each_kind!(A => {
        for (key, tracked) in A::table(set) {
            entries.push(DirtyEntry {
                kind: A::KIND,
                key: key.to_string(),
                deleted: Tracked::is_tombstone(tracked),
            });
        }
    });
    entries
}
