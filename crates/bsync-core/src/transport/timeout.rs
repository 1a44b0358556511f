use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::warn;

use super::{BranchRelation, CommitRequest, FileTree, HistoryEntry, Transport, VersionId};
use crate::error::{Result, SyncError};

/// Runs every call of the wrapped transport on a worker thread and gives up
/// after `timeout` with `RemoteUnavailable`.
///
/// An abandoned call keeps running in the background. Commits stay safe
/// because the branch update is a compare-and-swap.
#[derive(Clone)]
pub struct TimeoutTransport {
    inner: Arc<dyn Transport>,
    timeout: Duration,
}

impl std::fmt::Debug for TimeoutTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutTransport")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl TimeoutTransport {
    #[must_use]
    pub fn new(inner: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    fn call<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Transport) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(format!("bsync-{op}"))
            .spawn(move || {
                let _ = tx.send(f(inner.as_ref()));
            })?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(op, timeout = ?self.timeout, "transport call timed out");
                Err(SyncError::RemoteUnavailable(format!(
                    "{op} timed out after {:?}",
                    self.timeout
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(SyncError::RemoteUnavailable(format!(
                "{op} worker exited without a result"
            ))),
        }
    }
}

impl Transport for TimeoutTransport {
    fn local_tip(&self, branch: &str) -> Result<Option<VersionId>> {
        let branch = branch.to_string();
        self.call("local-tip", move |t| t.local_tip(&branch))
    }

    fn remote_tip(&self, branch: &str) -> Result<Option<VersionId>> {
        let branch = branch.to_string();
        self.call("remote-tip", move |t| t.remote_tip(&branch))
    }

    fn list_branches(&self, prefix: &str) -> Result<BTreeSet<String>> {
        let prefix = prefix.to_string();
        self.call("list-branches", move |t| t.list_branches(&prefix))
    }

    fn commit(&self, request: CommitRequest) -> Result<VersionId> {
        self.call("commit", move |t| t.commit(request))
    }

    fn read_tree(&self, version: &VersionId) -> Result<FileTree> {
        let version = version.clone();
        self.call("read-tree", move |t| t.read_tree(&version))
    }

    fn fetch(&self, prefix: &str) -> Result<()> {
        let prefix = prefix.to_string();
        self.call("fetch", move |t| t.fetch(&prefix))
    }

    fn publish(&self, branch: &str) -> Result<()> {
        let branch = branch.to_string();
        self.call("publish", move |t| t.publish(&branch))
    }

    fn history(&self, tip: &VersionId, limit: usize) -> Result<Vec<HistoryEntry>> {
        let tip = tip.clone();
        self.call("history", move |t| t.history(&tip, limit))
    }

    fn relation(&self, branch: &str) -> Result<BranchRelation> {
        let branch = branch.to_string();
        self.call("relation", move |t| t.relation(&branch))
    }

    fn count_between(&self, base: &VersionId, tip: &VersionId) -> Result<usize> {
        let (base, tip) = (base.clone(), tip.clone());
        self.call("count-between", move |t| t.count_between(&base, &tip))
    }

    fn has_remote(&self) -> bool {
        self.inner.has_remote()
    }
}
