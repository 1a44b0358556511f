use crate::error::{Result, SyncError};
use fs2::FileExt;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};
use tracing::debug;

/// Location of the lock file inside a workspace.
#[must_use]
pub fn lock_path(workspace: &Path) -> PathBuf {
    workspace.join(".bsync").join("lock")
}

/// RAII guard for the workspace-wide exclusive advisory lock. One sync
/// client per workspace holds it for its whole lifetime.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    /// Acquire the lock of `workspace`, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// `Lock` if another process keeps holding it; `Io` if the lock file
    /// cannot be created.
    pub fn acquire(workspace: &Path, timeout: Duration) -> Result<Self> {
        Self::acquire_at(&lock_path(workspace), timeout)
    }

    /// Acquire an exclusive lock on an explicit lock file path.
    ///
    /// # Errors
    ///
    /// As [`WorkspaceLock::acquire`].
    pub fn acquire_at(path: &Path, timeout: Duration) -> Result<Self> {
        let parent = path.parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "lock path has no parent")
        })?;
        fs::create_dir_all(parent)?;

        let start = Instant::now();
        loop {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(path)?;

            if file.try_lock_exclusive().is_ok() {
                // Holder pid, for humans inspecting a stuck workspace.
                file.set_len(0)?;
                writeln!(file, "{}", std::process::id())?;
                debug!(path = %path.display(), "workspace lock acquired");
                return Ok(Self {
                    file,
                    path: path.to_path_buf(),
                });
            }

            if start.elapsed() >= timeout {
                return Err(SyncError::Lock {
                    path: path.to_path_buf(),
                });
            }

            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Explicitly release the lock. Release also happens automatically on drop.
    pub fn release(self) {
        drop(self);
    }

    /// Return the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::{WorkspaceLock, lock_path};
    use crate::error::{ErrorCode, SyncError};
    use std::{
        sync::{Arc, Barrier},
        thread,
        time::Duration,
    };

    #[test]
    fn lock_allows_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = WorkspaceLock::acquire(dir.path(), Duration::from_millis(50)).unwrap();
        assert_eq!(lock.path(), lock_path(dir.path()).as_path());
        lock.release();
    }

    #[test]
    fn lock_times_out_when_held() {
        let dir = tempfile::tempdir().unwrap();
        let _guard = WorkspaceLock::acquire(dir.path(), Duration::from_millis(50)).unwrap();
        let err = WorkspaceLock::acquire(dir.path(), Duration::from_millis(20)).unwrap_err();

        assert!(matches!(&err, SyncError::Lock { path } if *path == lock_path(dir.path())));
        assert_eq!(err.code(), ErrorCode::LockContention);
        assert!(err.hint().is_some());
    }

    #[test]
    fn release_allows_follow_up_lock() {
        let dir = tempfile::tempdir().unwrap();
        {
            let _first = WorkspaceLock::acquire(dir.path(), Duration::from_millis(50)).unwrap();
        }
        let _second = WorkspaceLock::acquire(dir.path(), Duration::from_millis(50)).unwrap();
    }

    #[test]
    fn contention_is_resolved_after_holder_releases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().to_path_buf();

        let blocker = Arc::new(Barrier::new(2));
        let waiter = Arc::new(Barrier::new(2));

        let blocker_thread = Arc::clone(&blocker);
        let waiter_thread = Arc::clone(&waiter);
        let path_in_thread = path.clone();
        let handle = thread::spawn(move || {
            let _holder =
                WorkspaceLock::acquire(&path_in_thread, Duration::from_millis(200)).unwrap();
            blocker_thread.wait();
            waiter_thread.wait();
        });

        blocker.wait();
        assert!(matches!(
            WorkspaceLock::acquire(&path, Duration::from_millis(20)),
            Err(SyncError::Lock { .. })
        ));
        waiter.wait();
        handle.join().unwrap();

        let follow_up = WorkspaceLock::acquire(&path, Duration::from_millis(50)).unwrap();
        follow_up.release();
    }
}
