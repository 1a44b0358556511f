//! Periodic background sync.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::adapter::Adapter;
use crate::client::SyncClient;
use crate::error::{Result, SyncError};
use crate::view::Scope;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub interval: Duration,
    /// Push pending edits after each pull.
    pub auto_push: bool,
    pub scope: Scope,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(crate::config::DEFAULT_INTERVAL_SECS),
            auto_push: false,
            scope: Scope::All,
        }
    }
}

/// Counters over the scheduler's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleStats {
    pub completed: u64,
    /// Cycles skipped because the client was busy.
    pub skipped: u64,
    pub failed: u64,
    pub pushes: u64,
    pub last_cycle: Option<DateTime<Utc>>,
}

/// Handle to the background sync thread. Dropping it stops the thread.
pub struct Scheduler {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<Mutex<CycleStats>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .field("stats", &*self.stats.lock())
            .finish()
    }
}

impl Scheduler {
    /// Start syncing `client` every `options.interval`. The first cycle runs
    /// one interval after start.
    ///
    /// # Errors
    ///
    /// `Io` if the thread cannot be spawned.
    pub fn start(
        client: Arc<SyncClient>,
        options: SchedulerOptions,
        adapter: Option<Box<dyn Adapter>>,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(CycleStats::default()));
        let thread_stats = Arc::clone(&stats);

        let handle = thread::Builder::new()
            .name("bsync-scheduler".to_string())
            .spawn(move || {
                let mut adapter = adapter;
                info!(interval = ?options.interval, auto_push = options.auto_push, "scheduler started");
                loop {
                    match stop_rx.recv_timeout(options.interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    run_cycle(&client, &options, adapter.as_deref_mut(), &thread_stats);
                }
                info!("scheduler stopped");
            })?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            stats,
        })
    }

    #[must_use]
    pub fn stats(&self) -> CycleStats {
        self.stats.lock().clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread. No new cycle starts after this returns; a cycle in
    /// flight is waited for.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("scheduler thread panicked");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_cycle(
    client: &SyncClient,
    options: &SchedulerOptions,
    adapter: Option<&mut (dyn Adapter + 'static)>,
    stats: &Mutex<CycleStats>,
) {
    let report = match client.pull(&options.scope) {
        Ok(report) => report,
        Err(SyncError::Busy(op)) => {
            debug!(%op, "client busy, skipping sync cycle");
            record(stats, |s| s.skipped += 1);
            return;
        }
        Err(e) => {
            warn!(error = %e, "scheduled pull failed");
            record(stats, |s| s.failed += 1);
            return;
        }
    };

    if let Some(adapter) = adapter
        && let Err(e) = adapter.apply_view(&report.view)
    {
        warn!(error = %e, "adapter rejected merged view");
    }

    let mut pushed = false;
    if options.auto_push && client.has_pending() {
        match client.push() {
            Ok(_) => pushed = true,
            Err(SyncError::Busy(op)) => debug!(%op, "client busy, push deferred"),
            Err(e) => {
                warn!(error = %e, "scheduled push failed");
                record(stats, |s| s.failed += 1);
                return;
            }
        }
    }

    record(stats, |s| {
        s.completed += 1;
        if pushed {
            s.pushes += 1;
        }
    });
}

fn record(stats: &Mutex<CycleStats>, update: impl FnOnce(&mut CycleStats)) {
    let mut s = stats.lock();
    update(&mut s);
    s.last_cycle = Some(Utc::now());
}
