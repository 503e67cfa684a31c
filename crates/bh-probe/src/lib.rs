#![forbid(unsafe_code)]
//! Timeout-bounded responsiveness checks for possibly dead mounts.
//!
//! `stat` on a dead FUSE or network mount can block forever and cannot be
//! cancelled. [`MountProbe`] runs the `stat` on an expendable worker thread
//! and waits for it with a deadline. When the deadline passes the caller gets
//! [`ProbeOutcome::TimedOut`] and walks away; the worker stays quarantined
//! until the call returns, possibly never.
//!
//! Two safeguards keep stuck workers from piling up:
//!
//! - **Deduplication**: concurrent checks of the same path share one worker.
//! - **Worker cap**: at most `max_workers` workers exist at once. When they
//!   are all stuck, new checks fail fast with [`ProbeOutcome::Saturated`].
//!
//! No lock is held across the `stat` call.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default cap on simultaneously running workers.
pub const DEFAULT_MAX_WORKERS: usize = 3;

/// Default time a caller waits for a worker.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeConfig {
    /// Upper bound on live workers, stuck ones included. Clamped to at least 1.
    pub max_workers: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

/// Result of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProbeOutcome {
    /// `stat` succeeded.
    Responsive,
    /// `stat` returned an error. The mount answered, but not with metadata.
    Failed { errno: Option<i32> },
    /// The worker did not finish before the deadline.
    TimedOut,
    /// Every worker slot is taken; no check was started.
    Saturated,
}

impl ProbeOutcome {
    #[must_use]
    pub fn is_responsive(&self) -> bool {
        matches!(self, Self::Responsive)
    }
}

/// One in-flight `stat`, shared by its worker and every waiter.
#[derive(Debug, Default)]
struct ProbeJob {
    outcome: Mutex<Option<ProbeOutcome>>,
    finished: Condvar,
}

impl ProbeJob {
    fn complete(&self, outcome: ProbeOutcome) {
        *self.outcome.lock() = Some(outcome);
        self.finished.notify_all();
    }

    /// Wait for the worker until `deadline`. `None` means it is still running.
    fn wait_until(&self, deadline: Instant) -> Option<ProbeOutcome> {
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            if self.finished.wait_until(&mut outcome, deadline).timed_out() {
                break;
            }
        }
        *outcome
    }
}

#[derive(Debug, Default)]
struct ProbeTable {
    jobs: HashMap<PathBuf, Arc<ProbeJob>>,
    workers: usize,
}

#[derive(Debug)]
struct ProbeInner {
    table: Mutex<ProbeTable>,
    max_workers: usize,
}

impl ProbeInner {
    /// Called by a worker after its `stat` returned.
    fn retire(&self, path: &Path, job: &Arc<ProbeJob>) {
        let mut table = self.table.lock();
        table.workers = table.workers.saturating_sub(1);
        if table.jobs.get(path).is_some_and(|j| Arc::ptr_eq(j, job)) {
            table.jobs.remove(path);
        }
    }
}

/// Shared responsiveness checker. Clones share workers and the dedup table.
#[derive(Debug, Clone)]
pub struct MountProbe {
    inner: Arc<ProbeInner>,
}

impl Default for MountProbe {
    fn default() -> Self {
        Self::new(ProbeConfig::default())
    }
}

impl MountProbe {
    #[must_use]
    pub fn new(config: ProbeConfig) -> Self {
        Self {
            inner: Arc::new(ProbeInner {
                table: Mutex::new(ProbeTable::default()),
                max_workers: config.max_workers.max(1),
            }),
        }
    }

    /// Check whether `stat(path)` answers within `timeout`.
    ///
    /// Never blocks much longer than `timeout`, whatever the mount does.
    pub fn check(&self, path: impl AsRef<Path>, timeout: Duration) -> ProbeOutcome {
        let path = path.as_ref();
        let deadline = Instant::now() + timeout;
        let job = match self.join_or_start(path) {
            Ok(job) => job,
            Err(outcome) => return outcome,
        };

        match job.wait_until(deadline) {
            Some(outcome) => {
                debug!(path = %path.display(), ?outcome, "probe finished");
                outcome
            }
            None => {
                info!(
                    path = %path.display(),
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "probe timed out; worker left running"
                );
                ProbeOutcome::TimedOut
            }
        }
    }

    /// Number of paths with a check in flight.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.table.lock().jobs.len()
    }

    /// Number of live worker threads, stuck ones included.
    #[must_use]
    pub fn active_workers(&self) -> usize {
        self.inner.table.lock().workers
    }

    #[must_use]
    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    /// Join the in-flight check for `path` or start a new one.
    ///
    /// Fails with `Saturated` when every worker slot is taken, or with
    /// `Failed` when the worker thread could not be spawned.
    fn join_or_start(&self, path: &Path) -> Result<Arc<ProbeJob>, ProbeOutcome> {
        let mut table = self.inner.table.lock();
        if let Some(job) = table.jobs.get(path) {
            debug!(path = %path.display(), "joining in-flight probe");
            return Ok(Arc::clone(job));
        }
        if table.workers >= self.inner.max_workers {
            warn!(path = %path.display(), max_workers = self.inner.max_workers, "probe saturated");
            return Err(ProbeOutcome::Saturated);
        }

        let job = Arc::new(ProbeJob::default());
        let worker_job = Arc::clone(&job);
        let inner = Arc::clone(&self.inner);
        let worker_path = path.to_owned();
        let spawned = thread::Builder::new()
            .name("bh-probe".to_owned())
            .spawn(move || {
                let outcome = match fs::metadata(&worker_path) {
                    Ok(_) => ProbeOutcome::Responsive,
                    Err(err) => ProbeOutcome::Failed {
                        errno: err.raw_os_error(),
                    },
                };
                worker_job.complete(outcome);
                inner.retire(&worker_path, &worker_job);
            });
        if let Err(error) = spawned {
            return Err(spawn_failed(path, &error));
        }

        table.workers += 1;
        table.jobs.insert(path.to_owned(), Arc::clone(&job));
        debug!(path = %path.display(), workers = table.workers, "probe started");
        Ok(job)
    }
}

/// Outcome for a check whose worker thread never started.
fn spawn_failed(path: &Path, error: &io::Error) -> ProbeOutcome {
    warn!(path = %path.display(), %error, "failed to spawn probe worker");
    ProbeOutcome::Failed {
        errno: error.raw_os_error(),
    }
}
