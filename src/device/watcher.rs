//! Hotplug detection by polling `adb devices` and diffing against the
//! last persisted snapshot.
//!
//! One call to [`DeviceWatcher::poll_once`] is one cycle:
//! `Idle -> Scanning -> Diffing -> Notifying -> Idle`. A failed scan ends
//! the cycle without touching the stored snapshot; the next tick retries.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::device::{scan, Bridge, DeviceId, DeviceSnapshot, SnapshotStore};
use crate::error::{Diagnostics, ErrorCode};

/// Receives newly attached devices
#[async_trait]
pub trait DeviceHandler: Send + Sync {
    async fn device_added(&self, id: &DeviceId) -> anyhow::Result<()>;
}

/// Phase of a watch cycle, used for tracing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchPhase {
    Idle,
    Scanning,
    Diffing,
    Notifying,
}

/// Result of comparing two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotDiff {
    pub added: Vec<DeviceId>,
    pub removed: Vec<DeviceId>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Set difference in both directions: `added = current - previous`,
/// `removed = previous - current`, each ascending.
pub fn diff(previous: &DeviceSnapshot, current: &DeviceSnapshot) -> SnapshotDiff {
    SnapshotDiff {
        added: current.difference(previous).cloned().collect(),
        removed: previous.difference(current).cloned().collect(),
    }
}

/// Call `handler` once per id, in order. Failures are logged and counted;
/// the remaining ids are still delivered. Returns the number of failures.
pub async fn notify(added: &[DeviceId], handler: &dyn DeviceHandler, diagnostics: &Diagnostics) -> usize {
    let mut failures = 0;
    for id in added {
        info!(device = %id, "device connected");
        if let Err(e) = handler.device_added(id).await {
            failures += 1;
            diagnostics.warn(&format!("handler failed for device {id}: {e:#}"));
        }
    }
    failures
}

/// What a single poll tick did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Another tick held the lock
    Skipped,
    Completed {
        diff: SnapshotDiff,
        current: Vec<DeviceId>,
        handler_failures: usize,
    },
}

/// Holds the advisory lock for the duration of a tick
struct TickLock {
    file: File,
}

impl TickLock {
    fn try_acquire(path: &Path) -> std::io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Drop for TickLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("failed to release tick lock: {e}");
        }
    }
}

/// Polls for devices and dispatches arrivals to a handler
pub struct DeviceWatcher<S: SnapshotStore> {
    bridge: Bridge,
    store: S,
    handler: Arc<dyn DeviceHandler>,
    lock_path: Option<PathBuf>,
}

impl<S: SnapshotStore> DeviceWatcher<S> {
    pub fn new(bridge: Bridge, store: S, handler: Arc<dyn DeviceHandler>) -> Self {
        Self {
            bridge,
            store,
            handler,
            lock_path: None,
        }
    }

    /// Skip ticks that would overlap another holder of this lock file
    pub fn with_lock_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = Some(path.into());
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one watch cycle.
    ///
    /// Removed devices are not dispatched anywhere; they only drop out of the
    /// stored snapshot. The snapshot is rewritten on every completed cycle,
    /// changed or not.
    pub async fn poll_once(&self, diagnostics: &Diagnostics) -> Result<TickOutcome, ErrorCode> {
        let _lock = match &self.lock_path {
            Some(path) => match TickLock::try_acquire(path) {
                Ok(Some(lock)) => Some(lock),
                Ok(None) => {
                    info!(lock = %path.display(), "previous tick still running, skipping");
                    return Ok(TickOutcome::Skipped);
                }
                Err(e) => {
                    let code = ErrorCode::from_io(&e);
                    diagnostics.error(code, &format!("cannot open lock file {}: {e}", path.display()));
                    return Err(code);
                }
            },
            None => None,
        };

        let previous = self.store.load().map_err(|e| {
            let code = io_code(&e);
            diagnostics.error(code, &format!("cannot load stored snapshot: {e:#}"));
            code
        })?;

        trace_phase(WatchPhase::Scanning);
        let current = match scan(&self.bridge, diagnostics).await {
            Ok(current) => current,
            Err(code) => {
                warn!(?code, "scan failed, will retry on next tick");
                trace_phase(WatchPhase::Idle);
                return Err(code);
            }
        };

        trace_phase(WatchPhase::Diffing);
        let changes = diff(&previous, &current);
        for id in &changes.removed {
            info!(device = %id, "device disconnected");
        }

        trace_phase(WatchPhase::Notifying);
        let handler_failures = notify(&changes.added, self.handler.as_ref(), diagnostics).await;

        self.store.save(&current).map_err(|e| {
            let code = io_code(&e);
            diagnostics.error(code, &format!("cannot persist snapshot: {e:#}"));
            code
        })?;
        trace_phase(WatchPhase::Idle);

        Ok(TickOutcome::Completed {
            diff: changes,
            current: current.iter().cloned().collect(),
            handler_failures,
        })
    }

    /// Tick every `interval` until `shutdown` resolves. Tick errors are
    /// logged and do not stop the loop.
    pub async fn run_until<F>(&self, interval: Duration, diagnostics: &Diagnostics, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(interval_secs = interval.as_secs(), "device watcher started");
        tokio::pin!(shutdown);

        loop {
            match self.poll_once(diagnostics).await {
                Ok(TickOutcome::Completed { diff, .. }) if !diff.is_empty() => {
                    debug!(added = diff.added.len(), removed = diff.removed.len(), "device set changed");
                }
                Ok(_) => {}
                Err(ErrorCode::UserCancelled) => debug!("watch tick interrupted"),
                Err(code) => error!(?code, "watch tick failed"),
            }

            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown signal received, stopping watcher");
                    break;
                }
                _ = sleep(interval) => {}
            }
        }
    }
}

fn trace_phase(phase: WatchPhase) {
    debug!(?phase, "watch cycle");
}

fn io_code(err: &anyhow::Error) -> ErrorCode {
    err.downcast_ref::<std::io::Error>()
        .map(ErrorCode::from_io)
        .unwrap_or(ErrorCode::Unknown)
}
