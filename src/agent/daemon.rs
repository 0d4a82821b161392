use std::sync::Arc;

use tokio::time::Duration;
use tracing::info;

use crate::agent::config::Config;
use crate::agent::tools::{find_adb, find_scrcpy};
use crate::commands::{CommandRunner, Shutdown};
use crate::device::{Bridge, DeviceHandler, DeviceWatcher, FileSnapshotStore, TickOutcome};
use crate::error::{Diagnostics, ErrorCode};
use crate::mirror::{AutoMirrorHandler, LogHandler};

/// Build the watcher described by `config`, backed by the on-disk snapshot.
pub fn build_watcher(
    config: &Config,
    runner: Arc<dyn CommandRunner>,
    interactive: bool,
    shutdown: &Shutdown,
) -> Result<DeviceWatcher<FileSnapshotStore>, ErrorCode> {
    let adb = find_adb(config)?;
    let bridge = Bridge::new(runner, adb, config.timeout_strategy(), config.retry.clone());

    let handler: Arc<dyn DeviceHandler> = if config.watch.auto_mirror {
        let scrcpy = find_scrcpy(config)?;
        Arc::new(
            AutoMirrorHandler::new(bridge.clone(), scrcpy, config.mirror.clone())
                .with_confirmation(config.watch.confirm && interactive)
                .with_shutdown(shutdown.clone()),
        )
    } else {
        Arc::new(LogHandler)
    };

    let store = FileSnapshotStore::new(config.state_file());
    let lock = store.lock_path();
    info!(state_file = %store.path().display(), auto_mirror = config.watch.auto_mirror, "watcher configured");
    Ok(DeviceWatcher::new(bridge, store, handler).with_lock_file(lock))
}

/// Single tick, for launch agents and other external schedulers
pub async fn run_once(
    watcher: &DeviceWatcher<FileSnapshotStore>,
    diagnostics: &Diagnostics,
) -> Result<TickOutcome, ErrorCode> {
    let outcome = watcher.poll_once(diagnostics).await?;
    if let TickOutcome::Completed { diff, handler_failures, .. } = &outcome {
        info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            handler_failures,
            "watch tick complete"
        );
    }
    Ok(outcome)
}

/// Poll until `shutdown` fires. A signal during a tick interrupts its
/// child processes, so the loop stops without waiting for the tick.
pub async fn run(
    config: &Config,
    watcher: &DeviceWatcher<FileSnapshotStore>,
    diagnostics: &Diagnostics,
    shutdown: &Shutdown,
) {
    let interval = Duration::from_secs(config.watch.interval_secs.max(1));
    watcher
        .run_until(interval, diagnostics, async {
            shutdown.requested().await;
        })
        .await;

    info!(
        warnings = diagnostics.warnings(),
        errors = diagnostics.errors(),
        "device watcher stopped"
    );
}
