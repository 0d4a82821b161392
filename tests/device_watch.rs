mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use droid_mirror::device::{
    list_devices, scan, DeviceHandler, DeviceId, DeviceWatcher, FileSnapshotStore,
    MemorySnapshotStore, SnapshotStore, TickOutcome,
};
use droid_mirror::error::{Diagnostics, ErrorCode};

use common::{bridge, fail, ok, snapshot, strs, ScriptedRunner};

const DEVICES: &str = "devices -l";

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

impl Recorder {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceHandler for Recorder {
    async fn device_added(&self, id: &DeviceId) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(id.to_string());
        Ok(())
    }
}

fn watcher(
    runner: Arc<ScriptedRunner>,
    previous: &[&str],
) -> (DeviceWatcher<MemorySnapshotStore>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let store = MemorySnapshotStore::new(snapshot(previous));
    let watcher = DeviceWatcher::new(bridge(runner), store, recorder.clone());
    (watcher, recorder)
}

#[tokio::test]
async fn scan_returns_single_ready_device() {
    let runner = ScriptedRunner::new();
    runner.script(DEVICES, vec![ok("List of devices attached\nABCD1234\tdevice\n")]);
    let diagnostics = Diagnostics::new();

    let current = scan(&bridge(runner.clone()), &diagnostics).await.unwrap();

    let ids: Vec<&str> = current.iter().map(DeviceId::as_str).collect();
    assert_eq!(ids, vec!["ABCD1234"]);
    assert!(diagnostics.is_clean());
    assert_eq!(runner.calls(), vec![DEVICES]);
}

#[tokio::test]
async fn new_device_is_dispatched_once_and_persisted() {
    let runner = ScriptedRunner::new();
    runner.script(DEVICES, vec![ok("List of devices attached\nA1\tdevice\nB2\tdevice\n")]);
    let (watcher, recorder) = watcher(runner, &["A1"]);
    let diagnostics = Diagnostics::new();

    let outcome = watcher.poll_once(&diagnostics).await.unwrap();

    let TickOutcome::Completed { diff, current, handler_failures } = outcome else {
        panic!("tick was skipped");
    };
    assert_eq!(strs(&diff.added), vec!["B2"]);
    assert!(diff.removed.is_empty());
    assert_eq!(strs(&current), vec!["A1", "B2"]);
    assert_eq!(handler_failures, 0);
    assert_eq!(recorder.seen(), vec!["B2"]);
    assert_eq!(watcher.store().current(), snapshot(&["A1", "B2"]));
}

#[tokio::test]
async fn removals_are_persisted_without_dispatch() {
    let runner = ScriptedRunner::new();
    runner.script(DEVICES, vec![ok("List of devices attached\n\n")]);
    let (watcher, recorder) = watcher(runner, &["A1", "B2"]);

    let outcome = watcher.poll_once(&Diagnostics::new()).await.unwrap();

    let TickOutcome::Completed { diff, .. } = outcome else {
        panic!("tick was skipped");
    };
    assert_eq!(strs(&diff.removed), vec!["A1", "B2"]);
    assert!(recorder.seen().is_empty());
    assert!(watcher.store().current().is_empty());
    assert_eq!(watcher.store().save_count(), 1);
}

#[tokio::test]
async fn unchanged_set_still_rewrites_snapshot() {
    let runner = ScriptedRunner::new();
    runner.script(DEVICES, vec![ok("List of devices attached\nA1\tdevice\n")]);
    let (watcher, recorder) = watcher(runner, &["A1"]);

    for _ in 0..2 {
        watcher.poll_once(&Diagnostics::new()).await.unwrap();
    }

    assert!(recorder.seen().is_empty());
    assert_eq!(watcher.store().save_count(), 2);
}

#[tokio::test]
async fn unauthorized_devices_are_not_dispatched() {
    let runner = ScriptedRunner::new();
    runner.script(
        DEVICES,
        vec![ok("List of devices attached\nA1\tunauthorized\nB2\tdevice\n")],
    );
    let (watcher, recorder) = watcher(runner, &[]);

    watcher.poll_once(&Diagnostics::new()).await.unwrap();

    assert_eq!(recorder.seen(), vec!["B2"]);
    assert_eq!(watcher.store().current(), snapshot(&["B2"]));
}

#[tokio::test]
async fn invalid_serial_is_dropped_with_warning() {
    let runner = ScriptedRunner::new();
    runner.script(
        DEVICES,
        vec![ok("List of devices attached\nbad id!@#\tdevice\nGOOD1\tdevice\n")],
    );
    let (watcher, recorder) = watcher(runner, &[]);
    let diagnostics = Diagnostics::new();

    watcher.poll_once(&diagnostics).await.unwrap();

    assert_eq!(recorder.seen(), vec!["GOOD1"]);
    assert_eq!(diagnostics.warnings(), 1);
}

#[tokio::test]
async fn listing_failure_restarts_server_once() {
    let runner = ScriptedRunner::new();
    runner.script(
        DEVICES,
        vec![
            fail(1, "error: protocol fault"),
            fail(1, "error: protocol fault"),
            ok("List of devices attached\nA1\tdevice\n"),
        ],
    );
    runner.script("kill-server", vec![ok("")]);
    runner.script("start-server", vec![ok("")]);
    let diagnostics = Diagnostics::new();

    let entries = list_devices(&bridge(runner.clone()), &diagnostics).await.unwrap();

    assert_eq!(entries.len(), 1);
    assert_eq!(
        runner.calls(),
        vec![DEVICES, DEVICES, "kill-server", "start-server", DEVICES]
    );
    assert_eq!(diagnostics.warnings(), 1);
    assert_eq!(diagnostics.errors(), 0);
}

#[tokio::test]
async fn failed_scan_leaves_snapshot_untouched() {
    let runner = ScriptedRunner::new();
    runner.script(DEVICES, vec![fail(1, "error: cannot connect to daemon")]);
    runner.script("kill-server", vec![ok("")]);
    runner.script("start-server", vec![fail(1, "error: cannot bind")]);
    let (watcher, recorder) = watcher(runner.clone(), &["A1"]);
    let diagnostics = Diagnostics::new();

    let result = watcher.poll_once(&diagnostics).await;

    assert_eq!(result, Err(ErrorCode::CommandError));
    assert!(recorder.seen().is_empty());
    assert_eq!(watcher.store().save_count(), 0);
    assert_eq!(watcher.store().current(), snapshot(&["A1"]));
    assert_eq!(runner.count(DEVICES), 3);
    assert_eq!(diagnostics.errors(), 1);
}

#[tokio::test]
async fn no_devices_error_is_not_retried() {
    let runner = ScriptedRunner::new();
    runner.script(DEVICES, vec![fail(1, "error: no devices/emulators found")]);
    runner.script("kill-server", vec![ok("")]);
    runner.script("start-server", vec![ok("")]);

    let result = list_devices(&bridge(runner.clone()), &Diagnostics::new()).await;

    assert_eq!(result, Err(ErrorCode::NoDevices));
    // one attempt before the restart, one after
    assert_eq!(runner.count(DEVICES), 2);
}

#[tokio::test]
async fn file_store_survives_between_watchers() {
    let dir = tempfile::tempdir().unwrap();
    let state = dir.path().join("state").join("devices.state");

    let runner = ScriptedRunner::new();
    runner.script(DEVICES, vec![ok("List of devices attached\nA1\tdevice\nB2\tdevice\n")]);
    let first = Arc::new(Recorder::default());
    let store = FileSnapshotStore::new(&state);
    let lock = store.lock_path();
    DeviceWatcher::new(bridge(runner.clone()), store, first.clone())
        .with_lock_file(&lock)
        .poll_once(&Diagnostics::new())
        .await
        .unwrap();
    assert_eq!(first.seen(), vec!["A1", "B2"]);
    assert_eq!(std::fs::read_to_string(&state).unwrap(), "A1\nB2\n");

    let second = Arc::new(Recorder::default());
    DeviceWatcher::new(bridge(runner), FileSnapshotStore::new(&state), second.clone())
        .with_lock_file(&lock)
        .poll_once(&Diagnostics::new())
        .await
        .unwrap();
    assert!(second.seen().is_empty());
}

#[tokio::test]
async fn overlapping_tick_is_skipped() {
    use fs2::FileExt;

    let dir = tempfile::tempdir().unwrap();
    let store = FileSnapshotStore::new(dir.path().join("devices.state"));
    let lock = store.lock_path();
    let held = std::fs::File::create(&lock).unwrap();
    held.lock_exclusive().unwrap();

    let runner = ScriptedRunner::new();
    let recorder = Arc::new(Recorder::default());
    let watcher = DeviceWatcher::new(bridge(runner.clone()), store, recorder)
        .with_lock_file(&lock);

    let outcome = watcher.poll_once(&Diagnostics::new()).await.unwrap();

    assert_eq!(outcome, TickOutcome::Skipped);
    assert!(runner.calls().is_empty());
    assert!(watcher.store().load().unwrap().is_empty());
    FileExt::unlock(&held).unwrap();
}

#[tokio::test]
async fn interrupted_listing_skips_server_restart() {
    let mut interrupted = fail(143, "");
    interrupted.interrupted = true;
    let runner = ScriptedRunner::new();
    runner.script(DEVICES, vec![interrupted]);
    runner.script("kill-server", vec![ok("")]);
    runner.script("start-server", vec![ok("")]);
    let (watcher, recorder) = watcher(runner.clone(), &["A1"]);
    let diagnostics = Diagnostics::new();

    let result = watcher.poll_once(&diagnostics).await;

    assert_eq!(result, Err(ErrorCode::UserCancelled));
    assert_eq!(runner.calls(), vec![DEVICES]);
    assert!(recorder.seen().is_empty());
    assert_eq!(watcher.store().save_count(), 0);
    assert!(diagnostics.is_clean());
}
