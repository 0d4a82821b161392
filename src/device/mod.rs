pub mod bridge;
pub mod id;
pub mod scan;
pub mod snapshot;
pub mod watcher;

pub use bridge::{Bridge, DeviceInfo};
pub use id::DeviceId;
pub use scan::{list_devices, parse_device_list, ready_snapshot, scan, DeviceEntry, DeviceState};
pub use snapshot::{DeviceSnapshot, FileSnapshotStore, MemorySnapshotStore, SnapshotStore};
pub use watcher::{diff, notify, DeviceHandler, DeviceWatcher, SnapshotDiff, TickOutcome, WatchPhase};
