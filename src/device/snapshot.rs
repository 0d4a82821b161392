use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::device::DeviceId;

/// Sorted set of device serials seen at one poll tick
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    ids: BTreeSet<DeviceId>,
}

impl DeviceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &DeviceId) -> bool {
        self.ids.contains(id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids in ascending order
    pub fn iter(&self) -> impl Iterator<Item = &DeviceId> {
        self.ids.iter()
    }

    /// Ids present here but not in `other`, ascending
    pub fn difference<'a>(&'a self, other: &'a DeviceSnapshot) -> impl Iterator<Item = &'a DeviceId> {
        self.ids.difference(&other.ids)
    }

    /// Newline-joined ids, one per line with a trailing newline
    pub fn to_text(&self) -> String {
        self.ids.iter().map(|id| format!("{id}\n")).collect()
    }

    /// Inverse of [`DeviceSnapshot::to_text`]. Blank lines are skipped and
    /// malformed ids are dropped with a warning.
    pub fn from_text(text: &str) -> Self {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .filter_map(|line| match DeviceId::parse(line) {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!(line, "ignoring malformed id in stored snapshot");
                    None
                }
            })
            .collect()
    }
}

impl FromIterator<DeviceId> for DeviceSnapshot {
    fn from_iter<T: IntoIterator<Item = DeviceId>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a DeviceSnapshot {
    type Item = &'a DeviceId;
    type IntoIter = std::collections::btree_set::Iter<'a, DeviceId>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter()
    }
}

/// Where the last-known snapshot lives between poll ticks
pub trait SnapshotStore: Send + Sync {
    /// Stored snapshot, or an empty one when nothing was stored yet
    fn load(&self) -> Result<DeviceSnapshot>;

    /// Replace the stored snapshot in one step
    fn save(&self, snapshot: &DeviceSnapshot) -> Result<()>;
}

/// Line-oriented text file, replaced through a temp file and rename
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Advisory lock file guarding poll ticks on this store
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "devices.state".into());
        name.push(".lock");
        self.path.with_file_name(name)
    }

    fn parent_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn load(&self) -> Result<DeviceSnapshot> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(DeviceSnapshot::from_text(&text)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no stored snapshot yet");
                Ok(DeviceSnapshot::new())
            }
            Err(e) => Err(e)
                .with_context(|| format!("reading snapshot {}", self.path.display())),
        }
    }

    fn save(&self, snapshot: &DeviceSnapshot) -> Result<()> {
        let dir = self.parent_dir();
        fs::create_dir_all(&dir)
            .with_context(|| format!("creating state directory {}", dir.display()))?;

        let mut tmp = NamedTempFile::new_in(&dir).context("creating temp snapshot file")?;
        tmp.write_all(snapshot.to_text().as_bytes())
            .context("writing temp snapshot file")?;
        tmp.as_file().sync_all().context("syncing temp snapshot file")?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("replacing snapshot {}", self.path.display()))?;

        debug!(path = %self.path.display(), devices = snapshot.len(), "snapshot persisted");
        Ok(())
    }
}

/// In-process store, useful for tests and one-off watchers
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshot: Mutex<DeviceSnapshot>,
    saves: AtomicUsize,
}

impl MemorySnapshotStore {
    pub fn new(initial: DeviceSnapshot) -> Self {
        Self {
            snapshot: Mutex::new(initial),
            saves: AtomicUsize::new(0),
        }
    }

    /// Number of successful `save` calls
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn current(&self) -> DeviceSnapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn load(&self) -> Result<DeviceSnapshot> {
        Ok(self.current())
    }

    fn save(&self, snapshot: &DeviceSnapshot) -> Result<()> {
        *self
            .snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
