//! Snapshot store.
//!
//! Snapshots capture the state machine and its session table at a log
//! index. A snapshot moves through three states: *temporary* while being
//! written, *persisted* once flushed to a temporary file, and *complete*
//! once promoted to its canonical `{name}-{id}-{index}.snapshot` file.
//! Only complete snapshots are visible to readers and installers;
//! completing a snapshot deletes older snapshots for the same id.
//!
//! Snapshot files begin with a 16-byte header `{id:u64, index:u64}`
//! followed by opaque state-machine bytes.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info};

use cohort_common::LogIndex;

use crate::config::{StorageConfig, StorageLevel};
use crate::error::{StorageError, StorageResult};

/// Size of the snapshot file header.
const SNAPSHOT_HEADER_SIZE: usize = 16;

/// A complete, readable snapshot.
#[derive(Debug)]
pub struct SnapshotFile {
    id: u64,
    index: LogIndex,
    data: Bytes,
}

impl SnapshotFile {
    /// Returns the state machine id the snapshot covers.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the log index the snapshot reflects.
    pub fn index(&self) -> LogIndex {
        self.index
    }

    /// Returns the raw state-machine bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Returns a reader over the snapshot contents.
    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader {
            buf: self.data.clone(),
        }
    }
}

/// A snapshot being written; temporary until persisted, then promotable
/// to complete.
#[derive(Debug)]
pub struct PendingSnapshot {
    id: u64,
    index: LogIndex,
    buffer: BytesMut,
    persisted: bool,
    tmp_path: Option<PathBuf>,
}

impl PendingSnapshot {
    /// Returns the state machine id the snapshot covers.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the log index the snapshot reflects.
    pub fn index(&self) -> LogIndex {
        self.index
    }

    /// Returns a writer appending to the snapshot buffer.
    pub fn writer(&mut self) -> SnapshotWriter<'_> {
        SnapshotWriter {
            buf: &mut self.buffer,
        }
    }

    /// Returns true once the snapshot has been flushed to a temporary
    /// file.
    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    /// Flushes the snapshot durably to its temporary file.
    pub fn persist(&mut self) -> StorageResult<()> {
        if self.persisted {
            return Ok(());
        }
        if let Some(path) = &self.tmp_path {
            let mut header = BytesMut::with_capacity(SNAPSHOT_HEADER_SIZE);
            header.put_u64(self.id);
            header.put_u64(self.index);

            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            file.write_all(&header)?;
            file.write_all(&self.buffer)?;
            file.sync_all()?;
        }
        self.persisted = true;
        Ok(())
    }
}

/// Writes primitive values into a snapshot buffer.
pub struct SnapshotWriter<'a> {
    buf: &'a mut BytesMut,
}

impl SnapshotWriter<'_> {
    /// Writes an unsigned 32-bit value.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.put_u32(value);
    }

    /// Writes an unsigned 64-bit value.
    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64(value);
    }

    /// Writes a length-prefixed byte slice.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.put_u32(bytes.len() as u32);
        self.buf.put_slice(bytes);
    }

    /// Writes raw bytes with no framing, as when re-assembling a
    /// snapshot received in chunks.
    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }
}

/// Reads primitive values from a snapshot.
pub struct SnapshotReader {
    buf: Bytes,
}

impl SnapshotReader {
    /// Reads an unsigned 32-bit value.
    pub fn read_u32(&mut self) -> StorageResult<u32> {
        if self.buf.remaining() < 4 {
            return Err(StorageError::Corrupted("snapshot underflow".into()));
        }
        Ok(self.buf.get_u32())
    }

    /// Reads an unsigned 64-bit value.
    pub fn read_u64(&mut self) -> StorageResult<u64> {
        if self.buf.remaining() < 8 {
            return Err(StorageError::Corrupted("snapshot underflow".into()));
        }
        Ok(self.buf.get_u64())
    }

    /// Reads a length-prefixed byte slice.
    pub fn read_bytes(&mut self) -> StorageResult<Bytes> {
        let len = self.read_u32()? as usize;
        if self.buf.remaining() < len {
            return Err(StorageError::Corrupted("snapshot underflow".into()));
        }
        Ok(self.buf.split_to(len))
    }

    /// Returns the number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }
}

/// The store of snapshots for one server.
pub struct SnapshotStore {
    config: StorageConfig,
    completed: Mutex<HashMap<u64, Arc<SnapshotFile>>>,
}

impl SnapshotStore {
    /// Opens the store, loading any complete snapshots from disk.
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let mut completed: HashMap<u64, Arc<SnapshotFile>> = HashMap::new();

        if config.level == StorageLevel::Disk {
            std::fs::create_dir_all(&config.directory)?;
            for entry in std::fs::read_dir(&config.directory)? {
                let entry = entry?;
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else {
                    continue;
                };
                let Some((id, index)) = parse_snapshot_name(&config.name, name) else {
                    continue;
                };

                let raw = std::fs::read(entry.path())?;
                if raw.len() < SNAPSHOT_HEADER_SIZE {
                    return Err(StorageError::Corrupted(format!(
                        "snapshot {name} shorter than its header"
                    )));
                }
                let mut cursor = &raw[..];
                let header_id = cursor.get_u64();
                let header_index = cursor.get_u64();
                if header_id != id || header_index != index {
                    return Err(StorageError::Corrupted(format!(
                        "snapshot {name} header mismatch: {header_id}/{header_index}"
                    )));
                }

                let snapshot = Arc::new(SnapshotFile {
                    id,
                    index,
                    data: Bytes::from(raw).slice(SNAPSHOT_HEADER_SIZE..),
                });
                match completed.get(&id) {
                    Some(existing) if existing.index >= index => {}
                    _ => {
                        completed.insert(id, snapshot);
                    }
                }
            }
        }

        Ok(Self {
            config,
            completed: Mutex::new(completed),
        })
    }

    /// Starts a new temporary snapshot of the given state machine at the
    /// given index.
    pub fn create_temporary(&self, id: u64, index: LogIndex) -> PendingSnapshot {
        let tmp_path = match self.config.level {
            StorageLevel::Memory => None,
            StorageLevel::Disk => Some(
                self.config
                    .snapshot_path(id, index)
                    .with_extension("snapshot.tmp"),
            ),
        };
        PendingSnapshot {
            id,
            index,
            buffer: BytesMut::new(),
            persisted: false,
            tmp_path,
        }
    }

    /// Starts a snapshot on the receiving side of an install.
    pub fn create_snapshot(&self, id: u64, index: LogIndex) -> PendingSnapshot {
        self.create_temporary(id, index)
    }

    /// Promotes a pending snapshot to complete, making it visible to
    /// readers and deleting older snapshots for the same id.
    pub fn complete(&self, mut pending: PendingSnapshot) -> StorageResult<Arc<SnapshotFile>> {
        pending.persist()?;

        if let Some(tmp_path) = &pending.tmp_path {
            let canonical = self.config.snapshot_path(pending.id, pending.index);
            std::fs::rename(tmp_path, &canonical)?;
        }

        let snapshot = Arc::new(SnapshotFile {
            id: pending.id,
            index: pending.index,
            data: pending.buffer.freeze(),
        });

        let mut completed = self.completed.lock();
        if let Some(previous) = completed.get(&snapshot.id) {
            if previous.index > snapshot.index {
                // A newer snapshot already exists; discard this one.
                if self.config.level == StorageLevel::Disk {
                    let _ = std::fs::remove_file(
                        self.config.snapshot_path(snapshot.id, snapshot.index),
                    );
                }
                return Ok(Arc::clone(previous));
            }
            if self.config.level == StorageLevel::Disk && previous.index < snapshot.index {
                let stale = self.config.snapshot_path(previous.id, previous.index);
                debug!(path = %stale.display(), "removing superseded snapshot");
                let _ = std::fs::remove_file(stale);
            }
        }
        info!(id = snapshot.id, index = snapshot.index, "completed snapshot");
        completed.insert(snapshot.id, Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Discards a pending snapshot, removing its temporary file.
    pub fn discard(&self, pending: PendingSnapshot) {
        if let Some(tmp_path) = &pending.tmp_path {
            let _ = std::fs::remove_file(tmp_path);
        }
    }

    /// Returns the latest complete snapshot for the given id.
    pub fn snapshot_by_id(&self, id: u64) -> Option<Arc<SnapshotFile>> {
        self.completed.lock().get(&id).cloned()
    }

    /// Returns all complete snapshots, ordered by id.
    pub fn snapshots(&self) -> Vec<Arc<SnapshotFile>> {
        let mut snapshots: Vec<_> = self.completed.lock().values().cloned().collect();
        snapshots.sort_by_key(|s| s.id());
        snapshots
    }
}

fn parse_snapshot_name(prefix: &str, file_name: &str) -> Option<(u64, LogIndex)> {
    let rest = file_name.strip_prefix(prefix)?.strip_prefix('-')?;
    let rest = rest.strip_suffix(".snapshot")?;
    let (id, index) = rest.split_once('-')?;
    Some((id.parse().ok()?, index.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_read_round_trip() {
        let store = SnapshotStore::open(StorageConfig::memory("test")).unwrap();

        let mut pending = store.create_temporary(1, 100);
        {
            let mut writer = pending.writer();
            writer.write_u32(2);
            writer.write_u64(77);
            writer.write_bytes(b"machine state");
        }
        pending.persist().unwrap();
        assert!(pending.is_persisted());

        let snapshot = store.complete(pending).unwrap();
        assert_eq!(snapshot.id(), 1);
        assert_eq!(snapshot.index(), 100);

        let mut reader = snapshot.reader();
        assert_eq!(reader.read_u32().unwrap(), 2);
        assert_eq!(reader.read_u64().unwrap(), 77);
        assert_eq!(reader.read_bytes().unwrap().as_ref(), b"machine state");
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_incomplete_snapshot_invisible() {
        let store = SnapshotStore::open(StorageConfig::memory("test")).unwrap();
        let mut pending = store.create_temporary(1, 50);
        pending.writer().write_u64(1);

        assert!(store.snapshot_by_id(1).is_none());
        store.complete(pending).unwrap();
        assert_eq!(store.snapshot_by_id(1).unwrap().index(), 50);
    }

    #[test]
    fn test_complete_replaces_older() {
        let store = SnapshotStore::open(StorageConfig::memory("test")).unwrap();

        let pending = store.create_temporary(1, 10);
        store.complete(pending).unwrap();
        let pending = store.create_temporary(1, 20);
        store.complete(pending).unwrap();

        assert_eq!(store.snapshot_by_id(1).unwrap().index(), 20);

        // Completing a stale snapshot keeps the newer one.
        let pending = store.create_temporary(1, 5);
        let kept = store.complete(pending).unwrap();
        assert_eq!(kept.index(), 20);
        assert_eq!(store.snapshots().len(), 1);
    }

    #[test]
    fn test_disk_persistence_and_pruning() {
        let tmp = TempDir::new().unwrap();
        let config = StorageConfig::new("test", tmp.path());

        {
            let store = SnapshotStore::open(config.clone()).unwrap();
            let mut pending = store.create_temporary(1, 10);
            pending.writer().write_bytes(b"v1");
            store.complete(pending).unwrap();

            let mut pending = store.create_temporary(1, 25);
            pending.writer().write_bytes(b"v2");
            store.complete(pending).unwrap();

            // The superseded file is gone.
            assert!(!config.snapshot_path(1, 10).exists());
            assert!(config.snapshot_path(1, 25).exists());
        }

        let store = SnapshotStore::open(config).unwrap();
        let snapshot = store.snapshot_by_id(1).unwrap();
        assert_eq!(snapshot.index(), 25);
        let mut reader = snapshot.reader();
        assert_eq!(reader.read_bytes().unwrap().as_ref(), b"v2");
    }

    #[test]
    fn test_discard_removes_tmp_file() {
        let tmp = TempDir::new().unwrap();
        let config = StorageConfig::new("test", tmp.path());
        let store = SnapshotStore::open(config.clone()).unwrap();

        let mut pending = store.create_temporary(2, 30);
        pending.writer().write_u64(9);
        pending.persist().unwrap();
        let tmp_path = pending.tmp_path.clone().unwrap();
        assert!(tmp_path.exists());

        store.discard(pending);
        assert!(!tmp_path.exists());
        assert!(store.snapshot_by_id(2).is_none());
    }

    #[test]
    fn test_parse_snapshot_name() {
        assert_eq!(parse_snapshot_name("c", "c-1-9000.snapshot"), Some((1, 9000)));
        assert_eq!(parse_snapshot_name("c", "c-1-9000.log"), None);
        assert_eq!(parse_snapshot_name("c", "d-1-9000.snapshot"), None);
    }
}
