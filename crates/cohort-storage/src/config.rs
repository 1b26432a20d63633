//! Storage configuration.

use std::path::{Path, PathBuf};

use cohort_common::LogIndex;

/// Default maximum number of entries per segment.
pub const DEFAULT_MAX_ENTRIES_PER_SEGMENT: u32 = 1024 * 1024;

/// Default maximum segment size in bytes (32 MiB).
pub const DEFAULT_MAX_SEGMENT_SIZE: u32 = 32 * 1024 * 1024;

/// The largest entry count a segment's offset index can address.
pub const MAX_SEGMENT_ENTRIES: u32 = i32::MAX as u32;

/// Where log and snapshot data live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageLevel {
    /// Heap buffers only; nothing survives a restart. For tests and
    /// caches-of-record elsewhere.
    Memory,
    /// Files under the configured directory, flushed according to
    /// `flush_on_commit`.
    Disk,
}

/// Configuration for a server's storage directory.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// The storage name, used as the prefix of every file.
    pub name: String,
    /// The directory files are created under.
    pub directory: PathBuf,
    /// The storage level.
    pub level: StorageLevel,
    /// Maximum number of entries per segment.
    pub max_entries_per_segment: u32,
    /// Maximum segment data size in bytes.
    pub max_segment_size: u32,
    /// Whether to fsync segment data when the commit index advances.
    pub flush_on_commit: bool,
}

impl StorageConfig {
    /// Creates a disk-backed configuration with defaults.
    pub fn new(name: impl Into<String>, directory: impl AsRef<Path>) -> Self {
        Self {
            name: name.into(),
            directory: directory.as_ref().to_path_buf(),
            level: StorageLevel::Disk,
            max_entries_per_segment: DEFAULT_MAX_ENTRIES_PER_SEGMENT,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            flush_on_commit: true,
        }
    }

    /// Creates an in-memory configuration with defaults.
    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: PathBuf::new(),
            level: StorageLevel::Memory,
            max_entries_per_segment: DEFAULT_MAX_ENTRIES_PER_SEGMENT,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
            flush_on_commit: false,
        }
    }

    /// Sets the storage level.
    pub fn with_level(mut self, level: StorageLevel) -> Self {
        self.level = level;
        self
    }

    /// Sets the maximum entries per segment, capped at the offset index's
    /// addressable maximum.
    pub fn with_max_entries_per_segment(mut self, max_entries: u32) -> Self {
        self.max_entries_per_segment = max_entries.min(MAX_SEGMENT_ENTRIES);
        self
    }

    /// Sets the maximum segment size in bytes.
    pub fn with_max_segment_size(mut self, max_size: u32) -> Self {
        self.max_segment_size = max_size;
        self
    }

    /// Sets whether segment data is fsynced on commit.
    pub fn with_flush_on_commit(mut self, flush: bool) -> Self {
        self.flush_on_commit = flush;
        self
    }

    /// Returns the path of a segment data file.
    pub fn segment_path(&self, id: u64, version: u64) -> PathBuf {
        self.directory
            .join(format!("{}-{}-{}.log", self.name, id, version))
    }

    /// Returns the path of a segment offset index file.
    pub fn index_path(&self, id: u64, version: u64) -> PathBuf {
        self.directory
            .join(format!("{}-{}-{}.index", self.name, id, version))
    }

    /// Returns the path of a snapshot file.
    pub fn snapshot_path(&self, id: u64, index: LogIndex) -> PathBuf {
        self.directory
            .join(format!("{}-{}-{}.snapshot", self.name, id, index))
    }

    /// Returns the path of the persistent metadata file.
    pub fn meta_path(&self) -> PathBuf {
        self.directory.join(format!("{}.meta", self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_naming() {
        let config = StorageConfig::new("cohort", "/tmp/data");
        assert_eq!(
            config.segment_path(3, 2),
            PathBuf::from("/tmp/data/cohort-3-2.log")
        );
        assert_eq!(
            config.index_path(3, 2),
            PathBuf::from("/tmp/data/cohort-3-2.index")
        );
        assert_eq!(
            config.snapshot_path(1, 9000),
            PathBuf::from("/tmp/data/cohort-1-9000.snapshot")
        );
        assert_eq!(config.meta_path(), PathBuf::from("/tmp/data/cohort.meta"));
    }

    #[test]
    fn test_entry_cap() {
        let config =
            StorageConfig::memory("cohort").with_max_entries_per_segment(u32::MAX);
        assert_eq!(config.max_entries_per_segment, MAX_SEGMENT_ENTRIES);
    }
}
