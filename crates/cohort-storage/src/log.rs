//! The segmented append-only log.
//!
//! The log is an ordered sequence of [`Segment`]s. Appends go to the last
//! segment, rolling to a new one when it fills; lookups binary-search the
//! segment list by first index. The writer is exclusive; any number of
//! readers may hold positional cursors concurrently.
//!
//! The commit index is advisory: it records the highest index that must
//! never be truncated, and selects between the direct and binary-search
//! read paths in the offset index.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use cohort_common::{LogIndex, Term};
use cohort_protocol::entry::{Entry, Indexed};

use crate::config::{StorageConfig, StorageLevel};
use crate::error::{StorageError, StorageResult};
use crate::segment::{Segment, SegmentDescriptor};

struct LogInner {
    segments: Vec<Segment>,
    /// Logical floor: indices below this are treated as compacted even if
    /// the boundary segment still holds them physically.
    first_index: LogIndex,
    last_index: LogIndex,
    next_segment_id: u64,
}

/// The segmented log.
pub struct Log {
    config: StorageConfig,
    inner: RwLock<LogInner>,
    commit_index: AtomicU64,
}

impl Log {
    /// Opens the log, scanning the storage directory for existing
    /// segments when disk-backed.
    pub fn open(config: StorageConfig) -> StorageResult<Arc<Self>> {
        let mut segments = Vec::new();

        if config.level == StorageLevel::Disk {
            std::fs::create_dir_all(&config.directory)?;
            let mut found: Vec<(u64, u64)> = Vec::new();
            for entry in std::fs::read_dir(&config.directory)? {
                let entry = entry?;
                let file_name = entry.file_name();
                let Some(name) = file_name.to_str() else {
                    continue;
                };
                if let Some((id, version)) = parse_segment_name(&config.name, name) {
                    found.push((id, version));
                }
            }

            // Keep the highest version of each segment; stale versions are
            // leftovers from an interrupted compaction rewrite.
            found.sort_unstable();
            let mut latest: Vec<(u64, u64)> = Vec::new();
            for (id, version) in found {
                match latest.last_mut() {
                    Some((last_id, last_version)) if *last_id == id => {
                        let stale = config.segment_path(id, *last_version);
                        let stale_index = config.index_path(id, *last_version);
                        let _ = std::fs::remove_file(stale);
                        let _ = std::fs::remove_file(stale_index);
                        *last_version = version;
                    }
                    _ => latest.push((id, version)),
                }
            }

            for (id, version) in latest {
                segments.push(Segment::open(id, version, &config)?);
            }
            segments.sort_by_key(|s| s.first_index());
        }

        let (first_index, last_index, next_segment_id) = match (segments.first(), segments.last()) {
            (Some(first), Some(last)) => (
                first.first_index(),
                last.next_index() - 1,
                last.descriptor().id + 1,
            ),
            _ => (1, 0, 1),
        };

        let mut inner = LogInner {
            segments,
            first_index,
            last_index,
            next_segment_id,
        };

        if inner.segments.is_empty() {
            let descriptor = SegmentDescriptor {
                id: inner.next_segment_id,
                version: 1,
                index: 1,
            };
            inner.segments.push(Segment::create(descriptor, &config)?);
            inner.next_segment_id += 1;
        }

        Ok(Arc::new(Self {
            config,
            inner: RwLock::new(inner),
            commit_index: AtomicU64::new(0),
        }))
    }

    /// Returns an exclusive writer for this log.
    pub fn writer(self: &Arc<Self>) -> LogWriter {
        LogWriter {
            log: Arc::clone(self),
        }
    }

    /// Returns a positional reader starting at the log's first index.
    pub fn reader(self: &Arc<Self>) -> LogReader {
        let first = self.first_index();
        LogReader {
            log: Arc::clone(self),
            next_index: first,
        }
    }

    /// Returns the first readable index.
    pub fn first_index(&self) -> LogIndex {
        self.inner.read().first_index
    }

    /// Returns the last assigned index, or 0 when the log is empty.
    pub fn last_index(&self) -> LogIndex {
        self.inner.read().last_index
    }

    /// Returns the highest committed index.
    pub fn commit_index(&self) -> LogIndex {
        self.commit_index.load(Ordering::Acquire)
    }

    /// Returns the term of the last readable entry, or 0 for an empty log.
    pub fn last_term(&self) -> Term {
        let inner = self.inner.read();
        let mut index = inner.last_index;
        while index >= inner.first_index && index > 0 {
            if let Ok(Some(term)) = self.term_in(&inner, index) {
                return term;
            }
            index -= 1;
        }
        0
    }

    /// Returns the term of the entry at `index`. Index 0 reports term 0;
    /// compacted, skipped, and out-of-range indices report `None`.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        let inner = self.inner.read();
        if index < inner.first_index || index > inner.last_index {
            return None;
        }
        self.term_in(&inner, index).ok().flatten()
    }

    /// Returns the entry at `index`, or `None` if the index was compacted,
    /// skipped, cleaned, or not yet written.
    pub fn get(&self, index: LogIndex) -> StorageResult<Option<Indexed<Entry>>> {
        if index == 0 {
            return Ok(None);
        }
        let inner = self.inner.read();
        if index < inner.first_index || index > inner.last_index {
            return Ok(None);
        }
        let committed = index <= self.commit_index();
        match segment_for(&inner.segments, index) {
            Some(segment) => segment.read(index, committed),
            None => Ok(None),
        }
    }

    /// Returns true if the log holds an entry with the given index and
    /// term.
    pub fn contains(&self, index: LogIndex, term: Term) -> bool {
        if index == 0 {
            return term == 0;
        }
        self.term_at(index) == Some(term)
    }

    /// Records the highest index that must never be truncated. The commit
    /// index only moves forward.
    pub fn commit(&self, index: LogIndex) -> StorageResult<()> {
        let previous = self.commit_index.fetch_max(index, Ordering::AcqRel);
        if index > previous && self.config.flush_on_commit {
            let inner = self.inner.read();
            if let Some(segment) = inner.segments.last() {
                segment.flush()?;
            }
        }
        Ok(())
    }

    /// Marks the entry at `index` as cleaned, logically deleting it ahead
    /// of compaction.
    pub fn clean(&self, index: LogIndex) -> bool {
        let mut inner = self.inner.write();
        match segment_for_mut(&mut inner.segments, index) {
            Some(segment) => segment.clean(index),
            None => false,
        }
    }

    /// Compacts the log, deleting entries and whole segments below
    /// `index`. The effective index is clamped to the commit index.
    pub fn compact(&self, index: LogIndex) -> StorageResult<()> {
        let index = index.min(self.commit_index());
        let mut inner = self.inner.write();
        if index <= inner.first_index {
            return Ok(());
        }

        // Drop whole segments that end below the compaction point, always
        // keeping the segment that can accept the next append.
        while inner.segments.len() > 1 && inner.segments[0].next_index() <= index {
            let segment = inner.segments.remove(0);
            debug!(
                id = segment.descriptor().id,
                first = segment.first_index(),
                "deleting compacted segment"
            );
            segment.delete()?;
        }

        // Rewrite the boundary segment if cleaning marked entries in it.
        if inner.segments[0].cleaned_count() > 0 {
            let rewritten = inner.segments[0].rewrite(&self.config)?;
            let old = std::mem::replace(&mut inner.segments[0], rewritten);
            old.delete()?;
        }

        inner.first_index = index.max(inner.segments[0].first_index());
        Ok(())
    }

    fn term_in(&self, inner: &LogInner, index: LogIndex) -> StorageResult<Option<Term>> {
        match segment_for(&inner.segments, index) {
            Some(segment) => segment.term_at(index),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for Log {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Log")
            .field("segments", &inner.segments.len())
            .field("first_index", &inner.first_index)
            .field("last_index", &inner.last_index)
            .field("commit_index", &self.commit_index())
            .finish()
    }
}

/// The log's exclusive writer.
///
/// Only one writer should exist per log; appends, skips, and truncations
/// go through it.
pub struct LogWriter {
    log: Arc<Log>,
}

impl LogWriter {
    /// Appends an entry with the given term, assigning the next index.
    pub fn append(&mut self, term: Term, entry: Entry) -> StorageResult<Indexed<Entry>> {
        let mut inner = self.log.inner.write();
        let index = inner.last_index + 1;
        let indexed = Indexed::new(index, term, entry);

        self.roll_if_full(&mut inner)?;
        inner
            .segments
            .last_mut()
            .expect("log always holds a segment")
            .append(&indexed)?;
        inner.last_index = index;
        Ok(indexed)
    }

    /// Appends an entry that already carries its index, as during
    /// replication. The index must be the log's next index.
    pub fn append_indexed(&mut self, indexed: Indexed<Entry>) -> StorageResult<Indexed<Entry>> {
        let expected = self.log.last_index() + 1;
        if indexed.index != expected {
            return Err(StorageError::OutOfSequence {
                index: indexed.index,
                expected,
            });
        }
        self.append(indexed.term, indexed.entry)
    }

    /// Reserves `n` indices without writing entries.
    pub fn skip(&mut self, n: u64) -> StorageResult<()> {
        let mut inner = self.log.inner.write();
        self.roll_if_full(&mut inner)?;
        inner
            .segments
            .last_mut()
            .expect("log always holds a segment")
            .skip(n);
        inner.last_index += n;
        Ok(())
    }

    /// Removes all entries with indices greater than `index`.
    ///
    /// Fails if that would remove committed entries.
    pub fn truncate(&mut self, index: LogIndex) -> StorageResult<()> {
        let commit_index = self.log.commit_index();
        if index < commit_index {
            return Err(StorageError::TruncateCommitted {
                index,
                commit_index,
            });
        }

        let mut inner = self.log.inner.write();
        if index >= inner.last_index {
            return Ok(());
        }
        if index + 1 < inner.first_index {
            return Err(StorageError::Compacted {
                first_index: inner.first_index,
            });
        }

        loop {
            let drop_last = inner.segments.len() > 1
                && inner
                    .segments
                    .last()
                    .is_some_and(|segment| segment.first_index() > index);
            if !drop_last {
                break;
            }
            let segment = inner.segments.pop().expect("checked non-empty");
            segment.delete()?;
        }

        if let Some(last) = inner.segments.last_mut() {
            last.truncate(index)?;
        }
        inner.last_index = index;
        Ok(())
    }

    /// Flushes the active segment to disk.
    pub fn flush(&mut self) -> StorageResult<()> {
        let inner = self.log.inner.read();
        match inner.segments.last() {
            Some(segment) => segment.flush(),
            None => Ok(()),
        }
    }

    /// Returns the underlying log.
    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    fn roll_if_full(&self, inner: &mut LogInner) -> StorageResult<()> {
        let roll = inner
            .segments
            .last()
            .is_none_or(|segment| segment.is_full());
        if roll {
            let descriptor = SegmentDescriptor {
                id: inner.next_segment_id,
                version: 1,
                index: inner.last_index + 1,
            };
            debug!(id = descriptor.id, index = descriptor.index, "rolling segment");
            inner.segments.push(Segment::create(descriptor, &self.log.config)?);
            inner.next_segment_id += 1;
        }
        Ok(())
    }
}

/// A positional cursor over the log.
///
/// The cursor sees a consistent prefix: entries appended after a read are
/// picked up by subsequent calls, and skipped indices are passed over.
pub struct LogReader {
    log: Arc<Log>,
    next_index: LogIndex,
}

impl LogReader {
    /// Returns the index the next call to [`LogReader::next`] will try.
    pub fn current_index(&self) -> LogIndex {
        self.next_index
    }

    /// Repositions the cursor at `index`.
    pub fn reset(&mut self, index: LogIndex) {
        self.next_index = index;
    }

    /// Returns the next readable entry at or after the cursor.
    pub fn next(&mut self) -> StorageResult<Option<Indexed<Entry>>> {
        let last = self.log.last_index();
        while self.next_index <= last {
            let index = self.next_index;
            self.next_index += 1;
            if let Some(entry) = self.log.get(index)? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }
}

fn segment_for(segments: &[Segment], index: LogIndex) -> Option<&Segment> {
    let position = segments.partition_point(|s| s.first_index() <= index);
    position.checked_sub(1).map(|i| &segments[i])
}

fn segment_for_mut(segments: &mut [Segment], index: LogIndex) -> Option<&mut Segment> {
    let position = segments.partition_point(|s| s.first_index() <= index);
    position.checked_sub(1).map(move |i| &mut segments[i])
}

fn parse_segment_name(prefix: &str, file_name: &str) -> Option<(u64, u64)> {
    let rest = file_name.strip_prefix(prefix)?.strip_prefix('-')?;
    let rest = rest.strip_suffix(".log")?;
    let (id, version) = rest.split_once('-')?;
    Some((id.parse().ok()?, version.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn command(payload: &str) -> Entry {
        Entry::Command {
            timestamp: 1,
            session: 1,
            sequence: 1,
            payload: Bytes::from(payload.to_string()),
        }
    }

    fn memory_log() -> Arc<Log> {
        Log::open(StorageConfig::memory("test")).unwrap()
    }

    #[test]
    fn test_empty_log() {
        let log = memory_log();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.commit_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert!(log.get(1).unwrap().is_none());
    }

    #[test]
    fn test_append_assigns_dense_indices() {
        let log = memory_log();
        let mut writer = log.writer();

        for i in 1..=5u64 {
            let indexed = writer.append(1, command(&format!("cmd{i}"))).unwrap();
            assert_eq!(indexed.index, i);
        }

        assert_eq!(log.last_index(), 5);
        assert_eq!(log.get(3).unwrap().unwrap().index, 3);
        assert_eq!(log.term_at(3), Some(1));
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(6), None);
    }

    #[test]
    fn test_segment_rolling() {
        let config = StorageConfig::memory("test").with_max_entries_per_segment(3);
        let log = Log::open(config).unwrap();
        let mut writer = log.writer();

        for i in 1..=10u64 {
            writer.append(1, command(&format!("cmd{i}"))).unwrap();
        }

        assert_eq!(log.last_index(), 10);
        for i in 1..=10u64 {
            assert_eq!(log.get(i).unwrap().unwrap().index, i);
        }
        assert_eq!(log.inner.read().segments.len(), 4);
    }

    #[test]
    fn test_skip_leaves_gaps() {
        let log = memory_log();
        let mut writer = log.writer();

        writer.append(1, command("cmd1")).unwrap();
        writer.skip(3).unwrap();
        let indexed = writer.append(1, command("cmd5")).unwrap();

        assert_eq!(indexed.index, 5);
        assert!(log.get(2).unwrap().is_none());
        assert!(log.get(4).unwrap().is_none());
        assert_eq!(log.get(5).unwrap().unwrap().index, 5);
    }

    #[test]
    fn test_truncate_suffix() {
        let log = memory_log();
        let mut writer = log.writer();
        for i in 1..=10u64 {
            writer.append(1, command(&format!("cmd{i}"))).unwrap();
        }

        writer.truncate(6).unwrap();
        assert_eq!(log.last_index(), 6);
        assert!(log.get(7).unwrap().is_none());

        // Appends continue from the truncation point with the new term.
        let indexed = writer.append(2, command("new7")).unwrap();
        assert_eq!(indexed.index, 7);
        assert_eq!(log.term_at(7), Some(2));
    }

    #[test]
    fn test_truncate_across_segments() {
        let config = StorageConfig::memory("test").with_max_entries_per_segment(3);
        let log = Log::open(config).unwrap();
        let mut writer = log.writer();
        for i in 1..=10u64 {
            writer.append(1, command(&format!("cmd{i}"))).unwrap();
        }

        writer.truncate(2).unwrap();
        assert_eq!(log.last_index(), 2);
        assert!(log.get(3).unwrap().is_none());
        assert_eq!(log.get(2).unwrap().unwrap().index, 2);

        let indexed = writer.append(3, command("new3")).unwrap();
        assert_eq!(indexed.index, 3);
    }

    #[test]
    fn test_truncate_below_commit_fails() {
        let log = memory_log();
        let mut writer = log.writer();
        for i in 1..=5u64 {
            writer.append(1, command(&format!("cmd{i}"))).unwrap();
        }
        log.commit(4).unwrap();

        assert!(matches!(
            writer.truncate(3),
            Err(StorageError::TruncateCommitted { .. })
        ));
        writer.truncate(4).unwrap();
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn test_commit_is_monotonic() {
        let log = memory_log();
        log.commit(5).unwrap();
        log.commit(3).unwrap();
        assert_eq!(log.commit_index(), 5);
    }

    #[test]
    fn test_compact_deletes_whole_segments() {
        let config = StorageConfig::memory("test").with_max_entries_per_segment(3);
        let log = Log::open(config).unwrap();
        let mut writer = log.writer();
        for i in 1..=10u64 {
            writer.append(1, command(&format!("cmd{i}"))).unwrap();
        }
        log.commit(10).unwrap();

        log.compact(7).unwrap();
        assert_eq!(log.first_index(), 7);
        assert!(log.get(6).unwrap().is_none());
        assert_eq!(log.get(7).unwrap().unwrap().index, 7);
        assert_eq!(log.get(10).unwrap().unwrap().index, 10);
        assert_eq!(log.inner.read().segments.len(), 2);
    }

    #[test]
    fn test_compact_clamped_to_commit() {
        let log = memory_log();
        let mut writer = log.writer();
        for i in 1..=10u64 {
            writer.append(1, command(&format!("cmd{i}"))).unwrap();
        }
        log.commit(4).unwrap();

        log.compact(8).unwrap();
        // Only the committed prefix can be compacted, and the boundary
        // segment survives.
        assert!(log.first_index() <= 4 + 1);
        assert_eq!(log.get(5).unwrap().unwrap().index, 5);
    }

    #[test]
    fn test_clean_then_compact_rewrites_boundary() {
        let config = StorageConfig::memory("test").with_max_entries_per_segment(100);
        let log = Log::open(config).unwrap();
        let mut writer = log.writer();
        for i in 1..=10u64 {
            writer.append(1, command(&format!("cmd{i}"))).unwrap();
        }
        log.commit(10).unwrap();

        assert!(log.clean(3));
        assert!(!log.clean(3));
        assert!(log.get(3).unwrap().is_none());

        log.compact(2).unwrap();
        let inner = log.inner.read();
        assert_eq!(inner.segments[0].descriptor().version, 2);
        assert_eq!(inner.segments[0].cleaned_count(), 0);
    }

    #[test]
    fn test_reader_skips_gaps() {
        let log = memory_log();
        let mut writer = log.writer();
        writer.append(1, command("cmd1")).unwrap();
        writer.skip(2).unwrap();
        writer.append(1, command("cmd4")).unwrap();

        let mut reader = log.reader();
        assert_eq!(reader.next().unwrap().unwrap().index, 1);
        assert_eq!(reader.next().unwrap().unwrap().index, 4);
        assert!(reader.next().unwrap().is_none());

        // New appends become visible without resetting.
        writer.append(1, command("cmd5")).unwrap();
        assert_eq!(reader.next().unwrap().unwrap().index, 5);
    }

    #[test]
    fn test_disk_reopen() {
        let tmp = TempDir::new().unwrap();
        let config = StorageConfig::new("test", tmp.path()).with_max_entries_per_segment(4);

        {
            let log = Log::open(config.clone()).unwrap();
            let mut writer = log.writer();
            for i in 1..=10u64 {
                writer.append(2, command(&format!("cmd{i}"))).unwrap();
            }
            writer.flush().unwrap();
        }

        let log = Log::open(config).unwrap();
        assert_eq!(log.first_index(), 1);
        assert_eq!(log.last_index(), 10);
        assert_eq!(log.last_term(), 2);
        for i in 1..=10u64 {
            assert_eq!(log.get(i).unwrap().unwrap().index, i);
        }

        // The log keeps appending from where it left off.
        let mut writer = log.writer();
        let indexed = writer.append(3, command("cmd11")).unwrap();
        assert_eq!(indexed.index, 11);
    }

    #[test]
    fn test_parse_segment_name() {
        assert_eq!(parse_segment_name("cohort", "cohort-3-2.log"), Some((3, 2)));
        assert_eq!(parse_segment_name("cohort", "cohort-3-2.index"), None);
        assert_eq!(parse_segment_name("cohort", "other-3-2.log"), None);
        assert_eq!(parse_segment_name("a-b", "a-b-10-1.log"), Some((10, 1)));
    }
}
