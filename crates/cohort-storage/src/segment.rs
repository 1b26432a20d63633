//! Log segments.
//!
//! A segment stores a contiguous range of log entries in a file pair:
//! `{name}-{id}-{version}.log` holds the entry frames and
//! `{name}-{id}-{version}.index` holds the offset index. The version
//! starts at 1 and increments each time the segment is rewritten by
//! compaction.
//!
//! Entry frame layout (little-endian):
//!
//! ```text
//! +----------+----------+---------+------------------+
//! | Len(4)   | Term(8)  | Type(1) | Payload(Len - 9) |
//! +----------+----------+---------+------------------+
//! ```
//!
//! Index file layout: a 16-byte header `{magic:u32, first_index:u64,
//! version:u32}` followed by 8-byte slots `{status:u8, rel_offset:u24,
//! position:u32}`. A zero status byte marks the end of the written slots.
//! The segment id and version are encoded in the file names; the header
//! carries the first log index so a directory scan can rebuild the log.
//!
//! Writers are exclusive; readers share the segment and serialize on the
//! underlying file handle only for the duration of one frame read.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;

use cohort_common::{LogIndex, Term};
use cohort_protocol::entry::{Entry, Indexed};

use crate::config::{StorageConfig, StorageLevel};
use crate::error::{StorageError, StorageResult};
use crate::index::{OffsetIndex, INDEX_HEADER_SIZE, INDEX_SLOT_SIZE};

/// Magic number in segment index headers ("CIDX").
const INDEX_MAGIC: u32 = 0x43494458;

/// Bytes of frame header before the payload (term + type).
const FRAME_HEADER: u32 = 9;

/// Status byte of a live index slot.
const SLOT_LIVE: u8 = 1;

/// Identity of a segment: its id, rewrite version, and first log index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// The segment id, strictly increasing across the log.
    pub id: u64,
    /// The rewrite version, incremented by compaction.
    pub version: u64,
    /// The log index of the segment's first entry.
    pub index: LogIndex,
}

enum Backing {
    Memory(Mutex<Vec<u8>>),
    Disk {
        data: Mutex<File>,
        data_path: PathBuf,
        index: Mutex<File>,
        index_path: PathBuf,
    },
}

/// A single log segment.
pub struct Segment {
    descriptor: SegmentDescriptor,
    backing: Backing,
    index: OffsetIndex,
    /// The next relative offset to assign; includes skipped offsets.
    next_offset: u32,
    /// The next write position in the data file.
    write_pos: u32,
    max_entries: u32,
    max_size: u32,
}

impl Segment {
    /// Creates a new empty segment.
    pub fn create(descriptor: SegmentDescriptor, config: &StorageConfig) -> StorageResult<Self> {
        let backing = match config.level {
            StorageLevel::Memory => Backing::Memory(Mutex::new(Vec::new())),
            StorageLevel::Disk => {
                std::fs::create_dir_all(&config.directory)?;
                let data_path = config.segment_path(descriptor.id, descriptor.version);
                let index_path = config.index_path(descriptor.id, descriptor.version);
                let data = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&data_path)?;
                let mut index = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&index_path)?;

                let mut header = BytesMut::with_capacity(INDEX_HEADER_SIZE);
                header.put_u32(INDEX_MAGIC);
                header.put_u64(descriptor.index);
                header.put_u32(descriptor.version as u32);
                index.write_all(&header)?;

                Backing::Disk {
                    data: Mutex::new(data),
                    data_path,
                    index: Mutex::new(index),
                    index_path,
                }
            }
        };

        Ok(Self {
            descriptor,
            backing,
            index: OffsetIndex::new(),
            next_offset: 0,
            write_pos: 0,
            max_entries: config.max_entries_per_segment,
            max_size: config.max_segment_size,
        })
    }

    /// Opens an existing on-disk segment, rebuilding its offset index by
    /// scanning the index file once.
    pub fn open(id: u64, version: u64, config: &StorageConfig) -> StorageResult<Self> {
        let data_path = config.segment_path(id, version);
        let index_path = config.index_path(id, version);
        let mut data = OpenOptions::new().read(true).write(true).open(&data_path)?;
        let mut index_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&index_path)?;

        let mut header = [0u8; INDEX_HEADER_SIZE];
        index_file.read_exact(&mut header)?;
        let mut cursor = &header[..];
        let magic = cursor.get_u32();
        if magic != INDEX_MAGIC {
            return Err(StorageError::Corrupted(format!(
                "segment {id} index has invalid magic {magic:08x}"
            )));
        }
        let first_index = cursor.get_u64();
        let descriptor = SegmentDescriptor {
            id,
            version,
            index: first_index,
        };

        let mut index = OffsetIndex::new();
        let mut slot = [0u8; INDEX_SLOT_SIZE];
        loop {
            match index_file.read_exact(&mut slot) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            if slot[0] != SLOT_LIVE {
                break;
            }
            let offset = u32::from_be_bytes([0, slot[1], slot[2], slot[3]]);
            let position = u32::from_be_bytes([slot[4], slot[5], slot[6], slot[7]]);
            index.index(offset, position)?;
        }

        // Re-position after the last live slot so new slots overwrite any
        // zeroed tail.
        index_file.seek(SeekFrom::Start(
            (INDEX_HEADER_SIZE + index.size() * INDEX_SLOT_SIZE) as u64,
        ))?;

        // Derive the write position from the last indexed frame.
        let (next_offset, write_pos) = match index.last_offset() {
            None => (0, 0),
            Some(last) => {
                let position = index.position(last, true).unwrap();
                data.seek(SeekFrom::Start(position as u64))?;
                let mut len_buf = [0u8; 4];
                data.read_exact(&mut len_buf)?;
                let frame_len = u32::from_le_bytes(len_buf);
                (last + 1, position + 4 + frame_len)
            }
        };

        Ok(Self {
            descriptor,
            backing: Backing::Disk {
                data: Mutex::new(data),
                data_path,
                index: Mutex::new(index_file),
                index_path,
            },
            index,
            next_offset,
            write_pos,
            max_entries: config.max_entries_per_segment,
            max_size: config.max_segment_size,
        })
    }

    /// Returns the segment descriptor.
    pub fn descriptor(&self) -> SegmentDescriptor {
        self.descriptor
    }

    /// Returns the log index of the first entry this segment can hold.
    pub fn first_index(&self) -> LogIndex {
        self.descriptor.index
    }

    /// Returns the next log index this segment would assign.
    pub fn next_index(&self) -> LogIndex {
        self.descriptor.index + self.next_offset as u64
    }

    /// Returns the number of indexed entries.
    pub fn len(&self) -> usize {
        self.index.size()
    }

    /// Returns true if the segment holds no entries.
    pub fn is_empty(&self) -> bool {
        self.next_offset == 0
    }

    /// Returns the number of entries marked cleaned.
    pub fn cleaned_count(&self) -> usize {
        self.index.cleaned_count()
    }

    /// Returns true if the segment cannot accept more entries.
    pub fn is_full(&self) -> bool {
        self.next_offset >= self.max_entries || self.write_pos >= self.max_size
    }

    /// Appends an entry. The entry's index must be the segment's next
    /// index.
    pub fn append(&mut self, indexed: &Indexed<Entry>) -> StorageResult<()> {
        let expected = self.next_index();
        if indexed.index != expected {
            return Err(StorageError::OutOfSequence {
                index: indexed.index,
                expected,
            });
        }
        let offset = self.next_offset;
        self.write_frame(offset, indexed)?;
        self.next_offset = offset + 1;
        Ok(())
    }

    /// Reserves `n` indices without writing entries.
    pub fn skip(&mut self, n: u64) {
        self.next_offset += n as u32;
        self.index.mark_sparse();
    }

    /// Reads the entry at the given log index.
    ///
    /// Returns `None` for indices outside the segment, skipped offsets,
    /// and entries marked cleaned.
    pub fn read(&self, index: LogIndex, committed: bool) -> StorageResult<Option<Indexed<Entry>>> {
        if index < self.descriptor.index || index >= self.next_index() {
            return Ok(None);
        }
        let offset = (index - self.descriptor.index) as u32;
        if self.index.is_cleaned(offset) {
            return Ok(None);
        }
        let position = match self.index.position(offset, committed) {
            Some(position) => position,
            None => return Ok(None),
        };

        let (term, entry) = self.read_frame(position)?;
        Ok(Some(Indexed::new(index, term, entry)))
    }

    /// Reads only the term of the entry at the given log index.
    pub fn term_at(&self, index: LogIndex) -> StorageResult<Option<Term>> {
        Ok(self.read(index, true)?.map(|indexed| indexed.term))
    }

    /// Truncates the segment, keeping entries with indices `<= index`.
    pub fn truncate(&mut self, index: LogIndex) -> StorageResult<()> {
        if index + 1 >= self.next_index() {
            return Ok(());
        }

        let keep = if index < self.descriptor.index {
            None
        } else {
            Some((index - self.descriptor.index) as u32)
        };

        if let Some(cut) = self.index.truncate(keep) {
            self.write_pos = cut;
            match &self.backing {
                Backing::Memory(data) => data.lock().truncate(cut as usize),
                Backing::Disk { data, index, .. } => {
                    data.lock().set_len(cut as u64)?;
                    let index_len = INDEX_HEADER_SIZE + self.index.size() * INDEX_SLOT_SIZE;
                    let mut index = index.lock();
                    index.set_len(index_len as u64)?;
                    index.seek(SeekFrom::Start(index_len as u64))?;
                }
            }
        }

        self.next_offset = keep.map(|offset| offset + 1).unwrap_or(0);
        Ok(())
    }

    /// Marks the entry at `index` as cleaned.
    pub fn clean(&mut self, index: LogIndex) -> bool {
        if index < self.descriptor.index || index >= self.next_index() {
            return false;
        }
        self.index.clean((index - self.descriptor.index) as u32)
    }

    /// Rewrites the segment into a new version containing only live
    /// entries, returning the replacement. The caller is responsible for
    /// deleting this segment afterwards.
    pub fn rewrite(&self, config: &StorageConfig) -> StorageResult<Segment> {
        let descriptor = SegmentDescriptor {
            id: self.descriptor.id,
            version: self.descriptor.version + 1,
            index: self.descriptor.index,
        };
        let mut replacement = Segment::create(descriptor, config)?;

        for slot in self.index.live_slots() {
            let (term, entry) = self.read_frame(slot.position)?;
            let index = self.descriptor.index + slot.offset as u64;
            replacement.write_frame(slot.offset, &Indexed::new(index, term, entry))?;
            replacement.index.mark_sparse();
        }
        replacement.next_offset = self.next_offset;
        replacement.flush()?;
        Ok(replacement)
    }

    /// Flushes segment data and index to disk.
    pub fn flush(&self) -> StorageResult<()> {
        if let Backing::Disk { data, index, .. } = &self.backing {
            data.lock().sync_all()?;
            index.lock().sync_all()?;
        }
        Ok(())
    }

    /// Deletes the segment's files.
    pub fn delete(self) -> StorageResult<()> {
        if let Backing::Disk {
            data_path,
            index_path,
            ..
        } = self.backing
        {
            std::fs::remove_file(&data_path)?;
            std::fs::remove_file(&index_path)?;
        }
        Ok(())
    }

    fn write_frame(&mut self, offset: u32, indexed: &Indexed<Entry>) -> StorageResult<()> {
        let payload = bincode::serialize(&indexed.entry)?;
        let frame_len = FRAME_HEADER + payload.len() as u32;

        let mut buf = BytesMut::with_capacity(4 + frame_len as usize);
        buf.put_u32_le(frame_len);
        buf.put_u64_le(indexed.term);
        buf.put_u8(indexed.entry.type_code());
        buf.put_slice(&payload);

        let position = self.write_pos;
        match &self.backing {
            Backing::Memory(data) => {
                let mut data = data.lock();
                data.truncate(position as usize);
                data.extend_from_slice(&buf);
            }
            Backing::Disk { data, index, .. } => {
                let mut data = data.lock();
                data.seek(SeekFrom::Start(position as u64))?;
                data.write_all(&buf)?;

                let mut slot = BytesMut::with_capacity(INDEX_SLOT_SIZE);
                slot.put_u8(SLOT_LIVE);
                slot.put_slice(&offset.to_be_bytes()[1..]);
                slot.put_u32(position);
                index.lock().write_all(&slot)?;
            }
        }

        self.index.index(offset, position)?;
        self.write_pos = position + 4 + frame_len;
        Ok(())
    }

    fn read_frame(&self, position: u32) -> StorageResult<(Term, Entry)> {
        let frame = match &self.backing {
            Backing::Memory(data) => {
                let data = data.lock();
                let start = position as usize;
                if start + 4 > data.len() {
                    return Err(StorageError::Corrupted(format!(
                        "frame at {position} beyond segment end"
                    )));
                }
                let len =
                    u32::from_le_bytes(data[start..start + 4].try_into().unwrap()) as usize;
                data[start + 4..start + 4 + len].to_vec()
            }
            Backing::Disk { data, .. } => {
                let mut data = data.lock();
                data.seek(SeekFrom::Start(position as u64))?;
                let mut len_buf = [0u8; 4];
                data.read_exact(&mut len_buf)?;
                let len = u32::from_le_bytes(len_buf) as usize;
                let mut frame = vec![0u8; len];
                data.read_exact(&mut frame)?;
                frame
            }
        };

        let mut cursor = &frame[..];
        let term = cursor.get_u64_le();
        let type_code = cursor.get_u8();
        let entry: Entry = bincode::deserialize(cursor)?;
        if entry.type_code() != type_code {
            return Err(StorageError::Corrupted(format!(
                "entry type mismatch at position {position}: header {type_code}, payload {}",
                entry.type_code()
            )));
        }
        Ok((term, entry))
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("descriptor", &self.descriptor)
            .field("entries", &self.len())
            .field("next_offset", &self.next_offset)
            .field("write_pos", &self.write_pos)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn command(index: LogIndex, term: Term, payload: &str) -> Indexed<Entry> {
        Indexed::new(
            index,
            term,
            Entry::Command {
                timestamp: index * 10,
                session: 1,
                sequence: index,
                payload: Bytes::from(payload.to_string()),
            },
        )
    }

    fn memory_segment(first_index: LogIndex) -> Segment {
        let config = StorageConfig::memory("test");
        Segment::create(
            SegmentDescriptor {
                id: 1,
                version: 1,
                index: first_index,
            },
            &config,
        )
        .unwrap()
    }

    #[test]
    fn test_append_and_read() {
        let mut segment = memory_segment(1);

        for i in 1..=5 {
            segment.append(&command(i, 1, &format!("cmd{i}"))).unwrap();
        }

        assert_eq!(segment.len(), 5);
        assert_eq!(segment.next_index(), 6);

        let read = segment.read(3, true).unwrap().unwrap();
        assert_eq!(read.index, 3);
        assert_eq!(read.term, 1);

        assert!(segment.read(0, true).unwrap().is_none());
        assert!(segment.read(6, true).unwrap().is_none());
    }

    #[test]
    fn test_append_out_of_sequence() {
        let mut segment = memory_segment(1);
        segment.append(&command(1, 1, "cmd1")).unwrap();
        assert!(matches!(
            segment.append(&command(3, 1, "cmd3")),
            Err(StorageError::OutOfSequence { .. })
        ));
    }

    #[test]
    fn test_skip_reserves_indices() {
        let mut segment = memory_segment(1);
        segment.append(&command(1, 1, "cmd1")).unwrap();
        segment.skip(2);
        segment.append(&command(4, 1, "cmd4")).unwrap();

        assert_eq!(segment.next_index(), 5);
        assert!(segment.read(2, true).unwrap().is_none());
        assert!(segment.read(3, true).unwrap().is_none());
        assert_eq!(segment.read(4, true).unwrap().unwrap().index, 4);
    }

    #[test]
    fn test_truncate() {
        let mut segment = memory_segment(1);
        for i in 1..=5 {
            segment.append(&command(i, 1, &format!("cmd{i}"))).unwrap();
        }

        segment.truncate(3).unwrap();
        assert_eq!(segment.next_index(), 4);
        assert!(segment.read(4, true).unwrap().is_none());
        assert_eq!(segment.read(3, true).unwrap().unwrap().index, 3);

        // New entries append cleanly after a truncation.
        segment.append(&command(4, 2, "new4")).unwrap();
        assert_eq!(segment.read(4, true).unwrap().unwrap().term, 2);
    }

    #[test]
    fn test_clean_hides_entries() {
        let mut segment = memory_segment(1);
        for i in 1..=3 {
            segment.append(&command(i, 1, &format!("cmd{i}"))).unwrap();
        }

        assert!(segment.clean(2));
        assert!(!segment.clean(2));
        assert!(segment.read(2, true).unwrap().is_none());
        assert_eq!(segment.cleaned_count(), 1);
        assert_eq!(segment.read(1, true).unwrap().unwrap().index, 1);
    }

    #[test]
    fn test_is_full_by_entries() {
        let config = StorageConfig::memory("test").with_max_entries_per_segment(2);
        let mut segment = Segment::create(
            SegmentDescriptor {
                id: 1,
                version: 1,
                index: 1,
            },
            &config,
        )
        .unwrap();

        segment.append(&command(1, 1, "cmd1")).unwrap();
        assert!(!segment.is_full());
        segment.append(&command(2, 1, "cmd2")).unwrap();
        assert!(segment.is_full());
    }

    #[test]
    fn test_disk_round_trip() {
        let tmp = TempDir::new().unwrap();
        let config = StorageConfig::new("test", tmp.path());
        let descriptor = SegmentDescriptor {
            id: 1,
            version: 1,
            index: 1,
        };

        {
            let mut segment = Segment::create(descriptor, &config).unwrap();
            for i in 1..=10 {
                segment.append(&command(i, 2, &format!("cmd{i}"))).unwrap();
            }
            segment.flush().unwrap();
        }

        let mut segment = Segment::open(1, 1, &config).unwrap();
        assert_eq!(segment.descriptor(), descriptor);
        assert_eq!(segment.len(), 10);
        assert_eq!(segment.next_index(), 11);
        for i in 1..=10 {
            let read = segment.read(i, true).unwrap().unwrap();
            assert_eq!(read.index, i);
            assert_eq!(read.term, 2);
        }

        // Appending after reopen continues the sequence.
        segment.append(&command(11, 3, "cmd11")).unwrap();
        assert_eq!(segment.read(11, true).unwrap().unwrap().term, 3);
    }

    #[test]
    fn test_disk_truncate_persists() {
        let tmp = TempDir::new().unwrap();
        let config = StorageConfig::new("test", tmp.path());
        let descriptor = SegmentDescriptor {
            id: 1,
            version: 1,
            index: 1,
        };

        {
            let mut segment = Segment::create(descriptor, &config).unwrap();
            for i in 1..=5 {
                segment.append(&command(i, 1, &format!("cmd{i}"))).unwrap();
            }
            segment.truncate(2).unwrap();
            segment.flush().unwrap();
        }

        let segment = Segment::open(1, 1, &config).unwrap();
        assert_eq!(segment.next_index(), 3);
        assert!(segment.read(3, true).unwrap().is_none());
        assert_eq!(segment.read(2, true).unwrap().unwrap().index, 2);
    }

    #[test]
    fn test_rewrite_drops_cleaned_entries() {
        let tmp = TempDir::new().unwrap();
        let config = StorageConfig::new("test", tmp.path());
        let descriptor = SegmentDescriptor {
            id: 1,
            version: 1,
            index: 1,
        };

        let mut segment = Segment::create(descriptor, &config).unwrap();
        for i in 1..=5 {
            segment.append(&command(i, 1, &format!("cmd{i}"))).unwrap();
        }
        segment.clean(2);
        segment.clean(4);

        let rewritten = segment.rewrite(&config).unwrap();
        segment.delete().unwrap();

        assert_eq!(rewritten.descriptor().version, 2);
        assert_eq!(rewritten.len(), 3);
        assert!(rewritten.read(2, true).unwrap().is_none());
        assert!(rewritten.read(4, true).unwrap().is_none());
        assert_eq!(rewritten.read(3, true).unwrap().unwrap().index, 3);
        assert_eq!(rewritten.next_index(), 6);
    }
}
