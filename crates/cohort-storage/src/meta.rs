//! Persistent server metadata.
//!
//! Every server durably records its current term, the candidate it voted
//! for in that term, and the last cluster configuration it observed. The
//! record lives in a single `{name}.meta` file that is rewritten
//! atomically (write to a temporary file, fsync, rename) on every change.
//!
//! File layout (big-endian): `{magic:u32, term:u64, voted_for:u64
//! (0 = none), config_len:u32, config:bincode(Configuration)}`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;

use cohort_common::{MemberId, Term};
use cohort_protocol::member::Configuration;

use crate::config::{StorageConfig, StorageLevel};
use crate::error::{StorageError, StorageResult};

/// Magic number of meta files ("CMTA").
const META_MAGIC: u32 = 0x434d5441;

/// The persistent record of a server's term, vote, and configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerMeta {
    /// The server's current term.
    pub term: Term,
    /// The candidate voted for in the current term, if any.
    pub voted_for: Option<MemberId>,
    /// The last configuration the server observed.
    pub configuration: Option<Configuration>,
}

/// Durable storage for [`ServerMeta`].
pub struct MetaStore {
    path: Option<PathBuf>,
    cached: Mutex<ServerMeta>,
}

impl MetaStore {
    /// Opens the meta store, loading any existing record.
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        let path = match config.level {
            StorageLevel::Memory => None,
            StorageLevel::Disk => {
                std::fs::create_dir_all(&config.directory)?;
                Some(config.meta_path())
            }
        };

        let cached = match &path {
            Some(path) if path.exists() => Self::read(path)?,
            _ => ServerMeta::default(),
        };

        Ok(Self {
            path,
            cached: Mutex::new(cached),
        })
    }

    /// Returns the current record.
    pub fn load(&self) -> ServerMeta {
        self.cached.lock().clone()
    }

    /// Stores the term and vote, preserving the configuration.
    pub fn store_vote(&self, term: Term, voted_for: Option<MemberId>) -> StorageResult<()> {
        let mut cached = self.cached.lock();
        cached.term = term;
        cached.voted_for = voted_for;
        self.write(&cached)
    }

    /// Stores the last observed configuration, preserving term and vote.
    pub fn store_configuration(&self, configuration: &Configuration) -> StorageResult<()> {
        let mut cached = self.cached.lock();
        cached.configuration = Some(configuration.clone());
        self.write(&cached)
    }

    fn write(&self, meta: &ServerMeta) -> StorageResult<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let config_bytes = match &meta.configuration {
            Some(configuration) => bincode::serialize(configuration)?,
            None => Vec::new(),
        };

        let mut buf = BytesMut::with_capacity(24 + config_bytes.len());
        buf.put_u32(META_MAGIC);
        buf.put_u64(meta.term);
        buf.put_u64(meta.voted_for.unwrap_or(0));
        buf.put_u32(config_bytes.len() as u32);
        buf.put_slice(&config_bytes);

        let tmp = path.with_extension("meta.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;
            file.write_all(&buf)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read(path: &PathBuf) -> StorageResult<ServerMeta> {
        let raw = std::fs::read(path)?;
        if raw.len() < 24 {
            return Err(StorageError::Corrupted("meta file too short".into()));
        }

        let mut cursor = &raw[..];
        let magic = cursor.get_u32();
        if magic != META_MAGIC {
            return Err(StorageError::Corrupted(format!(
                "meta file has invalid magic {magic:08x}"
            )));
        }

        let term = cursor.get_u64();
        let voted = cursor.get_u64();
        let config_len = cursor.get_u32() as usize;
        if cursor.remaining() < config_len {
            return Err(StorageError::Corrupted("meta configuration truncated".into()));
        }

        let configuration = if config_len > 0 {
            Some(bincode::deserialize(&cursor[..config_len])?)
        } else {
            None
        };

        Ok(ServerMeta {
            term,
            voted_for: (voted != 0).then_some(voted),
            configuration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_protocol::member::{Member, MemberType};
    use tempfile::TempDir;

    fn member(id: MemberId) -> Member {
        Member::new(
            id,
            MemberType::Active,
            format!("127.0.0.1:{}", 5000 + id).parse().unwrap(),
            format!("127.0.0.1:{}", 6000 + id).parse().unwrap(),
        )
    }

    #[test]
    fn test_fresh_store() {
        let tmp = TempDir::new().unwrap();
        let store = MetaStore::open(&StorageConfig::new("test", tmp.path())).unwrap();
        let meta = store.load();
        assert_eq!(meta.term, 0);
        assert!(meta.voted_for.is_none());
        assert!(meta.configuration.is_none());
    }

    #[test]
    fn test_vote_round_trip() {
        let tmp = TempDir::new().unwrap();
        let config = StorageConfig::new("test", tmp.path());

        {
            let store = MetaStore::open(&config).unwrap();
            store.store_vote(7, Some(3)).unwrap();
        }

        let store = MetaStore::open(&config).unwrap();
        let meta = store.load();
        assert_eq!(meta.term, 7);
        assert_eq!(meta.voted_for, Some(3));
    }

    #[test]
    fn test_configuration_round_trip() {
        let tmp = TempDir::new().unwrap();
        let config = StorageConfig::new("test", tmp.path());

        let cluster = Configuration {
            index: 2,
            term: 1,
            timestamp: 1000,
            members: vec![member(1), member(2), member(3)],
        };

        {
            let store = MetaStore::open(&config).unwrap();
            store.store_vote(1, None).unwrap();
            store.store_configuration(&cluster).unwrap();
        }

        let store = MetaStore::open(&config).unwrap();
        let meta = store.load();
        assert_eq!(meta.term, 1);
        assert_eq!(meta.voted_for, None);
        assert_eq!(meta.configuration, Some(cluster));
    }

    #[test]
    fn test_vote_preserves_configuration() {
        let tmp = TempDir::new().unwrap();
        let config = StorageConfig::new("test", tmp.path());
        let store = MetaStore::open(&config).unwrap();

        let cluster = Configuration {
            index: 2,
            term: 1,
            timestamp: 1000,
            members: vec![member(1)],
        };
        store.store_configuration(&cluster).unwrap();
        store.store_vote(5, Some(1)).unwrap();

        let meta = store.load();
        assert_eq!(meta.term, 5);
        assert_eq!(meta.configuration, Some(cluster));
    }

    #[test]
    fn test_memory_store_is_ephemeral() {
        let store = MetaStore::open(&StorageConfig::memory("test")).unwrap();
        store.store_vote(3, Some(2)).unwrap();
        assert_eq!(store.load().term, 3);
    }
}
