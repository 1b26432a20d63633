//! # cohort-storage
//!
//! Durable storage for Cohort servers: the segmented append-only log, the
//! snapshot store, and the persistent server metadata file.
//!
//! The log is partitioned into bounded segments, each stored as a data
//! file plus an offset index that maps segment-relative offsets to file
//! positions. Snapshots capture the state machine (and its session table)
//! at a log index so the prefix below can be compacted away.

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Storage configuration
pub mod config;
/// Storage errors
pub mod error;
/// Segment offset index
pub mod index;
/// The segmented log
pub mod log;
/// Persistent server metadata
pub mod meta;
/// Log segments
pub mod segment;
/// Snapshot store
pub mod snapshot;

pub use config::{StorageConfig, StorageLevel};
pub use error::{StorageError, StorageResult};
pub use log::{Log, LogReader, LogWriter};
pub use meta::{MetaStore, ServerMeta};
pub use snapshot::{PendingSnapshot, SnapshotFile, SnapshotReader, SnapshotStore, SnapshotWriter};
