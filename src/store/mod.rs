//! Cold-store interface consumed by the hot block layer.
//!
//! The block layer only ever talks to the store through the traits in
//! this module: read batches rooted at a persisted state, one writable
//! batch at a time, per-root metadata and a durable flush. [`PagedDb`]
//! is the bundled implementation.

mod paged_db;

use std::sync::Arc;

use primitive_types::H256;
use thiserror::Error;

use crate::data::NibblePath;

pub use paged_db::PagedDb;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Database is corrupted: {0}")]
    Corrupted(String),
    #[error("A writable batch is already open")]
    WriterBusy,
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, DbError>;

/// Options for committing a writable batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitOptions {
    /// Flush data so the batch is durable on its own.
    FlushDataOnly,
    /// Skip flushing; a later store-level flush makes the data durable.
    DangerNoFlush,
    /// Discard the batch content, keeping only the writer slot handling.
    /// Used by verification runs.
    DangerNoWrite,
}

/// Metadata stamped on every committed batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatchMetadata {
    pub block_number: u64,
    pub state_hash: H256,
}

/// A read-only batch rooted at one persisted state.
pub trait ReadBatch: Send + Sync {
    /// The block number and state hash this batch is rooted at.
    fn metadata(&self) -> BatchMetadata;

    /// Looks up a canonical key.
    fn try_get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

/// The single writable batch.
pub trait WriteBatch: Send {
    /// Writes a canonical key-value pair.
    fn set_raw(&mut self, key: &[u8], value: &[u8]);

    /// Removes an account and its whole storage subtree.
    fn destroy(&mut self, path: &NibblePath);

    /// Removes every key whose canonical form starts with `prefix`.
    fn delete_by_prefix(&mut self, prefix: &[u8]);

    /// Stamps the batch metadata.
    fn set_metadata(&mut self, block_number: u64, hash: &H256);

    /// Requests integrity verification when the batch commits.
    fn verify_db_pages_on_commit(&mut self);

    /// Publishes the batch.
    fn commit(self: Box<Self>, options: CommitOptions) -> Result<()>;
}

/// The paged cold store as seen by the block layer.
pub trait StateStore: Send + Sync {
    /// Opens a read batch rooted at the most recent state.
    fn begin_read_only_batch(&self, label: &str) -> Arc<dyn ReadBatch>;

    /// Opens a read batch rooted exactly at `hash` if that root is still
    /// persisted, else at the most recent state. The caller compares the
    /// returned metadata against `hash` to know which anchor it got.
    fn begin_read_only_batch_or_latest(&self, hash: &H256, label: &str) -> Arc<dyn ReadBatch>;

    /// Opens the writable batch. At most one may be open at a time.
    fn begin_next_batch(&self) -> Result<Box<dyn WriteBatch>>;

    /// Whether `hash` is a persisted state root.
    fn has_state(&self, hash: &H256) -> bool;

    /// One read batch per persisted root, oldest first.
    fn snapshot_all(&self) -> Vec<Arc<dyn ReadBatch>>;

    /// Number of distinct state roots kept concurrently readable.
    fn history_depth(&self) -> u32;

    /// Durable flush of everything committed so far.
    fn flush(&self) -> Result<()>;
}
