//! PagedDb - the bundled cold store.
//!
//! Keeps a ring of immutable state snapshots, one per committed batch, up
//! to the configured history depth. Readers hold a snapshot and never
//! block the writer; the writer copies the newest snapshot forward and
//! publishes the result on commit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use primitive_types::H256;
use rustc_hash::FxBuildHasher;
use tracing::debug;

use crate::data::{Key, NibblePath};

use super::{
    BatchMetadata, CommitOptions, DbError, ReadBatch, Result, StateStore, WriteBatch,
};

type FastHashMap<K, V> = HashMap<K, V, FxBuildHasher>;

/// One persisted state root and its flat key-value content.
struct Snapshot {
    number: u64,
    hash: H256,
    data: FastHashMap<Vec<u8>, Vec<u8>>,
}

struct DbShared {
    history_depth: u32,
    /// Oldest snapshot at the front, newest at the back. Never empty; a
    /// fresh store holds the zero root.
    snapshots: RwLock<VecDeque<Arc<Snapshot>>>,
    writer_open: AtomicBool,
    flushes: AtomicU64,
}

impl DbShared {
    fn latest(&self) -> Arc<Snapshot> {
        self.snapshots.read().back().expect("ring never empty").clone()
    }
}

/// The bundled in-memory cold store.
#[derive(Clone)]
pub struct PagedDb {
    shared: Arc<DbShared>,
}

impl PagedDb {
    /// Creates an empty store retaining `history_depth` roots.
    pub fn in_memory(history_depth: u32) -> Self {
        assert!(history_depth >= 1, "history depth must be at least 1");
        let genesis = Arc::new(Snapshot {
            number: 0,
            hash: H256::zero(),
            data: FastHashMap::with_hasher(FxBuildHasher),
        });
        let mut snapshots = VecDeque::new();
        snapshots.push_back(genesis);
        Self {
            shared: Arc::new(DbShared {
                history_depth,
                snapshots: RwLock::new(snapshots),
                writer_open: AtomicBool::new(false),
                flushes: AtomicU64::new(0),
            }),
        }
    }

    /// Number of durable flushes performed.
    pub fn flush_count(&self) -> u64 {
        self.shared.flushes.load(Ordering::Relaxed)
    }

    /// The metadata of the most recent root.
    pub fn latest_metadata(&self) -> BatchMetadata {
        let snap = self.shared.latest();
        BatchMetadata {
            block_number: snap.number,
            state_hash: snap.hash,
        }
    }
}

impl StateStore for PagedDb {
    fn begin_read_only_batch(&self, _label: &str) -> Arc<dyn ReadBatch> {
        Arc::new(SnapshotBatch {
            snap: self.shared.latest(),
        })
    }

    fn begin_read_only_batch_or_latest(&self, hash: &H256, _label: &str) -> Arc<dyn ReadBatch> {
        let snapshots = self.shared.snapshots.read();
        let snap = snapshots
            .iter()
            .rev()
            .find(|s| s.hash == *hash)
            .unwrap_or_else(|| snapshots.back().expect("ring never empty"))
            .clone();
        Arc::new(SnapshotBatch { snap })
    }

    fn begin_next_batch(&self) -> Result<Box<dyn WriteBatch>> {
        if self.shared.writer_open.swap(true, Ordering::AcqRel) {
            return Err(DbError::WriterBusy);
        }
        let base = self.shared.latest();
        Ok(Box::new(NextBatch {
            shared: self.shared.clone(),
            metadata: BatchMetadata {
                block_number: base.number,
                state_hash: base.hash,
            },
            base,
            edits: FastHashMap::with_hasher(FxBuildHasher),
            destroys: Vec::new(),
            prefix_deletes: Vec::new(),
            verify: false,
            done: false,
        }))
    }

    fn has_state(&self, hash: &H256) -> bool {
        self.shared.snapshots.read().iter().any(|s| s.hash == *hash)
    }

    fn snapshot_all(&self) -> Vec<Arc<dyn ReadBatch>> {
        self.shared
            .snapshots
            .read()
            .iter()
            .map(|snap| Arc::new(SnapshotBatch { snap: snap.clone() }) as Arc<dyn ReadBatch>)
            .collect()
    }

    fn history_depth(&self) -> u32 {
        self.shared.history_depth
    }

    fn flush(&self) -> Result<()> {
        self.shared.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A read batch over one snapshot.
struct SnapshotBatch {
    snap: Arc<Snapshot>,
}

impl ReadBatch for SnapshotBatch {
    fn metadata(&self) -> BatchMetadata {
        BatchMetadata {
            block_number: self.snap.number,
            state_hash: self.snap.hash,
        }
    }

    fn try_get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.snap.data.get(key).cloned()
    }
}

/// The writable batch. Collects edits against the newest snapshot and
/// materializes a successor on commit.
struct NextBatch {
    shared: Arc<DbShared>,
    base: Arc<Snapshot>,
    metadata: BatchMetadata,
    edits: FastHashMap<Vec<u8>, Vec<u8>>,
    destroys: Vec<NibblePath>,
    prefix_deletes: Vec<Vec<u8>>,
    verify: bool,
    done: bool,
}

impl NextBatch {
    /// Whether a stored key falls under a destroyed account path.
    fn is_destroyed(destroys: &[NibblePath], key: &[u8]) -> bool {
        if destroys.is_empty() {
            return false;
        }
        let Some((parsed, _)) = Key::read_from(key) else {
            return false;
        };
        destroys.iter().any(|path| {
            parsed.path().len() >= path.len()
                && parsed.path().common_prefix_len(path) == path.len()
        })
    }
}

impl WriteBatch for NextBatch {
    fn set_raw(&mut self, key: &[u8], value: &[u8]) {
        self.edits.insert(key.to_vec(), value.to_vec());
    }

    fn destroy(&mut self, path: &NibblePath) {
        self.destroys.push(path.clone());
    }

    fn delete_by_prefix(&mut self, prefix: &[u8]) {
        self.prefix_deletes.push(prefix.to_vec());
    }

    fn set_metadata(&mut self, block_number: u64, hash: &H256) {
        self.metadata = BatchMetadata {
            block_number,
            state_hash: *hash,
        };
    }

    fn verify_db_pages_on_commit(&mut self) {
        self.verify = true;
    }

    fn commit(mut self: Box<Self>, options: CommitOptions) -> Result<()> {
        self.done = true;
        if options == CommitOptions::DangerNoWrite {
            self.shared.writer_open.store(false, Ordering::Release);
            return Ok(());
        }

        let mut data = self.base.data.clone();
        if !self.destroys.is_empty() {
            let destroys = std::mem::take(&mut self.destroys);
            data.retain(|key, _| !Self::is_destroyed(&destroys, key));
        }
        for prefix in &self.prefix_deletes {
            data.retain(|key, _| !key.starts_with(prefix));
        }
        for (key, value) in self.edits.drain() {
            data.insert(key, value);
        }

        if self.verify {
            for key in data.keys() {
                if Key::read_from(key).is_none() {
                    return Err(DbError::Corrupted(format!(
                        "undecodable key of {} bytes",
                        key.len()
                    )));
                }
            }
        }

        let snapshot = Arc::new(Snapshot {
            number: self.metadata.block_number,
            hash: self.metadata.state_hash,
            data,
        });
        {
            let mut snapshots = self.shared.snapshots.write();
            snapshots.push_back(snapshot);
            while snapshots.len() > self.shared.history_depth as usize {
                snapshots.pop_front();
            }
        }
        if options == CommitOptions::FlushDataOnly {
            self.shared.flushes.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            number = self.metadata.block_number,
            hash = ?self.metadata.state_hash,
            "batch committed"
        );
        self.shared.writer_open.store(false, Ordering::Release);
        Ok(())
    }
}

impl Drop for NextBatch {
    fn drop(&mut self) {
        // Aborted batch frees the writer slot.
        if !self.done {
            self.shared.writer_open.store(false, Ordering::Release);
        }
    }
}
