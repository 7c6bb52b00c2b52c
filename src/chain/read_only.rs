//! Read-only views and the shared accessor.
//!
//! A [`ReadOnlyView`] is a point-in-time handle over one state root: a
//! database batch plus leased in-memory ancestors, read through the same
//! protocol as a live block but without the own layer, caching or writes.
//!
//! The [`Accessor`] keeps one view per recent root so concurrent
//! consumers can read by state root regardless of where the write path
//! currently is. Views over states that reached the cold store are
//! swapped for database-backed ones; the oldest views are evicted FIFO
//! once the store's history depth is exceeded.

use std::collections::VecDeque;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use primitive_types::H256;
use rustc_hash::FxBuildHasher;
use tracing::debug;

use crate::data::{BitFilter, Key, Lease};
use crate::store::ReadBatch;

use super::block::{read_ancestors_then_db, CommittedBlock};
use super::blockchain::{ChainInner, IndexInner};
use super::metrics::ChainMetrics;
use super::world_state::Account;

type FastHashMap<K, V> = HashMap<K, V, FxBuildHasher>;

/// A stable read handle over one state root.
pub struct ReadOnlyView {
    hash: H256,
    batch: Arc<dyn ReadBatch>,
    ancestors: Vec<Lease<CommittedBlock>>,
    ancestors_filter: Option<Arc<BitFilter>>,
    metrics: Arc<ChainMetrics>,
}

impl ReadOnlyView {
    pub(crate) fn new(
        hash: H256,
        batch: Arc<dyn ReadBatch>,
        ancestors: Vec<Lease<CommittedBlock>>,
        ancestors_filter: Option<Arc<BitFilter>>,
        metrics: Arc<ChainMetrics>,
    ) -> Self {
        Self {
            hash,
            batch,
            ancestors,
            ancestors_filter,
            metrics,
        }
    }

    /// The state root this view answers for.
    pub fn hash(&self) -> H256 {
        self.hash
    }

    /// Whether the view reads from the database alone, with no in-memory
    /// ancestors.
    pub fn is_db_backed(&self) -> bool {
        self.ancestors.is_empty()
    }

    /// Reads an account.
    pub fn get_account(&self, address: &H256) -> Account {
        let key = Key::account(address);
        match self.read(&key) {
            Some(bytes) => Account::decode(&bytes).unwrap_or_default(),
            None => Account::new(),
        }
    }

    /// Reads a storage cell into `out`, returning the bytes written.
    pub fn get_storage(&self, address: &H256, slot: &H256, out: &mut [u8]) -> usize {
        let key = Key::storage_cell(address, slot);
        match self.read(&key) {
            Some(bytes) => {
                let n = bytes.len().min(out.len());
                out[..n].copy_from_slice(&bytes[..n]);
                n
            }
            None => 0,
        }
    }

    fn read(&self, key: &Key) -> Option<Vec<u8>> {
        let mut buf = [0u8; Key::MAX_BYTE_LENGTH];
        let key_bytes = key.write_to(&mut buf);
        read_ancestors_then_db(
            &self.ancestors,
            self.ancestors_filter.as_deref(),
            self.batch.as_ref(),
            key,
            key_bytes,
            key.hash64(),
            key.destroyed_hash64(),
            &self.metrics,
        )
        .map(|(value, _)| value)
    }
}

struct AccessorInner {
    readers: FastHashMap<H256, Arc<ReadOnlyView>>,
    /// Accepted database-backed views, oldest first.
    queue: VecDeque<Arc<ReadOnlyView>>,
}

/// Shared registry of read-only views keyed by state root.
pub struct Accessor {
    inner: RwLock<AccessorInner>,
    depth: usize,
}

impl Accessor {
    /// Registers one database-backed view per root currently persisted.
    pub(crate) fn new(chain: &ChainInner) -> Self {
        let mut readers = FastHashMap::with_hasher(FxBuildHasher);
        let mut queue = VecDeque::new();
        for batch in chain.db.snapshot_all() {
            let hash = batch.metadata().state_hash;
            let view = Arc::new(ReadOnlyView::new(
                hash,
                batch,
                Vec::new(),
                None,
                chain.metrics.clone(),
            ));
            readers.insert(hash, view.clone());
            queue.push_back(view);
        }
        Self {
            inner: RwLock::new(AccessorInner { readers, queue }),
            depth: chain.db.history_depth() as usize,
        }
    }

    /// Called under the index mutex when a block registers: exposes the
    /// new root through a chain-backed view.
    pub(crate) fn on_commit_to_blockchain(
        &self,
        chain: &ChainInner,
        index: &IndexInner,
        hash: H256,
    ) {
        let Ok((batch, ancestors, filter)) = chain.build_ancestry(index, hash) else {
            return;
        };
        let view = Arc::new(ReadOnlyView::new(
            hash,
            batch,
            ancestors,
            filter,
            chain.metrics.clone(),
        ));
        self.inner.write().readers.insert(hash, view);
    }

    /// Called by the flusher once a block is on disk: the root's view is
    /// swapped for a database-backed one, abandoned fork siblings are
    /// dropped, and the oldest views are evicted past the history depth.
    pub(crate) fn on_commit_to_database(
        &self,
        chain: &ChainInner,
        block: &CommittedBlock,
        siblings: &[Arc<CommittedBlock>],
    ) {
        let hash = block.hash();
        let batch = chain.db.begin_read_only_batch_or_latest(&hash, "accessor");
        let fresh = Arc::new(ReadOnlyView::new(
            hash,
            batch,
            Vec::new(),
            None,
            chain.metrics.clone(),
        ));

        let mut scheduled: Vec<Arc<ReadOnlyView>> = Vec::new();
        {
            let mut inner = self.inner.write();
            if let Some(old) = inner.readers.insert(hash, fresh.clone()) {
                scheduled.push(old);
            }
            inner.queue.push_back(fresh);
            while inner.queue.len() > self.depth {
                let Some(oldest) = inner.queue.pop_front() else {
                    break;
                };
                if let Some(current) = inner.readers.get(&oldest.hash()) {
                    if Arc::ptr_eq(current, &oldest) {
                        inner.readers.remove(&oldest.hash());
                    }
                }
                scheduled.push(oldest);
            }
            for sibling in siblings {
                if sibling.hash() == hash {
                    continue;
                }
                if let Some(view) = inner.readers.remove(&sibling.hash()) {
                    scheduled.push(view);
                }
            }
        }
        if !scheduled.is_empty() {
            debug!(count = scheduled.len(), "disposing stale read-only views");
        }
        // Outside the lock: dropping a view releases its ancestor leases.
        drop(scheduled);
    }

    /// Reads an account at `root`. `None` when the root is not tracked.
    pub fn get_account(&self, root: &H256, address: &H256) -> Option<Account> {
        let view = self.inner.read().readers.get(root).cloned()?;
        Some(view.get_account(address))
    }

    /// Reads a storage cell at `root`. `None` when the root is not tracked.
    pub fn get_storage(
        &self,
        root: &H256,
        address: &H256,
        slot: &H256,
        out: &mut [u8],
    ) -> Option<usize> {
        let view = self.inner.read().readers.get(root).cloned()?;
        Some(view.get_storage(address, slot, out))
    }

    /// Whether a view for `root` is registered.
    pub fn has(&self, root: &H256) -> bool {
        self.inner.read().readers.contains_key(root)
    }

    /// Whether the view registered for `root` reads from the database
    /// alone.
    pub fn is_db_backed(&self, root: &H256) -> bool {
        self.inner
            .read()
            .readers
            .get(root)
            .is_some_and(|view| view.is_db_backed())
    }

    /// Number of roots currently readable.
    pub fn reader_count(&self) -> usize {
        self.inner.read().readers.len()
    }

    pub(crate) fn dispose(&self) {
        let views: Vec<Arc<ReadOnlyView>> = {
            let mut inner = self.inner.write();
            inner.readers.clear();
            inner.queue.drain(..).collect()
        };
        drop(views);
    }
}
