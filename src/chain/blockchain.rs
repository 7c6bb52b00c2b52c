//! Blockchain - the versioned store of blocks before finalization.
//!
//! Keeps the tree of committed-but-not-finalized blocks rooted at the last
//! state flushed to the cold store. Execution forks a [`LiveBlock`] from
//! any recent head, commits it, and eventually finalizes a head, which
//! streams the chain below it to the background flusher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use hashbrown::HashMap;
use parking_lot::Mutex;
use primitive_types::H256;
use rustc_hash::FxBuildHasher;
use thiserror::Error;
use tracing::{debug, warn};

use crate::data::{BitFilter, Lease, Pool};
use crate::merkle::{normalize_root, CacheBudget, PreCommitBehavior};
use crate::store::{DbError, ReadBatch, StateStore};

use super::block::{CommittedBlock, LiveBlock};
use super::flusher;
use super::metrics::{ChainMetrics, ChainMetricsSnapshot};
use super::raw_state::RawState;
use super::read_only::{Accessor, ReadOnlyView};

type FastHashMap<K, V> = HashMap<K, V, FxBuildHasher>;

/// Blockchain errors.
#[derive(Error, Debug)]
pub enum BlockchainError {
    #[error("Parent state not found: {0:?}")]
    MissingParent(H256),
    #[error("Database error: {0}")]
    Database(#[from] DbError),
}

/// Result type for blockchain operations.
pub type Result<T> = std::result::Result<T, BlockchainError>;

/// Tuning knobs for the blockchain instance.
#[derive(Clone, Debug)]
pub struct Options {
    /// How long the flusher keeps draining before it forces durability.
    pub min_flush_delay: Duration,
    /// Read-cache writeback allowance for the state and storage
    /// dictionaries of each block.
    pub cache_budget_state_and_storage: CacheBudget,
    /// Read-cache writeback allowance for the pre-commit scratch of each
    /// block.
    pub cache_budget_pre_commit: CacheBudget,
    /// Bound on the finalization queue. `None` is unbounded; with a bound,
    /// finalize blocks once the flusher falls this far behind.
    pub finalization_queue_limit: Option<usize>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            min_flush_delay: Duration::from_secs(1),
            cache_budget_state_and_storage: CacheBudget::default(),
            cache_budget_pre_commit: CacheBudget::default(),
            finalization_queue_limit: None,
        }
    }
}

/// Events published by the background pipeline.
#[derive(Clone, Debug)]
pub enum ChainEvent {
    /// A finalized block reached the cold store durably.
    Flushed { block_number: u64, hash: H256 },
    /// The flusher died; no further progress will be made.
    FlusherFailure { error: String },
}

/// The process-wide block index. One mutex guards all three maps.
pub(crate) struct IndexInner {
    pub(crate) by_hash: FastHashMap<H256, Arc<CommittedBlock>>,
    pub(crate) by_number: FastHashMap<u64, Vec<Arc<CommittedBlock>>>,
    /// Commit-time leases, held until finalize hands them to the flusher
    /// queue (or until shutdown).
    pub(crate) owned: FastHashMap<H256, Lease<CommittedBlock>>,
    pub(crate) last_finalized: u64,
}

/// State shared between the facade, live blocks, the flusher and views.
pub(crate) struct ChainInner {
    pub(crate) db: Arc<dyn StateStore>,
    pub(crate) behavior: Arc<dyn PreCommitBehavior>,
    pub(crate) pool: Pool,
    pub(crate) index: Arc<Mutex<IndexInner>>,
    pub(crate) options: Options,
    pub(crate) metrics: Arc<ChainMetrics>,
    pub(crate) accessor: Mutex<Option<Arc<Accessor>>>,
    pub(crate) subscribers: Mutex<Vec<Sender<ChainEvent>>>,
    pub(crate) verify_on_commit: AtomicBool,
}

impl ChainInner {
    pub(crate) fn publish(&self, event: ChainEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Opens a database batch anchored as close to `parent` as possible
    /// and leases the in-memory blocks between `parent` and that anchor,
    /// newest first. The caller holds the index lock.
    pub(crate) fn build_ancestry(
        &self,
        index: &IndexInner,
        parent: H256,
    ) -> Result<(
        Arc<dyn ReadBatch>,
        Vec<Lease<CommittedBlock>>,
        Option<Arc<BitFilter>>,
    )> {
        let batch = self.db.begin_read_only_batch_or_latest(&parent, "ancestry");
        let anchor = normalize_root(batch.metadata().state_hash);

        let mut ancestors = Vec::new();
        let mut current = normalize_root(parent);
        while current != H256::zero() && current != anchor {
            let block = index
                .by_hash
                .get(&current)
                .ok_or(BlockchainError::MissingParent(current))?;
            ancestors.push(Lease::acquire(block));
            current = normalize_root(block.parent_hash());
        }

        let filter = if ancestors.is_empty() {
            None
        } else {
            let filter = BitFilter::new(&self.pool);
            for ancestor in &ancestors {
                filter.or_with(ancestor.filter());
            }
            Some(Arc::new(filter))
        };
        Ok((batch, ancestors, filter))
    }

    /// Registers a sealed block. A snapshot with the same hash already in
    /// the index coalesces: the newcomer is marked discardable and its
    /// lease is dropped, outside the lock.
    pub(crate) fn register(&self, block: Arc<CommittedBlock>, lease: Lease<CommittedBlock>) {
        let discarded = {
            let mut index = self.index.lock();
            if index.by_hash.contains_key(&block.hash()) {
                block.mark_discardable();
                debug!(hash = ?block.hash(), "coalesced same-hash commit");
                Some(lease)
            } else {
                index.by_hash.insert(block.hash(), block.clone());
                index
                    .by_number
                    .entry(block.block_number())
                    .or_default()
                    .push(block.clone());
                index.owned.insert(block.hash(), lease);
                self.metrics.inc_blocks_committed();
                debug!(number = block.block_number(), hash = ?block.hash(), "block committed");
                let accessor = self.accessor.lock().clone();
                if let Some(accessor) = accessor {
                    accessor.on_commit_to_blockchain(self, &index, block.hash());
                }
                None
            }
        };
        drop(discarded);
    }
}

/// The versioned in-memory state layer over a paged cold store.
pub struct Blockchain {
    inner: Arc<ChainInner>,
    finalize_tx: Option<Sender<Lease<CommittedBlock>>>,
    flusher: Option<JoinHandle<()>>,
    closed: bool,
}

impl Blockchain {
    /// Creates a blockchain over `db`, deriving roots through `behavior`.
    /// Spawns the background flusher.
    pub fn new(
        db: Arc<dyn StateStore>,
        behavior: Arc<dyn PreCommitBehavior>,
        options: Options,
    ) -> Self {
        let last_finalized = db.begin_read_only_batch("init").metadata().block_number;
        let inner = Arc::new(ChainInner {
            db,
            behavior,
            pool: Pool::new(),
            index: Arc::new(Mutex::new(IndexInner {
                by_hash: FastHashMap::with_hasher(FxBuildHasher),
                by_number: FastHashMap::with_hasher(FxBuildHasher),
                owned: FastHashMap::with_hasher(FxBuildHasher),
                last_finalized,
            })),
            options: options.clone(),
            metrics: Arc::new(ChainMetrics::new()),
            accessor: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            verify_on_commit: AtomicBool::new(false),
        });

        let (tx, rx) = match options.finalization_queue_limit {
            Some(limit) => bounded(limit),
            None => unbounded(),
        };
        let flusher_inner = inner.clone();
        let flusher = std::thread::Builder::new()
            .name("flusher".into())
            .spawn(move || flusher::run(flusher_inner, rx))
            .expect("failed to spawn flusher");

        Self {
            inner,
            finalize_tx: Some(tx),
            flusher: Some(flusher),
            closed: false,
        }
    }

    /// Starts a new block on top of the state identified by `parent_hash`.
    pub fn start_new(&self, parent_hash: H256) -> Result<LiveBlock> {
        let (batch, ancestors, filter) = {
            let index = self.inner.index.lock();
            self.inner.build_ancestry(&index, parent_hash)?
        };
        Ok(LiveBlock::new(
            self.inner.clone(),
            normalize_root(parent_hash),
            batch,
            ancestors,
            filter,
        ))
    }

    /// Opens a read-only view over the state identified by `hash`.
    pub fn start_read_only(&self, hash: H256) -> Result<ReadOnlyView> {
        let (batch, ancestors, filter) = {
            let index = self.inner.index.lock();
            self.inner.build_ancestry(&index, hash)?
        };
        Ok(ReadOnlyView::new(
            normalize_root(hash),
            batch,
            ancestors,
            filter,
            self.inner.metrics.clone(),
        ))
    }

    /// Opens a read-only view over whatever the cold store holds now.
    pub fn start_read_only_latest_from_db(&self) -> ReadOnlyView {
        let batch = self.inner.db.begin_read_only_batch("latest");
        let hash = batch.metadata().state_hash;
        ReadOnlyView::new(hash, batch, Vec::new(), None, self.inner.metrics.clone())
    }

    /// Starts a raw-import session writing straight into the cold store.
    pub fn start_raw(&self) -> RawState {
        RawState::new(self.inner.clone())
    }

    /// Whether `hash` is a known state, in memory or on disk.
    pub fn has_state(&self, hash: &H256) -> bool {
        let normalized = normalize_root(*hash);
        if normalized == H256::zero() {
            return true;
        }
        if self.inner.index.lock().by_hash.contains_key(hash) {
            return true;
        }
        self.inner.db.has_state(hash)
    }

    /// The highest finalized block number.
    pub fn last_finalized(&self) -> u64 {
        self.inner.index.lock().last_finalized
    }

    /// Number of committed blocks currently held in memory.
    pub fn committed_count(&self) -> usize {
        self.inner.index.lock().by_hash.len()
    }

    /// Finalizes the chain ending at `hash`: every block from the last
    /// finalized number up to `hash` is handed to the flusher in
    /// ascending block-number order. Blocks when the queue is bounded and
    /// full.
    ///
    /// # Panics
    /// Panics when `hash` is unknown, not newer than the last finalized
    /// block, or its parent chain is broken.
    pub fn finalize(&self, hash: H256) {
        let stack = {
            let mut index = self.inner.index.lock();
            let block = index
                .by_hash
                .get(&hash)
                .unwrap_or_else(|| panic!("finalizing unknown block {hash:?}"))
                .clone();
            let target = block.block_number();
            assert!(
                target > index.last_finalized,
                "finalizing block {} at or below the finalized number {}",
                target,
                index.last_finalized
            );
            let floor = index.last_finalized;

            // Newest first; popped in reverse below.
            let mut stack = Vec::new();
            let mut current = block;
            loop {
                let lease = index.owned.remove(&current.hash()).unwrap_or_else(|| {
                    panic!("block {:?} is not owned by the chain", current.hash())
                });
                let number = current.block_number();
                let parent = current.parent_hash();
                stack.push(lease);
                if number == floor + 1 {
                    break;
                }
                current = index
                    .by_hash
                    .get(&parent)
                    .unwrap_or_else(|| panic!("broken parent chain at {parent:?}"))
                    .clone();
            }
            index.last_finalized = target;
            stack
        };

        debug!(count = stack.len(), "finalizing chain");
        for lease in stack.into_iter().rev() {
            self.send_with_backoff(lease);
        }
    }

    fn send_with_backoff(&self, lease: Lease<CommittedBlock>) {
        let tx = self
            .finalize_tx
            .as_ref()
            .expect("finalize after close");
        let mut item = lease;
        loop {
            match tx.try_send(item) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    std::thread::yield_now();
                    std::thread::sleep(Duration::from_micros(50));
                }
                Err(TrySendError::Disconnected(back)) => {
                    // The flusher died; its failure event already fired.
                    warn!("finalization queue disconnected");
                    drop(back);
                    return;
                }
            }
        }
    }

    /// Builds (and installs) the shared read-only accessor, seeded with
    /// one view per state root currently persisted.
    pub fn build_read_only_accessor(&self) -> Arc<Accessor> {
        let accessor = Arc::new(Accessor::new(&self.inner));
        *self.inner.accessor.lock() = Some(accessor.clone());
        accessor
    }

    /// Makes every flushed batch verify store integrity when it commits.
    pub fn verify_db_integrity_on_commit(&self) {
        self.inner.verify_on_commit.store(true, Ordering::Relaxed);
    }

    /// Subscribes to pipeline events.
    pub fn subscribe(&self) -> Receiver<ChainEvent> {
        let (tx, rx) = unbounded();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Current metric counters.
    pub fn metrics(&self) -> ChainMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Pages currently rented from the shared pool. Zero after a clean
    /// shutdown.
    pub fn pool_outstanding(&self) -> usize {
        self.inner.pool.outstanding()
    }

    /// Shuts the pipeline down: closes the queue, joins the flusher,
    /// disposes the accessor and releases every remaining snapshot.
    ///
    /// # Panics
    /// Panics when committed blocks are still leased by outstanding
    /// readers or live blocks.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        drop(self.finalize_tx.take());
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
        if let Some(accessor) = self.inner.accessor.lock().take() {
            accessor.dispose();
        }
        let owned: Vec<_> = {
            let mut index = self.inner.index.lock();
            index.owned.drain().map(|(_, lease)| lease).collect()
        };
        drop(owned);

        let remaining = self.inner.index.lock().by_hash.len();
        if remaining != 0 && !std::thread::panicking() {
            panic!("disposed with {remaining} committed blocks still leased");
        }
    }
}

impl Drop for Blockchain {
    fn drop(&mut self) {
        self.shutdown();
    }
}
