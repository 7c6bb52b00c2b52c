//! Speculative prefetcher bound to one live block.
//!
//! Execution pumps account and storage hints while transactions run; a
//! single worker on the shared pool pulls the referenced values up into
//! the block's pre-commit cache so sealing finds them warm. The worker's
//! only synchronization with the owner is the pre-commit lock plus
//! atomic bits in the write filter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use primitive_types::H256;

use crate::data::{hash64_of, BitFilter, Key, Lease, Page, Pool};
use crate::merkle::{PreCommitBehavior, PrefetchContext, PrefetchTransform};
use crate::store::ReadBatch;

use super::block::{read_ancestors_then_db, CommittedBlock, PreCommitCache};
use super::metrics::ChainMetrics;

/// Everything the worker needs to read on behalf of its block.
pub(crate) struct PrefetchSource {
    pub(crate) behavior: Arc<dyn PreCommitBehavior>,
    pub(crate) ancestors: Vec<Lease<CommittedBlock>>,
    pub(crate) ancestors_filter: Option<Arc<BitFilter>>,
    pub(crate) batch: Arc<dyn ReadBatch>,
    pub(crate) cache: Arc<Mutex<PreCommitCache>>,
    pub(crate) own_filter: Arc<BitFilter>,
    pub(crate) pool: Pool,
    pub(crate) metrics: Arc<ChainMetrics>,
}

enum Hint {
    Account(H256),
    Storage(H256, H256),
}

struct PrefetchShared {
    /// Deduplicates hints across producer threads.
    seen: BitFilter,
    queue: Mutex<VecDeque<Hint>>,
    /// Whether a worker is scheduled or running.
    running: AtomicBool,
    /// Hints enqueued and not yet fully processed.
    pending: AtomicUsize,
    source: PrefetchSource,
}

/// Handle used to pump hints into the worker. Cheap to clone.
#[derive(Clone)]
pub struct Prefetcher {
    shared: Arc<PrefetchShared>,
}

impl Prefetcher {
    pub(crate) fn new(source: PrefetchSource) -> Self {
        let seen = BitFilter::new(&source.pool);
        Self {
            shared: Arc::new(PrefetchShared {
                seen,
                queue: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                pending: AtomicUsize::new(0),
                source,
            }),
        }
    }

    /// Hints that `address` will be touched by the sealed block.
    pub fn prefetch_account(&self, address: &H256) {
        if self.shared.seen.add_atomic(hash64_of(address)) {
            self.push(Hint::Account(*address));
        }
    }

    /// Hints that `(address, slot)` will be touched by the sealed block.
    pub fn prefetch_storage(&self, address: &H256, slot: &H256) {
        let account_hash = hash64_of(address);
        if self.shared.seen.add_atomic(account_hash) {
            self.push(Hint::Account(*address));
        }
        if self.shared.seen.add_atomic(account_hash ^ hash64_of(slot)) {
            self.push(Hint::Storage(*address, *slot));
        }
    }

    /// Stops accepting new work. Items already queued drain without
    /// touching the cache.
    pub fn block_further(&self) {
        self.shared.source.cache.lock().open = false;
    }

    /// Spins until the queue is empty and the worker has parked.
    pub fn wait_drained(&self) {
        while self.shared.pending.load(Ordering::Acquire) != 0
            || self.shared.running.load(Ordering::Acquire)
        {
            std::thread::yield_now();
        }
    }

    fn push(&self, hint: Hint) {
        self.shared.source.metrics.inc_prefetch_requests();
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        self.shared.queue.lock().push_back(hint);
        self.schedule();
    }

    fn schedule(&self) {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let shared = self.shared.clone();
            rayon::spawn(move || worker(shared));
        }
    }
}

fn worker(shared: Arc<PrefetchShared>) {
    loop {
        let hint = shared.queue.lock().pop_front();
        match hint {
            Some(hint) => {
                process(&shared, hint);
                shared.pending.fetch_sub(1, Ordering::AcqRel);
            }
            None => {
                shared.running.store(false, Ordering::Release);
                // A producer may have pushed between the pop and the
                // store; reclaim the worker slot if so.
                if shared.queue.lock().is_empty() {
                    return;
                }
                if shared
                    .running
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

fn process(shared: &PrefetchShared, hint: Hint) {
    let source = &shared.source;
    let mut guard = source.cache.lock();
    if !guard.open {
        return;
    }
    let scratch = source.pool.rent();
    let mut ctx = WorkerCtx {
        cache: &mut *guard,
        source,
        scratch,
    };
    match hint {
        Hint::Account(address) => source.behavior.prefetch_account(&address, &mut ctx),
        Hint::Storage(address, slot) => {
            source.behavior.prefetch_storage(&address, &slot, &mut ctx)
        }
    }
    source.metrics.inc_prefetch_completed();
}

/// The worker-side [`PrefetchContext`]: pre-commit cache probe, ancestor
/// and database walk, transform into a borrowed scratch page, store.
struct WorkerCtx<'a> {
    cache: &'a mut PreCommitCache,
    source: &'a PrefetchSource,
    scratch: Page,
}

impl PrefetchContext for WorkerCtx<'_> {
    fn fetch(&mut self, key: &Key, transform: PrefetchTransform<'_>) -> Option<Vec<u8>> {
        let mut buf = [0u8; Key::MAX_BYTE_LENGTH];
        let key_bytes = key.write_to(&mut buf);
        let hash = key.hash64();

        if let Some((value, _)) = self.cache.dict.try_get(key_bytes, hash) {
            return Some(value.to_vec());
        }

        let (raw, _) = read_ancestors_then_db(
            &self.source.ancestors,
            self.source.ancestors_filter.as_deref(),
            self.source.batch.as_ref(),
            key,
            key_bytes,
            hash,
            key.destroyed_hash64(),
            &self.source.metrics,
        )?;

        let (len, tag) = transform(&raw, self.scratch.as_mut_slice());
        let transformed = &self.scratch.as_slice()[..len];
        self.cache.dict.set(key_bytes, hash, transformed, tag);
        self.source.own_filter.add_atomic(hash);
        Some(transformed.to_vec())
    }
}
