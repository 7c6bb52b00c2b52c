//! Live blocks and committed snapshots.
//!
//! A [`LiveBlock`] is the mutable working state of one block in progress:
//! three span dictionaries (account state, storage, pre-commit scratch),
//! a write filter, the set of destroyed accounts and leased references to
//! the committed ancestors it forked from. Sealing a live block produces
//! an immutable [`CommittedBlock`] that serves descendant reads until it
//! is flushed to the cold store and the last lease drops.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;
use primitive_types::H256;
use rustc_hash::FxBuildHasher;
use tracing::trace;

use crate::data::{
    destroyed_hash64, BitFilter, EntryTag, Key, KeyKind, Lease, Leased, NibblePath, SpanDict,
};
use crate::merkle::{empty_root, normalize_root, CommitContext};
use crate::store::{ReadBatch, WriteBatch};

use super::blockchain::{ChainInner, IndexInner};
use super::metrics::ChainMetrics;
use super::prefetcher::{PrefetchSource, Prefetcher};
use super::world_state::Account;
use super::Result;

type FastHashMap<K, V> = HashMap<K, V, FxBuildHasher>;
type FastHashSet<T> = HashSet<T, FxBuildHasher>;

/// Read depth marking a value served by the database batch.
pub(crate) const DEPTH_DB: u8 = u8::MAX;

/// The pre-commit scratch dictionary plus the gate the prefetcher checks
/// before doing work. Both live under one mutex: taking it is the single
/// synchronization point between the owner and the prefetch worker.
pub(crate) struct PreCommitCache {
    pub(crate) dict: SpanDict,
    pub(crate) open: bool,
}

/// Where a protocol read caches the value it pulled up.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CacheTarget {
    StateStorage,
    PreCommit,
}

/// Outcome of probing one committed block.
pub(crate) enum AncestorLookup {
    Hit(Vec<u8>),
    /// The block authoritatively answers "no such entry".
    Tombstone,
    Miss,
}

/// An immutable snapshot of a sealed block.
pub struct CommittedBlock {
    hash: H256,
    parent_hash: H256,
    block_number: u64,
    raw: bool,
    filter: BitFilter,
    merged: SpanDict,
    destroyed: Option<FastHashSet<H256>>,
    leases: AtomicU32,
    /// Set when a same-hash snapshot was already registered; cleanup then
    /// skips the index, which never saw this instance.
    discardable: AtomicBool,
    index: Weak<Mutex<IndexInner>>,
}

impl CommittedBlock {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        index: Weak<Mutex<IndexInner>>,
        hash: H256,
        parent_hash: H256,
        block_number: u64,
        raw: bool,
        filter: BitFilter,
        merged: SpanDict,
        destroyed: Option<FastHashSet<H256>>,
    ) -> (Arc<Self>, Lease<Self>) {
        let block = Arc::new(Self {
            hash,
            parent_hash,
            block_number,
            raw,
            filter,
            merged,
            destroyed,
            leases: AtomicU32::new(1),
            discardable: AtomicBool::new(false),
            index,
        });
        let lease = Lease::first(block.clone());
        (block, lease)
    }

    pub fn hash(&self) -> H256 {
        self.hash
    }

    pub fn parent_hash(&self) -> H256 {
        self.parent_hash
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    /// Dictionary probes served so far; exercised by tests observing the
    /// ancestor-skip behavior.
    pub fn probe_count(&self) -> u64 {
        self.merged.probe_count()
    }

    pub(crate) fn filter(&self) -> &BitFilter {
        &self.filter
    }

    pub(crate) fn merged(&self) -> &SpanDict {
        &self.merged
    }

    pub(crate) fn destroyed(&self) -> Option<&FastHashSet<H256>> {
        self.destroyed.as_ref()
    }

    pub(crate) fn mark_discardable(&self) {
        self.discardable.store(true, Ordering::Release);
    }

    /// Probes this block for `key`. The caller has already consulted the
    /// filter.
    pub(crate) fn lookup(&self, key: &Key, key_bytes: &[u8], hash: u64) -> AncestorLookup {
        if let Some((value, meta)) = self.merged.try_get(key_bytes, hash) {
            return if meta == EntryTag::Destroyed {
                AncestorLookup::Tombstone
            } else {
                AncestorLookup::Hit(value.to_vec())
            };
        }
        if key.path().is_full() {
            if let (Some(destroyed), Some(address)) = (self.destroyed.as_ref(), key.address()) {
                if destroyed.contains(&address) {
                    return AncestorLookup::Tombstone;
                }
            }
        }
        AncestorLookup::Miss
    }
}

impl Leased for CommittedBlock {
    fn leases(&self) -> &AtomicU32 {
        &self.leases
    }

    fn clean_up(&self) {
        if self.discardable.load(Ordering::Acquire) {
            return;
        }
        let Some(index) = self.index.upgrade() else {
            return;
        };
        let mut index = index.lock();
        let me = self as *const CommittedBlock;
        if let Some(stored) = index.by_hash.get(&self.hash) {
            if Arc::as_ptr(stored) == me {
                index.by_hash.remove(&self.hash);
            }
        }
        if let Some(list) = index.by_number.get_mut(&self.block_number) {
            list.retain(|block| Arc::as_ptr(block) != me);
            if list.is_empty() {
                index.by_number.remove(&self.block_number);
            }
        }
    }
}

/// Walks the ancestor chain (newest first), then the database batch.
///
/// `None` means empty-but-authoritative: nothing in the chain or the
/// store holds the key, or a block on the way destroyed its account.
#[allow(clippy::too_many_arguments)]
pub(crate) fn read_ancestors_then_db(
    ancestors: &[Lease<CommittedBlock>],
    ancestors_filter: Option<&BitFilter>,
    batch: &dyn ReadBatch,
    key: &Key,
    key_bytes: &[u8],
    hash: u64,
    destroyed_hash: u64,
    metrics: &ChainMetrics,
) -> Option<(Vec<u8>, u8)> {
    let walk = ancestors_filter.is_some_and(|f| f.may_contain_any(hash, destroyed_hash));
    if walk {
        for (position, ancestor) in ancestors.iter().enumerate() {
            if !ancestor.filter().may_contain_any(hash, destroyed_hash) {
                continue;
            }
            metrics.inc_ancestor_probes();
            match ancestor.lookup(key, key_bytes, hash) {
                AncestorLookup::Hit(value) => return Some((value, (position + 1) as u8)),
                AncestorLookup::Tombstone => return None,
                AncestorLookup::Miss => {}
            }
        }
    }
    metrics.inc_db_reads();
    batch.try_get(key_bytes).map(|value| (value, DEPTH_DB))
}

/// The mutable working state of one block.
///
/// One logical writer at a time; the only concurrent actor is the block's
/// own prefetcher, which touches the scratch cache under its lock and the
/// write filter atomically.
pub struct LiveBlock {
    chain: Arc<ChainInner>,
    parent_hash: H256,
    batch: Arc<dyn ReadBatch>,
    ancestors: Vec<Lease<CommittedBlock>>,
    ancestors_filter: Option<Arc<BitFilter>>,
    own_filter: Arc<BitFilter>,
    state: SpanDict,
    storage: SpanDict,
    pre_commit: Arc<Mutex<PreCommitCache>>,
    destroyed: Option<FastHashSet<H256>>,
    root_hash: Option<H256>,
    prefetcher: Option<Prefetcher>,
    prefetcher_opened: bool,
    touched: FastHashSet<H256>,
    storage_slots: FastHashMap<H256, FastHashSet<H256>>,
    db_reads: u64,
    cached_state_storage: u32,
    cached_pre_commit: u32,
}

impl LiveBlock {
    pub(crate) fn new(
        chain: Arc<ChainInner>,
        parent_hash: H256,
        batch: Arc<dyn ReadBatch>,
        ancestors: Vec<Lease<CommittedBlock>>,
        ancestors_filter: Option<Arc<BitFilter>>,
    ) -> Self {
        let pool = chain.pool.clone();
        Self {
            own_filter: Arc::new(BitFilter::new(&pool)),
            state: SpanDict::new(&pool),
            storage: SpanDict::new(&pool),
            pre_commit: Arc::new(Mutex::new(PreCommitCache {
                dict: SpanDict::new(&pool),
                open: true,
            })),
            chain,
            parent_hash,
            batch,
            ancestors,
            ancestors_filter,
            destroyed: None,
            root_hash: None,
            prefetcher: None,
            prefetcher_opened: false,
            touched: FastHashSet::with_hasher(FxBuildHasher),
            storage_slots: FastHashMap::with_hasher(FxBuildHasher),
            db_reads: 0,
            cached_state_storage: 0,
            cached_pre_commit: 0,
        }
    }

    /// Hash of the parent state this block forked from.
    pub fn parent_hash(&self) -> H256 {
        self.parent_hash
    }

    /// The state root, once the block has been sealed.
    pub fn hash(&self) -> Option<H256> {
        self.root_hash
    }

    /// `(block_number, hash)` of each in-memory ancestor, newest first.
    pub fn ancestors(&self) -> Vec<(u64, H256)> {
        self.ancestors
            .iter()
            .map(|a| (a.block_number(), a.hash()))
            .collect()
    }

    /// Accounts written in this block.
    pub fn touched_accounts(&self) -> impl Iterator<Item = &H256> {
        self.touched.iter()
    }

    /// Storage slots written in this block.
    pub fn touched_storage_slots(&self) -> usize {
        self.storage_slots.values().map(|slots| slots.len()).sum()
    }

    /// Reads that fell through to the database batch.
    pub fn db_reads(&self) -> u64 {
        self.db_reads
    }

    /// Reads an account, consulting this block, its ancestors and the
    /// database in that order.
    pub fn get_account(&mut self, address: &H256) -> Account {
        let key = Key::account(address);
        match self.read_internal(&key, CacheTarget::StateStorage) {
            Some((bytes, _)) => Account::decode(&bytes).unwrap_or_default(),
            None => Account::new(),
        }
    }

    /// Reads a storage cell into `out`, returning the number of bytes
    /// written. Zero means the cell is empty.
    pub fn get_storage(&mut self, address: &H256, slot: &H256, out: &mut [u8]) -> usize {
        let key = Key::storage_cell(address, slot);
        match self.read_internal(&key, CacheTarget::StateStorage) {
            Some((bytes, _)) => {
                let n = bytes.len().min(out.len());
                out[..n].copy_from_slice(&bytes[..n]);
                n
            }
            None => 0,
        }
    }

    /// Writes an account.
    pub fn set_account(&mut self, address: &H256, account: &Account) {
        self.insert(&Key::account(address), &account.encode(), &[], EntryTag::Persistent);
        self.touched.insert(*address);
    }

    /// Writes an account, telling the pre-commit behavior when the caller
    /// knows the account did not exist before.
    pub fn set_account_with_hint(&mut self, address: &H256, account: &Account, newly_created: bool) {
        self.set_account(address, account);
        if newly_created {
            let behavior = self.chain.behavior.clone();
            let mut ctx = LiveCommitCtx { block: self };
            behavior.on_new_account_created(address, &mut ctx);
        }
    }

    /// Writes a storage cell. An empty value deletes the cell.
    pub fn set_storage(&mut self, address: &H256, slot: &H256, value: &[u8]) {
        self.insert(&Key::storage_cell(address, slot), value, &[], EntryTag::Persistent);
        self.storage_slots
            .entry(*address)
            .or_insert_with(|| FastHashSet::with_hasher(FxBuildHasher))
            .insert(*slot);
    }

    /// Tears down an account: its payload reads as empty and every storage
    /// cell and derived entry under it is tombstoned, here and for all
    /// descendants, until a later block recreates it.
    pub fn destroy_account(&mut self, address: &H256) {
        self.insert(&Key::account(address), &[], &[], EntryTag::Persistent);

        let path = NibblePath::from_hash(address);
        self.storage.mark_destroyed_where(|key_bytes| {
            matches_account_path(key_bytes, &path)
        });
        self.pre_commit
            .lock()
            .dict
            .mark_destroyed_where(|key_bytes| matches_account_path(key_bytes, &path));

        self.storage_slots.remove(address);
        self.destroyed
            .get_or_insert_with(|| FastHashSet::with_hasher(FxBuildHasher))
            .insert(*address);

        let behavior = self.chain.behavior.clone();
        let mut ctx = LiveCommitCtx { block: self };
        behavior.on_account_destroyed(address, &mut ctx);
    }

    /// Opens the block's prefetcher, or `None` when the pre-commit
    /// behavior does not support prefetching.
    ///
    /// # Panics
    /// Panics when called twice on the same block.
    pub fn open_prefetcher(&mut self) -> Option<Prefetcher> {
        if !self.chain.behavior.can_prefetch() {
            return None;
        }
        assert!(
            !self.prefetcher_opened,
            "a prefetcher is already open for this block"
        );
        self.prefetcher_opened = true;
        let prefetcher = Prefetcher::new(PrefetchSource {
            behavior: self.chain.behavior.clone(),
            ancestors: self.ancestors.clone(),
            ancestors_filter: self.ancestors_filter.clone(),
            batch: self.batch.clone(),
            cache: self.pre_commit.clone(),
            own_filter: self.own_filter.clone(),
            pool: self.chain.pool.clone(),
            metrics: self.chain.metrics.clone(),
        });
        self.prefetcher = Some(prefetcher.clone());
        Some(prefetcher)
    }

    /// Seals the block as `block_number` and registers the snapshot.
    ///
    /// An empty block on an empty parent is swallowed: the empty-tree
    /// root is returned and nothing is registered.
    ///
    /// # Panics
    /// Panics when the block carries no change over a non-empty parent.
    pub fn commit(mut self, block_number: u64) -> Result<H256> {
        if let Some(prefetcher) = self.prefetcher.take() {
            prefetcher.block_further();
            prefetcher.wait_drained();
        }

        let behavior = self.chain.behavior.clone();
        let budget = self.chain.options.cache_budget_pre_commit;
        let root = {
            let mut ctx = LiveCommitCtx { block: &mut self };
            behavior.before_commit(&mut ctx, budget)
        };
        self.root_hash = Some(root);

        if normalize_root(root) == self.parent_hash {
            if self.parent_hash == H256::zero() {
                trace!("empty block on empty state swallowed");
                return Ok(empty_root());
            }
            panic!("committing a block without a state change");
        }

        let pool = &self.chain.pool;
        let filter = BitFilter::new(pool);
        let mut merged = SpanDict::new(pool);
        let keep = |tag: EntryTag| tag != EntryTag::UseOnce;
        // State and storage key kinds are disjoint, so both copy in
        // append mode; the scratch dictionary may shadow either and
        // copies with overwrite.
        self.state.copy_to(&mut merged, keep, Some(&filter), true);
        self.storage.copy_to(&mut merged, keep, Some(&filter), true);
        self.pre_commit
            .lock()
            .dict
            .copy_to(&mut merged, keep, Some(&filter), false);
        if let Some(destroyed) = &self.destroyed {
            for address in destroyed {
                filter.add(destroyed_hash64(address));
            }
        }

        let (block, lease) = CommittedBlock::new(
            Arc::downgrade(&self.chain.index),
            root,
            self.parent_hash,
            block_number,
            false,
            filter,
            merged,
            self.destroyed.take(),
        );
        self.chain.register(block, lease);
        Ok(root)
    }

    /// Writes this block's persistent entries straight into a store
    /// batch, bypassing the committed-block machinery. Raw import only.
    pub fn apply_raw(&self, batch: &mut dyn WriteBatch) {
        let behavior = self.chain.behavior.as_ref();
        super::flusher::write_persistent_entries(&self.state, behavior, batch);
        super::flusher::write_persistent_entries(&self.storage, behavior, batch);
        let cache = self.pre_commit.lock();
        super::flusher::write_persistent_entries(&cache.dict, behavior, batch);
    }

    /// Drops every change, keeping the parent anchor and ancestors.
    pub fn reset(&mut self) {
        if let Some(prefetcher) = self.prefetcher.take() {
            prefetcher.block_further();
            prefetcher.wait_drained();
        }
        self.prefetcher_opened = false;
        self.own_filter = Arc::new(BitFilter::new(&self.chain.pool));
        self.state.clear();
        self.storage.clear();
        {
            let mut cache = self.pre_commit.lock();
            cache.dict.clear();
            cache.open = true;
        }
        self.destroyed = None;
        self.root_hash = None;
        self.touched.clear();
        self.storage_slots.clear();
        self.db_reads = 0;
        self.cached_state_storage = 0;
        self.cached_pre_commit = 0;
    }

    fn insert(&mut self, key: &Key, value0: &[u8], value1: &[u8], tag: EntryTag) {
        self.root_hash = None;
        let hash = key.hash64();
        self.own_filter.add_atomic(hash);
        let mut buf = [0u8; Key::MAX_BYTE_LENGTH];
        let key_bytes = key.write_to(&mut buf);
        match key.kind() {
            KeyKind::Account => self.state.set_concat(key_bytes, hash, value0, value1, tag),
            KeyKind::StorageCell => self.storage.set_concat(key_bytes, hash, value0, value1, tag),
            KeyKind::Merkle => self
                .pre_commit
                .lock()
                .dict
                .set_concat(key_bytes, hash, value0, value1, tag),
        }
    }

    /// The recursive read: own filter and dictionaries, the local
    /// destroyed set, the ancestor walk, then the database.
    fn read_internal(&mut self, key: &Key, target: CacheTarget) -> Option<(Vec<u8>, u8)> {
        let mut buf = [0u8; Key::MAX_BYTE_LENGTH];
        let key_bytes = key.write_to(&mut buf);
        let hash = key.hash64();
        let destroyed_hash = key.destroyed_hash64();

        if self.own_filter.may_contain(hash) {
            if key.kind() != KeyKind::StorageCell {
                // Pre-commit entries may shadow state.
                let cache = self.pre_commit.lock();
                if let Some((value, meta)) = cache.dict.try_get(key_bytes, hash) {
                    if meta == EntryTag::Destroyed {
                        return None;
                    }
                    return Some((value.to_vec(), 0));
                }
            }
            let primary = match key.kind() {
                KeyKind::Account => Some(&self.state),
                KeyKind::StorageCell => Some(&self.storage),
                KeyKind::Merkle => None,
            };
            if let Some(dict) = primary {
                if let Some((value, meta)) = dict.try_get(key_bytes, hash) {
                    if meta == EntryTag::Destroyed {
                        return None;
                    }
                    return Some((value.to_vec(), 0));
                }
            }
        }

        // An account torn down in this block answers empty without
        // consulting ancestors, even when the filter false-positives.
        if key.path().is_full() {
            if let (Some(destroyed), Some(address)) = (self.destroyed.as_ref(), key.address()) {
                if destroyed.contains(&address) {
                    return None;
                }
            }
        }

        let result = read_ancestors_then_db(
            &self.ancestors,
            self.ancestors_filter.as_deref(),
            self.batch.as_ref(),
            key,
            key_bytes,
            hash,
            destroyed_hash,
            &self.chain.metrics,
        );
        if let Some((value, depth)) = &result {
            if *depth == DEPTH_DB {
                self.db_reads += 1;
            }
            self.maybe_cache(key, hash, value, target);
        }
        result
    }

    /// Writes a value pulled from an ancestor or the database back into
    /// this block so the next read is local. Bounded per block.
    fn maybe_cache(&mut self, key: &Key, hash: u64, value: &[u8], target: CacheTarget) {
        match target {
            CacheTarget::StateStorage => {
                let limit = self.chain.options.cache_budget_state_and_storage.entries_per_block;
                if self.cached_state_storage >= limit {
                    return;
                }
                self.cached_state_storage += 1;
            }
            CacheTarget::PreCommit => {
                let limit = self.chain.options.cache_budget_pre_commit.entries_per_block;
                if self.cached_pre_commit >= limit {
                    return;
                }
                self.cached_pre_commit += 1;
            }
        }
        self.own_filter.add_atomic(hash);
        let mut buf = [0u8; Key::MAX_BYTE_LENGTH];
        let key_bytes = key.write_to(&mut buf);
        match target {
            CacheTarget::StateStorage => match key.kind() {
                KeyKind::Account => self.state.set(key_bytes, hash, value, EntryTag::Cached),
                KeyKind::StorageCell => self.storage.set(key_bytes, hash, value, EntryTag::Cached),
                KeyKind::Merkle => {
                    self.pre_commit
                        .lock()
                        .dict
                        .set(key_bytes, hash, value, EntryTag::Cached);
                }
            },
            CacheTarget::PreCommit => {
                self.pre_commit
                    .lock()
                    .dict
                    .set(key_bytes, hash, value, EntryTag::Cached);
            }
        }
        self.chain.metrics.inc_cache_writebacks();
    }
}

/// Whether an encoded key's account path equals `path`.
fn matches_account_path(key_bytes: &[u8], path: &NibblePath) -> bool {
    match Key::read_from(key_bytes) {
        Some((key, _)) => key.path() == path,
        None => false,
    }
}

/// [`CommitContext`] over a live block, handed to the pre-commit behavior.
pub(crate) struct LiveCommitCtx<'a> {
    pub(crate) block: &'a mut LiveBlock,
}

impl CommitContext for LiveCommitCtx<'_> {
    fn parent_hash(&self) -> H256 {
        self.block.parent_hash
    }

    fn read(&mut self, key: &Key) -> Option<Vec<u8>> {
        self.block
            .read_internal(key, CacheTarget::PreCommit)
            .map(|(value, _)| value)
    }

    fn write(&mut self, key: &Key, value: &[u8], tag: EntryTag) {
        self.block.insert(key, value, &[], tag);
    }

    fn for_each_change(&self, visit: &mut dyn FnMut(&Key, &[u8])) {
        for dict in [&self.block.state, &self.block.storage] {
            for entry in dict.iter() {
                if !matches!(entry.meta, EntryTag::Persistent | EntryTag::Destroyed) {
                    continue;
                }
                if let Some((key, _)) = Key::read_from(entry.key) {
                    visit(&key, entry.value);
                }
            }
        }
    }
}
