//! Integration tests for forkdb.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use primitive_types::{H256, U256};

use forkdb::chain::{Account, Blockchain, BlockchainError, ChainEvent, Options};
use forkdb::data::NibblePath;
use forkdb::merkle::{empty_root, FlatDigestRoot};
use forkdb::store::{PagedDb, ReadBatch, Result as StoreResult, StateStore, WriteBatch};

fn new_chain(history_depth: u32) -> (Arc<PagedDb>, Blockchain) {
    let db = Arc::new(PagedDb::in_memory(history_depth));
    let chain = Blockchain::new(db.clone(), Arc::new(FlatDigestRoot), Options::default());
    (db, chain)
}

/// Waits until the flusher reports the given block durable, skipping
/// earlier flush events from split drain windows.
fn await_flushed(events: &crossbeam_channel::Receiver<ChainEvent>, number: u64, hash: H256) {
    loop {
        match events.recv_timeout(Duration::from_secs(5)).expect("pipeline event") {
            ChainEvent::Flushed { block_number, hash: flushed }
                if (block_number, flushed) == (number, hash) =>
            {
                return;
            }
            ChainEvent::Flushed { .. } => continue,
            ChainEvent::FlusherFailure { error } => panic!("flusher failed: {error}"),
        }
    }
}

fn account(balance: u64, nonce: u64) -> Account {
    Account {
        nonce,
        balance: U256::from(balance),
        code_hash: H256::zero(),
        storage_root: H256::zero(),
    }
}

#[test]
fn test_single_block_lifecycle() {
    let (_db, chain) = new_chain(8);
    let events = chain.subscribe();

    let address = H256::repeat_byte(0x11);
    let mut block = chain.start_new(H256::zero()).unwrap();
    block.set_account(&address, &account(100, 1));
    let h1 = block.commit(1).unwrap();

    chain.finalize(h1);
    await_flushed(&events, 1, h1);

    let view = chain.start_read_only(h1).unwrap();
    let read = view.get_account(&address);
    assert_eq!(read.balance, U256::from(100));
    assert_eq!(read.nonce, 1);
    assert_eq!(read.code_hash, H256::zero());
    chain.close();
}

#[test]
fn test_two_block_chain_shadows_parent() {
    let (_db, chain) = new_chain(8);
    let address = H256::repeat_byte(0x11);
    let slot = H256::repeat_byte(0x22);

    let mut b1 = chain.start_new(H256::zero()).unwrap();
    b1.set_account(&address, &account(100, 1));
    let h1 = b1.commit(1).unwrap();

    let mut b2 = chain.start_new(h1).unwrap();
    b2.set_account(&address, &account(200, 2));
    b2.set_storage(&address, &slot, &[0xAA]);
    let h2 = b2.commit(2).unwrap();

    let at_h2 = chain.start_read_only(h2).unwrap();
    assert_eq!(at_h2.get_account(&address), account(200, 2));
    let mut out = [0u8; 32];
    assert_eq!(at_h2.get_storage(&address, &slot, &mut out), 1);
    assert_eq!(out[0], 0xAA);

    // The parent still answers with its own state.
    let at_h1 = chain.start_read_only(h1).unwrap();
    assert_eq!(at_h1.get_account(&address), account(100, 1));
    assert_eq!(at_h1.get_storage(&address, &slot, &mut out), 0);

    drop(at_h1);
    drop(at_h2);
    chain.close();
}

#[test]
fn test_destroy_account_wins_over_ancestors() {
    let (_db, chain) = new_chain(8);
    let address = H256::repeat_byte(0x11);
    let slot_a = H256::repeat_byte(0x22);
    let slot_b = H256::repeat_byte(0x33);

    let mut b1 = chain.start_new(H256::zero()).unwrap();
    b1.set_account(&address, &account(100, 1));
    b1.set_storage(&address, &slot_a, &[0xAA]);
    let h1 = b1.commit(1).unwrap();

    let mut b2 = chain.start_new(h1).unwrap();
    b2.set_storage(&address, &slot_b, &[0xBB]);
    b2.destroy_account(&address);
    let h2 = b2.commit(2).unwrap();

    let mut out = [0u8; 32];
    let at_h2 = chain.start_read_only(h2).unwrap();
    assert_eq!(at_h2.get_account(&address), Account::default());
    assert_eq!(at_h2.get_storage(&address, &slot_a, &mut out), 0);
    assert_eq!(at_h2.get_storage(&address, &slot_b, &mut out), 0);

    // Descendants observe the destruction too.
    let mut b3 = chain.start_new(h2).unwrap();
    assert_eq!(b3.get_account(&address), Account::default());
    assert_eq!(b3.get_storage(&address, &slot_a, &mut out), 0);

    // Until a recreation shadows it.
    b3.set_account(&address, &account(5, 1));
    let h3 = b3.commit(3).unwrap();
    let at_h3 = chain.start_read_only(h3).unwrap();
    assert_eq!(at_h3.get_account(&address), account(5, 1));
    assert_eq!(at_h3.get_storage(&address, &slot_a, &mut out), 0);

    drop(at_h2);
    drop(at_h3);
    chain.close();
}

#[test]
fn test_fork_flush_drops_losing_sibling() {
    let (db, chain) = new_chain(8);
    let events = chain.subscribe();

    let mut b1 = chain.start_new(H256::zero()).unwrap();
    b1.set_account(&H256::repeat_byte(0x01), &account(100, 1));
    let h1 = b1.commit(1).unwrap();

    let mut fork_a = chain.start_new(h1).unwrap();
    fork_a.set_account(&H256::repeat_byte(0x02), &account(200, 1));
    let hash_a = fork_a.commit(2).unwrap();

    let mut fork_b = chain.start_new(h1).unwrap();
    fork_b.set_account(&H256::repeat_byte(0x02), &account(300, 1));
    let hash_b = fork_b.commit(2).unwrap();
    assert_ne!(hash_a, hash_b);
    assert_eq!(chain.committed_count(), 3);

    chain.finalize(hash_a);
    await_flushed(&events, 2, hash_a);

    assert!(db.has_state(&hash_a));
    assert!(!db.has_state(&hash_b));
    // Both forks (and their parent) were released when block 2 hit disk.
    assert_eq!(chain.committed_count(), 0);
    assert!(matches!(
        chain.start_new(hash_b),
        Err(BlockchainError::MissingParent(_))
    ));
    chain.close();
}

#[test]
fn test_prefetched_reads_match_plain_reads() {
    let (_db, chain) = new_chain(8);
    let address = H256::repeat_byte(0xAB);
    let slot = H256::repeat_byte(0x01);

    let mut b1 = chain.start_new(H256::zero()).unwrap();
    b1.set_account(&address, &account(700, 3));
    b1.set_storage(&address, &slot, &[0xDE, 0xAD]);
    let h1 = b1.commit(1).unwrap();

    let mut warmed = chain.start_new(h1).unwrap();
    let prefetcher = warmed.open_prefetcher().expect("prefetching supported");
    prefetcher.prefetch_storage(&address, &slot);
    prefetcher.wait_drained();
    drop(prefetcher);

    let mut plain = chain.start_new(h1).unwrap();

    assert_eq!(warmed.get_account(&address), plain.get_account(&address));
    let mut warmed_out = [0u8; 32];
    let mut plain_out = [0u8; 32];
    let warmed_len = warmed.get_storage(&address, &slot, &mut warmed_out);
    let plain_len = plain.get_storage(&address, &slot, &mut plain_out);
    assert_eq!(warmed_len, plain_len);
    assert_eq!(&warmed_out[..warmed_len], &plain_out[..plain_len]);

    drop(warmed);
    drop(plain);
    chain.close();
}

#[test]
fn test_empty_block_is_swallowed() {
    let (_db, chain) = new_chain(8);
    let block = chain.start_new(H256::zero()).unwrap();
    let hash = block.commit(1).unwrap();
    assert_eq!(hash, empty_root());
    assert_eq!(chain.committed_count(), 0);
    chain.close();
}

#[test]
fn test_read_through_equivalence_across_chain() {
    let (_db, chain) = new_chain(8);
    let events = chain.subscribe();

    let a = H256::repeat_byte(0x0A);
    let b = H256::repeat_byte(0x0B);
    let slot = H256::repeat_byte(0x01);

    let mut b1 = chain.start_new(H256::zero()).unwrap();
    b1.set_account(&a, &account(1, 1));
    b1.set_account(&b, &account(2, 1));
    b1.set_storage(&a, &slot, &[0x01]);
    let h1 = b1.commit(1).unwrap();
    chain.finalize(h1);
    await_flushed(&events, 1, h1);

    let mut b2 = chain.start_new(h1).unwrap();
    b2.set_account(&a, &account(10, 2));
    // Deleting a cell writes the empty value.
    b2.set_storage(&a, &slot, &[]);
    let h2 = b2.commit(2).unwrap();

    let mut b3 = chain.start_new(h2).unwrap();
    b3.set_account(&b, &account(20, 2));
    let h3 = b3.commit(3).unwrap();

    // The head observes the last write for every key across the chain,
    // with the deletion read as empty.
    let head = chain.start_read_only(h3).unwrap();
    assert_eq!(head.get_account(&a), account(10, 2));
    assert_eq!(head.get_account(&b), account(20, 2));
    let mut out = [0u8; 32];
    assert_eq!(head.get_storage(&a, &slot, &mut out), 0);

    drop(head);
    chain.close();
}

#[test]
fn test_untouched_key_skips_ancestor_probes() {
    let (_db, chain) = new_chain(8);

    let mut b1 = chain.start_new(H256::zero()).unwrap();
    b1.set_account(&H256::repeat_byte(0x01), &account(1, 1));
    let h1 = b1.commit(1).unwrap();

    let mut b2 = chain.start_new(h1).unwrap();
    b2.set_account(&H256::repeat_byte(0x02), &account(2, 1));
    let h2 = b2.commit(2).unwrap();

    let mut head = chain.start_new(h2).unwrap();

    // A key no block ever touched: the merged filters reject it and the
    // read goes straight to the database.
    let before = chain.metrics();
    head.get_account(&H256::repeat_byte(0x77));
    let diff = chain.metrics().diff(&before);
    assert_eq!(diff.ancestor_probes, 0);
    assert_eq!(diff.db_reads, 1);

    // A key written two blocks back walks the ancestors.
    let before = chain.metrics();
    assert_eq!(head.get_account(&H256::repeat_byte(0x01)), account(1, 1));
    let diff = chain.metrics().diff(&before);
    assert!(diff.ancestor_probes >= 1);

    drop(head);
    chain.close();
}

#[test]
fn test_finalization_streams_in_ascending_order() {
    let db = Arc::new(PagedDb::in_memory(8));
    let recording = Arc::new(RecordingStore {
        inner: db,
        stamped: Arc::new(Mutex::new(Vec::new())),
        gate: AtomicBool::new(true),
    });
    let chain = Blockchain::new(recording.clone(), Arc::new(FlatDigestRoot), Options::default());
    let events = chain.subscribe();

    let mut parent = H256::zero();
    let mut hashes = Vec::new();
    for n in 1..=4u64 {
        let mut block = chain.start_new(parent).unwrap();
        block.set_account(&H256::repeat_byte(n as u8), &account(n, n));
        parent = block.commit(n).unwrap();
        hashes.push(parent);
    }

    chain.finalize(parent);
    await_flushed(&events, 4, parent);

    let stamped = recording.stamped.lock().unwrap().clone();
    assert_eq!(stamped, vec![1, 2, 3, 4]);
    chain.close();
}

#[test]
fn test_bounded_queue_applies_backpressure() {
    let db = Arc::new(PagedDb::in_memory(8));
    let gated = Arc::new(RecordingStore {
        inner: db,
        stamped: Arc::new(Mutex::new(Vec::new())),
        gate: AtomicBool::new(false),
    });
    let options = Options {
        finalization_queue_limit: Some(1),
        ..Options::default()
    };
    let chain = Arc::new(Blockchain::new(
        gated.clone(),
        Arc::new(FlatDigestRoot),
        options,
    ));
    let events = chain.subscribe();

    let mut parent = H256::zero();
    for n in 1..=4u64 {
        let mut block = chain.start_new(parent).unwrap();
        block.set_account(&H256::repeat_byte(n as u8), &account(n, n));
        parent = block.commit(n).unwrap();
    }

    let finalizer = {
        let chain = chain.clone();
        let head = parent;
        std::thread::spawn(move || chain.finalize(head))
    };

    // With the store gated shut and a queue of one, finalize cannot hand
    // over the whole chain.
    std::thread::sleep(Duration::from_millis(200));
    assert!(!finalizer.is_finished());

    gated.gate.store(true, Ordering::Release);
    finalizer.join().unwrap();
    await_flushed(&events, 4, parent);

    Arc::try_unwrap(chain)
        .unwrap_or_else(|_| panic!("outstanding blockchain handles"))
        .close();
}

#[test]
fn test_clean_shutdown_returns_every_page() {
    let (_db, chain) = new_chain(8);
    let events = chain.subscribe();

    let address = H256::repeat_byte(0x11);
    let mut b1 = chain.start_new(H256::zero()).unwrap();
    b1.set_account(&address, &account(1, 1));
    let h1 = b1.commit(1).unwrap();

    let mut b2 = chain.start_new(h1).unwrap();
    b2.set_account(&address, &account(2, 2));
    let h2 = b2.commit(2).unwrap();

    chain.finalize(h2);
    await_flushed(&events, 2, h2);

    assert_eq!(chain.committed_count(), 0);
    assert_eq!(chain.pool_outstanding(), 0);
    chain.close();
}

#[test]
fn test_accessor_freshness_and_eviction() {
    let (db, chain) = new_chain(2);
    let events = chain.subscribe();
    let accessor = chain.build_read_only_accessor();

    let address = H256::repeat_byte(0x11);
    let mut parent = H256::zero();
    let mut roots = Vec::new();
    for n in 1..=3u64 {
        let mut block = chain.start_new(parent).unwrap();
        block.set_account(&address, &account(n * 100, n));
        parent = block.commit(n).unwrap();
        roots.push(parent);

        // Visible through the accessor while still in memory.
        assert!(accessor.has(&parent));
        assert!(!accessor.is_db_backed(&parent));

        chain.finalize(parent);
        await_flushed(&events, n, parent);

        // After the flush the same root reads from the database path.
        assert!(accessor.is_db_backed(&parent));
        let read = accessor.get_account(&parent, &address).unwrap();
        assert_eq!(read.balance, U256::from(n * 100));
    }

    // Depth is two: the first root fell off both the store and the
    // accessor.
    assert!(!db.has_state(&roots[0]));
    assert!(!accessor.has(&roots[0]));
    assert!(accessor.has(&roots[2]));

    drop(accessor);
    chain.close();
}

#[test]
fn test_raw_state_round_trip_through_db() {
    let (db, chain) = new_chain(8);

    let address = H256::repeat_byte(0x42);
    let slot = H256::repeat_byte(0x43);
    let mut raw = chain.start_raw();
    raw.set_account(&address, &account(9000, 7));
    raw.set_storage(&address, &slot, &[0x07]);
    let root = raw.commit().unwrap();
    raw.finalize(1).unwrap();
    drop(raw);

    assert!(db.has_state(&root));

    let view = chain.start_read_only(root).unwrap();
    let read = view.get_account(&address);
    assert_eq!(read.balance, U256::from(9000));
    assert_eq!(read.nonce, 7);
    assert_eq!(read.storage_root, empty_root());
    let mut out = [0u8; 32];
    assert_eq!(view.get_storage(&address, &slot, &mut out), 1);
    assert_eq!(out[0], 0x07);

    drop(view);
    chain.close();
}

#[test]
fn test_flusher_failure_is_published() {
    let (db, chain) = new_chain(8);
    let events = chain.subscribe();

    // Hold the single writable batch so the flusher cannot open one.
    let blocker = db.begin_next_batch().unwrap();

    let mut block = chain.start_new(H256::zero()).unwrap();
    block.set_account(&H256::repeat_byte(0x01), &account(1, 1));
    let hash = block.commit(1).unwrap();
    chain.finalize(hash);

    match events.recv_timeout(Duration::from_secs(5)).unwrap() {
        ChainEvent::FlusherFailure { error } => {
            assert!(error.contains("batch"), "unexpected error: {error}");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    drop(blocker);
    chain.close();
}

/// Store wrapper recording metadata stamps and optionally gating the
/// writer until released.
struct RecordingStore {
    inner: Arc<PagedDb>,
    stamped: Arc<Mutex<Vec<u64>>>,
    gate: AtomicBool,
}

impl StateStore for RecordingStore {
    fn begin_read_only_batch(&self, label: &str) -> Arc<dyn ReadBatch> {
        self.inner.begin_read_only_batch(label)
    }

    fn begin_read_only_batch_or_latest(&self, hash: &H256, label: &str) -> Arc<dyn ReadBatch> {
        self.inner.begin_read_only_batch_or_latest(hash, label)
    }

    fn begin_next_batch(&self) -> StoreResult<Box<dyn WriteBatch>> {
        while !self.gate.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(10));
        }
        let inner = self.inner.begin_next_batch()?;
        Ok(Box::new(RecordingBatch {
            inner,
            stamped: None,
            sink: self.stamped.clone(),
        }))
    }

    fn has_state(&self, hash: &H256) -> bool {
        self.inner.has_state(hash)
    }

    fn snapshot_all(&self) -> Vec<Arc<dyn ReadBatch>> {
        self.inner.snapshot_all()
    }

    fn history_depth(&self) -> u32 {
        self.inner.history_depth()
    }

    fn flush(&self) -> StoreResult<()> {
        self.inner.flush()
    }
}

struct RecordingBatch {
    inner: Box<dyn WriteBatch>,
    stamped: Option<u64>,
    sink: Arc<Mutex<Vec<u64>>>,
}

impl WriteBatch for RecordingBatch {
    fn set_raw(&mut self, key: &[u8], value: &[u8]) {
        self.inner.set_raw(key, value);
    }

    fn destroy(&mut self, path: &NibblePath) {
        self.inner.destroy(path);
    }

    fn delete_by_prefix(&mut self, prefix: &[u8]) {
        self.inner.delete_by_prefix(prefix);
    }

    fn set_metadata(&mut self, block_number: u64, hash: &H256) {
        self.stamped = Some(block_number);
        self.inner.set_metadata(block_number, hash);
    }

    fn verify_db_pages_on_commit(&mut self) {
        self.inner.verify_db_pages_on_commit();
    }

    fn commit(self: Box<Self>, options: forkdb::store::CommitOptions) -> StoreResult<()> {
        if let Some(number) = self.stamped {
            self.sink.lock().unwrap().push(number);
        }
        self.inner.commit(options)
    }
}
