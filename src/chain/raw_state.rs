//! Raw-state import: bulk writes straight into the cold store.
//!
//! Importers (snapshot sync, genesis loading) bypass the block machinery:
//! changes accumulate in plain dictionaries and [`commit`](RawState::commit)
//! writes them into a store batch directly, with no committed snapshot.
//! [`finalize`](RawState::finalize) stamps the metadata and flushes; a raw
//! session must be finalized before it is dropped.

use std::sync::Arc;

use primitive_types::H256;
use tracing::info;

use crate::data::{EntryTag, Key, NibblePath, SpanDict};
use crate::merkle::{normalize_root, CommitContext};
use crate::store::{CommitOptions, ReadBatch};

use super::blockchain::ChainInner;
use super::flusher::write_persistent_entries;
use super::world_state::Account;
use super::Result;

/// A bulk-import session.
pub struct RawState {
    chain: Arc<ChainInner>,
    batch: Arc<dyn ReadBatch>,
    state: SpanDict,
    storage: SpanDict,
    scratch: SpanDict,
    prefix_deletes: Vec<Vec<u8>>,
    root: H256,
    dirty: bool,
    finalized: bool,
}

impl RawState {
    pub(crate) fn new(chain: Arc<ChainInner>) -> Self {
        let batch = chain.db.begin_read_only_batch("raw");
        let root = normalize_root(batch.metadata().state_hash);
        let pool = chain.pool.clone();
        Self {
            state: SpanDict::new(&pool),
            storage: SpanDict::new(&pool),
            scratch: SpanDict::new(&pool),
            prefix_deletes: Vec::new(),
            chain,
            batch,
            root,
            dirty: false,
            finalized: false,
        }
    }

    /// The root of the last committed change set.
    pub fn root(&self) -> H256 {
        self.root
    }

    /// Writes an account. The storage root is forced to the empty-tree
    /// root; the import path never carries per-account tree state.
    pub fn set_account(&mut self, address: &H256, account: &Account) {
        let account = account.clone().with_empty_storage_root();
        self.insert(&Key::account(address), &account.encode());
    }

    /// Writes a storage cell.
    pub fn set_storage(&mut self, address: &H256, slot: &H256, value: &[u8]) {
        self.insert(&Key::storage_cell(address, slot), value);
    }

    /// Records an import boundary. Boundary markers are per-session
    /// scratch; they never reach the store.
    pub fn set_boundary(&mut self, path: NibblePath) {
        let key = Key::merkle(path);
        let mut buf = [0u8; Key::MAX_BYTE_LENGTH];
        let key_bytes = key.write_to(&mut buf);
        self.scratch
            .set(key_bytes, key.hash64(), &[], EntryTag::UseOnce);
        self.dirty = true;
    }

    /// Schedules removal of everything under `key` when the session
    /// commits.
    pub fn register_delete_by_prefix(&mut self, key: &Key) {
        self.prefix_deletes.push(key.encode());
        self.dirty = true;
    }

    /// Derives the root over the accumulated changes and writes them into
    /// a store batch. The dictionaries are drained; the session can keep
    /// importing afterwards.
    pub fn commit(&mut self) -> Result<H256> {
        let behavior = self.chain.behavior.clone();
        let budget = self.chain.options.cache_budget_pre_commit;
        let root = {
            let mut ctx = RawCommitCtx { raw: self };
            behavior.before_commit(&mut ctx, budget)
        };

        let mut batch = self.chain.db.begin_next_batch()?;
        for prefix in self.prefix_deletes.drain(..) {
            batch.delete_by_prefix(&prefix);
        }
        write_persistent_entries(&self.state, behavior.as_ref(), batch.as_mut());
        write_persistent_entries(&self.storage, behavior.as_ref(), batch.as_mut());
        write_persistent_entries(&self.scratch, behavior.as_ref(), batch.as_mut());
        // Intermediate commits already carry the derived root; finalize
        // re-stamps it with the block number.
        batch.set_metadata(self.batch.metadata().block_number, &root);
        batch.commit(CommitOptions::DangerNoFlush)?;

        self.state.clear();
        self.storage.clear();
        self.scratch.clear();
        self.root = root;
        self.dirty = false;
        Ok(root)
    }

    /// Stamps the store with `(block_number, root)` and flushes durably.
    pub fn finalize(&mut self, block_number: u64) -> Result<()> {
        if self.dirty {
            self.commit()?;
        }
        let mut batch = self.chain.db.begin_next_batch()?;
        batch.set_metadata(block_number, &self.root);
        batch.commit(CommitOptions::FlushDataOnly)?;
        self.chain.db.flush()?;
        self.finalized = true;
        info!(number = block_number, root = ?self.root, "raw import finalized");
        Ok(())
    }

    fn insert(&mut self, key: &Key, value: &[u8]) {
        let mut buf = [0u8; Key::MAX_BYTE_LENGTH];
        let key_bytes = key.write_to(&mut buf);
        let hash = key.hash64();
        match key.kind() {
            crate::data::KeyKind::Account => {
                self.state.set(key_bytes, hash, value, EntryTag::Persistent)
            }
            crate::data::KeyKind::StorageCell => {
                self.storage.set(key_bytes, hash, value, EntryTag::Persistent)
            }
            crate::data::KeyKind::Merkle => {
                self.scratch.set(key_bytes, hash, value, EntryTag::Persistent)
            }
        }
        self.dirty = true;
    }
}

impl Drop for RawState {
    fn drop(&mut self) {
        if !self.finalized && !std::thread::panicking() {
            panic!("raw state dropped before finalize");
        }
    }
}

/// Commit context over the raw dictionaries: reads probe the session's
/// own writes, then the store; derived entries land in the scratch
/// dictionary.
struct RawCommitCtx<'a> {
    raw: &'a mut RawState,
}

impl CommitContext for RawCommitCtx<'_> {
    fn parent_hash(&self) -> H256 {
        self.raw.root
    }

    fn read(&mut self, key: &Key) -> Option<Vec<u8>> {
        let mut buf = [0u8; Key::MAX_BYTE_LENGTH];
        let key_bytes = key.write_to(&mut buf);
        let hash = key.hash64();
        for dict in [&self.raw.scratch, &self.raw.state, &self.raw.storage] {
            if let Some((value, meta)) = dict.try_get(key_bytes, hash) {
                if meta == EntryTag::Destroyed {
                    return None;
                }
                return Some(value.to_vec());
            }
        }
        self.raw.batch.try_get(key_bytes)
    }

    fn write(&mut self, key: &Key, value: &[u8], tag: EntryTag) {
        let mut buf = [0u8; Key::MAX_BYTE_LENGTH];
        let key_bytes = key.write_to(&mut buf);
        self.raw.scratch.set(key_bytes, key.hash64(), value, tag);
    }

    fn for_each_change(&self, visit: &mut dyn FnMut(&Key, &[u8])) {
        for dict in [&self.raw.state, &self.raw.storage] {
            for entry in dict.iter() {
                if entry.meta != EntryTag::Persistent {
                    continue;
                }
                if let Some((key, _)) = Key::read_from(entry.key) {
                    visit(&key, entry.value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{Blockchain, Options};
    use crate::merkle::FlatDigestRoot;
    use crate::store::{PagedDb, StateStore};
    use primitive_types::U256;

    #[test]
    fn test_raw_import_round_trip() {
        let db = Arc::new(PagedDb::in_memory(8));
        let blockchain = Blockchain::new(db.clone(), Arc::new(FlatDigestRoot), Options::default());

        let mut raw = blockchain.start_raw();
        let address = H256::repeat_byte(0x11);
        raw.set_account(&address, &Account::with_balance(U256::from(1000)));
        raw.set_storage(&address, &H256::repeat_byte(0x22), &[0xAA]);

        let root = raw.commit().unwrap();
        raw.finalize(1).unwrap();
        drop(raw);

        assert!(db.has_state(&root));
        let view = blockchain.start_read_only(root).unwrap();
        assert_eq!(view.get_account(&address).balance, U256::from(1000));
        let mut out = [0u8; 32];
        let n = view.get_storage(&address, &H256::repeat_byte(0x22), &mut out);
        assert_eq!(&out[..n], &[0xAA]);
        blockchain.close();
    }

    #[test]
    #[should_panic(expected = "raw state dropped before finalize")]
    fn test_unfinalized_drop_panics() {
        let db = Arc::new(PagedDb::in_memory(8));
        let blockchain = Blockchain::new(db, Arc::new(FlatDigestRoot), Options::default());
        let mut raw = blockchain.start_raw();
        raw.set_account(&H256::repeat_byte(0x11), &Account::default());
        drop(raw);
        blockchain.close();
    }
}
