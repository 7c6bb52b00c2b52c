//! The pre-commit behavior seam and the bundled flat-digest root.

use primitive_types::H256;
use tiny_keccak::{Hasher, Keccak};

use crate::data::{EntryTag, Key, NibblePath};

use super::{empty_root, normalize_root, HASH_SIZE};

/// Caching allowance for protocol reads performed on behalf of the
/// behavior; once spent, further reads are served without writing the
/// result back into the scratch dictionary.
#[derive(Clone, Copy, Debug)]
pub struct CacheBudget {
    pub entries_per_block: u32,
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self {
            entries_per_block: 2000,
        }
    }
}

/// Read/write access to the block being sealed.
pub trait CommitContext {
    /// Hash of the parent state.
    fn parent_hash(&self) -> H256;

    /// Full-protocol read: the block's own dictionaries, then ancestors,
    /// then the database. Results may be cached into the scratch
    /// dictionary within the commit budget.
    fn read(&mut self, key: &Key) -> Option<Vec<u8>>;

    /// Writes a derived entry into the scratch dictionary.
    fn write(&mut self, key: &Key, value: &[u8], tag: EntryTag);

    /// Visits every persistent change the block carries.
    fn for_each_change(&self, visit: &mut dyn FnMut(&Key, &[u8]));
}

/// Transform applied to a raw value while the prefetcher copies it into a
/// scratch page; returns the transformed length and the tag to store under.
pub type PrefetchTransform<'a> = &'a dyn Fn(&[u8], &mut [u8]) -> (usize, EntryTag);

/// Access handed to the behavior's prefetch entry points.
pub trait PrefetchContext {
    /// Probes the scratch dictionary first; on miss runs the ancestor and
    /// database walk, pipes the raw bytes through `transform` and stores
    /// the result. Returns the bytes now cached, or `None` on a miss.
    fn fetch(&mut self, key: &Key, transform: PrefetchTransform<'_>) -> Option<Vec<u8>>;
}

/// Derives the state root when a block is sealed and mediates how values
/// reach the cold store.
pub trait PreCommitBehavior: Send + Sync {
    /// Computes the root of the sealed block. Runs once per commit; reads
    /// go through the context, derived entries are written back through it.
    fn before_commit(&self, ctx: &mut dyn CommitContext, budget: CacheBudget) -> H256;

    /// Optional value rewrite while a block is applied to the cold store.
    /// `None` keeps the value as stored.
    fn inspect_before_apply(&self, _key: &Key, _value: &[u8]) -> Option<Vec<u8>> {
        None
    }

    /// Called after a whole account has been torn down in a block.
    fn on_account_destroyed(&self, _address: &H256, _ctx: &mut dyn CommitContext) {}

    /// Called when a write creates an account that did not exist before.
    fn on_new_account_created(&self, _address: &H256, _ctx: &mut dyn CommitContext) {}

    /// Whether this behavior supports speculative prefetching.
    fn can_prefetch(&self) -> bool {
        false
    }

    /// Pulls the data needed to seal `address` into the scratch cache.
    fn prefetch_account(&self, _address: &H256, _ctx: &mut dyn PrefetchContext) {}

    /// Pulls the data needed to seal one storage slot into the scratch cache.
    fn prefetch_storage(&self, _address: &H256, _slot: &H256, _ctx: &mut dyn PrefetchContext) {}
}

/// Scratch key of the persisted root record.
fn root_record_key() -> Key {
    Key::merkle(NibblePath::new())
}

/// Scratch key of the transient change-count note.
fn change_count_key() -> Key {
    Key::merkle(NibblePath::from_bytes(&[0x00]))
}

/// Tree-less root derivation: the root is a keccak digest chaining the
/// parent root with the sorted change set. Deterministic and
/// collision-resistant enough to identify states; it does not produce
/// verifiable merkle proofs.
pub struct FlatDigestRoot;

impl FlatDigestRoot {
    fn digest(parent: &H256, changes: &[(Vec<u8>, Vec<u8>)]) -> H256 {
        let mut keccak = Keccak::v256();
        keccak.update(parent.as_bytes());
        for (key, value) in changes {
            keccak.update(&(key.len() as u32).to_le_bytes());
            keccak.update(key);
            keccak.update(&(value.len() as u32).to_le_bytes());
            keccak.update(value);
        }
        let mut output = [0u8; HASH_SIZE];
        keccak.finalize(&mut output);
        H256::from(output)
    }
}

impl PreCommitBehavior for FlatDigestRoot {
    fn before_commit(&self, ctx: &mut dyn CommitContext, _budget: CacheBudget) -> H256 {
        let mut changes: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        ctx.for_each_change(&mut |key, value| {
            changes.push((key.encode(), value.to_vec()));
        });

        if changes.is_empty() {
            let parent = ctx.parent_hash();
            return if normalize_root(parent) == H256::zero() {
                empty_root()
            } else {
                parent
            };
        }

        changes.sort();
        let root = Self::digest(&ctx.parent_hash(), &changes);

        // The root record survives into the cold store; the change count
        // is per-commit scratch and gets dropped when the block seals.
        ctx.write(&root_record_key(), root.as_bytes(), EntryTag::Persistent);
        ctx.write(
            &change_count_key(),
            &(changes.len() as u64).to_le_bytes(),
            EntryTag::UseOnce,
        );
        root
    }

    fn can_prefetch(&self) -> bool {
        true
    }

    fn prefetch_account(&self, address: &H256, ctx: &mut dyn PrefetchContext) {
        let copy: PrefetchTransform<'_> = &|raw, scratch| {
            scratch[..raw.len()].copy_from_slice(raw);
            (raw.len(), EntryTag::Cached)
        };
        ctx.fetch(&Key::account(address), copy);
    }

    fn prefetch_storage(&self, address: &H256, slot: &H256, ctx: &mut dyn PrefetchContext) {
        let copy: PrefetchTransform<'_> = &|raw, scratch| {
            scratch[..raw.len()].copy_from_slice(raw);
            (raw.len(), EntryTag::Cached)
        };
        ctx.fetch(&Key::storage_cell(address, slot), copy);
    }
}
