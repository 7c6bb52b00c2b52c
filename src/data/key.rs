//! Tagged state keys and their precomputed hashes.
//!
//! Every entry in a block dictionary is addressed by a [`Key`]: a kind tag,
//! the nibble path of the account, and (for storage cells and per-account
//! merkle nodes) an extra path. Keys serialize to a canonical byte form
//! that is also what the cold store indexes on.

use std::hash::Hasher;

use primitive_types::H256;
use rustc_hash::FxHasher;

use super::nibble_path::NibblePath;

/// Seed mixed into the destroyed-account checksum so it does not collide
/// with plain CRCs of the same bytes elsewhere.
const DESTROYED_SEED: u32 = 0x9E37_79B9;

/// The kind of data a key addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyKind {
    /// Account payload keyed by the account path.
    Account = 0,
    /// Storage cell keyed by account path + slot path.
    StorageCell = 1,
    /// Derived merkle node keyed by an arbitrary (possibly partial) path.
    Merkle = 2,
}

impl KeyKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(KeyKind::Account),
            1 => Some(KeyKind::StorageCell),
            2 => Some(KeyKind::Merkle),
            _ => None,
        }
    }
}

/// A tagged state key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Key {
    kind: KeyKind,
    path: NibblePath,
    extra: NibblePath,
}

impl Key {
    /// Largest canonical serialization: kind byte + two full paths.
    pub const MAX_BYTE_LENGTH: usize = 1 + 2 * NibblePath::MAX_BYTE_LENGTH;

    /// Key of an account payload.
    pub fn account(address: &H256) -> Self {
        Self {
            kind: KeyKind::Account,
            path: NibblePath::from_hash(address),
            extra: NibblePath::new(),
        }
    }

    /// Key of a storage cell within an account.
    pub fn storage_cell(address: &H256, slot: &H256) -> Self {
        Self {
            kind: KeyKind::StorageCell,
            path: NibblePath::from_hash(address),
            extra: NibblePath::from_hash(slot),
        }
    }

    /// Key of a state-level merkle node.
    pub fn merkle(path: NibblePath) -> Self {
        Self {
            kind: KeyKind::Merkle,
            path,
            extra: NibblePath::new(),
        }
    }

    /// Key of a merkle node inside one account's storage tree.
    pub fn merkle_under(address: &H256, node_path: NibblePath) -> Self {
        Self {
            kind: KeyKind::Merkle,
            path: NibblePath::from_hash(address),
            extra: node_path,
        }
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    pub fn path(&self) -> &NibblePath {
        &self.path
    }

    pub fn extra(&self) -> &NibblePath {
        &self.extra
    }

    /// The account address, when the path spans a full hash.
    pub fn address(&self) -> Option<H256> {
        self.path.to_h256()
    }

    /// Serialized size in bytes.
    pub fn byte_length(&self) -> usize {
        1 + self.path.byte_length() + self.extra.byte_length()
    }

    /// Writes the canonical form `[kind][path][extra]` into `buf`,
    /// returning the written prefix.
    pub fn write_to<'a>(&self, buf: &'a mut [u8]) -> &'a [u8] {
        buf[0] = self.kind as u8;
        let mut at = 1;
        at += self.path.write_to(&mut buf[at..]).len();
        at += self.extra.write_to(&mut buf[at..]).len();
        &buf[..at]
    }

    /// Canonical form as an owned vector.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = [0u8; Self::MAX_BYTE_LENGTH];
        self.write_to(&mut buf).to_vec()
    }

    /// Parses a canonical form, returning the key and the remaining bytes.
    pub fn read_from(bytes: &[u8]) -> Option<(Self, &[u8])> {
        let (&kind, rest) = bytes.split_first()?;
        let kind = KeyKind::from_u8(kind)?;
        let (path, rest) = NibblePath::read_from(rest)?;
        let (extra, rest) = NibblePath::read_from(rest)?;
        Some((Self { kind, path, extra }, rest))
    }

    /// The 64-bit probe hash over the canonical form. All consumers of the
    /// same logical key observe the same value.
    pub fn hash64(&self) -> u64 {
        let mut buf = [0u8; Self::MAX_BYTE_LENGTH];
        let encoded = self.write_to(&mut buf);
        let mut hasher = FxHasher::default();
        hasher.write(encoded);
        hasher.finish()
    }

    /// The whole-subtree destruction hash for this key's account, or 0
    /// when the path is not a full address.
    pub fn destroyed_hash64(&self) -> u64 {
        match self.address() {
            Some(address) => destroyed_hash64(&address),
            None => 0,
        }
    }
}

/// CRC-32C (Castagnoli) of an address with a constant seed, zero-extended
/// to 64 bits. Committed-block filters carry one such hash per destroyed
/// account so readers can skip blocks that neither wrote nor destroyed a
/// key.
pub fn destroyed_hash64(address: &H256) -> u64 {
    crc32c::crc32c_append(DESTROYED_SEED, address.as_bytes()) as u64
}

/// The 64-bit probe hash of a bare 32-byte value. Used by the prefetcher
/// to deduplicate account and storage hints.
pub fn hash64_of(value: &H256) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(value.as_bytes());
    hasher.finish()
}
