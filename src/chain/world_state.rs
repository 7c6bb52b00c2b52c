//! Account model shared by the hot layer and the cold store.

use primitive_types::{H256, U256};

use crate::merkle::empty_root;

/// An account.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Account {
    /// Account nonce.
    pub nonce: u64,
    /// Account balance.
    pub balance: U256,
    /// Code hash (keccak256 of code, or zero if no code).
    pub code_hash: H256,
    /// Storage root hash. Recomputed when a block seals; external
    /// importers write the empty-tree root here.
    pub storage_root: H256,
}

impl Account {
    /// Creates a new empty account.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an account with the given balance.
    pub fn with_balance(balance: U256) -> Self {
        Self {
            balance,
            ..Default::default()
        }
    }

    /// Returns true if this is an empty account.
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code_hash == H256::zero()
    }

    /// Same account with the storage root forced to the empty-tree root.
    pub fn with_empty_storage_root(mut self) -> Self {
        self.storage_root = empty_root();
        self
    }

    /// Encodes the account for storage.
    ///
    /// Format: [nonce (8)] [balance (32)] [code_hash (32)] [storage_root (32)]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(104);
        buf.extend_from_slice(&self.nonce.to_le_bytes());
        buf.extend_from_slice(&self.balance.to_little_endian());
        buf.extend_from_slice(self.code_hash.as_bytes());
        buf.extend_from_slice(self.storage_root.as_bytes());
        buf
    }

    /// Decodes an account from bytes. An empty payload is the empty
    /// account; that is how destroyed accounts read back.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.is_empty() {
            return Some(Self::default());
        }
        if data.len() < 104 {
            return None;
        }

        let nonce = u64::from_le_bytes(data[0..8].try_into().ok()?);
        let balance = U256::from_little_endian(&data[8..40]);
        let code_hash = H256::from_slice(&data[40..72]);
        let storage_root = H256::from_slice(&data[72..104]);

        Some(Self {
            nonce,
            balance,
            code_hash,
            storage_root,
        })
    }
}
