//! State-root computation seam.
//!
//! The block layer does not know how roots are derived; it hands the
//! sealed block to a [`PreCommitBehavior`] and stores whatever derived
//! entries the behavior writes back. [`FlatDigestRoot`] is the bundled
//! tree-less implementation.

mod behavior;

use primitive_types::H256;
use tiny_keccak::{Hasher, Keccak};

pub use behavior::{
    CacheBudget, CommitContext, FlatDigestRoot, PreCommitBehavior, PrefetchContext,
    PrefetchTransform,
};

/// Hash size (Keccak-256).
pub const HASH_SIZE: usize = 32;

/// Root hash of the empty tree (keccak256 of the RLP null).
pub const EMPTY_ROOT: [u8; HASH_SIZE] = [
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8,
    0x6e, 0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63,
    0xb4, 0x21,
];

/// The empty-tree root as an `H256`.
pub fn empty_root() -> H256 {
    H256::from(EMPTY_ROOT)
}

/// Computes the Keccak-256 hash of the input.
pub fn keccak256(data: &[u8]) -> [u8; HASH_SIZE] {
    let mut keccak = Keccak::v256();
    let mut output = [0u8; HASH_SIZE];
    keccak.update(data);
    keccak.finalize(&mut output);
    output
}

/// Folds the empty-tree root into the zero hash. All consumers compare
/// roots in this normalized form.
pub fn normalize_root(hash: H256) -> H256 {
    if hash.as_bytes() == EMPTY_ROOT {
        H256::zero()
    } else {
        hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256_known_values() {
        assert_eq!(
            hex::encode(keccak256(&[])),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
        assert_eq!(
            hex::encode(keccak256(b"hello")),
            "1c8aff950685c2ed4bc3174f3472287b56d9517b9c948127319a09a7a36deac8"
        );
    }

    #[test]
    fn test_empty_root_constant() {
        // keccak256(rlp(null)) = keccak256(0x80)
        assert_eq!(keccak256(&[0x80]), EMPTY_ROOT);
    }

    #[test]
    fn test_normalize_root() {
        assert_eq!(normalize_root(empty_root()), H256::zero());
        assert_eq!(normalize_root(H256::zero()), H256::zero());
        let other = H256::repeat_byte(0x11);
        assert_eq!(normalize_root(other), other);
    }
}
