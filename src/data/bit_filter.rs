//! Bit filter for fast negative lookups.
//!
//! A fixed-size bit array keyed by precomputed 64-bit hashes. It can tell
//! definitely that a key was NOT written, or that it possibly was. Every
//! call site tolerates false positives; false negatives cannot happen.
//!
//! Each block carries one filter; reads OR ancestor filters together to
//! skip whole blocks without probing their dictionaries.

use std::sync::atomic::{AtomicU64, Ordering};

use super::pool::{Page, Pool, WORDS_PER_PAGE};

/// Pages of backing memory per filter (64KB = 524288 bits).
/// This gives ~1% saturation for the write volume of a typical block.
const FILTER_PAGES: usize = 16;

/// Total addressable bits.
const FILTER_BITS: usize = FILTER_PAGES * WORDS_PER_PAGE * 64;

/// A fixed-size bit filter backed by pool pages.
///
/// One bit per hash. All operations go through atomic words, so the filter
/// can be shared between the owning writer and a background prefetcher.
pub struct BitFilter {
    pages: Vec<Page>,
}

impl BitFilter {
    /// Creates an empty filter, renting its backing pages from `pool`.
    pub fn new(pool: &Pool) -> Self {
        Self {
            pages: (0..FILTER_PAGES).map(|_| pool.rent()).collect(),
        }
    }

    #[inline]
    fn word(&self, hash: u64) -> (&AtomicU64, u64) {
        let bit = (hash as usize) % FILTER_BITS;
        let word_idx = bit / 64;
        let word = &self.pages[word_idx / WORDS_PER_PAGE].as_atomic_words()[word_idx % WORDS_PER_PAGE];
        (word, 1u64 << (bit % 64))
    }

    /// Sets the bit for `hash`. Returns `true` iff the bit was previously 0.
    ///
    /// Not a read-modify-write; only safe when a single writer updates the
    /// filter. Use [`add_atomic`](Self::add_atomic) when racing.
    #[inline]
    pub fn add(&self, hash: u64) -> bool {
        let (word, mask) = self.word(hash);
        let current = word.load(Ordering::Relaxed);
        if current & mask != 0 {
            return false;
        }
        word.store(current | mask, Ordering::Relaxed);
        true
    }

    /// Atomically sets the bit for `hash`. Returns `true` iff this call
    /// set it, which makes the filter usable as a work deduplicator.
    #[inline]
    pub fn add_atomic(&self, hash: u64) -> bool {
        let (word, mask) = self.word(hash);
        word.fetch_or(mask, Ordering::Relaxed) & mask == 0
    }

    /// Whether `hash` may have been added.
    #[inline]
    pub fn may_contain(&self, hash: u64) -> bool {
        let (word, mask) = self.word(hash);
        word.load(Ordering::Relaxed) & mask != 0
    }

    /// Whether either hash may have been added. A zero `second` hash is
    /// treated as "not applicable" and skipped.
    #[inline]
    pub fn may_contain_any(&self, first: u64, second: u64) -> bool {
        if self.may_contain(first) {
            return true;
        }
        second != 0 && self.may_contain(second)
    }

    /// ORs another filter of the same geometry into this one.
    pub fn or_with(&self, other: &BitFilter) {
        for (dst_page, src_page) in self.pages.iter().zip(other.pages.iter()) {
            let dst = dst_page.as_atomic_words();
            for (i, src) in src_page.as_atomic_words().iter().enumerate() {
                let word = src.load(Ordering::Relaxed);
                if word != 0 {
                    dst[i].fetch_or(word, Ordering::Relaxed);
                }
            }
        }
    }

    /// Clears every bit.
    pub fn clear(&mut self) {
        for page in &mut self.pages {
            page.zero();
        }
    }
}
