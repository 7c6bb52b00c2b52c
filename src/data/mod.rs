//! Core data structures: paths, keys, pooled pages, filters, dictionaries
//! and lease-tracked lifetimes.

mod bit_filter;
mod key;
mod lease;
mod nibble_path;
mod pool;
mod span_dict;

pub use bit_filter::BitFilter;
pub use key::{destroyed_hash64, hash64_of, Key, KeyKind};
pub use lease::{Lease, Leased};
pub use nibble_path::{NibblePath, FULL_PATH_NIBBLES};
pub use pool::{Page, Pool, PAGE_SIZE};
pub use span_dict::{DictEntry, EntryTag, SpanDict};
