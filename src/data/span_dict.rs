//! SpanDict - pooled map from byte keys to byte values.
//!
//! Keys and values are arbitrary byte spans stored back to back in pages
//! rented from the [`Pool`]; the probe table is open-addressed over
//! caller-supplied 64-bit hashes with a full key compare on hash match.
//! One byte of metadata rides along with every entry.
//!
//! A dictionary has a single writer. Shared `&self` access only reads,
//! so committed snapshots can serve concurrent lookups.

use std::sync::atomic::{AtomicU64, Ordering};

use super::bit_filter::BitFilter;
use super::pool::{Page, Pool, PAGE_SIZE};

const INITIAL_SLOTS: usize = 64;

/// Per-entry metadata tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryTag {
    /// Written by execution; flushed to the cold store.
    Persistent = 0,
    /// Read-through cache of an ancestor or database value; kept in
    /// committed snapshots, never flushed.
    Cached = 1,
    /// Scratch value discarded when the block is sealed.
    UseOnce = 2,
    /// Tombstone left by whole-account destruction; reads treat it as an
    /// authoritative empty.
    Destroyed = 3,
}

impl EntryTag {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EntryTag::Persistent,
            1 => EntryTag::Cached,
            2 => EntryTag::UseOnce,
            _ => EntryTag::Destroyed,
        }
    }
}

#[derive(Clone, Copy, Default)]
struct Slot {
    hash: u64,
    page: u32,
    offset: u32,
    key_len: u16,
    value_len: u32,
    meta: u8,
    used: bool,
}

enum Find {
    Found(usize),
    Vacant(usize),
}

/// An entry yielded during iteration.
pub struct DictEntry<'a> {
    pub key: &'a [u8],
    pub hash: u64,
    pub value: &'a [u8],
    pub meta: EntryTag,
}

/// A pooled byte-span dictionary.
pub struct SpanDict {
    slots: Vec<Slot>,
    len: usize,
    pages: Vec<Page>,
    write_offset: usize,
    pool: Pool,
    probes: AtomicU64,
}

impl SpanDict {
    /// Creates an empty dictionary renting data pages from `pool`.
    pub fn new(pool: &Pool) -> Self {
        Self {
            slots: vec![Slot::default(); INITIAL_SLOTS],
            len: 0,
            pages: Vec::new(),
            write_offset: 0,
            pool: pool.clone(),
            probes: AtomicU64::new(0),
        }
    }

    /// Number of live entries (tombstones included).
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of `try_get` calls served so far.
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    fn span<'a>(pages: &'a [Page], slot: &Slot) -> (&'a [u8], &'a [u8]) {
        let data = pages[slot.page as usize].as_slice();
        let key_start = slot.offset as usize;
        let value_start = key_start + slot.key_len as usize;
        (
            &data[key_start..value_start],
            &data[value_start..value_start + slot.value_len as usize],
        )
    }

    fn find(&self, key: &[u8], hash: u64) -> Find {
        let mask = self.slots.len() - 1;
        let mut i = (hash as usize) & mask;
        loop {
            let slot = &self.slots[i];
            if !slot.used {
                return Find::Vacant(i);
            }
            if slot.hash == hash {
                let (stored_key, _) = Self::span(&self.pages, slot);
                if stored_key == key {
                    return Find::Found(i);
                }
            }
            i = (i + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let mut slots = vec![Slot::default(); self.slots.len() * 2];
        let mask = slots.len() - 1;
        for slot in self.slots.iter().filter(|s| s.used) {
            let mut i = (slot.hash as usize) & mask;
            while slots[i].used {
                i = (i + 1) & mask;
            }
            slots[i] = *slot;
        }
        self.slots = slots;
    }

    fn alloc_span(&mut self, total: usize) -> (u32, u32) {
        assert!(total <= PAGE_SIZE, "span exceeds page size");
        if self.pages.is_empty() || PAGE_SIZE - self.write_offset < total {
            self.pages.push(self.pool.rent());
            self.write_offset = 0;
        }
        let page = (self.pages.len() - 1) as u32;
        let offset = self.write_offset as u32;
        self.write_offset += total;
        (page, offset)
    }

    fn write_span(&mut self, page: u32, offset: u32, key: &[u8], value0: &[u8], value1: &[u8]) {
        let buf = self.pages[page as usize].as_mut_slice();
        let mut at = offset as usize;
        buf[at..at + key.len()].copy_from_slice(key);
        at += key.len();
        buf[at..at + value0.len()].copy_from_slice(value0);
        at += value0.len();
        buf[at..at + value1.len()].copy_from_slice(value1);
    }

    /// Inserts or overwrites the value for `key`. `hash` must be the same
    /// for every call with the same key bytes.
    pub fn set(&mut self, key: &[u8], hash: u64, value: &[u8], meta: EntryTag) {
        self.set_concat(key, hash, value, &[], meta);
    }

    /// Inserts or overwrites with a value assembled from two parts,
    /// avoiding an intermediate allocation at the call site.
    pub fn set_concat(
        &mut self,
        key: &[u8],
        hash: u64,
        value0: &[u8],
        value1: &[u8],
        meta: EntryTag,
    ) {
        let total_value = value0.len() + value1.len();
        match self.find(key, hash) {
            Find::Found(i) => {
                let slot = self.slots[i];
                if total_value <= slot.value_len as usize {
                    // Shrinking rewrite fits in the existing span.
                    let start = slot.offset as usize + slot.key_len as usize;
                    let buf = self.pages[slot.page as usize].as_mut_slice();
                    buf[start..start + value0.len()].copy_from_slice(value0);
                    buf[start + value0.len()..start + total_value].copy_from_slice(value1);
                } else {
                    let (page, offset) = self.alloc_span(key.len() + total_value);
                    self.write_span(page, offset, key, value0, value1);
                    let slot = &mut self.slots[i];
                    slot.page = page;
                    slot.offset = offset;
                }
                let slot = &mut self.slots[i];
                slot.value_len = total_value as u32;
                slot.meta = meta as u8;
            }
            Find::Vacant(_) => {
                if (self.len + 1) * 4 > self.slots.len() * 3 {
                    self.grow();
                }
                let i = match self.find(key, hash) {
                    Find::Vacant(i) => i,
                    Find::Found(_) => unreachable!("key appeared during grow"),
                };
                let (page, offset) = self.alloc_span(key.len() + total_value);
                self.write_span(page, offset, key, value0, value1);
                self.slots[i] = Slot {
                    hash,
                    page,
                    offset,
                    key_len: key.len() as u16,
                    value_len: total_value as u32,
                    meta: meta as u8,
                    used: true,
                };
                self.len += 1;
            }
        }
    }

    /// Looks up the value and tag for `key`.
    pub fn try_get(&self, key: &[u8], hash: u64) -> Option<(&[u8], EntryTag)> {
        self.probes.fetch_add(1, Ordering::Relaxed);
        match self.find(key, hash) {
            Find::Found(i) => {
                let slot = &self.slots[i];
                let (_, value) = Self::span(&self.pages, slot);
                Some((value, EntryTag::from_u8(slot.meta)))
            }
            Find::Vacant(_) => None,
        }
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = DictEntry<'_>> + '_ {
        self.slots.iter().filter(|s| s.used).map(move |slot| {
            let (key, value) = Self::span(&self.pages, slot);
            DictEntry {
                key,
                hash: slot.hash,
                value,
                meta: EntryTag::from_u8(slot.meta),
            }
        })
    }

    /// Tombstones every entry whose key matches the predicate, in place.
    /// Returns the number of entries converted.
    pub fn mark_destroyed_where(&mut self, mut pred: impl FnMut(&[u8]) -> bool) -> usize {
        let mut converted = 0;
        for i in 0..self.slots.len() {
            let slot = self.slots[i];
            if !slot.used || slot.meta == EntryTag::Destroyed as u8 {
                continue;
            }
            let (key, _) = Self::span(&self.pages, &slot);
            if pred(key) {
                let slot = &mut self.slots[i];
                slot.value_len = 0;
                slot.meta = EntryTag::Destroyed as u8;
                converted += 1;
            }
        }
        converted
    }

    /// Copies entries whose tag passes `keep` into `dest`, recording each
    /// copied hash in `filter`. Used to assemble a committed snapshot out
    /// of a block's working dictionaries.
    ///
    /// With `append_only`, every copied key must be new to `dest`; the
    /// caller vouches for disjointness and an overwrite panics. Without
    /// it, later copies win.
    pub fn copy_to(
        &self,
        dest: &mut SpanDict,
        keep: impl Fn(EntryTag) -> bool,
        filter: Option<&BitFilter>,
        append_only: bool,
    ) {
        for slot in self.slots.iter().filter(|s| s.used) {
            let meta = EntryTag::from_u8(slot.meta);
            if !keep(meta) {
                continue;
            }
            let (key, value) = Self::span(&self.pages, slot);
            if append_only {
                dest.insert_new(key, slot.hash, value, meta);
            } else {
                dest.set(key, slot.hash, value, meta);
            }
            if let Some(filter) = filter {
                filter.add(slot.hash);
            }
        }
    }

    /// Inserts a key that must not be present yet.
    fn insert_new(&mut self, key: &[u8], hash: u64, value: &[u8], meta: EntryTag) {
        if (self.len + 1) * 4 > self.slots.len() * 3 {
            self.grow();
        }
        let i = match self.find(key, hash) {
            Find::Vacant(i) => i,
            Find::Found(_) => panic!("append-only copy hit an existing key"),
        };
        let (page, offset) = self.alloc_span(key.len() + value.len());
        self.write_span(page, offset, key, value, &[]);
        self.slots[i] = Slot {
            hash,
            page,
            offset,
            key_len: key.len() as u16,
            value_len: value.len() as u32,
            meta: meta as u8,
            used: true,
        };
        self.len += 1;
    }

    /// Drops all entries and returns the data pages to the pool.
    pub fn clear(&mut self) {
        self.slots = vec![Slot::default(); INITIAL_SLOTS];
        self.len = 0;
        self.pages.clear();
        self.write_offset = 0;
    }
}
