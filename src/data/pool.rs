//! Page pool - fixed-size aligned buffers shared across the crate.
//!
//! Filters and dictionaries borrow their backing memory from a single pool
//! owned by the blockchain instance, so teardown can verify that every page
//! made it back.

use std::alloc::{alloc, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// Page size in bytes (4KB).
pub const PAGE_SIZE: usize = 4096;

/// 64-bit words per page.
pub const WORDS_PER_PAGE: usize = PAGE_SIZE / 8;

fn page_layout() -> Layout {
    // Page-aligned so the buffer can be reinterpreted as a word array.
    Layout::from_size_align(PAGE_SIZE, PAGE_SIZE).expect("static layout")
}

/// A raw page pointer that can cross threads while parked in the free list.
struct RawPage(NonNull<u8>);

unsafe impl Send for RawPage {}

struct PoolShared {
    free: Mutex<Vec<RawPage>>,
    /// Pages currently rented out.
    outstanding: AtomicUsize,
    /// Pages ever allocated from the system.
    allocated: AtomicUsize,
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let mut free = self.free.lock();
        for page in free.drain(..) {
            unsafe { dealloc(page.0.as_ptr(), page_layout()) };
        }
    }
}

/// A shared allocator of fixed-size pages.
///
/// Renting returns a zeroed [`Page`]; dropping the page hands the buffer
/// back. `outstanding()` is the number of pages not yet returned.
#[derive(Clone)]
pub struct Pool {
    shared: Arc<PoolShared>,
}

impl Pool {
    /// Creates an empty pool. Pages are allocated lazily on first rent.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::new()),
                outstanding: AtomicUsize::new(0),
                allocated: AtomicUsize::new(0),
            }),
        }
    }

    /// Rents a zeroed page.
    pub fn rent(&self) -> Page {
        let ptr = {
            let mut free = self.shared.free.lock();
            free.pop()
        };
        let ptr = match ptr {
            Some(page) => page.0,
            None => {
                self.shared.allocated.fetch_add(1, Ordering::Relaxed);
                // Safety: layout has non-zero size.
                let raw = unsafe { alloc(page_layout()) };
                NonNull::new(raw).expect("page allocation failed")
            }
        };
        self.shared.outstanding.fetch_add(1, Ordering::Relaxed);
        // Safety: the pointer is exclusively ours until the page is dropped.
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, PAGE_SIZE) };
        Page {
            ptr,
            shared: self.shared.clone(),
        }
    }

    /// Number of pages rented out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Relaxed)
    }

    /// Number of pages ever allocated from the system.
    pub fn allocated(&self) -> usize {
        self.shared.allocated.load(Ordering::Relaxed)
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

/// A rented page. Returns itself to the pool on drop.
pub struct Page {
    ptr: NonNull<u8>,
    shared: Arc<PoolShared>,
}

// Safety: the buffer is plain memory; aliasing is governed by &/&mut access.
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// Read access to the raw bytes.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), PAGE_SIZE) }
    }

    /// Write access to the raw bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), PAGE_SIZE) }
    }

    /// The page viewed as atomic 64-bit words.
    ///
    /// The buffer is page-aligned, so the cast is always in bounds and
    /// aligned. Used by filters that are updated concurrently.
    pub fn as_atomic_words(&self) -> &[AtomicU64] {
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr() as *const AtomicU64, WORDS_PER_PAGE)
        }
    }

    /// Zeroes the page.
    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        self.shared.outstanding.fetch_sub(1, Ordering::Relaxed);
        self.shared.free.lock().push(RawPage(self.ptr));
    }
}
