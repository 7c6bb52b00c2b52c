//! Lease-based lifetime tracking for shared snapshots.
//!
//! Committed blocks are shared by the block index, descendant blocks,
//! the finalization queue and read-only accessors. Plain `Arc` reclaims
//! memory, but the moment a snapshot stops being *reachable* (deregister
//! from the index, hand pages back) is a domain event, tracked by an
//! explicit lease count. The count starts at 1 on construction; the last
//! release runs `clean_up` exactly once.

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Types whose logical lifetime is governed by a lease count.
pub trait Leased {
    /// The lease counter. Must be initialized to 1 by the constructor.
    fn leases(&self) -> &AtomicU32;

    /// Runs once, on the release of the last lease.
    fn clean_up(&self);
}

/// A held lease. Releases on drop.
pub struct Lease<T: Leased> {
    inner: Arc<T>,
}

impl<T: Leased> Lease<T> {
    /// Wraps the construction-time lease of a freshly built object.
    pub fn first(inner: Arc<T>) -> Self {
        debug_assert_eq!(inner.leases().load(Ordering::Relaxed), 1);
        Self { inner }
    }

    /// Acquires an additional lease.
    ///
    /// # Panics
    /// Panics if the object has already been released; resurrecting a
    /// cleaned-up snapshot would hand out dangling state.
    pub fn acquire(inner: &Arc<T>) -> Self {
        let leases = inner.leases();
        let mut current = leases.load(Ordering::Relaxed);
        loop {
            assert!(current != 0, "lease acquired on a released object");
            match leases.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Self { inner: inner.clone() },
                Err(observed) => current = observed,
            }
        }
    }

    /// The shared handle behind this lease.
    pub fn shared(&self) -> &Arc<T> {
        &self.inner
    }
}

impl<T: Leased> Clone for Lease<T> {
    fn clone(&self) -> Self {
        Self::acquire(&self.inner)
    }
}

impl<T: Leased> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T: Leased> Drop for Lease<T> {
    fn drop(&mut self) {
        if self.inner.leases().fetch_sub(1, Ordering::Release) == 1 {
            std::sync::atomic::fence(Ordering::Acquire);
            self.inner.clean_up();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct Tracked {
        leases: AtomicU32,
        cleaned: AtomicBool,
    }

    impl Tracked {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                leases: AtomicU32::new(1),
                cleaned: AtomicBool::new(false),
            })
        }
    }

    impl Leased for Tracked {
        fn leases(&self) -> &AtomicU32 {
            &self.leases
        }

        fn clean_up(&self) {
            assert!(!self.cleaned.swap(true, Ordering::SeqCst), "cleaned twice");
        }
    }

    #[test]
    fn test_clean_up_runs_on_last_release() {
        let tracked = Tracked::new();
        let first = Lease::first(tracked.clone());
        let second = first.clone();

        drop(first);
        assert!(!tracked.cleaned.load(Ordering::SeqCst));

        drop(second);
        assert!(tracked.cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_acquire_while_alive() {
        let tracked = Tracked::new();
        let first = Lease::first(tracked.clone());
        let extra = Lease::acquire(&tracked);
        assert_eq!(tracked.leases.load(Ordering::SeqCst), 2);
        drop(extra);
        drop(first);
        assert!(tracked.cleaned.load(Ordering::SeqCst));
    }

    #[test]
    #[should_panic(expected = "released object")]
    fn test_acquire_after_release_panics() {
        let tracked = Tracked::new();
        drop(Lease::first(tracked.clone()));
        let _ = Lease::acquire(&tracked);
    }
}
