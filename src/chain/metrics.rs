//! Hot-layer metrics for observability.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters covering the block layer.
///
/// All counters are atomic for thread-safe access.
#[derive(Debug, Default)]
pub struct ChainMetrics {
    /// Blocks sealed and registered in the index.
    pub blocks_committed: AtomicU64,
    /// Blocks applied to the cold store.
    pub blocks_flushed: AtomicU64,
    /// Reads that fell through to a database batch.
    pub db_reads: AtomicU64,
    /// Ancestor dictionaries probed during reads.
    pub ancestor_probes: AtomicU64,
    /// Values written back into a block as read cache.
    pub cache_writebacks: AtomicU64,
    /// Prefetch hints accepted after deduplication.
    pub prefetch_requests: AtomicU64,
    /// Prefetch work items completed.
    pub prefetch_completed: AtomicU64,
}

impl ChainMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_blocks_committed(&self) {
        self.blocks_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_blocks_flushed(&self) {
        self.blocks_flushed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_db_reads(&self) {
        self.db_reads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_ancestor_probes(&self) {
        self.ancestor_probes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_cache_writebacks(&self) {
        self.cache_writebacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_prefetch_requests(&self) {
        self.prefetch_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_prefetch_completed(&self) {
        self.prefetch_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> ChainMetricsSnapshot {
        ChainMetricsSnapshot {
            blocks_committed: self.blocks_committed.load(Ordering::Relaxed),
            blocks_flushed: self.blocks_flushed.load(Ordering::Relaxed),
            db_reads: self.db_reads.load(Ordering::Relaxed),
            ancestor_probes: self.ancestor_probes.load(Ordering::Relaxed),
            cache_writebacks: self.cache_writebacks.load(Ordering::Relaxed),
            prefetch_requests: self.prefetch_requests.load(Ordering::Relaxed),
            prefetch_completed: self.prefetch_completed.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the chain counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainMetricsSnapshot {
    pub blocks_committed: u64,
    pub blocks_flushed: u64,
    pub db_reads: u64,
    pub ancestor_probes: u64,
    pub cache_writebacks: u64,
    pub prefetch_requests: u64,
    pub prefetch_completed: u64,
}

impl ChainMetricsSnapshot {
    /// Calculates the difference between two snapshots.
    pub fn diff(&self, other: &ChainMetricsSnapshot) -> ChainMetricsSnapshot {
        ChainMetricsSnapshot {
            blocks_committed: self.blocks_committed.saturating_sub(other.blocks_committed),
            blocks_flushed: self.blocks_flushed.saturating_sub(other.blocks_flushed),
            db_reads: self.db_reads.saturating_sub(other.db_reads),
            ancestor_probes: self.ancestor_probes.saturating_sub(other.ancestor_probes),
            cache_writebacks: self.cache_writebacks.saturating_sub(other.cache_writebacks),
            prefetch_requests: self.prefetch_requests.saturating_sub(other.prefetch_requests),
            prefetch_completed: self.prefetch_completed.saturating_sub(other.prefetch_completed),
        }
    }
}

impl std::fmt::Display for ChainMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Chain Metrics:")?;
        writeln!(f, "  Blocks committed:   {}", self.blocks_committed)?;
        writeln!(f, "  Blocks flushed:     {}", self.blocks_flushed)?;
        writeln!(f, "  DB reads:           {}", self.db_reads)?;
        writeln!(f, "  Ancestor probes:    {}", self.ancestor_probes)?;
        writeln!(f, "  Cache writebacks:   {}", self.cache_writebacks)?;
        writeln!(f, "  Prefetch requests:  {}", self.prefetch_requests)?;
        writeln!(f, "  Prefetch completed: {}", self.prefetch_completed)?;
        Ok(())
    }
}
