//! # forkdb
//!
//! The in-memory, versioned state layer of a blockchain state database.
//!
//! ## Architecture
//!
//! The library is split into two major components:
//!
//! 1. **Blockchain** - the hot layer: a tree of in-progress and committed
//!    block states rooted at the last finalized on-disk state. Execution
//!    forks a live block from any recent head, mutates it and commits a
//!    new head; finalizing a head streams the chain below it to a
//!    background flusher.
//! 2. **StateStore** - the cold layer: a paged store holding finalized
//!    state, consumed through batch interfaces.
//!
//! Reads traverse the block's own dictionaries, the committed ancestor
//! chain (skipped wholesale via per-block bit filters), and finally a
//! database batch.
//!
//! ## Modules
//!
//! - `data` - core data structures (NibblePath, Key, SpanDict, BitFilter,
//!   page Pool, lease tracking)
//! - `store` - the cold-store interface and the bundled implementation
//! - `chain` - live blocks, committed snapshots, finalization, read-only
//!   accessors
//! - `merkle` - the state-root computation seam

pub mod chain;
pub mod data;
pub mod merkle;
pub mod store;
