//! The hot block layer: live blocks, committed snapshots, finalization
//! and read-only access by state root.

mod block;
mod blockchain;
mod flusher;
mod metrics;
mod prefetcher;
mod raw_state;
mod read_only;
mod world_state;

pub use block::{CommittedBlock, LiveBlock};
pub use blockchain::{Blockchain, BlockchainError, ChainEvent, Options, Result};
pub use metrics::{ChainMetrics, ChainMetricsSnapshot};
pub use prefetcher::Prefetcher;
pub use raw_state::RawState;
pub use read_only::{Accessor, ReadOnlyView};
pub use world_state::Account;
