//! The background flusher.
//!
//! A single long-lived thread drains the finalization queue. Each block
//! becomes one writable store batch: metadata stamp, account destroys,
//! then every persistent entry, optionally rewritten by the pre-commit
//! behavior. Batches are committed without a flush while more work is
//! queued; one durable flush closes each drain window.
//!
//! Any error terminates the thread and publishes a failure event. Callers
//! eventually block on the full queue; the process is expected to stop.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Receiver;
use primitive_types::H256;
use tracing::{error, info};

use crate::data::{EntryTag, Key, Lease, NibblePath, SpanDict};
use crate::merkle::PreCommitBehavior;
use crate::store::{CommitOptions, Result, WriteBatch};

use super::block::CommittedBlock;
use super::blockchain::{ChainEvent, ChainInner};

pub(crate) fn run(inner: Arc<ChainInner>, rx: Receiver<Lease<CommittedBlock>>) {
    if let Err(err) = drain_loop(&inner, &rx) {
        error!(error = %err, "flusher failed");
        inner.publish(ChainEvent::FlusherFailure {
            error: err.to_string(),
        });
    }
}

fn drain_loop(inner: &ChainInner, rx: &Receiver<Lease<CommittedBlock>>) -> Result<()> {
    while let Ok(first) = rx.recv() {
        let started = Instant::now();
        let mut last: Option<(u64, H256)> = None;
        let mut current = Some(first);

        while let Some(lease) = current {
            apply_block(inner, &lease, rx.is_empty())?;
            last = Some((lease.block_number(), lease.hash()));
            release_and_notify(inner, &lease);
            drop(lease);

            current = if started.elapsed() < inner.options.min_flush_delay {
                rx.try_recv().ok()
            } else {
                None
            };
        }

        if let Some((block_number, hash)) = last {
            inner.db.flush()?;
            info!(number = block_number, ?hash, "flushed");
            inner.publish(ChainEvent::Flushed { block_number, hash });
        }
    }
    Ok(())
}

/// Applies one committed block to a fresh writable batch.
fn apply_block(inner: &ChainInner, block: &CommittedBlock, queue_empty: bool) -> Result<()> {
    let mut batch = inner.db.begin_next_batch()?;
    batch.set_metadata(block.block_number(), &block.hash());
    if inner.verify_on_commit.load(Ordering::Relaxed) {
        batch.verify_db_pages_on_commit();
    }

    if let Some(destroyed) = block.destroyed() {
        for address in destroyed {
            batch.destroy(&NibblePath::from_hash(address));
        }
    }
    write_persistent_entries(block.merged(), inner.behavior.as_ref(), batch.as_mut());

    // An empty queue ends the drain window; force durability for the
    // last batch and let earlier ones coalesce into it.
    let options = if queue_empty {
        CommitOptions::FlushDataOnly
    } else {
        CommitOptions::DangerNoFlush
    };
    batch.commit(options)?;
    inner.metrics.inc_blocks_flushed();
    Ok(())
}

/// Writes every persistent entry of `dict` into `batch`, giving the
/// behavior a chance to rewrite each value on the way out.
pub(crate) fn write_persistent_entries(
    dict: &SpanDict,
    behavior: &dyn PreCommitBehavior,
    batch: &mut dyn WriteBatch,
) {
    for entry in dict.iter() {
        if entry.meta != EntryTag::Persistent {
            continue;
        }
        let Some((key, _)) = Key::read_from(entry.key) else {
            continue;
        };
        match behavior.inspect_before_apply(&key, entry.value) {
            Some(rewritten) => batch.set_raw(entry.key, &rewritten),
            None => batch.set_raw(entry.key, entry.value),
        }
    }
}

/// Drops the commit-time leases of the flushed block's whole number group
/// (the block itself came through the queue; abandoned fork siblings are
/// released here) and tells the accessor the state is now on disk.
fn release_and_notify(inner: &ChainInner, block: &CommittedBlock) {
    let (siblings, leases) = {
        let mut index = inner.index.lock();
        let siblings: Vec<Arc<CommittedBlock>> = index
            .by_number
            .get(&block.block_number())
            .cloned()
            .unwrap_or_default();
        let leases: Vec<Lease<CommittedBlock>> = siblings
            .iter()
            .filter_map(|sibling| index.owned.remove(&sibling.hash()))
            .collect();
        (siblings, leases)
    };

    let accessor = inner.accessor.lock().clone();
    if let Some(accessor) = accessor {
        accessor.on_commit_to_database(inner, block, &siblings);
    }
    // Outside the index lock: the last release deregisters the block.
    drop(leases);
}
