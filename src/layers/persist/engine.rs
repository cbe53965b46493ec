// SPDX-License-Identifier: MPL-2.0

//! The persistence engine: a dedicated worker thread that encodes the
//! current remap set into `copy_count` redundant on-disk copies and
//! advances the durable `seq` counter, mirroring the single-slot
//! request queue described for this component — mutation callers
//! enqueue a wake token, the worker dequeues, snapshots, encodes and
//! writes, and at most one cycle is ever in flight. Concurrent
//! requests that arrive while a cycle runs are coalesced into the next
//! one rather than queued individually, the same group-commit shape an
//! edit-log compaction pass uses to batch edits into one cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use super::codec::{self, LayoutParams, MetadataRecord};
use crate::clock::now_ns;
use crate::layers::bio::{BlockDevice, BufMut, BufRef, BufferedBlockIo};
use crate::layers::table::RemapTable;
use crate::prelude::*;

/// The result of one completed persistence cycle.
#[derive(Clone, Copy, Debug)]
pub struct PersistOutcome {
    pub seq: u64,
    pub copies_written: usize,
    pub copy_count: usize,
}

/// The outcome of reading all copies on target creation/`restore`.
pub struct OpenSummary {
    pub record: Option<MetadataRecord>,
    pub authoritative_copy_index: Option<usize>,
    pub valid_copy_count: usize,
    pub copy_count: usize,
}

struct CycleState {
    /// Bumped once per `enqueue`/`save_sync` call.
    dirty_gen: u64,
    /// The highest generation a completed cycle has incorporated.
    completed_gen: u64,
    last_outcome: Option<std::result::Result<PersistOutcome, Error>>,
    shutdown: bool,
    /// Set by `stop_without_save`: exit immediately, even with pending
    /// dirty work, rather than draining it like a normal `shutdown`.
    abandon: bool,
}

struct Shared {
    io: BufferedBlockIo,
    table: Arc<RemapTable>,
    layout: LayoutParams,
    stride_blocks: u64,
    next_seq: AtomicU64,
    durable_seq: AtomicU64,
    state: Mutex<CycleState>,
    cond: Condvar,
}

/// Owns the worker thread that performs persistence cycles for one
/// target. Dropping an `Engine` without calling `shutdown` first leaks
/// the thread until the process exits (`Target::close` always calls
/// `shutdown`).
pub struct Engine {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Engine {
    /// Spawns the worker and returns an engine ready to accept
    /// `enqueue`/`save_sync` calls. `starting_seq` is the `seq` the
    /// first cycle should write (one past the last durable `seq`
    /// recovered on open, or 0 for a fresh target).
    pub fn new(table: Arc<RemapTable>, spare_device: Arc<dyn BlockDevice>, layout: LayoutParams, stride_blocks: u64, starting_seq: u64) -> Self {
        let shared = Arc::new(Shared {
            io: BufferedBlockIo::new(spare_device),
            table,
            layout,
            stride_blocks,
            next_seq: AtomicU64::new(starting_seq),
            durable_seq: AtomicU64::new(starting_seq.saturating_sub(1)),
            state: Mutex::new(CycleState { dirty_gen: 0, completed_gen: 0, last_outcome: None, shutdown: false, abandon: false }),
            cond: Condvar::new(),
        });

        let worker_shared = shared.clone();
        let worker = std::thread::spawn(move || Self::worker_loop(worker_shared));

        Self { shared, worker: Some(worker) }
    }

    /// Fire-and-forget: marks the set dirty and returns immediately.
    /// Used by auto-remap and by admin mutations that don't need to
    /// block on durability.
    pub fn enqueue(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.dirty_gen += 1;
        self.shared.cond.notify_all();
    }

    /// Blocks until a cycle that incorporates every mutation made
    /// before this call has durably completed (or failed with zero
    /// copies written). Used by admin `save`.
    pub fn save_sync(&self) -> Result<PersistOutcome> {
        let target_gen = {
            let mut state = self.shared.state.lock().unwrap();
            state.dirty_gen += 1;
            self.shared.cond.notify_all();
            state.dirty_gen
        };

        let mut state = self.shared.state.lock().unwrap();
        while state.completed_gen < target_gen {
            state = self.shared.cond.wait(state).unwrap();
        }
        state.last_outcome.clone().expect("a cycle completed without recording an outcome")
    }

    /// The highest `seq` known to be durable across at least one copy.
    pub fn durable_seq(&self) -> u64 {
        self.shared.durable_seq.load(Ordering::SeqCst)
    }

    /// Performs a final synchronous cycle and stops the worker thread.
    pub fn shutdown(mut self) -> Result<()> {
        let outcome = self.save_sync();
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        outcome.map(|_| ())
    }

    /// Stops the worker thread without persisting current state first.
    /// Used by `restore`, which is replacing this engine's table with
    /// one freshly loaded from disk — saving the about-to-be-discarded
    /// in-memory state would be wrong.
    pub fn stop_without_save(mut self) {
        let mut state = self.shared.state.lock().unwrap();
        state.shutdown = true;
        state.abandon = true;
        self.shared.cond.notify_all();
        drop(state);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }

    fn worker_loop(shared: Arc<Shared>) {
        loop {
            let target_gen = {
                let mut state = shared.state.lock().unwrap();
                while state.dirty_gen <= state.completed_gen && !state.shutdown {
                    state = shared.cond.wait(state).unwrap();
                }
                if state.abandon || (state.shutdown && state.dirty_gen <= state.completed_gen) {
                    return;
                }
                state.dirty_gen
            };

            let outcome = Self::run_cycle(&shared);

            let mut state = shared.state.lock().unwrap();
            state.completed_gen = target_gen;
            state.last_outcome = Some(outcome);
            shared.cond.notify_all();
        }
    }

    fn run_cycle(shared: &Shared) -> Result<PersistOutcome> {
        let seq = shared.next_seq.fetch_add(1, Ordering::SeqCst);
        let entries = shared.table.snapshot_for_serialize();
        let timestamp_ns = now_ns();
        let record = codec::encode(seq, timestamp_ns, shared.layout, &entries);

        let block_size = shared.layout.block_size as usize;
        let copy_count = shared.layout.copy_count;
        let nblocks_per_copy = record.len() / block_size;

        let mut copy_start_blocks = Vec::with_capacity(copy_count as usize);
        for copy_idx in 0..copy_count {
            let start_block = copy_idx as u64 * shared.stride_blocks;
            for (i, chunk) in record.chunks(block_size).enumerate() {
                shared.io.write_block(start_block + i as u64, BufRef::new(chunk));
            }
            copy_start_blocks.push(start_block);
        }

        let (failed_blocks, flush_result) = shared.io.flush_report();

        let copies_written = if flush_result.is_err() {
            0
        } else {
            copy_start_blocks
                .iter()
                .filter(|&&start| (start..start + nblocks_per_copy as u64).all(|b| !failed_blocks.contains(&b)))
                .count()
        };

        if copies_written == 0 {
            shared.next_seq.store(seq, Ordering::SeqCst);
            return Err(Error::persistence_io(0));
        }

        shared.durable_seq.store(seq, Ordering::SeqCst);
        shared.table.mark_all_persisted();

        if copies_written < copy_count as usize {
            warn!("persistence cycle seq={seq} wrote {copies_written}/{copy_count} copies; degraded");
        } else {
            debug!("persistence cycle seq={seq} wrote all {copy_count} copies");
        }

        Ok(PersistOutcome { seq, copies_written, copy_count: copy_count as usize })
    }
}

/// Reads and validates all `copy_count` metadata copies and selects the
/// authoritative one (max `seq`; ties by `timestamp_ns`, then lowest
/// copy index). Used on target creation/open and by `restore`.
pub fn open(spare_device: Arc<dyn BlockDevice>, copy_count: u32, stride_blocks: u64, block_size: usize) -> OpenSummary {
    let io = BufferedBlockIo::new(spare_device);

    let mut best: Option<(usize, MetadataRecord)> = None;
    let mut valid_copy_count = 0usize;

    for copy_idx in 0..copy_count as usize {
        let start_block = copy_idx as u64 * stride_blocks;
        match read_copy(&io, start_block, stride_blocks, block_size) {
            Ok(record) => {
                valid_copy_count += 1;
                let better = match &best {
                    None => true,
                    Some((best_idx, best_rec)) => {
                        (record.seq, record.timestamp_ns) > (best_rec.seq, best_rec.timestamp_ns)
                            || (record.seq == best_rec.seq && record.timestamp_ns == best_rec.timestamp_ns && copy_idx < *best_idx)
                    }
                };
                if better {
                    best = Some((copy_idx, record));
                }
            }
            Err(e) => {
                warn!("metadata copy {copy_idx} invalid: {e}");
            }
        }
    }

    if valid_copy_count == 0 {
        info!("no prior state found on spare device; starting with an empty remap set");
    }

    match best {
        Some((idx, record)) => {
            OpenSummary { record: Some(record), authoritative_copy_index: Some(idx), valid_copy_count, copy_count: copy_count as usize }
        }
        None => OpenSummary { record: None, authoritative_copy_index: None, valid_copy_count, copy_count: copy_count as usize },
    }
}

fn read_copy(io: &BufferedBlockIo, start_block: u64, stride_blocks: u64, block_size: usize) -> Result<MetadataRecord> {
    let mut first_block = vec![0u8; block_size];
    io.read_block(start_block, BufMut::new(&mut first_block))?;

    let entry_count = codec::peek_entry_count(&first_block)
        .ok_or_else(|| Error::with_msg(Errno::MetadataCorrupt, "block size smaller than header"))? as usize;

    let body_len = entry_count
        .checked_mul(codec::ENTRY_SIZE)
        .ok_or_else(|| Error::with_msg(Errno::MetadataCorrupt, "entry_count overflow"))?;
    let record_len = codec::HEADER_SIZE
        .checked_add(body_len)
        .ok_or_else(|| Error::with_msg(Errno::MetadataCorrupt, "entry_count overflow"))?;

    let reserved_len = stride_blocks as usize * block_size;
    if record_len > reserved_len {
        return_errno_with_msg!(MetadataCorrupt, "entry_count exceeds this copy's reserved region");
    }

    let padded_len = record_len.div_ceil(block_size) * block_size;
    let mut buf = first_block;
    buf.resize(padded_len, 0);
    for i in 1..(padded_len / block_size) {
        let mut block = vec![0u8; block_size];
        io.read_block(start_block + i as u64, BufMut::new(&mut block))?;
        buf[i * block_size..(i + 1) * block_size].copy_from_slice(&block);
    }

    codec::decode(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::bio::MemBlockDevice;
    use crate::layers::table::SpareAllocator;
    use crate::sector::RemapFlags;

    fn layout() -> LayoutParams {
        LayoutParams { logical_length: 1000, spare_data_start: 32, spare_data_end: 1032, copy_count: 3, block_size: 4096 }
    }

    fn spare_device() -> Arc<dyn BlockDevice> {
        // 3 copies * 1 block stride + 1032 data sectors worth of space.
        let sectors = 3 * 8 /* blocks/sector at 512B sectors, 4096/512=8 */ + 1032;
        Arc::new(MemBlockDevice::new(sectors as u64))
    }

    #[test]
    fn save_sync_then_open_round_trips() {
        let table = Arc::new(RemapTable::new(SpareAllocator::new(32, 1032)));
        table.insert_new(10, 1, RemapFlags::ADMIN).unwrap();
        table.insert_new(20, 2, RemapFlags::ADMIN).unwrap();

        let device = spare_device();
        let engine = Engine::new(table.clone(), device.clone(), layout(), 1, 0);
        let outcome = engine.save_sync().unwrap();
        assert_eq!(outcome.copies_written, 3);
        engine.shutdown().unwrap();

        let summary = open(device, 3, 1, 4096);
        assert_eq!(summary.valid_copy_count, 3);
        let record = summary.record.unwrap();
        assert_eq!(record.entries.len(), 2);
    }

    #[test]
    fn two_consecutive_saves_increment_seq_by_one() {
        let table = Arc::new(RemapTable::new(SpareAllocator::new(32, 1032)));
        let device = spare_device();
        let engine = Engine::new(table, device, layout(), 1, 0);

        let first = engine.save_sync().unwrap();
        let second = engine.save_sync().unwrap();
        assert_eq!(second.seq, first.seq + 1);
        engine.shutdown().unwrap();
    }

    #[test]
    fn zero_valid_copies_yields_empty_summary() {
        let device = spare_device();
        let summary = open(device, 3, 1, 4096);
        assert_eq!(summary.valid_copy_count, 0);
        assert!(summary.record.is_none());
    }
}
