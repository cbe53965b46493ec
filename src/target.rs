// SPDX-License-Identifier: MPL-2.0

//! `Target`: the object a host's block-layer glue constructs to plug
//! this crate into an I/O stack. Owns the remap table, the spare
//! allocator (inside the table), the persistence engine, the device
//! handles, and the statistics counters; dispatches I/O and admin
//! commands.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::admin::{self, Command, Response};
use crate::clock::now_ns;
use crate::layers::bio::BlockDevice;
use crate::layers::io::{self, Direction, ErrorClass};
use crate::layers::persist::{self, Engine, LayoutParams, PersistOutcome};
use crate::layers::table::{RemapTable, SpareAllocator};
use crate::prelude::*;
use crate::sector::{LogicalRange, RemapEntry, RemapFlags, Sector, SECTOR_SIZE};
use crate::stats::{self, Stats};

/// Diagnostic-only: how many `Target`s this process has constructed.
/// The one piece of process-wide state this crate keeps.
static INSTANCE_COUNT: AtomicU64 = AtomicU64::new(0);

/// Construction parameters for a `Target`, held by value and threaded
/// through every component rather than read from globals.
#[derive(Clone, Debug)]
pub struct TargetConfig {
    /// Where the logical range `[0, logical_length)` begins on the
    /// physical main device.
    pub logical_start: Sector,
    pub logical_length: u64,
    /// Number of redundant metadata copies. Default 5.
    pub metadata_copies: u32,
    /// Bytes per metadata/persistence block. Default 4096.
    pub block_size: usize,
    /// Blocks between the start of consecutive metadata copies.
    /// Default 32 (128 KiB at the default block size), matching the
    /// source's fixed offsets 0, 32, 64, 96, 128 for 5 copies.
    pub stride_blocks: u64,
    /// Override for where the spare device's data region begins.
    /// `None` derives it from `metadata_copies` and `stride_blocks`.
    pub metadata_region_sectors: Option<u64>,
    /// Overrides the default `std::io::ErrorKind`-based classification
    /// policy. `None` uses `layers::io::classify`. Hosts with richer
    /// status codes (NVMe/SCSI sense data) than `std::io::Error`
    /// exposes can plug in their own mapping here.
    pub classify_error: Option<fn(&std::io::Error) -> ErrorClass>,
}

impl TargetConfig {
    pub fn new(logical_start: Sector, logical_length: u64) -> Self {
        Self {
            logical_start,
            logical_length,
            metadata_copies: 5,
            block_size: 4096,
            stride_blocks: 32,
            metadata_region_sectors: None,
            classify_error: None,
        }
    }

    pub fn with_classify_error(mut self, classifier: fn(&std::io::Error) -> ErrorClass) -> Self {
        self.classify_error = Some(classifier);
        self
    }

    pub fn with_metadata_copies(mut self, n: u32) -> Self {
        self.metadata_copies = n;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_stride_blocks(mut self, stride_blocks: u64) -> Self {
        self.stride_blocks = stride_blocks;
        self
    }

    pub fn with_metadata_region_sectors(mut self, sectors: u64) -> Self {
        self.metadata_region_sectors = Some(sectors);
        self
    }

    fn derived_metadata_region_sectors(&self) -> u64 {
        let sectors_per_block = (self.block_size / SECTOR_SIZE) as u64;
        self.metadata_copies as u64 * self.stride_blocks * sectors_per_block
    }

    /// The first sector of the spare device's data region; everything
    /// before it is reserved for metadata copies.
    pub fn spare_data_start(&self) -> Sector {
        self.metadata_region_sectors.unwrap_or_else(|| self.derived_metadata_region_sectors())
    }

    pub fn logical_range(&self) -> LogicalRange {
        LogicalRange::new(self.logical_length)
    }

    fn layout_params(&self, spare_data_end: Sector) -> LayoutParams {
        LayoutParams {
            logical_length: self.logical_length,
            spare_data_start: self.spare_data_start(),
            spare_data_end,
            copy_count: self.metadata_copies,
            block_size: self.block_size as u32,
        }
    }
}

struct Core {
    table: Arc<RemapTable>,
    engine: Engine,
}

struct InFlightGuard<'a>(&'a AtomicU64);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct Target {
    config: TargetConfig,
    main: Arc<dyn BlockDevice>,
    spare: Arc<dyn BlockDevice>,
    /// A reconfiguration lock: I/O and admin mutations take a read
    /// guard (cheap, concurrent); `restore` takes the write guard to
    /// swap in a freshly recovered table and engine atomically.
    core: RwLock<Core>,
    stats: Stats,
    in_flight: AtomicU64,
    auth_copy_index: AtomicI64,
}

impl Target {
    fn validate_devices(config: &TargetConfig, main: &Arc<dyn BlockDevice>, spare: &Arc<dyn BlockDevice>) -> Result<()> {
        let main_end = config
            .logical_start
            .checked_add(config.logical_length)
            .ok_or_else(|| Error::with_msg(Errno::Internal, "logical range overflows"))?;
        if main_end > main.metadata().nsectors {
            return_errno_with_msg!(Internal, "main device too small for the configured logical range");
        }
        if config.spare_data_start() >= spare.metadata().nsectors {
            return_errno_with_msg!(Internal, "spare device too small to hold the metadata region");
        }
        Ok(())
    }

    /// Creates a fresh target with an empty remap set, ignoring any
    /// prior state already on `spare_device`. Use `open` to recover.
    pub fn create(config: TargetConfig, main_device: Arc<dyn BlockDevice>, spare_device: Arc<dyn BlockDevice>) -> Result<Self> {
        Self::validate_devices(&config, &main_device, &spare_device)?;

        let spare_data_end = spare_device.metadata().nsectors;
        let allocator = SpareAllocator::new(config.spare_data_start(), spare_data_end);
        let table = Arc::new(RemapTable::new(allocator));
        let layout = config.layout_params(spare_data_end);
        let engine = Engine::new(table.clone(), spare_device.clone(), layout, config.stride_blocks, 0);

        INSTANCE_COUNT.fetch_add(1, Ordering::Relaxed);
        info!("target created: logical_length={} metadata_copies={}", config.logical_length, config.metadata_copies);

        Ok(Self {
            config,
            main: main_device,
            spare: spare_device,
            core: RwLock::new(Core { table, engine }),
            stats: Stats::new(),
            in_flight: AtomicU64::new(0),
            auth_copy_index: AtomicI64::new(-1),
        })
    }

    /// Opens a target, recovering prior remap state from the spare
    /// device's authoritative metadata copy if one exists. A target
    /// with zero valid copies opens with an empty remap set rather
    /// than failing.
    pub fn open(config: TargetConfig, main_device: Arc<dyn BlockDevice>, spare_device: Arc<dyn BlockDevice>) -> Result<Self> {
        Self::validate_devices(&config, &main_device, &spare_device)?;

        let spare_data_end = spare_device.metadata().nsectors;
        let summary = persist::open(spare_device.clone(), config.metadata_copies, config.stride_blocks, config.block_size);

        let (entries, starting_seq, auth_idx) = match &summary.record {
            Some(record) => (record.entries.clone(), record.seq + 1, summary.authoritative_copy_index),
            None => (Vec::new(), 0, None),
        };

        let allocator = SpareAllocator::new(config.spare_data_start(), spare_data_end);
        let table = Arc::new(RemapTable::rebuild_from(allocator, entries)?);

        let layout = config.layout_params(spare_data_end);
        let engine = Engine::new(table.clone(), spare_device.clone(), layout, config.stride_blocks, starting_seq);

        if summary.valid_copy_count < summary.copy_count {
            warn!(
                "{}/{} metadata copies valid on open; enqueuing a corrective rewrite",
                summary.valid_copy_count, summary.copy_count
            );
            engine.enqueue();
        }

        INSTANCE_COUNT.fetch_add(1, Ordering::Relaxed);

        Ok(Self {
            config,
            main: main_device,
            spare: spare_device,
            core: RwLock::new(Core { table, engine }),
            stats: Stats::new(),
            in_flight: AtomicU64::new(0),
            auth_copy_index: AtomicI64::new(auth_idx.map(|i| i as i64).unwrap_or(-1)),
        })
    }

    fn submit(&self, direction: Direction, start: Sector, buf: &mut [u8]) -> Result<()> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let core = self.core.read().unwrap();
        io::submit(
            self.config.logical_range(),
            self.config.logical_start,
            &core.table,
            &core.engine,
            &self.stats,
            self.main.as_ref(),
            self.spare.as_ref(),
            direction,
            start,
            buf,
            self.config.classify_error,
        )
    }

    /// Reads `buf.len() / SECTOR_SIZE` sectors starting at logical
    /// sector `start` into `buf`.
    pub fn read(&self, start: Sector, buf: &mut [u8]) -> Result<()> {
        self.submit(Direction::Read, start, buf)
    }

    /// Writes `data` (a multiple of `SECTOR_SIZE` bytes) starting at
    /// logical sector `start`.
    pub fn write(&self, start: Sector, data: &[u8]) -> Result<()> {
        let mut buf = data.to_vec();
        self.submit(Direction::Write, start, &mut buf)
    }

    /// Administrative `add`: allocator picks the spare sector.
    pub fn add(&self, bad: Sector) -> Result<RemapEntry> {
        if !self.config.logical_range().contains(bad) {
            return_errno!(OutOfRange);
        }
        let core = self.core.read().unwrap();
        let entry = core.table.insert_new(bad, now_ns(), RemapFlags::ADMIN)?;
        core.engine.enqueue();
        Ok(entry)
    }

    /// Administrative `test_remap`: caller chooses the spare sector.
    pub fn test_remap(&self, bad: Sector, spare: Sector) -> Result<RemapEntry> {
        if !self.config.logical_range().contains(bad) {
            return_errno!(OutOfRange);
        }
        let spare_data_start = self.config.spare_data_start();
        if spare < spare_data_start {
            return_errno!(SpareReserved);
        }
        if spare >= self.spare.metadata().nsectors {
            return_errno!(OutOfRange);
        }

        let core = self.core.read().unwrap();
        let entry = core.table.insert_specific(bad, spare, now_ns(), RemapFlags::ADMIN)?;
        core.engine.enqueue();
        Ok(entry)
    }

    /// Administrative `remove`.
    pub fn remove(&self, bad: Sector) -> Result<Sector> {
        let core = self.core.read().unwrap();
        let spare = core.table.remove(bad)?;
        core.engine.enqueue();
        Ok(spare)
    }

    /// Administrative `save`: blocks until a cycle covering every prior
    /// mutation has durably completed.
    pub fn save(&self) -> Result<PersistOutcome> {
        self.core.read().unwrap().engine.save_sync()
    }

    /// Administrative `restore`: reloads the authoritative copy from
    /// the spare device and rebuilds the in-memory remap set. Rejected
    /// with `Busy` while any I/O is in flight.
    pub fn restore(&self) -> Result<()> {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return_errno!(Busy);
        }

        let spare_data_end = self.spare.metadata().nsectors;
        let summary = persist::open(self.spare.clone(), self.config.metadata_copies, self.config.stride_blocks, self.config.block_size);
        let record = summary.record.ok_or_else(|| Error::new(Errno::MetadataUnavailable))?;

        let allocator = SpareAllocator::new(self.config.spare_data_start(), spare_data_end);
        let table = Arc::new(RemapTable::rebuild_from(allocator, record.entries)?);
        let layout = self.config.layout_params(spare_data_end);
        let engine = Engine::new(table.clone(), self.spare.clone(), layout, self.config.stride_blocks, record.seq + 1);

        let mut core = self.core.write().unwrap();
        let old_engine = std::mem::replace(&mut core.engine, engine);
        core.table = table;
        if summary.valid_copy_count < summary.copy_count {
            core.engine.enqueue();
        }
        drop(core);

        old_engine.stop_without_save();
        self.auth_copy_index.store(summary.authoritative_copy_index.map(|i| i as i64).unwrap_or(-1), Ordering::SeqCst);

        Ok(())
    }

    /// Performs a final synchronous persistence cycle and releases the
    /// device handles (spec: "the RemapSet is destroyed on target close
    /// after a final persistence write").
    pub fn close(self) -> Result<()> {
        let core = self.core.into_inner().unwrap();
        core.engine.shutdown()
    }

    fn status_line(&self) -> String {
        let core = self.core.read().unwrap();
        let snap = self.stats.snapshot();
        let health = stats::health_score(core.table.allocator_free(), core.table.allocator_capacity());
        format!(
            "entries={} seq={} reads={} writes={} errors={} remapped_ios={} health_score={} auth_copy_index={}",
            core.table.len(),
            core.engine.durable_seq(),
            snap.reads,
            snap.writes,
            snap.errors,
            snap.remapped_ios,
            health,
            self.auth_copy_index.load(Ordering::SeqCst),
        )
    }

    fn stats_line(&self) -> String {
        let core = self.core.read().unwrap();
        let snap = self.stats.snapshot();
        format!(
            "reads={} writes={} errors={} remapped_ios={} auto_remaps={} entries={} spare_free={} spare_capacity={}",
            snap.reads,
            snap.writes,
            snap.errors,
            snap.remapped_ios,
            snap.auto_remaps,
            core.table.len(),
            core.table.allocator_free(),
            core.table.allocator_capacity(),
        )
    }

    /// Parses and dispatches one control-channel line, returning the
    /// line to send back.
    pub fn handle_line(&self, line: &str) -> String {
        match admin::parse_line(line) {
            Ok(cmd) => self.handle_command(cmd).to_line(),
            Err(e) => Response::from(e).to_line(),
        }
    }

    pub fn handle_command(&self, cmd: Command) -> Response {
        match cmd {
            Command::Help => Response::ok(admin::HELP_TEXT),
            Command::Status => Response::ok(self.status_line()),
            Command::Stats => Response::ok(self.stats_line()),
            Command::Add { bad } => match self.add(bad) {
                Ok(entry) => Response::ok(format!("bad={} spare={}", entry.bad, entry.spare)),
                Err(e) => e.into(),
            },
            Command::TestRemap { bad, spare } => match self.test_remap(bad, spare) {
                Ok(entry) => Response::ok(format!("bad={} spare={}", entry.bad, entry.spare)),
                Err(e) => e.into(),
            },
            Command::Remove { bad } => match self.remove(bad) {
                Ok(spare) => Response::ok(format!("bad={bad} spare={spare}")),
                Err(e) => e.into(),
            },
            Command::Save => match self.save() {
                Ok(outcome) => Response::ok(format!("seq={} copies_written={}/{}", outcome.seq, outcome.copies_written, outcome.copy_count)),
                Err(e) => e.into(),
            },
            Command::Restore => match self.restore() {
                Ok(()) => Response::ok(""),
                Err(e) => e.into(),
            },
            Command::ClearStats => {
                self.stats.clear();
                Response::ok("")
            }
        }
    }

    pub fn instance_count() -> u64 {
        INSTANCE_COUNT.load(Ordering::Relaxed)
    }
}
