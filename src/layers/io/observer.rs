// SPDX-License-Identifier: MPL-2.0

//! The end-of-I/O observer: classifies a failed I/O against the main
//! device and decides whether it warrants an automatic remap.
//!
//! Only a single failing sector (a run of length 1) whose error
//! classifies as `Media` triggers an immediate remap. A failing
//! multi-sector run against the main device is surfaced without
//! remapping anything — the core cannot tell which offset within the
//! run actually failed without per-offset status from the device, so
//! it leaves remapping to the caller's retry-at-finer-granularity
//! behavior, which resubmits as single-sector I/Os that this same path
//! then handles individually.

use crate::clock::now_ns;
use crate::layers::persist::Engine;
use crate::layers::table::RemapTable;
use crate::prelude::*;
use crate::sector::RemapFlags;
use crate::stats::Stats;

use super::path::{Destination, IoRun};

/// How an end-of-I/O status is classified for auto-remap purposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Data/integrity failure on the device — the sector itself is bad.
    Media,
    /// Link/timeout/other non-media failure.
    Transport,
    /// The I/O was cancelled rather than failed.
    Cancelled,
}

/// The default classification policy: a single function the core
/// calls, defaulting unknown statuses to `Transport` so they never
/// trigger a remap. Hosts with richer status codes than
/// `std::io::Error` (NVMe/SCSI sense data, for example) can override
/// this via `TargetConfig::classify_error`.
pub fn classify(err: &std::io::Error) -> ErrorClass {
    use std::io::ErrorKind;
    match err.kind() {
        ErrorKind::InvalidData => ErrorClass::Media,
        ErrorKind::Interrupted => ErrorClass::Cancelled,
        _ => ErrorClass::Transport,
    }
}

/// Observes one run's failure, applies the auto-remap policy, records
/// statistics, and returns the `Error` to propagate to the originating
/// I/O: the pre-remap result, since the caller always observes the
/// failure and the remap only takes effect on subsequent I/Os.
/// `classifier` overrides the default `classify` policy, for hosts with
/// richer status codes than `std::io::Error` exposes.
pub fn observe_run_failure(
    table: &RemapTable,
    engine: &Engine,
    stats: &Stats,
    run: IoRun,
    err: std::io::Error,
    classifier: Option<fn(&std::io::Error) -> ErrorClass>,
) -> Error {
    let class = classifier.unwrap_or(classify)(&err);
    stats.record_error();

    if let Destination::Main(bad) = run.destination {
        if run.nsectors == 1 && class == ErrorClass::Media {
            auto_remap(table, engine, stats, bad);
        }
    }

    match class {
        ErrorClass::Media => Error::with_msg(Errno::MediaError, "media error on main device"),
        ErrorClass::Transport => Error::with_msg(Errno::TransportError, "transport error"),
        ErrorClass::Cancelled => Error::with_msg(Errno::TransportError, "I/O cancelled"),
    }
}

/// Idempotent: if `bad` is already mapped, just bumps `error_count`;
/// otherwise allocates a spare and inserts a new `AUTO` entry. Either
/// way it strictly increases entry count or `error_count`, never both
/// decreasing (the monotonicity property).
fn auto_remap(table: &RemapTable, engine: &Engine, stats: &Stats, bad: u64) {
    if table.bump_error_count(bad).is_ok() {
        stats.record_auto_remap();
        return;
    }

    match table.insert_new(bad, now_ns(), RemapFlags::AUTO) {
        Ok(entry) => {
            info!("auto-remap: bad={bad} -> spare={}", entry.spare);
            stats.record_auto_remap();
            engine.enqueue();
        }
        Err(e) if e.errno() == Errno::SpareExhausted => {
            warn!("auto-remap skipped for bad={bad}: spare allocator exhausted");
        }
        Err(e) => {
            error!("auto-remap failed for bad={bad}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(destination: Destination) -> IoRun {
        IoRun { origin_offset: 0, nsectors: 1, destination }
    }

    #[test]
    fn observe_failure_auto_remaps_single_sector_media_error_on_main() {
        let table = RemapTable::new(crate::layers::table::SpareAllocator::new(1000, 2000));
        let stats = Stats::new();
        let engine_table = std::sync::Arc::new(RemapTable::new(crate::layers::table::SpareAllocator::new(1000, 2000)));
        let device = std::sync::Arc::new(crate::layers::bio::MemBlockDevice::new(16));
        let layout = crate::layers::persist::LayoutParams { logical_length: 100, spare_data_start: 1000, spare_data_end: 2000, copy_count: 1, block_size: 4096 };
        let engine = Engine::new(engine_table, device, layout, 1, 0);

        let err = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad sector");
        let returned = observe_run_failure(&table, &engine, &stats, run(Destination::Main(42)), err, None);
        assert_eq!(returned.errno(), Errno::MediaError);
        assert!(table.lookup(42).is_some());
        assert_eq!(stats.snapshot().auto_remaps, 1);
        engine.shutdown().unwrap();
    }

    #[test]
    fn classify_invalid_data_is_media() {
        let err = std::io::Error::new(std::io::ErrorKind::InvalidData, "x");
        assert_eq!(classify(&err), ErrorClass::Media);
    }

    #[test]
    fn classify_unknown_kind_defaults_to_transport() {
        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "x");
        assert_eq!(classify(&err), ErrorClass::Transport);
    }

    #[test]
    fn classify_interrupted_is_cancelled() {
        let err = std::io::Error::new(std::io::ErrorKind::Interrupted, "x");
        assert_eq!(classify(&err), ErrorClass::Cancelled);
    }
}
