// SPDX-License-Identifier: MPL-2.0

//! The I/O path: validates range, consults the remap table once per
//! covered sector, splits a multi-sector I/O into maximal runs sharing
//! one destination, and forwards each run. Modeled on
//! `kernel/comps/block/src/request_queue.rs`'s own bio-merging
//! discipline (`can_merge`/`merge_bio`), generalized from "can two
//! adjacent bios merge" to "do two adjacent sectors share a
//! destination".

use super::observer::{self, ErrorClass};
use crate::layers::bio::BlockDevice;
use crate::layers::persist::Engine;
use crate::layers::table::RemapTable;
use crate::prelude::*;
use crate::sector::{LogicalRange, Sector, SECTOR_SIZE};
use crate::stats::Stats;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination {
    Main(Sector),
    Spare(Sector),
}

/// A maximal subrange of an I/O sharing a single destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoRun {
    /// Offset, in sectors, from the start of the originating I/O.
    pub origin_offset: u64,
    pub nsectors: u64,
    pub destination: Destination,
}

fn destination_of(table: &RemapTable, sector: Sector) -> Destination {
    table.lookup(sector).map(Destination::Spare).unwrap_or(Destination::Main(sector))
}

/// Splits `[start, start + nsectors)` into maximal runs whose sectors
/// share one destination: either all forwarded to the main device
/// unchanged, or a contiguous run on the spare device.
pub fn plan_runs(table: &RemapTable, start: Sector, nsectors: u64) -> Vec<IoRun> {
    let mut runs = Vec::new();
    let mut offset = 0u64;

    while offset < nsectors {
        let head = destination_of(table, start + offset);
        let mut run_len = 1u64;

        while offset + run_len < nsectors {
            let next = destination_of(table, start + offset + run_len);
            let contiguous = match (head, next) {
                (Destination::Main(_), Destination::Main(_)) => true,
                (Destination::Spare(s0), Destination::Spare(s1)) => s1 == s0 + run_len,
                _ => false,
            };
            if !contiguous {
                break;
            }
            run_len += 1;
        }

        runs.push(IoRun { origin_offset: offset, nsectors: run_len, destination: head });
        offset += run_len;
    }

    runs
}

/// Dispatches one I/O of `buf.len() / SECTOR_SIZE` sectors starting at
/// logical sector `start`. `buf` is filled on `Read`, read from on
/// `Write`. Fails fast with `OutOfRange` before touching any device if
/// the covered range isn't entirely within `logical_range`. Runs
/// forwarded to the main device are translated by `main_offset`
/// (logical sector 0 corresponds to `main_offset` on the physical main
/// device); spare destinations are already device-absolute.
#[allow(clippy::too_many_arguments)]
pub fn submit(
    logical_range: LogicalRange,
    main_offset: Sector,
    table: &RemapTable,
    engine: &Engine,
    stats: &Stats,
    main: &dyn BlockDevice,
    spare: &dyn BlockDevice,
    direction: Direction,
    start: Sector,
    buf: &mut [u8],
    classifier: Option<fn(&std::io::Error) -> ErrorClass>,
) -> Result<()> {
    if buf.len() % SECTOR_SIZE != 0 {
        return_errno_with_msg!(Internal, "I/O buffer length is not sector-aligned");
    }
    let nsectors = (buf.len() / SECTOR_SIZE) as u64;
    let end = start.checked_add(nsectors).ok_or(Error::new(Errno::OutOfRange))?;
    if !logical_range.contains_range(&(start..end)) {
        return_errno!(OutOfRange);
    }

    match direction {
        Direction::Read => stats.record_read(),
        Direction::Write => stats.record_write(),
    }

    let runs = plan_runs(table, start, nsectors);
    let mut any_remapped = false;

    for run in runs {
        if matches!(run.destination, Destination::Spare(_)) {
            any_remapped = true;
        }

        let run_start = run.origin_offset as usize * SECTOR_SIZE;
        let run_end = run_start + run.nsectors as usize * SECTOR_SIZE;
        let run_buf = &mut buf[run_start..run_end];

        let (device, physical_sector) = match run.destination {
            Destination::Main(s) => (main, main_offset + s),
            Destination::Spare(s) => (spare, s),
        };
        let byte_offset = physical_sector * SECTOR_SIZE as u64;

        let result = match direction {
            Direction::Read => device.read_at(byte_offset, run_buf),
            Direction::Write => device.write_at(byte_offset, run_buf),
        };

        if let Err(io_err) = result {
            return Err(observer::observe_run_failure(table, engine, stats, run, io_err, classifier));
        }
    }

    if any_remapped {
        stats.record_remapped_io();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::table::SpareAllocator;
    use crate::sector::RemapFlags;

    fn table_with(remaps: &[(Sector, Sector)]) -> RemapTable {
        let t = RemapTable::new(SpareAllocator::new(1000, 2000));
        for &(bad, spare) in remaps {
            t.insert_specific(bad, spare, 1, RemapFlags::ADMIN).unwrap();
        }
        t
    }

    #[test]
    fn all_unmapped_is_one_main_run() {
        let t = table_with(&[]);
        let runs = plan_runs(&t, 10, 5);
        assert_eq!(runs, vec![IoRun { origin_offset: 0, nsectors: 5, destination: Destination::Main(10) }]);
    }

    #[test]
    fn single_mapped_sector_is_one_spare_run() {
        let t = table_with(&[(10, 1500)]);
        let runs = plan_runs(&t, 10, 1);
        assert_eq!(runs, vec![IoRun { origin_offset: 0, nsectors: 1, destination: Destination::Spare(1500) }]);
    }

    #[test]
    fn mixed_destinations_split_into_maximal_runs() {
        // sectors 10,11 unmapped; 12 -> 1500; 13 -> 1501 (contiguous spare); 14 unmapped
        let t = table_with(&[(12, 1500), (13, 1501)]);
        let runs = plan_runs(&t, 10, 5);
        assert_eq!(
            runs,
            vec![
                IoRun { origin_offset: 0, nsectors: 2, destination: Destination::Main(10) },
                IoRun { origin_offset: 2, nsectors: 2, destination: Destination::Spare(1500) },
                IoRun { origin_offset: 4, nsectors: 1, destination: Destination::Main(14) },
            ]
        );
    }

    #[test]
    fn noncontiguous_spare_sectors_do_not_merge() {
        // 12 -> 1500, 13 -> 1600: both mapped but not a contiguous spare run.
        let t = table_with(&[(12, 1500), (13, 1600)]);
        let runs = plan_runs(&t, 12, 2);
        assert_eq!(
            runs,
            vec![
                IoRun { origin_offset: 0, nsectors: 1, destination: Destination::Spare(1500) },
                IoRun { origin_offset: 1, nsectors: 1, destination: Destination::Spare(1600) },
            ]
        );
    }
}
