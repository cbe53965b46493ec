// SPDX-License-Identifier: MPL-2.0

//! The core addressing and record types: logical/spare sector ids and
//! the `RemapEntry` record that ties them together.

use std::ops::Range;

use bitflags::bitflags;

/// A 512-byte logical unit, addressed by a 64-bit index.
///
/// Distinct from a spare-device sector (`SpareSector`) at the type level
/// so that the two address spaces can never be confused at a call site,
/// the way `aster-block`'s `BlockId<const N: u16>` keeps block and sector
/// indices apart.
pub type Sector = u64;

/// The size in bytes of one logical or spare sector.
pub const SECTOR_SIZE: usize = 512;

/// The contiguous logical range `[0, L)` a target exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogicalRange {
    len: u64,
}

impl LogicalRange {
    pub const fn new(len: u64) -> Self {
        Self { len }
    }

    pub const fn len(&self) -> u64 {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns whether `sector` lies within `[0, L)`.
    pub fn contains(&self, sector: Sector) -> bool {
        sector < self.len
    }

    /// Returns whether the whole `range` lies within `[0, L)`.
    ///
    /// An empty range is considered in range only if its start is within
    /// bounds (or the range is entirely empty), matching the "validate
    /// the I/O range" contract in the I/O path.
    pub fn contains_range(&self, range: &Range<Sector>) -> bool {
        if range.start > range.end {
            return false;
        }
        range.end <= self.len
    }
}

bitflags! {
    /// Provenance and state bits for a `RemapEntry`.
    ///
    /// Bits 0-3 encode provenance, bits 4-7 encode lifecycle state. Kept as
    /// plain `u32` flags (not an enum) because both axes are independent
    /// and the on-disk format commits to a `u32` field (see
    /// `layers::persist::codec`).
    #[derive(Default)]
    pub struct RemapFlags: u32 {
        /// Created by an administrative `add`/`test_remap` command.
        const ADMIN = 0b0000_0001;
        /// Created by the error observer in response to a media error.
        const AUTO = 0b0000_0010;
        /// Entry is live and visible to the I/O path.
        const LIVE = 0b0001_0000;
        /// Entry has been mutated since the last durable persistence cycle.
        const PENDING_WRITE = 0b0010_0000;
        /// Entry is administratively quarantined (reserved for future use;
        /// no command in this crate currently sets it, but the bit is part
        /// of the on-disk format and must round-trip).
        const QUARANTINED = 0b0100_0000;
    }
}

/// A single bad-sector-to-spare-sector remap.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RemapEntry {
    /// The logical sector being redirected. Unique across the live set.
    pub bad: Sector,
    /// The spare-device sector backing `bad`. Unique across the live set.
    pub spare: Sector,
    /// Wall-clock nanoseconds at insertion.
    pub created_ns: u64,
    /// Observed failures attributed to `bad` since insertion.
    pub error_count: u32,
    pub flags: RemapFlags,
}

impl RemapEntry {
    pub fn new(bad: Sector, spare: Sector, created_ns: u64, flags: RemapFlags) -> Self {
        Self { bad, spare, created_ns, error_count: if flags.contains(RemapFlags::AUTO) { 1 } else { 0 }, flags: flags | RemapFlags::LIVE }
    }
}
