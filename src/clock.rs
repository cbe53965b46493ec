// SPDX-License-Identifier: MPL-2.0

//! The crate's single wall-clock touchpoint, used to stamp
//! `RemapEntry::created_ns` and `MetadataRecord::timestamp_ns`. Kept in
//! one place so the rest of the crate never calls `SystemTime::now()`
//! directly, so process-wide state stays limited to a few
//! clearly-documented spots.

use std::time::{SystemTime, UNIX_EPOCH};

/// Nanoseconds since the Unix epoch, saturating at 0 if the clock is
/// somehow set before it.
pub fn now_ns() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos() as u64).unwrap_or(0)
}
