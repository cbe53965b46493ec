// SPDX-License-Identifier: MPL-2.0

//! The `MetadataRecord` wire format: a fixed little-endian header
//! (bit-exact field offsets, see below) followed by a packed entry
//! body, zero-padded to a block boundary. A single CRC32 covers the
//! header (with its own `crc32` field zeroed during computation) plus
//! the body, not the trailing pad.
//!
//! The header is hand-encoded field-by-field, since its reserved gap
//! and field order don't correspond to any single natural Rust struct
//! layout worth fighting the compiler over. The entry body, which is a
//! uniform repeated record, is encoded via a `zerocopy`-derived raw
//! row type instead.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::prelude::*;
use crate::sector::{RemapEntry, RemapFlags, Sector};

pub const MAGIC: u32 = 0x5350_524D; // b"SPRM" read as a little-endian u32
pub const VERSION: u32 = 1;

const OFF_MAGIC: usize = 0x00;
const OFF_VERSION: usize = 0x04;
const OFF_SEQ: usize = 0x08;
const OFF_TIMESTAMP_NS: usize = 0x10;
const OFF_CRC32: usize = 0x18;
const OFF_ENTRY_COUNT: usize = 0x1C;
const OFF_LOGICAL_LENGTH: usize = 0x20;
const OFF_SPARE_DATA_START: usize = 0x28;
const OFF_SPARE_DATA_END: usize = 0x30;
const OFF_COPY_COUNT: usize = 0x38;
const OFF_BLOCK_SIZE: usize = 0x3C;
const OFF_RESERVED: usize = 0x40;

/// Start of the entry body within a copy.
pub const HEADER_SIZE: usize = 0x130;
const RESERVED_LEN: usize = HEADER_SIZE - OFF_RESERVED;

/// Bytes occupied by one on-disk entry row.
pub const ENTRY_SIZE: usize = 32;

#[derive(Clone, Copy, Debug, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct RawEntry {
    bad: u64,
    spare: u64,
    created_ns: u64,
    error_count: u32,
    flags: u32,
}

/// Geometry parameters self-described by a record's header, needed to
/// validate the body before trusting it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LayoutParams {
    pub logical_length: u64,
    pub spare_data_start: Sector,
    pub spare_data_end: Sector,
    pub copy_count: u32,
    pub block_size: u32,
}

/// A decoded, fully-validated metadata record.
#[derive(Clone, Debug)]
pub struct MetadataRecord {
    pub seq: u64,
    pub timestamp_ns: u64,
    pub layout: LayoutParams,
    pub entries: Vec<RemapEntry>,
}

/// Encodes `entries` under `layout` at counter `seq`/`timestamp_ns`,
/// padded to a whole number of `layout.block_size` blocks.
///
/// Panics only if `layout.block_size` is 0 or smaller than the header,
/// both of which indicate a misconfigured target and are caught at
/// `TargetConfig` construction, never at persistence time.
pub fn encode(seq: u64, timestamp_ns: u64, layout: LayoutParams, entries: &[RemapEntry]) -> Vec<u8> {
    let block_size = layout.block_size as usize;
    assert!(block_size >= HEADER_SIZE, "block_size smaller than the metadata header");

    let body_len = entries.len() * ENTRY_SIZE;
    let record_len = HEADER_SIZE + body_len;
    let padded_len = record_len.div_ceil(block_size) * block_size;

    let mut buf = vec![0u8; padded_len];
    buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&MAGIC.to_le_bytes());
    buf[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&VERSION.to_le_bytes());
    buf[OFF_SEQ..OFF_SEQ + 8].copy_from_slice(&seq.to_le_bytes());
    buf[OFF_TIMESTAMP_NS..OFF_TIMESTAMP_NS + 8].copy_from_slice(&timestamp_ns.to_le_bytes());
    // OFF_CRC32 left zeroed for the checksum pass below.
    buf[OFF_ENTRY_COUNT..OFF_ENTRY_COUNT + 4].copy_from_slice(&(entries.len() as u32).to_le_bytes());
    buf[OFF_LOGICAL_LENGTH..OFF_LOGICAL_LENGTH + 8].copy_from_slice(&layout.logical_length.to_le_bytes());
    buf[OFF_SPARE_DATA_START..OFF_SPARE_DATA_START + 8].copy_from_slice(&layout.spare_data_start.to_le_bytes());
    buf[OFF_SPARE_DATA_END..OFF_SPARE_DATA_END + 8].copy_from_slice(&layout.spare_data_end.to_le_bytes());
    buf[OFF_COPY_COUNT..OFF_COPY_COUNT + 4].copy_from_slice(&layout.copy_count.to_le_bytes());
    buf[OFF_BLOCK_SIZE..OFF_BLOCK_SIZE + 4].copy_from_slice(&block_size_u32(block_size).to_le_bytes());
    // OFF_RESERVED..HEADER_SIZE stays zeroed.
    debug_assert_eq!(RESERVED_LEN, HEADER_SIZE - OFF_RESERVED);

    for (i, entry) in entries.iter().enumerate() {
        let raw = RawEntry {
            bad: entry.bad,
            spare: entry.spare,
            created_ns: entry.created_ns,
            error_count: entry.error_count,
            flags: entry.flags.bits(),
        };
        let start = HEADER_SIZE + i * ENTRY_SIZE;
        buf[start..start + ENTRY_SIZE].copy_from_slice(raw.as_bytes());
    }

    let crc = crc32(&buf[..record_len]);
    buf[OFF_CRC32..OFF_CRC32 + 4].copy_from_slice(&crc.to_le_bytes());
    buf
}

fn block_size_u32(block_size: usize) -> u32 {
    block_size as u32
}

/// Computes the CRC32 a record would carry, treating the `crc32` field
/// itself as zero.
fn crc32(record_prefix: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&record_prefix[..OFF_CRC32]);
    hasher.update(&[0u8; 4]);
    hasher.update(&record_prefix[OFF_CRC32 + 4..]);
    hasher.finalize()
}

/// Reads just the `entry_count` field out of a copy's first block,
/// without validating anything else. Used by the read/open protocol to
/// size the full read before CRC validation is possible.
pub fn peek_entry_count(first_block: &[u8]) -> Option<u32> {
    if first_block.len() < OFF_ENTRY_COUNT + 4 {
        return None;
    }
    Some(u32::from_le_bytes(first_block[OFF_ENTRY_COUNT..OFF_ENTRY_COUNT + 4].try_into().unwrap()))
}

/// Decodes and fully validates a single copy's raw bytes.
///
/// Returns `MetadataCorrupt` on any structural failure: short buffer,
/// bad magic/version, CRC mismatch, or an entry whose `bad`/`spare`
/// falls outside the layout the header itself declares. A copy that
/// fails any of these checks is discarded by the caller, never trusted
/// partially.
pub fn decode(buf: &[u8]) -> Result<MetadataRecord> {
    if buf.len() < HEADER_SIZE {
        return_errno_with_msg!(MetadataCorrupt, "copy shorter than the fixed header");
    }

    let magic = u32::from_le_bytes(buf[OFF_MAGIC..OFF_MAGIC + 4].try_into().unwrap());
    if magic != MAGIC {
        return_errno_with_msg!(MetadataCorrupt, "bad magic");
    }
    let version = u32::from_le_bytes(buf[OFF_VERSION..OFF_VERSION + 4].try_into().unwrap());
    if version != VERSION {
        return_errno_with_msg!(MetadataCorrupt, "unsupported version");
    }

    let seq = u64::from_le_bytes(buf[OFF_SEQ..OFF_SEQ + 8].try_into().unwrap());
    let timestamp_ns = u64::from_le_bytes(buf[OFF_TIMESTAMP_NS..OFF_TIMESTAMP_NS + 8].try_into().unwrap());
    let stored_crc = u32::from_le_bytes(buf[OFF_CRC32..OFF_CRC32 + 4].try_into().unwrap());
    let entry_count = u32::from_le_bytes(buf[OFF_ENTRY_COUNT..OFF_ENTRY_COUNT + 4].try_into().unwrap()) as usize;
    let logical_length = u64::from_le_bytes(buf[OFF_LOGICAL_LENGTH..OFF_LOGICAL_LENGTH + 8].try_into().unwrap());
    let spare_data_start = u64::from_le_bytes(buf[OFF_SPARE_DATA_START..OFF_SPARE_DATA_START + 8].try_into().unwrap());
    let spare_data_end = u64::from_le_bytes(buf[OFF_SPARE_DATA_END..OFF_SPARE_DATA_END + 8].try_into().unwrap());
    let copy_count = u32::from_le_bytes(buf[OFF_COPY_COUNT..OFF_COPY_COUNT + 4].try_into().unwrap());
    let block_size = u32::from_le_bytes(buf[OFF_BLOCK_SIZE..OFF_BLOCK_SIZE + 4].try_into().unwrap());

    let record_len = HEADER_SIZE + entry_count * ENTRY_SIZE;
    if record_len > buf.len() {
        return_errno_with_msg!(MetadataCorrupt, "entry_count overruns the copy");
    }

    let computed_crc = crc32(&buf[..record_len]);
    if computed_crc != stored_crc {
        return_errno_with_msg!(MetadataCorrupt, "crc32 mismatch");
    }

    if spare_data_end <= spare_data_start {
        return_errno_with_msg!(MetadataCorrupt, "empty or inverted spare data region");
    }

    let mut entries = Vec::with_capacity(entry_count);
    for i in 0..entry_count {
        let start = HEADER_SIZE + i * ENTRY_SIZE;
        let raw = RawEntry::read_from_bytes(&buf[start..start + ENTRY_SIZE])
            .map_err(|_| Error::with_msg(Errno::MetadataCorrupt, "truncated entry row"))?;

        if raw.bad >= logical_length {
            return_errno_with_msg!(MetadataCorrupt, "entry bad sector out of logical range");
        }
        if raw.spare < spare_data_start || raw.spare >= spare_data_end {
            return_errno_with_msg!(MetadataCorrupt, "entry spare sector outside data region");
        }

        entries.push(RemapEntry {
            bad: raw.bad,
            spare: raw.spare,
            created_ns: raw.created_ns,
            error_count: raw.error_count,
            flags: RemapFlags::from_bits_truncate(raw.flags),
        });
    }

    Ok(MetadataRecord {
        seq,
        timestamp_ns,
        layout: LayoutParams { logical_length, spare_data_start, spare_data_end, copy_count, block_size },
        entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sector::RemapFlags;

    fn layout() -> LayoutParams {
        LayoutParams { logical_length: 1000, spare_data_start: 200, spare_data_end: 1200, copy_count: 5, block_size: 4096 }
    }

    #[test]
    fn round_trip_preserves_entries_and_header_values() {
        let entries = vec![
            RemapEntry::new(10, 210, 111, RemapFlags::ADMIN),
            RemapEntry::new(20, 220, 222, RemapFlags::AUTO),
        ];
        let buf = encode(7, 999, layout(), &entries);
        assert_eq!(buf.len() % 4096, 0);

        let record = decode(&buf).unwrap();
        assert_eq!(record.seq, 7);
        assert_eq!(record.layout, layout());
        assert_eq!(record.entries.len(), 2);
        assert_eq!(record.entries[0].bad, 10);
        assert_eq!(record.entries[1].bad, 20);
    }

    #[test]
    fn bit_flip_in_body_fails_crc() {
        let entries = vec![RemapEntry::new(1, 201, 1, RemapFlags::ADMIN)];
        let mut buf = encode(1, 1, layout(), &entries);
        // Flip a byte inside the entry row itself, not the trailing
        // block-padding (which the CRC doesn't cover).
        let target = HEADER_SIZE + ENTRY_SIZE - 1;
        buf[target] ^= 0xFF;
        assert_eq!(decode(&buf).unwrap_err().errno(), Errno::MetadataCorrupt);
    }

    #[test]
    fn wrong_magic_rejected() {
        let entries: Vec<RemapEntry> = vec![];
        let mut buf = encode(1, 1, layout(), &entries);
        buf[0] = !buf[0];
        assert_eq!(decode(&buf).unwrap_err().errno(), Errno::MetadataCorrupt);
    }

    #[test]
    fn out_of_range_bad_sector_rejected() {
        // Hand-encode a record whose sole entry has bad >= logical_length
        // without going through a validating constructor.
        let mut entries = vec![RemapEntry::new(1, 201, 1, RemapFlags::ADMIN)];
        entries[0].bad = 5000;
        let buf = encode(1, 1, layout(), &entries);
        assert_eq!(decode(&buf).unwrap_err().errno(), Errno::MetadataCorrupt);
    }

    #[test]
    fn empty_record_round_trips() {
        let buf = encode(0, 0, layout(), &[]);
        let record = decode(&buf).unwrap();
        assert!(record.entries.is_empty());
    }
}
