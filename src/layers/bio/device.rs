// SPDX-License-Identifier: MPL-2.0

//! The block-device seam.
//!
//! `BlockDevice` is the one trait the host's block-layer glue (out of
//! scope for this crate) must implement to plug a real main or spare
//! device into a `Target`. It is deliberately tiny and synchronous:
//! reads/writes suspend the calling thread, matching a plain
//! multi-threaded scheduling model without pulling in an async runtime.
//!
//! Two reference implementations are provided for tests: `MemBlockDevice`
//! (an in-memory disk, with hooks to simulate failing sectors) and
//! `FileBlockDevice` (a thin wrapper over a real file or block special
//! file).

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Mutex;

/// Metadata describing a block device's addressable extent.
#[derive(Debug, Clone, Copy)]
pub struct DeviceMeta {
    /// Total number of 512-byte sectors on the device.
    pub nsectors: u64,
}

/// A synchronous, byte-addressable block device.
///
/// # Thread safety
///
/// Implementations must support concurrent calls from multiple threads;
/// this crate never serializes access to a `BlockDevice` on its own.
pub trait BlockDevice: Send + Sync + std::fmt::Debug {
    /// Reads `buf.len()` bytes starting at `byte_offset`.
    fn read_at(&self, byte_offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// Writes `buf` starting at `byte_offset`.
    fn write_at(&self, byte_offset: u64, buf: &[u8]) -> io::Result<()>;

    /// Ensures prior writes are durable.
    fn flush(&self) -> io::Result<()>;

    /// Returns the device's metadata.
    fn metadata(&self) -> DeviceMeta;
}

/// An in-memory block device, for unit tests and quick simulations.
///
/// Can be told to fail reads or writes to specific sectors, to exercise
/// the error observer / auto-remap path.
pub struct MemBlockDevice {
    data: Mutex<Vec<u8>>,
    nsectors: u64,
    failing_reads: Mutex<std::collections::HashSet<u64>>,
    failing_writes: Mutex<std::collections::HashSet<u64>>,
}

impl MemBlockDevice {
    pub fn new(nsectors: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; nsectors as usize * crate::sector::SECTOR_SIZE]),
            nsectors,
            failing_reads: Mutex::new(std::collections::HashSet::new()),
            failing_writes: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Arranges for reads that touch `sector` to fail with a simulated
    /// media error, until cleared.
    pub fn fail_read(&self, sector: u64) {
        self.failing_reads.lock().unwrap().insert(sector);
    }

    pub fn fail_write(&self, sector: u64) {
        self.failing_writes.lock().unwrap().insert(sector);
    }

    pub fn clear_failures(&self, sector: u64) {
        self.failing_reads.lock().unwrap().remove(&sector);
        self.failing_writes.lock().unwrap().remove(&sector);
    }

    fn sector_range_touches(start_sector: u64, nbytes: usize, failing: &std::collections::HashSet<u64>) -> bool {
        let sector_size = crate::sector::SECTOR_SIZE as u64;
        let nsectors = (nbytes as u64).div_ceil(sector_size);
        (start_sector..start_sector + nsectors).any(|s| failing.contains(&s))
    }
}

impl std::fmt::Debug for MemBlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemBlockDevice").field("nsectors", &self.nsectors).finish()
    }
}

impl BlockDevice for MemBlockDevice {
    fn read_at(&self, byte_offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let sector_size = crate::sector::SECTOR_SIZE as u64;
        let start_sector = byte_offset / sector_size;
        if Self::sector_range_touches(start_sector, buf.len(), &self.failing_reads.lock().unwrap()) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "simulated media error on read"));
        }
        let data = self.data.lock().unwrap();
        let start = byte_offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of device"));
        }
        buf.copy_from_slice(&data[start..end]);
        Ok(())
    }

    fn write_at(&self, byte_offset: u64, buf: &[u8]) -> io::Result<()> {
        let sector_size = crate::sector::SECTOR_SIZE as u64;
        let start_sector = byte_offset / sector_size;
        if Self::sector_range_touches(start_sector, buf.len(), &self.failing_writes.lock().unwrap()) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "simulated media error on write"));
        }
        let mut data = self.data.lock().unwrap();
        let start = byte_offset as usize;
        let end = start + buf.len();
        if end > data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "write past end of device"));
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }

    fn metadata(&self) -> DeviceMeta {
        DeviceMeta { nsectors: self.nsectors }
    }
}

/// A block device backed by a real file (or Linux block special file).
pub struct FileBlockDevice {
    file: File,
    nsectors: u64,
}

impl FileBlockDevice {
    /// Opens `path` and treats it as a device of `nsectors` 512-byte
    /// sectors. The caller is responsible for having sized the backing
    /// file (or block device) appropriately.
    pub fn open(file: File, nsectors: u64) -> Self {
        Self { file, nsectors }
    }
}

impl std::fmt::Debug for FileBlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBlockDevice").field("nsectors", &self.nsectors).finish()
    }
}

impl BlockDevice for FileBlockDevice {
    fn read_at(&self, byte_offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, byte_offset)
    }

    fn write_at(&self, byte_offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.write_all_at(buf, byte_offset)
    }

    fn flush(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn metadata(&self) -> DeviceMeta {
        DeviceMeta { nsectors: self.nsectors }
    }
}
