// SPDX-License-Identifier: MPL-2.0

//! The layer of block I/O: a device abstraction, block-aligned buffers,
//! and a 4 KiB write-back cache used by the persistence engine.

mod block_buf;
mod buffered;
mod device;

pub use block_buf::{Buf, BufMut, BufRef};
pub use buffered::BufferedBlockIo;
pub use device::{BlockDevice, DeviceMeta, FileBlockDevice, MemBlockDevice};

/// The block size used for metadata I/O against the spare device.
pub const BLOCK_SIZE: usize = 4096;
