// SPDX-License-Identifier: MPL-2.0

//! Buffers whose length is guaranteed (at construction) to be a multiple
//! of `BLOCK_SIZE`: an owned `Buf` plus borrowed `BufRef`/`BufMut` views,
//! built on plain `std::vec::Vec`.

use super::BLOCK_SIZE;
use crate::prelude::*;

/// An owned, block-aligned buffer.
#[derive(Clone)]
pub struct Buf(Vec<u8>);

impl Buf {
    /// Allocates `num_blocks` zeroed blocks.
    pub fn alloc(num_blocks: usize) -> Result<Self> {
        if num_blocks == 0 {
            return_errno_with_msg!(Internal, "num_blocks must be nonzero");
        }
        Ok(Self(vec![0u8; num_blocks * BLOCK_SIZE]))
    }

    pub fn nblocks(&self) -> usize {
        self.0.len() / BLOCK_SIZE
    }

    /// Copies a borrowed view into a freshly owned buffer, e.g. to stage a
    /// block in a write-back cache past the lifetime of the caller's slice.
    pub fn from_ref(buf: BufRef<'_>) -> Self {
        Self(buf.as_slice().to_vec())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.0
    }

    pub fn as_ref(&self) -> BufRef<'_> {
        BufRef(self.as_slice())
    }

    pub fn as_mut(&mut self) -> BufMut<'_> {
        BufMut(self.0.as_mut_slice())
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.0
    }
}

/// An immutably-borrowed, block-aligned buffer.
#[derive(Clone, Copy)]
pub struct BufRef<'a>(&'a [u8]);

impl<'a> BufRef<'a> {
    pub fn new(slice: &'a [u8]) -> Self {
        debug_assert!(slice.len() % BLOCK_SIZE == 0);
        Self(slice)
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0
    }

    pub fn nblocks(&self) -> usize {
        self.0.len() / BLOCK_SIZE
    }
}

/// A mutably-borrowed, block-aligned buffer.
pub struct BufMut<'a>(&'a mut [u8]);

impl<'a> BufMut<'a> {
    pub fn new(slice: &'a mut [u8]) -> Self {
        debug_assert!(slice.len() % BLOCK_SIZE == 0);
        Self(slice)
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.0
    }

    pub fn as_slice(&self) -> &[u8] {
        self.0
    }

    pub fn nblocks(&self) -> usize {
        self.0.len() / BLOCK_SIZE
    }
}
