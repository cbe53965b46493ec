// SPDX-License-Identifier: MPL-2.0

use std::fmt;

/// The error kinds produced by this crate.
///
/// Mirrors the error taxonomy of the design: fast-path validation errors,
/// table/allocator constraints, I/O classification outcomes, metadata
/// integrity outcomes and admin-surface rejections all live in one flat
/// enum so callers can match on `errno()` without downcasting.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Errno {
    /// Sector (or sector range) outside the logical range, or a spare
    /// address outside the data region.
    OutOfRange,
    /// `bad` already has a live remap entry.
    AlreadyMapped,
    /// `bad` has no remap entry.
    NotFound,
    /// The allocator has no free spare sectors.
    SpareExhausted,
    /// The requested spare sector is already assigned to another entry.
    SpareInUse,
    /// The requested spare sector lies in the reserved metadata region.
    SpareReserved,
    /// End-of-I/O status classified as a data/integrity failure.
    MediaError,
    /// End-of-I/O status classified as non-media (link/timeout/etc).
    TransportError,
    /// A metadata copy failed magic/version/layout/CRC validation.
    MetadataCorrupt,
    /// Zero metadata copies validated on open.
    MetadataUnavailable,
    /// Failure writing one or more metadata copies.
    PersistenceIo,
    /// Admin operation rejected because I/O is not quiesced.
    Busy,
    /// Invariant violation. Fatal: the target should stop accepting mutations.
    Internal,
}

/// An error with a kind and an optional static message.
#[derive(Clone, Debug)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
    /// Set only for `PersistenceIo`: how many of the N copies wrote durably.
    copies_written: Option<usize>,
}

impl Error {
    /// Creates a new error with the given kind and no message.
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None, copies_written: None }
    }

    /// Creates a new error with the given kind and message.
    pub const fn with_msg(errno: Errno, msg: &'static str) -> Self {
        Error { errno, msg: Some(msg), copies_written: None }
    }

    /// Creates a `PersistenceIo` error carrying the number of copies that
    /// wrote durably before the cycle gave up.
    pub const fn persistence_io(copies_written: usize) -> Self {
        Error { errno: Errno::PersistenceIo, msg: None, copies_written: Some(copies_written) }
    }

    /// Returns the error kind.
    pub fn errno(&self) -> Errno {
        self.errno
    }

    /// Returns the number of metadata copies written durably, if this is a
    /// `PersistenceIo` error.
    pub fn copies_written(&self) -> Option<usize> {
        self.copies_written
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.msg {
            Some(msg) => write!(f, "{:?}: {}", self.errno, msg),
            None => write!(f, "{:?}", self.errno),
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {}

#[macro_export]
macro_rules! return_errno {
    ($errno:expr) => {
        return ::std::result::Result::Err($crate::error::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_msg {
    ($errno:expr, $msg:expr) => {
        return ::std::result::Result::Err($crate::error::Error::with_msg($errno, $msg))
    };
}

impl From<std::io::Error> for Error {
    fn from(_e: std::io::Error) -> Self {
        Error::with_msg(Errno::TransportError, "underlying device I/O failed")
    }
}
