// SPDX-License-Identifier: MPL-2.0

//! The I/O fast path and the end-of-I/O error observer.

pub mod observer;
pub mod path;

pub use observer::{classify, ErrorClass};
pub use path::{submit, Destination, Direction, IoRun};
