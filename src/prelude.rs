// SPDX-License-Identifier: MPL-2.0

pub(crate) use crate::{
    error::{Errno, Errno::*, Error},
    return_errno, return_errno_with_msg,
};

pub(crate) type Result<T> = std::result::Result<T, Error>;

pub(crate) use log::{debug, error, info, trace, warn};
