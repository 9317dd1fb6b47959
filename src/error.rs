// SPDX-License-Identifier: MPL-2.0

#![allow(dead_code)]

/// Error number.
///
/// The subset of UNIX error numbers this subsystem reports to its
/// callers. The numeric values are the conventional ones so that
/// ioctl-level glue can pass them through unchanged.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Errno {
    EPERM = 1,   /* Operation not permitted */
    ENOENT = 2,  /* No such file or directory */
    EINTR = 4,   /* Interrupted system call */
    EIO = 5,     /* I/O error */
    E2BIG = 7,   /* Argument list too long */
    EAGAIN = 11, /* Try again */
    ENOMEM = 12, /* Out of memory */
    EACCES = 13, /* Permission denied */
    EFAULT = 14, /* Bad address */
    EBUSY = 16,  /* Device or resource busy */
    EEXIST = 17, /* File exists */
    ENODEV = 19, /* No such device */
    EINVAL = 22, /* Invalid argument */
    ENOSPC = 28, /* No space left on device */

    EDEADLK = 35, /* Resource deadlock would occur */

    EOVERFLOW = 75, /* Value too large for defined data type */

    ERESTARTSYS = 512, /* Interrupted, restart the call */
}

/// Error used in this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error {
    errno: Errno,
    msg: Option<&'static str>,
}

impl Error {
    pub const fn new(errno: Errno) -> Self {
        Error { errno, msg: None }
    }

    pub const fn with_message(errno: Errno, msg: &'static str) -> Self {
        Error {
            errno,
            msg: Some(msg),
        }
    }

    pub const fn error(&self) -> Errno {
        self.errno
    }

    /// Whether the error is an interruption rather than a true failure.
    ///
    /// Cleanup paths must not treat these as corruption signals; the
    /// operation is retried on the next call.
    pub const fn is_interruption(&self) -> bool {
        matches!(self.errno, Errno::EINTR | Errno::ERESTARTSYS)
    }

    /// Whether the caller is expected to back off and retry the whole
    /// transaction (wound-wait protocol or optimistic-pin races).
    pub const fn is_backoff(&self) -> bool {
        matches!(self.errno, Errno::EDEADLK | Errno::EAGAIN)
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::new(errno)
    }
}

impl AsRef<Error> for Error {
    fn as_ref(&self) -> &Error {
        self
    }
}

#[macro_export]
macro_rules! return_errno {
    ($errno: expr) => {
        return Err($crate::Error::new($errno))
    };
}

#[macro_export]
macro_rules! return_errno_with_message {
    ($errno: expr, $message: expr) => {
        return Err($crate::Error::with_message($errno, $message))
    };
}
