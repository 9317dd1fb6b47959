// SPDX-License-Identifier: MPL-2.0

use core::sync::atomic::{AtomicI32, AtomicU8, Ordering};

use crate::prelude::*;

const PENDING: u8 = 0;
const SIGNALED: u8 = 1;

/// The outcome a signalled fence carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    Pending,
    Ok,
    Error(Errno),
}

/// A one-shot completion object.
///
/// Bind and unbind work publishes its completion through a fence so
/// dependent operations queue behind it instead of blocking a thread.
/// A fence signals exactly once, optionally with an error; waiters
/// observe the error and propagate it.
#[derive(Debug)]
pub struct Fence {
    state: AtomicU8,
    err: AtomicI32,
}

impl Fence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(PENDING),
            err: AtomicI32::new(0),
        })
    }

    /// A fence born signalled, for synchronous completions.
    pub fn signaled() -> Arc<Self> {
        let f = Self::new();
        f.signal();
        f
    }

    pub fn is_signaled(&self) -> bool {
        self.state.load(Ordering::Acquire) == SIGNALED
    }

    pub fn status(&self) -> FenceStatus {
        if !self.is_signaled() {
            return FenceStatus::Pending;
        }
        match self.err.load(Ordering::Acquire) {
            0 => FenceStatus::Ok,
            raw => FenceStatus::Error(errno_from_raw(raw)),
        }
    }

    /// Signals success. Signalling twice is a no-op.
    pub fn signal(&self) {
        self.state.store(SIGNALED, Ordering::Release);
    }

    /// Signals completion with an error.
    pub fn signal_with_error(&self, errno: Errno) {
        self.err.store(errno as i32, Ordering::Release);
        self.state.store(SIGNALED, Ordering::Release);
    }

    /// Spins until the fence signals, returning its outcome.
    ///
    /// The production driver parks on a wait queue here; in this crate
    /// pending work is executed by whoever drains the bind engine, so
    /// waits are short.
    pub fn wait(&self) -> Result<()> {
        while !self.is_signaled() {
            cfg_if::cfg_if! {
                if #[cfg(test)] {
                    std::thread::yield_now();
                } else {
                    core::hint::spin_loop();
                }
            }
        }
        match self.status() {
            FenceStatus::Ok => Ok(()),
            FenceStatus::Error(e) => Err(Error::new(e)),
            FenceStatus::Pending => unreachable!(),
        }
    }
}

fn errno_from_raw(raw: i32) -> Errno {
    match raw {
        1 => Errno::EPERM,
        2 => Errno::ENOENT,
        4 => Errno::EINTR,
        5 => Errno::EIO,
        7 => Errno::E2BIG,
        11 => Errno::EAGAIN,
        12 => Errno::ENOMEM,
        13 => Errno::EACCES,
        14 => Errno::EFAULT,
        16 => Errno::EBUSY,
        17 => Errno::EEXIST,
        19 => Errno::ENODEV,
        22 => Errno::EINVAL,
        28 => Errno::ENOSPC,
        35 => Errno::EDEADLK,
        75 => Errno::EOVERFLOW,
        512 => Errno::ERESTARTSYS,
        _ => Errno::EIO,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fence_signals_once() {
        let f = Fence::new();
        assert_eq!(f.status(), FenceStatus::Pending);
        f.signal();
        assert!(f.is_signaled());
        assert_eq!(f.status(), FenceStatus::Ok);
        assert!(f.wait().is_ok());
    }

    #[test]
    fn fence_carries_error() {
        let f = Fence::new();
        f.signal_with_error(Errno::ENOSPC);
        assert_eq!(f.status(), FenceStatus::Error(Errno::ENOSPC));
        assert_eq!(f.wait().unwrap_err().error(), Errno::ENOSPC);
    }
}
