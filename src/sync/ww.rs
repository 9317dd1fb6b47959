// SPDX-License-Identifier: MPL-2.0

//! Wound-wait object locking.
//!
//! Every multi-object operation (pinning several buffers for a submit,
//! migrating while a fault handler binds) runs inside a
//! [`WwTransaction`]. Locks taken through the transaction detect
//! ordering conflicts: a younger transaction that would wait on an
//! older one gets `EDEADLK` instead, must release everything it holds,
//! wait for the contended lock, and retry the whole transaction. There
//! is no partial rollback.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::prelude::*;

/// No transaction holds the lock.
const UNLOCKED: u64 = 0;

/// Allocator of transaction tickets. One per device.
#[derive(Debug)]
pub struct WwClass {
    next_ticket: AtomicU64,
}

impl WwClass {
    pub const fn new() -> Self {
        Self {
            // Ticket 0 means "unlocked"; start above it.
            next_ticket: AtomicU64::new(1),
        }
    }

    /// Opens a transaction with a fresh ticket.
    pub fn begin(&self) -> WwTransaction<'_> {
        WwTransaction {
            class: self,
            ticket: self.next_ticket.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl Default for WwClass {
    fn default() -> Self {
        Self::new()
    }
}

/// An open wound-wait acquire context.
#[derive(Debug)]
pub struct WwTransaction<'a> {
    class: &'a WwClass,
    ticket: u64,
}

impl WwTransaction<'_> {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Restarts the transaction with a fresh (younger) ticket.
    ///
    /// Called by the retry helper after a backoff; the caller must have
    /// dropped every guard first.
    pub fn restart(&mut self) {
        self.ticket = self.class.next_ticket.fetch_add(1, Ordering::Relaxed);
    }
}

/// A mutex participating in wound-wait ordering.
#[derive(Debug)]
pub struct WwMutex<T> {
    owner: AtomicU64,
    inner: Mutex<T>,
}

impl<T> WwMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            owner: AtomicU64::new(UNLOCKED),
            inner: Mutex::new(value),
        }
    }

    /// Locks within a transaction.
    ///
    /// Returns `EDEADLK` if the lock is held by an older transaction;
    /// the caller must back off per the wound-wait protocol. Waits out
    /// younger holders.
    pub fn lock_ww<'a>(&'a self, txn: &WwTransaction<'_>) -> Result<WwGuard<'a, T>> {
        loop {
            let holder = self.owner.load(Ordering::Acquire);
            if holder == UNLOCKED {
                if self
                    .owner
                    .compare_exchange(UNLOCKED, txn.ticket, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let guard = self.inner.lock();
                    return Ok(WwGuard {
                        owner: &self.owner,
                        guard,
                    });
                }
                continue;
            }
            if holder < txn.ticket {
                // An older transaction holds it: we are the one that
                // must die and retry from the top.
                return_errno!(Errno::EDEADLK);
            }
            core::hint::spin_loop();
        }
    }

    /// Locks outside any transaction, for single-object paths that can
    /// never hold more than one object lock.
    pub fn lock_single(&self) -> WwGuard<'_, T> {
        loop {
            if self
                .owner
                .compare_exchange(UNLOCKED, u64::MAX, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let guard = self.inner.lock();
                return WwGuard {
                    owner: &self.owner,
                    guard,
                };
            }
            core::hint::spin_loop();
        }
    }

    /// Spins until the lock is free. Used by the backoff protocol to
    /// wait on the contended lock before retrying.
    pub fn wait_unlocked(&self) {
        while self.owner.load(Ordering::Acquire) != UNLOCKED {
            core::hint::spin_loop();
        }
    }
}

/// Guard of a [`WwMutex`].
#[derive(Debug)]
pub struct WwGuard<'a, T> {
    owner: &'a AtomicU64,
    guard: MutexGuard<'a, T>,
}

impl<T> core::ops::Deref for WwGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> core::ops::DerefMut for WwGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for WwGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.store(UNLOCKED, Ordering::Release);
    }
}

/// Runs `f` as a wound-wait transaction, retrying on `EDEADLK` with a
/// fresh ticket each round.
///
/// `f` must release every lock it took before returning `EDEADLK`
/// upward, which guard scoping enforces naturally.
pub fn ww_retry<T>(
    class: &WwClass,
    mut f: impl FnMut(&WwTransaction<'_>) -> Result<T>,
) -> Result<T> {
    let mut txn = class.begin();
    loop {
        match f(&txn) {
            Err(e) if e.error() == Errno::EDEADLK => {
                trace!("ww transaction {} backing off", txn.ticket());
                txn.restart();
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn older_holder_wins() {
        let class = WwClass::new();
        let m = WwMutex::new(0u32);

        let old = class.begin();
        let young = class.begin();
        assert!(old.ticket() < young.ticket());

        let _held = m.lock_ww(&old).unwrap();
        assert_eq!(m.lock_ww(&young).unwrap_err().error(), Errno::EDEADLK);
    }

    #[test]
    fn retry_restarts_whole_transaction() {
        let class = WwClass::new();
        let m = WwMutex::new(0u32);
        let mut attempts = 0;
        let blocker = class.begin();
        let held = m.lock_ww(&blocker).unwrap();

        let res: Result<u32> = ww_retry(&class, |txn| {
            attempts += 1;
            if attempts == 1 {
                // First round conflicts with the older holder.
                m.lock_ww(txn).map(|g| *g)
            } else {
                Ok(42)
            }
        });
        assert_eq!(res.unwrap(), 42);
        assert_eq!(attempts, 2);
        drop(held);
    }

    #[test]
    fn concurrent_transactions_make_progress() {
        use std::{sync::Arc as StdArc, thread};

        let class = StdArc::new(WwClass::new());
        let a = StdArc::new(WwMutex::new(0u64));
        let b = StdArc::new(WwMutex::new(0u64));

        let mut handles = std::vec::Vec::new();
        for i in 0..4 {
            let (class, a, b) = (class.clone(), a.clone(), b.clone());
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    ww_retry(&class, |txn| {
                        // Half the threads lock in the opposite order to
                        // force ordering conflicts.
                        let (first, second) = if i % 2 == 0 { (&a, &b) } else { (&b, &a) };
                        let mut g1 = first.lock_ww(txn)?;
                        let mut g2 = second.lock_ww(txn)?;
                        *g1 += 1;
                        *g2 += 1;
                        Ok(())
                    })
                    .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*a.lock_single(), 400);
        assert_eq!(*b.lock_single(), 400);
    }
}
