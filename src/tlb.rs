// SPDX-License-Identifier: MPL-2.0

//! TLB invalidation bookkeeping.
//!
//! Each GT caches translations per address space. An unbind or a
//! migration must invalidate before the backing memory is reused, but
//! an invalidation is redundant when no bind has been issued on that
//! GT since the last one; the per-(vm, GT) serials encode exactly
//! that, so back-to-back unbinds collapse into one flush.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::{mm::Vaddr, prelude::*};

/// Invalidations wider than this fall back to a full flush even on
/// selective hardware.
const FULL_FLUSH_THRESHOLD: usize = 32 * crate::mm::PAGE_SIZE * 1024;

/// Per-(vm, GT) serial pair.
#[derive(Debug, Default)]
pub struct TlbVmState {
    /// Bumped whenever a bind makes this GT's TLB possibly stale.
    bind_serial: AtomicU64,
    /// The bind serial the last completed invalidation observed.
    inv_serial: AtomicU64,
}

impl TlbVmState {
    pub const fn new() -> Self {
        Self {
            bind_serial: AtomicU64::new(0),
            inv_serial: AtomicU64::new(0),
        }
    }

    pub fn note_bind(&self) {
        self.bind_serial.fetch_add(1, Ordering::Release);
    }
}

/// The invalidation engine of one GT.
#[derive(Debug)]
pub struct TlbTracker {
    gt_id: u32,
    selective: bool,
    /// Monotone count of invalidations actually issued.
    seqno: AtomicU64,
    full_flushes: AtomicU64,
    ranged_flushes: AtomicU64,
}

impl TlbTracker {
    pub(crate) fn new(gt_id: u32, selective: bool) -> Self {
        Self {
            gt_id,
            selective,
            seqno: AtomicU64::new(0),
            full_flushes: AtomicU64::new(0),
            ranged_flushes: AtomicU64::new(0),
        }
    }

    /// Invalidates `range` of one address space on this GT, or skips
    /// if the GT saw no bind since the previous invalidation.
    ///
    /// Returns whether an invalidation was actually issued.
    pub fn invalidate_range(&self, state: &TlbVmState, range: Option<Range<Vaddr>>) -> bool {
        let bind = state.bind_serial.load(Ordering::Acquire);
        if state.inv_serial.load(Ordering::Acquire) >= bind {
            return false;
        }

        match range {
            Some(r) if self.selective && r.len() < FULL_FLUSH_THRESHOLD => {
                trace!(
                    "gt{}: ranged TLB invalidation [{:#x}..{:#x}]",
                    self.gt_id,
                    r.start,
                    r.end
                );
                self.ranged_flushes.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                trace!("gt{}: full TLB invalidation", self.gt_id);
                self.full_flushes.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.seqno.fetch_add(1, Ordering::Release);
        state.inv_serial.store(bind, Ordering::Release);
        true
    }

    /// Invalidations issued so far.
    pub fn seqno(&self) -> u64 {
        self.seqno.load(Ordering::Acquire)
    }

    pub fn full_flushes(&self) -> u64 {
        self.full_flushes.load(Ordering::Relaxed)
    }

    pub fn ranged_flushes(&self) -> u64 {
        self.ranged_flushes.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mm::PAGE_SIZE;

    #[test]
    fn redundant_invalidations_are_skipped() {
        let tracker = TlbTracker::new(0, true);
        let state = TlbVmState::new();

        // Nothing bound yet: nothing to flush.
        assert!(!tracker.invalidate_range(&state, None));

        state.note_bind();
        assert!(tracker.invalidate_range(&state, Some(0..PAGE_SIZE)));
        assert_eq!(tracker.seqno(), 1);

        // No bind in between: the second unbind's flush collapses.
        assert!(!tracker.invalidate_range(&state, Some(0..PAGE_SIZE)));
        assert_eq!(tracker.seqno(), 1);

        state.note_bind();
        assert!(tracker.invalidate_range(&state, None));
        assert_eq!(tracker.seqno(), 2);
    }

    #[test]
    fn selective_capability_picks_flush_kind() {
        let selective = TlbTracker::new(0, true);
        let full_only = TlbTracker::new(1, false);
        let state = TlbVmState::new();

        state.note_bind();
        selective.invalidate_range(&state, Some(0..PAGE_SIZE));
        assert_eq!(selective.ranged_flushes(), 1);
        assert_eq!(selective.full_flushes(), 0);

        state.note_bind();
        full_only.invalidate_range(&state, Some(0..PAGE_SIZE));
        assert_eq!(full_only.ranged_flushes(), 0);
        assert_eq!(full_only.full_flushes(), 1);

        // A huge range degrades to a full flush even when selective.
        state.note_bind();
        selective.invalidate_range(&state, Some(0..usize::MAX / 2));
        assert_eq!(selective.full_flushes(), 1);
    }
}
