// SPDX-License-Identifier: MPL-2.0

//! The graphics tile (GT): the unit that owns engines, a translation
//! cache, and a page-table node cache.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{prelude::*, tlb::TlbTracker, vm::PtCache};

/// Engine identity as hardware reports it in fault messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineId {
    pub class: u8,
    pub instance: u8,
}

/// One graphics tile.
pub struct Gt {
    id: u32,
    engines: Vec<EngineId>,
    wedged: AtomicBool,
    pt_cache: Arc<PtCache>,
    tlb: TlbTracker,
    blit_copies: AtomicU64,
}

/// Pooled page-table nodes kept per GT.
const PT_CACHE_LIMIT: usize = 128;

impl Gt {
    pub fn new(id: u32, engines: Vec<EngineId>, selective_tlb_inv: bool) -> Arc<Self> {
        Arc::new(Self {
            id,
            engines,
            wedged: AtomicBool::new(false),
            pt_cache: Arc::new(PtCache::new(PT_CACHE_LIMIT)),
            tlb: TlbTracker::new(id, selective_tlb_inv),
            blit_copies: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn engines(&self) -> &[EngineId] {
        &self.engines
    }

    pub fn has_engine(&self, engine: EngineId) -> bool {
        self.engines.contains(&engine)
    }

    pub fn pt_cache(&self) -> &Arc<PtCache> {
        &self.pt_cache
    }

    pub fn tlb(&self) -> &TlbTracker {
        &self.tlb
    }

    /// Records a copy routed through the blit engine.
    pub(crate) fn note_blit(&self) {
        self.blit_copies.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies the blit engine performed (a wedged GT performs none).
    pub fn blit_copies(&self) -> u64 {
        self.blit_copies.load(Ordering::Relaxed)
    }

    /// Whether the GT has been declared dead.
    ///
    /// Wedged GTs fail GPU-side work fast; CPU fallback paths keep
    /// memory management functional.
    pub fn is_wedged(&self) -> bool {
        self.wedged.load(Ordering::Acquire)
    }

    pub fn set_wedged(&self) {
        if !self.wedged.swap(true, Ordering::AcqRel) {
            error!("gt{}: wedged, failing GPU-side work fast", self.id);
        }
    }

    /// Tears down the node cache. Called once at device removal; late
    /// frees after this point drop their nodes instead of pooling.
    pub fn shutdown(&self) {
        self.pt_cache.close();
        self.pt_cache.drain();
    }
}

impl Debug for Gt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Gt")
            .field("id", &self.id)
            .field("wedged", &self.is_wedged())
            .finish_non_exhaustive()
    }
}
