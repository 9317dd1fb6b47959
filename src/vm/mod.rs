// SPDX-License-Identifier: MPL-2.0

//! Address spaces: the GGTT and per-context PPGTTs.
//!
//! An address space owns the VA range allocator, the translation
//! structure (a flat table for the GGTT, a radix tree for a PPGTT),
//! the scratch hierarchy, and the per-GT TLB serials. The binding
//! transitions of all VMAs in one space are serialized by the space's
//! mutex; the map of bound VMAs has its own lock so persistent-bind
//! bookkeeping and fault lookups proceed independently of pin/unpin
//! traffic.

pub mod codec;
pub(crate) mod page_table;
pub mod range_alloc;

use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

pub use self::{
    codec::{codec_for, PteCodec, PteFields},
    page_table::PtCache,
    range_alloc::{RangeAllocator, VaNode},
};
use self::page_table::{PtTree, PteLookup};
use crate::{
    gt::Gt,
    mm::{
        page_prop::PageProperty,
        region::{AllocFlags, BlockList, MemoryRegion},
        sg::ScatterList,
        DeviceAddr, PageSizes, Vaddr, SZ_4K,
    },
    platform::Platform,
    prelude::*,
    sync::Fence,
    tlb::TlbVmState,
    vma::{bind::BindEngine, Vma},
};

/// Which translation table an address space is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmKind {
    /// The single global space of a device/tile, one flat table.
    Ggtt,
    /// A private per-context space, a multi-level radix tree.
    Ppgtt,
}

/// The GGTT's single-level PTE array.
struct FlatTable {
    ptes: Vec<core::sync::atomic::AtomicU64>,
    used: AtomicU32,
}

impl FlatTable {
    fn new(total: usize) -> Self {
        Self {
            ptes: (0..total / SZ_4K)
                .map(|_| core::sync::atomic::AtomicU64::new(0))
                .collect(),
            used: AtomicU32::new(0),
        }
    }
}

enum Translation {
    Flat(FlatTable),
    Radix(PtTree),
}

/// A VMA bound (or persistently registered) in this space, keyed by
/// its start address.
pub(crate) struct BoundEntry {
    pub size: usize,
    pub vma: Weak<Vma>,
}

/// One GPU virtual address space.
pub struct AddressSpace {
    kind: VmKind,
    asid: u32,
    total: usize,
    page_sizes: PageSizes,
    compact_64k: bool,
    faultable: bool,
    async_bind: bool,
    codec: &'static dyn PteCodec,
    translation: Translation,
    /// The VA range allocator.
    pub(crate) mm: Mutex<RangeAllocator>,
    /// The vm mutex: serializes binding transitions.
    pub(crate) mutex: Mutex<()>,
    /// The vm-bind lock: VA-ordered map of bound VMAs.
    pub(crate) bound: Mutex<BTreeMap<Vaddr, BoundEntry>>,
    open: AtomicUsize,
    scratch_leaf: u64,
    scratch_addrs: Vec<DeviceAddr>,
    scratch_backing: Option<(Arc<MemoryRegion>, BlockList)>,
    gts: Vec<Arc<Gt>>,
    tlb_state: Vec<TlbVmState>,
    engine: Arc<BindEngine>,
    /// Completion of the most recent user-fence write, for ordering
    /// chained VM_BIND completions.
    pub(crate) last_ufence: Mutex<Option<Arc<Fence>>>,
}

impl AddressSpace {
    /// Creates the global space.
    pub fn new_ggtt(
        platform: &Platform,
        gts: Vec<Arc<Gt>>,
        engine: Arc<BindEngine>,
        smem: &Arc<MemoryRegion>,
        total: usize,
    ) -> Result<Arc<Self>> {
        // The GGTT maps at 4K granularity only.
        Self::new(
            VmKind::Ggtt,
            platform,
            PageSizes::SZ_4K,
            gts,
            engine,
            smem,
            0,
            total,
        )
    }

    /// Creates a per-context space.
    pub fn new_ppgtt(
        platform: &Platform,
        gts: Vec<Arc<Gt>>,
        engine: Arc<BindEngine>,
        smem: &Arc<MemoryRegion>,
        asid: u32,
    ) -> Result<Arc<Self>> {
        let total = 1usize
            .checked_shl(platform.va_bits as u32)
            .unwrap_or(usize::MAX);
        Self::new(
            VmKind::Ppgtt,
            platform,
            platform.page_sizes,
            gts,
            engine,
            smem,
            asid,
            total,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        kind: VmKind,
        platform: &Platform,
        page_sizes: PageSizes,
        gts: Vec<Arc<Gt>>,
        engine: Arc<BindEngine>,
        smem: &Arc<MemoryRegion>,
        asid: u32,
        total: usize,
    ) -> Result<Arc<Self>> {
        debug_assert!(total.is_power_of_two());
        debug_assert!(!gts.is_empty());

        let codec = codec_for(platform);

        // One scratch page per level so an unmapped walk lands on a
        // deterministic sentinel instead of faulting unpredictably.
        let (scratch_leaf, scratch_addrs, scratch_backing) = if platform.has_scratch {
            let nr = platform.nr_levels() as usize;
            let blocks = smem.alloc(nr * SZ_4K, AllocFlags::empty(), 0)?;
            let sg = smem.sg_of(&blocks);
            let mut addrs = Vec::new();
            let mut cur = sg.cursor();
            for _ in 0..nr {
                let addr = cur.addr();
                smem.clear(addr, SZ_4K);
                addrs.push(addr);
                cur.advance(SZ_4K);
            }
            let leaf = codec.encode(addrs[0], SZ_4K, PageProperty::scratch());
            (leaf, addrs, Some((smem.clone(), blocks)))
        } else {
            (0, Vec::new(), None)
        };

        let translation = match kind {
            VmKind::Ggtt => Translation::Flat(FlatTable::new(total)),
            VmKind::Ppgtt => Translation::Radix(PtTree::new(
                platform.nr_levels(),
                gts[0].pt_cache().clone(),
            )),
        };

        let tlb_state = gts.iter().map(|_| TlbVmState::new()).collect();

        debug!(
            "vm created: {:?} asid {} total {:#x} codec {}",
            kind,
            asid,
            total,
            codec.name()
        );

        Ok(Arc::new(Self {
            kind,
            asid,
            total,
            page_sizes,
            compact_64k: platform.has_compact_64k,
            faultable: platform.has_recoverable_faults && kind == VmKind::Ppgtt,
            async_bind: platform.needs_async_bind,
            codec,
            translation,
            mm: Mutex::new(RangeAllocator::new(0..total)),
            mutex: Mutex::new(()),
            bound: Mutex::new(BTreeMap::new()),
            open: AtomicUsize::new(1),
            scratch_leaf,
            scratch_addrs,
            scratch_backing,
            gts,
            tlb_state,
            engine,
            last_ufence: Mutex::new(None),
        }))
    }

    pub fn kind(&self) -> VmKind {
        self.kind
    }

    pub fn asid(&self) -> u32 {
        self.asid
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn page_sizes(&self) -> PageSizes {
        self.page_sizes
    }

    /// Whether faults on this space suspend and notify instead of
    /// wedging the context.
    pub fn is_faultable(&self) -> bool {
        self.faultable
    }

    pub(crate) fn wants_async_bind(&self) -> bool {
        self.async_bind
    }

    pub(crate) fn bind_engine(&self) -> &Arc<BindEngine> {
        &self.engine
    }

    /// The scratch sentinel address reads of unmapped ranges hit.
    pub fn scratch_addr(&self) -> Option<DeviceAddr> {
        self.scratch_addrs.first().copied()
    }

    /// Takes an open reference. Fails once the space is closed.
    pub fn open(&self) -> Result<()> {
        let mut cur = self.open.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return_errno_with_message!(Errno::EINVAL, "address space is closed");
            }
            match self.open.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(now) => cur = now,
            }
        }
    }

    /// Drops an open reference; the last drop closes the space and
    /// new bindings are refused.
    pub fn close(&self) {
        let prev = self.open.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
        if prev == 1 {
            debug!("vm asid {} closed", self.asid);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.open.load(Ordering::Acquire) == 0
    }

    /// Writes PTEs for `range` from the scatter list.
    ///
    /// Called under the vm mutex (or from bind work ordered by it).
    pub(crate) fn insert_sg(
        &self,
        range: Range<Vaddr>,
        sg: &ScatterList,
        prop: PageProperty,
    ) -> Result<()> {
        debug_assert!(range.end <= self.total);
        match &self.translation {
            Translation::Flat(t) => {
                let mut cur = sg.cursor();
                let mut va = range.start;
                while va < range.end {
                    let idx = va / SZ_4K;
                    let old = t.ptes[idx].swap(
                        self.codec.encode(cur.addr(), SZ_4K, prop),
                        Ordering::Release,
                    );
                    if old == 0 || old == self.scratch_leaf {
                        t.used.fetch_add(1, Ordering::Release);
                    }
                    cur.advance(SZ_4K);
                    va += SZ_4K;
                }
                Ok(())
            }
            Translation::Radix(t) => t.insert(
                range.clone(),
                sg,
                prop,
                self.codec,
                self.page_sizes,
                self.compact_64k,
                self.scratch_leaf,
            ),
        }?;

        for st in &self.tlb_state {
            st.note_bind();
        }
        Ok(())
    }

    /// Clears `range`.
    ///
    /// With `detach`, leaf entries are pointed at scratch so a
    /// faultable space re-faults cleanly; otherwise non-faultable
    /// spaces scratch-fill and faultable spaces leave entries absent.
    pub(crate) fn clear_range(&self, range: Range<Vaddr>, detach: bool) -> usize {
        let scratch = if detach || !self.faultable {
            self.scratch_leaf
        } else {
            0
        };
        match &self.translation {
            Translation::Flat(t) => {
                let mut removed = 0;
                let mut va = range.start;
                while va < range.end {
                    let old = t.ptes[va / SZ_4K].swap(scratch, Ordering::Release);
                    if old != 0 && old != self.scratch_leaf {
                        t.used.fetch_sub(1, Ordering::Release);
                        removed += 1;
                    }
                    va += SZ_4K;
                }
                removed
            }
            Translation::Radix(t) => t.clear(range, scratch),
        }
    }

    /// Invalidates the cleared range on every GT that may cache it.
    pub(crate) fn invalidate_tlbs(&self, range: Option<Range<Vaddr>>) {
        for (gt, st) in self.gts.iter().zip(self.tlb_state.iter()) {
            gt.tlb().invalidate_range(st, range.clone());
        }
    }

    /// Resolves a VA the way the hardware walker would.
    ///
    /// Returns the decoded fields, the mapped page size, and whether
    /// the entry is the scratch sentinel.
    pub fn lookup(&self, va: Vaddr) -> Option<(PteFields, usize, bool)> {
        let looked = match &self.translation {
            Translation::Flat(t) => {
                if va >= self.total {
                    return None;
                }
                let raw = t.ptes[va / SZ_4K].load(Ordering::Acquire);
                (raw != 0).then_some(PteLookup {
                    raw,
                    page_size: SZ_4K,
                })
            }
            Translation::Radix(t) => t.query(va),
        }?;
        let fields = self.codec.decode(looked.raw)?;
        let is_scratch = self.scratch_leaf != 0 && looked.raw == self.scratch_leaf;
        Some((fields, looked.page_size, is_scratch))
    }

    /// Page-table node count (always 1 for the flat GGTT).
    pub fn nr_pt_nodes(&self) -> usize {
        match &self.translation {
            Translation::Flat(_) => 1,
            Translation::Radix(t) => t.nr_nodes(),
        }
    }

    /// Present-entry count at the root (the flat table's total count).
    pub fn root_used(&self) -> u32 {
        match &self.translation {
            Translation::Flat(t) => t.used.load(Ordering::Acquire),
            Translation::Radix(t) => t.root_used(),
        }
    }

    /// Registers a bound VMA for VA lookups.
    pub(crate) fn note_bound(&self, start: Vaddr, size: usize, vma: Weak<Vma>) {
        self.bound.lock().insert(start, BoundEntry { size, vma });
    }

    pub(crate) fn forget_bound(&self, start: Vaddr) {
        self.bound.lock().remove(&start);
    }

    /// Finds the bound VMA covering `va`.
    pub fn find_vma(&self, va: Vaddr) -> Option<Arc<Vma>> {
        let bound = self.bound.lock();
        let (&start, entry) = bound.range(..=va).next_back()?;
        if va < start + entry.size {
            entry.vma.upgrade()
        } else {
            None
        }
    }

    /// Unbinds unpinned VMAs, lowest VA first, until at least `need`
    /// bytes were released or no candidates remain.
    ///
    /// The caller-driven eviction loop for `ENOSPC` pins.
    pub(crate) fn evict_some(&self, need: usize) -> Result<()> {
        let candidates: Vec<Arc<Vma>> = {
            let bound = self.bound.lock();
            bound.values().filter_map(|e| e.vma.upgrade()).collect()
        };
        let mut freed = 0usize;
        for vma in candidates {
            if freed >= need {
                break;
            }
            if vma.is_pinned() {
                continue;
            }
            let size = vma.size();
            // Best effort: skip anything that refuses (raced pins,
            // chained segments) and keep scanning.
            if vma.unbind().is_ok() {
                freed += size;
                debug!("evicted vma [{:#x} bytes] for ENOSPC retry", size);
            }
        }
        if freed == 0 {
            return_errno_with_message!(Errno::ENOSPC, "no evictable mappings");
        }
        Ok(())
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if let Some((region, blocks)) = self.scratch_backing.take() {
            region.free(blocks);
        }
    }
}

impl Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("kind", &self.kind)
            .field("asid", &self.asid)
            .field("total", &self.total)
            .finish_non_exhaustive()
    }
}
