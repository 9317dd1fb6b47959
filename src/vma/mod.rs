// SPDX-License-Identifier: MPL-2.0

//! VMAs: the bindings of objects into address spaces.
//!
//! A VMA is the unit of binding: one (object, address space, view)
//! triple, present in the object's VMA tree at most once. Pinning is
//! the hot path — an already-bound VMA pins with one atomic update
//! and no lock. The slow path serializes on the address space's
//! mutex, allocates the VA node, materializes pages under the
//! object's ww lock, and writes PTEs either synchronously or as
//! fence-ordered bind work.

pub mod bind;

use core::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

pub use self::bind::UserFence;
use self::bind::WorkOp;
use crate::{
    mm::{Vaddr, PAGE_SIZE, SZ_1G, SZ_2M, SZ_64K},
    object::Object,
    prelude::*,
    sync::{ww_retry, Fence, WwTransaction},
    vm::{AddressSpace, VaNode},
};

bitflags! {
    /// How a pin wants the VMA bound.
    pub struct BindFlags: u32 {
        /// Bind into the global table.
        const GLOBAL = 1 << 0;
        /// Bind into the per-context table.
        const LOCAL = 1 << 1;
        /// Restrict the VA to the CPU-mappable aperture.
        const MAPPABLE = 1 << 2;
        /// Restrict the VA to the low 4G zone.
        const ZONE_32 = 1 << 3;
    }
}

/// Which part of an object a VMA maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ViewKind {
    Whole,
    Partial,
}

/// A view of an object: the whole of it or a page-aligned window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct View {
    pub kind: ViewKind,
    pub offset: usize,
    pub size: usize,
}

impl View {
    pub fn whole(object_size: usize) -> Self {
        Self {
            kind: ViewKind::Whole,
            offset: 0,
            size: object_size,
        }
    }

    pub fn partial(offset: usize, size: usize) -> Self {
        Self {
            kind: ViewKind::Partial,
            offset,
            size,
        }
    }
}

// The flags word: pin count in the low bits, state above it.
const PIN_MASK: u64 = 0x3ff;
const BOUND_GLOBAL: u64 = 1 << 10;
const BOUND_LOCAL: u64 = 1 << 11;
const BOUND_MASK: u64 = BOUND_GLOBAL | BOUND_LOCAL;
const PAGES_PINNED: u64 = 1 << 12;
const ERROR_BIT: u64 = 1 << 13;
const CHAINED: u64 = 1 << 14;

/// Options of one pin request.
#[derive(Debug, Clone)]
pub struct PinOptions {
    pub flags: BindFlags,
    /// Bind exactly at this VA.
    pub fixed: Option<Vaddr>,
    pub align: usize,
}

impl Default for PinOptions {
    fn default() -> Self {
        Self {
            flags: BindFlags::empty(),
            fixed: None,
            align: PAGE_SIZE,
        }
    }
}

/// Debugger annotation attached to a VMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmaMetadata {
    pub tag: u64,
    pub cookie: u64,
}

/// One binding of an object view into one address space.
pub struct Vma {
    /// Self-reference for fence bookkeeping and VA registration.
    self_ref: Weak<Vma>,
    object: Weak<Object>,
    vm: Arc<AddressSpace>,
    view: View,
    /// Explicit VM_BIND lifetime rather than execbuf-scoped.
    persistent: bool,
    /// Total chain length when this VMA is one segment of a chain.
    chain_total: usize,
    flags: AtomicU64,
    node: Mutex<Option<VaNode>>,
    /// The exclusive fence of the in-flight binding transition.
    active: Mutex<Option<Arc<Fence>>>,
    /// The user fence attached by VM_BIND, if any.
    ufence: Mutex<Option<UserFence>>,
    /// The next segment of a chained binding.
    adjacent: Mutex<Option<Arc<Vma>>>,
    metadata: Mutex<Vec<VmaMetadata>>,
    /// Signalled when the VMA is destroyed.
    debug_fences: Mutex<Vec<Arc<Fence>>>,
}

impl Vma {
    /// Looks up or creates the VMA of (object, vm, view).
    pub fn instance(
        obj: &Arc<Object>,
        vm: &Arc<AddressSpace>,
        view: View,
    ) -> Result<Arc<Vma>> {
        Self::instance_raw(obj, vm, view, false, 0)
    }

    /// The persistent (VM_BIND) variant.
    pub fn instance_persistent(
        obj: &Arc<Object>,
        vm: &Arc<AddressSpace>,
        view: View,
    ) -> Result<Arc<Vma>> {
        Self::instance_raw(obj, vm, view, true, 0)
    }

    fn instance_raw(
        obj: &Arc<Object>,
        vm: &Arc<AddressSpace>,
        view: View,
        persistent: bool,
        chain_total: usize,
    ) -> Result<Arc<Vma>> {
        if view.offset % PAGE_SIZE != 0
            || view.size == 0
            || view.size % PAGE_SIZE != 0
            || view.offset + view.size > obj.size()
        {
            return_errno_with_message!(Errno::EINVAL, "view outside the object");
        }
        if vm.is_closed() {
            return_errno_with_message!(Errno::EINVAL, "address space is closed");
        }

        let key = (vm_key(vm), view);
        if let Some(existing) = obj.vma_lookup(key) {
            return Ok(existing);
        }
        let vma = Arc::new_cyclic(|self_ref| Vma {
            self_ref: self_ref.clone(),
            object: Arc::downgrade(obj),
            vm: vm.clone(),
            view,
            persistent,
            chain_total,
            flags: AtomicU64::new(if chain_total != 0 { CHAINED } else { 0 }),
            node: Mutex::new(None),
            active: Mutex::new(None),
            ufence: Mutex::new(None),
            adjacent: Mutex::new(None),
            metadata: Mutex::new(Vec::new()),
            debug_fences: Mutex::new(Vec::new()),
        });
        obj.vma_insert(key, &vma);
        Ok(vma)
    }

    pub fn object(&self) -> Result<Arc<Object>> {
        self.object
            .upgrade()
            .ok_or(Error::with_message(Errno::ENODEV, "object was destroyed"))
    }

    pub fn vm(&self) -> &Arc<AddressSpace> {
        &self.vm
    }

    pub fn view(&self) -> View {
        self.view
    }

    pub fn size(&self) -> usize {
        self.view.size
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// The assigned VA, once bound.
    pub fn start(&self) -> Option<Vaddr> {
        self.node.lock().map(|n| n.start)
    }

    pub fn pin_count(&self) -> u64 {
        self.flags.load(Ordering::Acquire) & PIN_MASK
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count() != 0
    }

    pub fn is_bound(&self) -> bool {
        self.flags.load(Ordering::Acquire) & BOUND_MASK != 0
    }

    pub(crate) fn set_error(&self) {
        self.flags.fetch_or(ERROR_BIT, Ordering::AcqRel);
    }

    pub fn has_error(&self) -> bool {
        self.flags.load(Ordering::Acquire) & ERROR_BIT != 0
    }

    fn is_chained(&self) -> bool {
        self.flags.load(Ordering::Acquire) & CHAINED != 0
    }

    fn wanted_bits(&self, flags: BindFlags) -> u64 {
        let mut wanted = 0;
        if flags.contains(BindFlags::GLOBAL) {
            wanted |= BOUND_GLOBAL;
        }
        if flags.contains(BindFlags::LOCAL) {
            wanted |= BOUND_LOCAL;
        }
        if wanted == 0 {
            wanted = match self.vm.kind() {
                crate::vm::VmKind::Ggtt => BOUND_GLOBAL,
                crate::vm::VmKind::Ppgtt => BOUND_LOCAL,
            };
        }
        wanted
    }

    /// The lock-free fast pin: succeeds iff the VMA is already bound
    /// with the wanted mask, not in error, and the count has room.
    fn try_qad_pin(&self, wanted: u64) -> bool {
        self.flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
                if f & ERROR_BIT != 0 {
                    return None;
                }
                if f & wanted != wanted {
                    return None;
                }
                if f & PIN_MASK == PIN_MASK {
                    return None;
                }
                Some(f + 1)
            })
            .is_ok()
    }

    /// Pins the VMA, binding it first if needed.
    ///
    /// The single-object convenience wrapper around [`Self::pin_ww`].
    pub fn pin(&self, opts: &PinOptions) -> Result<()> {
        let obj = self.object()?;
        let class = obj.ww_class().clone();
        drop(obj);
        ww_retry(&class, |txn| self.pin_ww(txn, opts))
    }

    /// Pins within a caller's ww transaction (the execbuf path).
    pub fn pin_ww(&self, txn: &WwTransaction<'_>, opts: &PinOptions) -> Result<()> {
        let wanted = self.wanted_bits(opts.flags);
        if self.try_qad_pin(wanted) {
            return Ok(());
        }

        let obj = self.object()?;
        // Lock order: object ww lock, then the vm mutex.
        let mut st = obj.lock_ww(txn)?;
        let _vm_guard = self.vm.mutex.lock();

        // A concurrent binder may have won while we took locks.
        if self.try_qad_pin(wanted) {
            return Ok(());
        }
        if self.vm.is_closed() {
            return_errno_with_message!(Errno::EINVAL, "address space is closed");
        }
        if self.has_error() {
            return_errno_with_message!(Errno::EINVAL, "vma is in an error state");
        }

        // Pages first: the node alignment depends on their geometry.
        let fresh_pages = self.flags.load(Ordering::Acquire) & PAGES_PINNED == 0;
        if fresh_pages {
            obj.pin_pages_locked(&mut st)?;
            self.flags.fetch_or(PAGES_PINNED, Ordering::AcqRel);
        }

        let res = (|| {
            let chunk = obj.mapping_chunk(&st, self.vm.page_sizes());
            let node = self.node_locked(opts, chunk)?;

            if self.flags.load(Ordering::Acquire) & BOUND_MASK == 0 {
                let sg = obj.sg_slice(&st, self.view.offset, self.view.size)?;
                let prop = obj.mapping_prop(&st);
                if self.vm.wants_async_bind() {
                    let mut deps: SmallVec<[Arc<Fence>; 2]> = SmallVec::new();
                    if let Some(prev) = self.active.lock().clone() {
                        deps.push(prev);
                    }
                    let fence = self.vm.bind_engine().queue_work(
                        deps,
                        WorkOp::Insert {
                            vm: self.vm.clone(),
                            range: node.range(),
                            sg,
                            prop,
                        },
                        Some(self.self_ref.clone()),
                    );
                    *self.active.lock() = Some(fence);
                } else {
                    self.vm.insert_sg(node.range(), &sg, prop)?;
                }
                self.vm
                    .note_bound(node.start, node.size, self.self_ref.clone());
            }
            Ok(())
        })();

        match res {
            Ok(()) => {
                self.flags
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
                        Some((f | wanted) + 1)
                    })
                    .unwrap();
                Ok(())
            }
            Err(e) => {
                if fresh_pages {
                    self.flags.fetch_and(!PAGES_PINNED, Ordering::AcqRel);
                    obj.unpin_pages();
                }
                Err(e)
            }
        }
    }

    /// Gets or allocates the VA node. Called under the vm mutex.
    fn node_locked(&self, opts: &PinOptions, chunk: usize) -> Result<VaNode> {
        let mut node_guard = self.node.lock();
        if let Some(node) = *node_guard {
            if let Some(fixed) = opts.fixed {
                if fixed != node.start {
                    return_errno_with_message!(Errno::EINVAL, "bound elsewhere");
                }
            }
            return Ok(node);
        }

        // Pad the alignment so huge-page-capable objects get leaf
        // tables (and huge entries) to themselves.
        let pad = if chunk >= SZ_1G {
            SZ_1G
        } else if chunk >= SZ_64K {
            SZ_2M
        } else {
            PAGE_SIZE
        };
        let align = opts.align.max(pad);

        let total = self.vm.total();
        let zone = if opts.flags.contains(BindFlags::ZONE_32) {
            0..total.min(1 << 32)
        } else if opts.flags.contains(BindFlags::MAPPABLE) {
            // The CPU-visible aperture is the low half of the GGTT.
            0..total / 2
        } else {
            0..total
        };

        let mut mm = self.vm.mm.lock();
        let node = match opts.fixed {
            Some(va) => mm.insert_fixed(va, self.view.size)?,
            None => mm.insert(self.view.size, align, zone)?,
        };
        *node_guard = Some(node);
        Ok(node)
    }

    /// Drops one pin.
    pub fn unpin(&self) {
        let prev = self.flags.fetch_sub(1, Ordering::AcqRel);
        debug_assert_ne!(prev & PIN_MASK, 0, "unbalanced unpin");
    }

    /// Fully unbinds the VMA: PTEs cleared, VA node released, TLBs
    /// invalidated.
    ///
    /// Refuses with `EAGAIN` while any pin is outstanding. A segment
    /// of a chain cannot be unbound alone; use [`unbind_chain`].
    pub fn unbind(&self) -> Result<()> {
        if self.is_chained() {
            return_errno_with_message!(Errno::EINVAL, "segment chains unbind as a whole");
        }
        self.unbind_inner()
    }

    fn unbind_inner(&self) -> Result<()> {
        // Serialize against slow-path binders first, then atomically
        // claim the teardown: no pins, bound bits off so the fast pin
        // path stops succeeding right now.
        let _vm_guard = self.vm.mutex.lock();
        let claim = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
                if f & PIN_MASK != 0 {
                    None
                } else {
                    Some(f & !(BOUND_MASK | PAGES_PINNED))
                }
            });
        let Ok(prev) = claim else {
            return_errno!(Errno::EAGAIN);
        };

        // Wait out the in-flight binding transition, if any. This
        // wait is not interruptible: the teardown must complete.
        self.vm.bind_engine().flush();
        if let Some(f) = self.active.lock().take() {
            let _ = f.wait();
        }

        let Some(node) = self.node.lock().take() else {
            return Ok(());
        };

        self.vm.clear_range(node.range(), false);
        self.vm.invalidate_tlbs(Some(node.range()));
        self.vm.forget_bound(node.start);
        self.vm.mm.lock().remove(node);

        if prev & PAGES_PINNED != 0 {
            if let Ok(obj) = self.object() {
                obj.unpin_pages();
            }
        }
        Ok(())
    }

    /// Detaches a faultable binding: PTEs point at scratch, the VA
    /// node and registration stay, and the next GPU access re-faults
    /// and rebinds instead of crashing.
    pub fn invalidate(&self) -> Result<()> {
        let _vm_guard = self.vm.mutex.lock();
        let claim = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |f| {
                if f & PIN_MASK != 0 {
                    None
                } else {
                    Some(f & !BOUND_MASK)
                }
            });
        if claim.is_err() {
            return_errno!(Errno::EAGAIN);
        }

        self.vm.bind_engine().flush();
        if let Some(f) = self.active.lock().take() {
            let _ = f.wait();
        }

        if let Some(node) = *self.node.lock() {
            if self.vm.wants_async_bind() {
                // Tear down as fence-ordered work; the TLB
                // invalidation coalesces into it.
                let fence = self.vm.bind_engine().queue_work(
                    SmallVec::new(),
                    WorkOp::Clear {
                        vm: self.vm.clone(),
                        range: node.range(),
                        detach: true,
                    },
                    Some(self.self_ref.clone()),
                );
                *self.active.lock() = Some(fence);
                self.vm.bind_engine().flush();
            } else {
                self.vm.clear_range(node.range(), true);
                self.vm.invalidate_tlbs(Some(node.range()));
            }
        }
        Ok(())
    }

    pub(crate) fn active_fence(&self) -> Option<Arc<Fence>> {
        self.active.lock().clone()
    }

    pub(crate) fn set_ufence(&self, uf: UserFence) {
        *self.ufence.lock() = Some(uf);
    }

    /// Attaches a debugger annotation.
    pub fn attach_metadata(&self, meta: VmaMetadata) {
        self.metadata.lock().push(meta);
    }

    pub fn metadata(&self) -> Vec<VmaMetadata> {
        self.metadata.lock().clone()
    }

    /// Registers a fence signalled when this VMA is destroyed.
    pub fn add_debug_fence(&self) -> Arc<Fence> {
        let f = Fence::new();
        self.debug_fences.lock().push(f.clone());
        f
    }
}

impl Drop for Vma {
    fn drop(&mut self) {
        // A VMA dropped while still holding a VA node (a failed bind
        // whose caller gave up) must not leak the range.
        if let Some(node) = self.node.get_mut().take() {
            self.vm.clear_range(node.range(), false);
            self.vm.invalidate_tlbs(Some(node.range()));
            self.vm.forget_bound(node.start);
            self.vm.mm.lock().remove(node);
            if *self.flags.get_mut() & PAGES_PINNED != 0 {
                if let Some(obj) = self.object.upgrade() {
                    obj.unpin_pages();
                }
            }
        }
        for f in self.debug_fences.get_mut().drain(..) {
            f.signal();
        }
    }
}

impl Debug for Vma {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Vma")
            .field("view", &self.view)
            .field("start", &self.start())
            .field("pins", &self.pin_count())
            .finish_non_exhaustive()
    }
}

pub(crate) fn vm_key(vm: &Arc<AddressSpace>) -> usize {
    Arc::as_ptr(vm) as usize
}

/// Pins into the global table, evicting unpinned VMAs on `ENOSPC`
/// until the pin fits or nothing is left to evict.
pub fn ggtt_pin(vma: &Arc<Vma>, opts: &PinOptions) -> Result<()> {
    loop {
        match vma.pin(opts) {
            Err(e) if e.error() == Errno::ENOSPC => {
                vma.vm().evict_some(vma.size())?;
            }
            other => return other,
        }
    }
}

/// Explicitly binds `[offset, offset + size)` of an object at `va`,
/// independent of any submission scope.
///
/// When a user fence is given, its write is queued behind both this
/// bind's completion and the previous user-fence write of the same
/// address space, preserving completion order.
pub fn vm_bind(
    obj: &Arc<Object>,
    vm: &Arc<AddressSpace>,
    va: Vaddr,
    offset: usize,
    size: usize,
    ufence: Option<UserFence>,
) -> Result<Arc<Vma>> {
    let view = if offset == 0 && size == obj.size() {
        View::whole(size)
    } else {
        View::partial(offset, size)
    };
    let vma = Vma::instance_persistent(obj, vm, view)?;
    let opts = PinOptions {
        fixed: Some(va),
        ..Default::default()
    };
    vma.pin(&opts)?;

    if let Some(uf) = ufence {
        let mut deps: SmallVec<[Arc<Fence>; 2]> = SmallVec::new();
        if let Some(act) = vma.active_fence() {
            deps.push(act);
        }
        let mut last = vm.last_ufence.lock();
        if let Some(prev) = last.clone() {
            deps.push(prev);
        }
        let fence = vm.bind_engine().queue_work(
            deps,
            WorkOp::WriteUserFence { ufence: uf.clone() },
            None,
        );
        *last = Some(fence);
        vma.set_ufence(uf);
    }

    // The binding persists without a transient pin.
    vma.unpin();
    Ok(vma)
}

/// Reverses a [`vm_bind`] at exactly `va`.
pub fn vm_unbind(vm: &Arc<AddressSpace>, va: Vaddr) -> Result<()> {
    let Some(vma) = vm.find_vma(va) else {
        return_errno_with_message!(Errno::EINVAL, "nothing bound here");
    };
    if vma.start() != Some(va) || !vma.is_persistent() {
        return_errno_with_message!(Errno::EINVAL, "not the start of a persistent binding");
    }
    vma.unbind()?;
    if let Ok(obj) = vma.object() {
        obj.vma_remove(&(vm_key(vm), vma.view()));
    }
    Ok(())
}

/// Binds a segmented object as a chain of adjacent VMAs, one per
/// segment, each with independent residency.
pub fn bind_segmented(
    parent: &Arc<Object>,
    vm: &Arc<AddressSpace>,
    opts: &PinOptions,
) -> Result<Vec<Arc<Vma>>> {
    let segments = parent.segments();
    if segments.is_empty() {
        return_errno_with_message!(Errno::EINVAL, "not a segmented object");
    }
    let total = parent.size();

    // Create the chain.
    let mut vmas = Vec::with_capacity(segments.len());
    for seg in segments {
        vmas.push(Vma::instance_raw(
            seg,
            vm,
            View::whole(seg.size()),
            false,
            total,
        )?);
    }
    for pair in vmas.windows(2) {
        *pair[0].adjacent.lock() = Some(pair[1].clone());
    }

    // Reserve one contiguous VA extent, then carve per-segment nodes
    // out of it under a single allocator lock.
    {
        let mut mm = vm.mm.lock();
        let whole = match opts.fixed {
            Some(va) => mm.insert_fixed(va, total)?,
            None => mm.insert(total, opts.align.max(PAGE_SIZE), 0..vm.total())?,
        };
        mm.remove(whole);
        let mut va = whole.start;
        for (seg, vma) in segments.iter().zip(vmas.iter()) {
            let node = mm.insert_fixed(va, seg.size())?;
            *vma.node.lock() = Some(node);
            va += seg.size();
        }
    }

    // Bind each segment; unwind on failure.
    for (i, vma) in vmas.iter().enumerate() {
        let pin_opts = PinOptions {
            fixed: vma.start(),
            ..opts.clone()
        };
        if let Err(e) = vma.pin(&pin_opts) {
            for bound in &vmas[..i] {
                bound.unpin();
            }
            let _ = unbind_chain_inner(&vmas);
            return Err(e);
        }
    }
    Ok(vmas)
}

/// Unbinds a whole segment chain, verifying adjacency first.
///
/// Partial chains are structurally invalid: the caller must pass the
/// first VMA, and every segment must still be linked, contiguous and
/// unpinned before any teardown starts.
pub fn unbind_chain(first: &Arc<Vma>) -> Result<()> {
    let mut chain = alloc::vec![first.clone()];
    let mut cur = first.clone();
    loop {
        let next = cur.adjacent.lock().clone();
        match next {
            Some(n) => {
                chain.push(n.clone());
                cur = n;
            }
            None => break,
        }
    }
    verify_adjacent_segments(&chain)?;
    if chain.iter().any(|v| v.is_pinned()) {
        return_errno!(Errno::EAGAIN);
    }
    unbind_chain_inner(&chain)
}

fn unbind_chain_inner(chain: &[Arc<Vma>]) -> Result<()> {
    for vma in chain {
        vma.unbind_inner()?;
    }
    Ok(())
}

/// Checks that a chain covers exactly its object's total length with
/// VA-adjacent segments.
fn verify_adjacent_segments(chain: &[Arc<Vma>]) -> Result<()> {
    let total = chain[0].chain_total;
    if total == 0 {
        return_errno_with_message!(Errno::EINVAL, "not a segment chain");
    }
    let sum: usize = chain.iter().map(|v| v.size()).sum();
    if sum != total {
        return_errno_with_message!(Errno::EINVAL, "segment chain is incomplete");
    }
    let mut expected = None;
    for vma in chain {
        let Some(start) = vma.start() else {
            return_errno_with_message!(Errno::EINVAL, "segment lost its address");
        };
        if let Some(want) = expected {
            if start != want {
                return_errno_with_message!(Errno::EINVAL, "segments are not adjacent");
            }
        }
        expected = Some(start + vma.size());
    }
    Ok(())
}
