// SPDX-License-Identifier: MPL-2.0

//! Buffer objects: the backing-store handles the page-table layer
//! binds.
//!
//! An object's pages are materialized lazily on the first pin and are
//! either fully absent or fully present. The residency record (region,
//! blocks, scatter list) lives behind the object's wound-wait lock;
//! the external identity of the object never changes, even when
//! migration swaps the record wholesale.

pub(crate) mod backend;
pub mod migrate;

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use smallvec::SmallVec;

pub(crate) use self::backend::{Backend, Residency, Shadow};
use crate::{
    gt::Gt,
    mm::{
        page_prop::{CachePolicy, PageFlags, PageProperty},
        region::{MemoryRegion, RegionKind},
        sg::ScatterList,
        PageSizes, PAGE_SIZE, SZ_4K,
    },
    prelude::*,
    sync::{Fence, WwClass, WwGuard, WwMutex, WwTransaction},
    vma::{View, Vma},
};

bitflags! {
    /// Object behavior flags.
    pub struct ObjectFlags: u32 {
        /// Backing pages must be physically contiguous.
        const CONTIGUOUS = 1 << 0;
        /// Contents may be discarded whenever the pages are released.
        const VOLATILE = 1 << 1;
        /// GPU mappings must refuse writes.
        const READONLY = 1 << 2;
        /// Backed by pinned user pages.
        const USERPTR = 1 << 3;
    }
}

/// Purgeability advice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Madv {
    /// Contents are needed; the default.
    WillNeed,
    /// Contents may be discarded under memory pressure.
    DontNeed,
    /// Contents have been discarded.
    Purged,
}

/// The ww-locked mutable side of an object.
pub(crate) struct ObjectState {
    pub backend: Backend,
    pub resident: Option<Residency>,
    pub swapto: Option<Shadow>,
    pub madv: Madv,
    /// Completion of an in-flight migration copy, if any.
    pub migrating: Option<Arc<Fence>>,
}

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// A buffer object.
pub struct Object {
    id: u64,
    size: usize,
    flags: ObjectFlags,
    cache: CachePolicy,
    /// Regions this object may reside in, in preference order.
    placements: SmallVec<[Arc<MemoryRegion>; 2]>,
    ww: Arc<WwClass>,
    state: WwMutex<ObjectState>,
    pages_pin: AtomicUsize,
    /// VMAs keyed by (address space, view).
    vma_tree: Mutex<BTreeMap<(usize, View), Arc<Vma>>>,
    /// Child segment objects of a segmented buffer.
    segments: Vec<Arc<Object>>,
    /// The blit engine used for swaps and migration copies.
    blit: Option<Arc<Gt>>,
}

impl Object {
    /// Allocates an object in `region`, zeroed on first use, the way
    /// the creation ioctls publish fresh buffers.
    pub fn create(
        region: &Arc<MemoryRegion>,
        size: usize,
        flags: ObjectFlags,
        cache: CachePolicy,
        ww: &Arc<WwClass>,
        swap_to: Option<Arc<MemoryRegion>>,
        blit: Option<Arc<Gt>>,
    ) -> Result<Arc<Self>> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return_errno_with_message!(Errno::EINVAL, "object size must be page aligned");
        }
        let mut placements = SmallVec::new();
        placements.push(region.clone());
        if let Some(smem) = &swap_to {
            placements.push(smem.clone());
        }
        Ok(Arc::new(Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            size,
            flags,
            cache,
            placements,
            ww: ww.clone(),
            state: WwMutex::new(ObjectState {
                backend: backend::backend_for(region, swap_to),
                resident: None,
                swapto: None,
                madv: Madv::WillNeed,
                migrating: None,
            }),
            pages_pin: AtomicUsize::new(0),
            vma_tree: Mutex::new(BTreeMap::new()),
            segments: Vec::new(),
            blit,
        }))
    }

    /// An object in the stolen range; fails later with `ENODEV` when
    /// the machine reserved none.
    pub fn create_stolen(
        stolen: Option<&Arc<MemoryRegion>>,
        size: usize,
        ww: &Arc<WwClass>,
    ) -> Result<Arc<Self>> {
        if size == 0 || size % PAGE_SIZE != 0 {
            return_errno_with_message!(Errno::EINVAL, "object size must be page aligned");
        }
        let mut placements = SmallVec::new();
        if let Some(r) = stolen {
            placements.push(r.clone());
        }
        Ok(Arc::new(Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            size,
            flags: ObjectFlags::CONTIGUOUS,
            cache: CachePolicy::Uncacheable,
            placements,
            ww: ww.clone(),
            state: WwMutex::new(ObjectState {
                backend: Backend::Stolen {
                    region: stolen.cloned(),
                },
                resident: None,
                swapto: None,
                madv: Madv::WillNeed,
                migrating: None,
            }),
            pages_pin: AtomicUsize::new(0),
            vma_tree: Mutex::new(BTreeMap::new()),
            segments: Vec::new(),
            blit: None,
        }))
    }

    /// Wraps caller-owned memory as pinned user pages.
    pub fn create_userptr(
        smem: &Arc<MemoryRegion>,
        data: Vec<u8>,
        ww: &Arc<WwClass>,
    ) -> Result<Arc<Self>> {
        use align_ext::AlignExt;
        if data.is_empty() {
            return_errno_with_message!(Errno::EINVAL, "empty user range");
        }
        let size = data.len().align_up(PAGE_SIZE);
        let mut placements = SmallVec::new();
        placements.push(smem.clone());
        Ok(Arc::new(Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            size,
            flags: ObjectFlags::USERPTR,
            cache: CachePolicy::Writeback,
            placements,
            ww: ww.clone(),
            state: WwMutex::new(ObjectState {
                backend: Backend::Userptr {
                    region: smem.clone(),
                    host: Mutex::new(data),
                },
                resident: None,
                swapto: None,
                madv: Madv::WillNeed,
                migrating: None,
            }),
            pages_pin: AtomicUsize::new(0),
            vma_tree: Mutex::new(BTreeMap::new()),
            segments: Vec::new(),
            blit: None,
        }))
    }

    /// A large buffer split into independently resident segments.
    ///
    /// Segments bind as a chain of adjacent VMAs; see
    /// [`crate::vma::bind_segmented`].
    pub fn create_segmented(
        region: &Arc<MemoryRegion>,
        total: usize,
        segment_size: usize,
        ww: &Arc<WwClass>,
        blit: Option<Arc<Gt>>,
    ) -> Result<Arc<Self>> {
        if segment_size == 0
            || segment_size % PAGE_SIZE != 0
            || total == 0
            || total % segment_size != 0
        {
            return_errno_with_message!(Errno::EINVAL, "bad segment geometry");
        }
        let mut segments = Vec::new();
        for _ in 0..total / segment_size {
            segments.push(Self::create(
                region,
                segment_size,
                ObjectFlags::empty(),
                CachePolicy::Writeback,
                ww,
                None,
                blit.clone(),
            )?);
        }
        let mut placements = SmallVec::new();
        placements.push(region.clone());
        Ok(Arc::new(Self {
            id: NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed),
            size: total,
            flags: ObjectFlags::empty(),
            cache: CachePolicy::Writeback,
            placements,
            ww: ww.clone(),
            state: WwMutex::new(ObjectState {
                backend: backend::backend_for(region, None),
                resident: None,
                swapto: None,
                madv: Madv::WillNeed,
                migrating: None,
            }),
            pages_pin: AtomicUsize::new(0),
            vma_tree: Mutex::new(BTreeMap::new()),
            segments,
            blit,
        }))
    }

    /// A stable identity that survives migration, standing in for the
    /// userspace handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn flags(&self) -> ObjectFlags {
        self.flags
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(ObjectFlags::READONLY)
    }

    pub fn placements(&self) -> &[Arc<MemoryRegion>] {
        &self.placements
    }

    /// Whether this object's placement list asks for device memory.
    pub fn prefers_lmem(&self) -> bool {
        self.placements
            .first()
            .is_some_and(|r| r.kind() == RegionKind::Lmem)
    }

    pub fn segments(&self) -> &[Arc<Object>] {
        &self.segments
    }

    pub fn ww_class(&self) -> &Arc<WwClass> {
        &self.ww
    }

    pub(crate) fn blit_gt(&self) -> Option<&Arc<Gt>> {
        self.blit.as_ref()
    }

    /// Takes the object lock inside a ww transaction.
    pub(crate) fn lock_ww(&self, txn: &WwTransaction<'_>) -> Result<WwGuard<'_, ObjectState>> {
        self.state.lock_ww(txn)
    }

    /// Takes the object lock outside any transaction.
    pub(crate) fn lock_single(&self) -> WwGuard<'_, ObjectState> {
        self.state.lock_single()
    }

    /// Materializes and pins the pages.
    ///
    /// Idempotent: further pins only bump the count.
    pub(crate) fn pin_pages_locked(&self, st: &mut ObjectState) -> Result<()> {
        if let Some(f) = st.migrating.clone() {
            f.wait()?;
            st.migrating = None;
        }
        match st.madv {
            Madv::Purged => {
                return_errno_with_message!(Errno::EFAULT, "object content was purged")
            }
            _ => (),
        }
        if st.resident.is_none() {
            let shadow = st.swapto.take();
            let zero = shadow.is_none() && !self.flags.contains(ObjectFlags::USERPTR);
            st.resident = Some(st.backend.get_pages(
                self.size,
                self.flags,
                shadow,
                self.blit.as_ref(),
                zero,
            )?);
        }
        self.pages_pin.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn unpin_pages(&self) {
        let prev = self.pages_pin.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unbalanced page unpin");
    }

    pub fn pages_pinned(&self) -> usize {
        self.pages_pin.load(Ordering::Acquire)
    }

    /// Releases pages, swapping content out when the backend keeps a
    /// shadow. Leaves the residency record empty on success.
    pub(crate) fn put_pages_locked(&self, st: &mut ObjectState) -> Result<()> {
        if self.pages_pinned() > 0 {
            return_errno_with_message!(Errno::EBUSY, "pages are pinned");
        }
        let Some(resident) = st.resident.take() else {
            return Ok(());
        };
        let discard = self.flags.contains(ObjectFlags::VOLATILE) || st.madv != Madv::WillNeed;
        match st.backend.put_pages(resident, discard, self.blit.as_ref()) {
            Ok(shadow) => {
                st.swapto = shadow;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// The scatter sub-list backing `[offset, offset + len)`.
    pub(crate) fn sg_slice(&self, st: &ObjectState, offset: usize, len: usize) -> Result<ScatterList> {
        let Some(res) = &st.resident else {
            return_errno_with_message!(Errno::EINVAL, "object has no pages");
        };
        if offset + len > res.sg.len() {
            return_errno_with_message!(Errno::EINVAL, "view outside the object");
        }
        Ok(res.sg.slice(offset, len))
    }

    /// The page property GPU mappings of this object get.
    pub(crate) fn mapping_prop(&self, st: &ObjectState) -> PageProperty {
        let local = st
            .resident
            .as_ref()
            .map(|r| r.region.kind() == RegionKind::Lmem)
            .unwrap_or(false);
        let mut flags = PageFlags::R;
        if !self.is_readonly() {
            flags |= PageFlags::W;
        }
        // Hardware atomics only reach device memory.
        if local {
            flags |= PageFlags::ATOMIC;
        }
        PageProperty::new(flags, self.cache, local)
    }

    /// The largest mapping granule the current residency supports.
    pub(crate) fn mapping_chunk(&self, st: &ObjectState, sizes: PageSizes) -> usize {
        let Some(res) = &st.resident else {
            return SZ_4K;
        };
        let chunk = res.sg.max_uniform_chunk(SZ_4K);
        sizes
            .descending()
            .find(|&ps| ps <= chunk)
            .unwrap_or(SZ_4K)
    }

    /// The region the pages currently live in.
    pub fn current_region(&self) -> Option<Arc<MemoryRegion>> {
        let st = self.lock_single();
        st.resident.as_ref().map(|r| r.region.clone())
    }

    pub fn is_resident(&self) -> bool {
        self.lock_single().resident.is_some()
    }

    pub fn is_swapped_out(&self) -> bool {
        self.lock_single().swapto.is_some()
    }

    /// Reads object content, for content-preservation checks.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let st = self.lock_single();
        let Some(res) = &st.resident else {
            return_errno_with_message!(Errno::EINVAL, "object has no pages");
        };
        let mut cur = res.sg.cursor();
        let mut skip = offset;
        while skip > 0 {
            let n = cur.contiguous_left().min(skip);
            cur.advance(n);
            skip -= n;
        }
        let mut off = 0;
        while off < buf.len() {
            let n = cur.contiguous_left().min(buf.len() - off);
            res.region.read(cur.addr(), &mut buf[off..off + n]);
            cur.advance(n);
            off += n;
        }
        Ok(())
    }

    /// Writes object content.
    pub fn write(&self, offset: usize, buf: &[u8]) -> Result<()> {
        let st = self.lock_single();
        let Some(res) = &st.resident else {
            return_errno_with_message!(Errno::EINVAL, "object has no pages");
        };
        let mut cur = res.sg.cursor();
        let mut skip = offset;
        while skip > 0 {
            let n = cur.contiguous_left().min(skip);
            cur.advance(n);
            skip -= n;
        }
        let mut off = 0;
        while off < buf.len() {
            let n = cur.contiguous_left().min(buf.len() - off);
            res.region.write(cur.addr(), &buf[off..off + n]);
            cur.advance(n);
            off += n;
        }
        Ok(())
    }

    /// Applies purgeability advice, returning the previous state.
    ///
    /// Once purged, an object stays purged; only fresh pins observe
    /// the `EFAULT`.
    pub fn madv(&self, advice: Madv) -> Madv {
        debug_assert_ne!(advice, Madv::Purged);
        let mut st = self.lock_single();
        let old = st.madv;
        if old != Madv::Purged {
            st.madv = advice;
        }
        old
    }

    /// Drops the content of a `DontNeed` object under memory
    /// pressure. No-op when pinned or not marked.
    pub fn purge(&self) -> bool {
        let mut st = self.lock_single();
        if st.madv != Madv::DontNeed || self.pages_pinned() > 0 {
            return false;
        }
        if let Some(res) = st.resident.take() {
            res.region.free(res.blocks);
        }
        if let Some(sh) = st.swapto.take() {
            sh.region.free(sh.blocks);
        }
        st.madv = Madv::Purged;
        debug!("object {} purged", self.id);
        true
    }

    // VMA tree maintenance; the tree owns the VMAs of this object.

    pub(crate) fn vma_lookup(&self, key: (usize, View)) -> Option<Arc<Vma>> {
        self.vma_tree.lock().get(&key).cloned()
    }

    pub(crate) fn vma_insert(&self, key: (usize, View), vma: &Arc<Vma>) {
        let old = self.vma_tree.lock().insert(key, vma.clone());
        debug_assert!(old.is_none(), "vma registered twice");
    }

    pub(crate) fn vma_remove(&self, key: &(usize, View)) -> Option<Arc<Vma>> {
        self.vma_tree.lock().remove(key)
    }

    pub(crate) fn vmas(&self) -> Vec<Arc<Vma>> {
        self.vma_tree.lock().values().cloned().collect()
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        if self.pages_pinned() != 0 {
            warn!("object {} destroyed with pinned pages", self.id);
        }
        // Release any residual backing.
        let mut st = self.state.lock_single();
        if let Some(res) = st.resident.take() {
            res.region.free(res.blocks);
        }
        if let Some(sh) = st.swapto.take() {
            sh.region.free(sh.blocks);
        }
    }
}

impl Debug for Object {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

pub use migrate::migrate;

#[cfg(test)]
mod test {
    use super::*;
    use crate::mm::{region::RegionKind, SZ_2M, SZ_64K};

    fn regions() -> (Arc<MemoryRegion>, Arc<MemoryRegion>) {
        let lmem = MemoryRegion::new("lmem", RegionKind::Lmem, 0x1_0000_0000, 8 * SZ_2M, SZ_4K);
        let smem = MemoryRegion::new("smem", RegionKind::Smem, 0, 8 * SZ_2M, SZ_4K);
        (lmem, smem)
    }

    #[test]
    fn pages_are_lazy_and_idempotent() {
        let (lmem, _) = regions();
        let ww = Arc::new(WwClass::new());
        let obj = Object::create(
            &lmem,
            SZ_2M,
            ObjectFlags::empty(),
            CachePolicy::Writeback,
            &ww,
            None,
            None,
        )
        .unwrap();
        assert!(!obj.is_resident());

        let mut st = obj.lock_single();
        obj.pin_pages_locked(&mut st).unwrap();
        obj.pin_pages_locked(&mut st).unwrap();
        drop(st);
        assert!(obj.is_resident());
        assert_eq!(obj.pages_pinned(), 2);
        assert_eq!(lmem.avail(), (7 * SZ_2M) as u64);

        obj.unpin_pages();
        obj.unpin_pages();
        // Pages stay resident until put, purge or destroy.
        assert!(obj.is_resident());
        drop(obj);
        assert_eq!(lmem.avail(), (8 * SZ_2M) as u64);
    }

    #[test]
    fn fresh_pages_are_zeroed() {
        let (lmem, _) = regions();
        let ww = Arc::new(WwClass::new());
        let obj = Object::create(
            &lmem,
            SZ_4K,
            ObjectFlags::empty(),
            CachePolicy::Writeback,
            &ww,
            None,
            None,
        )
        .unwrap();
        let mut st = obj.lock_single();
        obj.pin_pages_locked(&mut st).unwrap();
        drop(st);
        let mut buf = [0xffu8; 64];
        obj.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 64]);
        obj.unpin_pages();
    }

    #[test]
    fn swap_out_and_back_preserves_content() {
        let (lmem, smem) = regions();
        let ww = Arc::new(WwClass::new());
        let obj = Object::create(
            &lmem,
            SZ_64K,
            ObjectFlags::empty(),
            CachePolicy::Writeback,
            &ww,
            Some(smem.clone()),
            None,
        )
        .unwrap();

        let mut st = obj.lock_single();
        obj.pin_pages_locked(&mut st).unwrap();
        drop(st);
        obj.write(0, &[0x5a; 128]).unwrap();
        obj.write(SZ_64K - 16, &[0xa5; 16]).unwrap();
        obj.unpin_pages();

        let lmem_avail = lmem.avail();
        let mut st = obj.lock_single();
        obj.put_pages_locked(&mut st).unwrap();
        drop(st);
        assert!(!obj.is_resident());
        assert!(obj.is_swapped_out());
        assert_eq!(lmem.avail(), lmem_avail + SZ_64K as u64);

        let mut st = obj.lock_single();
        obj.pin_pages_locked(&mut st).unwrap();
        drop(st);
        assert!(!obj.is_swapped_out());
        let mut buf = [0u8; 128];
        obj.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0x5a; 128]);
        let mut tail = [0u8; 16];
        obj.read(SZ_64K - 16, &mut tail).unwrap();
        assert_eq!(tail, [0xa5; 16]);
        obj.unpin_pages();
    }

    #[test]
    fn purged_objects_refuse_pins() {
        let (lmem, _) = regions();
        let ww = Arc::new(WwClass::new());
        let obj = Object::create(
            &lmem,
            SZ_4K,
            ObjectFlags::empty(),
            CachePolicy::Writeback,
            &ww,
            None,
            None,
        )
        .unwrap();
        let mut st = obj.lock_single();
        obj.pin_pages_locked(&mut st).unwrap();
        drop(st);
        obj.unpin_pages();

        assert_eq!(obj.madv(Madv::DontNeed), Madv::WillNeed);
        assert!(obj.purge());
        assert!(!obj.is_resident());

        let mut st = obj.lock_single();
        let err = obj.pin_pages_locked(&mut st).unwrap_err();
        assert_eq!(err.error(), Errno::EFAULT);
    }

    #[test]
    fn stolen_without_reservation_is_enodev() {
        let ww = Arc::new(WwClass::new());
        let obj = Object::create_stolen(None, SZ_4K, &ww).unwrap();
        let mut st = obj.lock_single();
        assert_eq!(
            obj.pin_pages_locked(&mut st).unwrap_err().error(),
            Errno::ENODEV
        );
    }

    #[test]
    fn userptr_round_trips_host_content() {
        let (_, smem) = regions();
        let ww = Arc::new(WwClass::new());
        let data = alloc::vec![0xc3u8; 3 * SZ_4K];
        let obj = Object::create_userptr(&smem, data, &ww).unwrap();
        let mut st = obj.lock_single();
        obj.pin_pages_locked(&mut st).unwrap();
        drop(st);
        let mut buf = [0u8; 32];
        obj.read(SZ_4K, &mut buf).unwrap();
        assert_eq!(buf, [0xc3; 32]);
        obj.unpin_pages();
    }
}
