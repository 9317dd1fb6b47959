// SPDX-License-Identifier: MPL-2.0

//! Object migration between memory regions.
//!
//! Migration allocates donor pages in the destination region, copies
//! live content across (blit engine when healthy, CPU otherwise), and
//! swaps the residency record under the object lock. The object's
//! identity — handle, VMA tree, placement list — never changes, so
//! userspace handles resolve the same object before and after.

use super::{backend, Object};
use crate::{
    mm::region::{AllocFlags, MemoryRegion, RegionKind},
    prelude::*,
    sync::{Fence, WwTransaction},
};

/// Moves `obj`'s residency into `dst`.
///
/// All VMAs must be unbindable: bound mappings are torn down first
/// (resident pages cannot move under the GPU's feet). Fails with
/// `EBUSY` when the pages are pinned and `nowait` forbids waiting;
/// `EDEADLK` propagates for the caller's ww backoff.
pub fn migrate(
    obj: &Arc<Object>,
    txn: &WwTransaction<'_>,
    dst: &Arc<MemoryRegion>,
    nowait: bool,
) -> Result<()> {
    // Unbind every VMA; a pinned one means the object is in active
    // use and the migration loses.
    for vma in obj.vmas() {
        match vma.unbind() {
            Ok(()) => (),
            Err(e) if e.error() == Errno::EAGAIN => {
                return_errno_with_message!(Errno::EBUSY, "mapping is pinned");
            }
            Err(e) => return Err(e),
        }
    }

    let mut st = obj.lock_ww(txn)?;

    if obj.pages_pinned() > 0 {
        if nowait {
            return_errno_with_message!(Errno::EBUSY, "pages are pinned");
        }
        // Bounded wait for transient pins; the production driver
        // parks on the object's resv here.
        let mut spins = 0u32;
        while obj.pages_pinned() > 0 {
            core::hint::spin_loop();
            spins += 1;
            if spins > 1_000_000 {
                return_errno_with_message!(Errno::EBUSY, "pages stayed pinned");
            }
        }
    }

    if let Some(f) = st.migrating.clone() {
        f.wait()?;
        st.migrating = None;
    }

    let Some(old) = st.resident.take() else {
        // Nothing resident: just retarget the backend. The next
        // get_pages lands in the destination.
        st.backend = backend::backend_for(dst, swap_region(&st.backend));
        debug!("object {}: retargeted to {}", obj.id(), dst.name());
        return Ok(());
    };

    if Arc::ptr_eq(&old.region, dst) {
        st.resident = Some(old);
        return Ok(());
    }

    // Donor allocation in the destination.
    let alloc_flags = if obj.flags().contains(super::ObjectFlags::CONTIGUOUS) {
        AllocFlags::CONTIGUOUS
    } else {
        AllocFlags::empty()
    };
    let blocks = match dst.alloc(old.sg.len(), alloc_flags, 0) {
        Ok(b) => b,
        Err(e) => {
            st.resident = Some(old);
            return Err(e);
        }
    };
    let sg = dst.sg_of(&blocks);

    // The copy. A wedged blit engine degrades to the CPU path inside.
    let fence = Fence::new();
    st.migrating = Some(fence.clone());
    backend::copy_between_sg(&old.region, &old.sg, dst, &sg, obj.blit_gt());
    fence.signal();
    st.migrating = None;

    // The body swap: same object, new insides.
    debug!(
        "object {}: migrated {} -> {} ({} bytes)",
        obj.id(),
        old.region.name(),
        dst.name(),
        sg.len()
    );
    old.region.free(old.blocks);
    st.backend = backend::backend_for(dst, swap_region(&st.backend));
    st.resident = Some(backend::Residency {
        region: dst.clone(),
        blocks,
        sg,
    });
    Ok(())
}

/// Carries the swap-shadow region across a backend swap.
fn swap_region(backend: &backend::Backend) -> Option<Arc<MemoryRegion>> {
    match backend {
        backend::Backend::Lmem { swap_to, .. } => swap_to.clone(),
        _ => None,
    }
}

/// Whether migrating `obj` into `dst` is sensible right now.
///
/// The availability heuristic: never migrate into a region that is
/// more than half full, and never "migrate" to where we already are.
pub fn should_migrate(obj: &Object, dst: &Arc<MemoryRegion>) -> bool {
    if !dst.has_migration_headroom() {
        return false;
    }
    match obj.current_region() {
        Some(cur) => !Arc::ptr_eq(&cur, dst),
        None => true,
    }
}

/// Picks the destination a fault or access hint should migrate
/// toward: the first device-local placement of the object.
pub fn preferred_lmem(obj: &Object) -> Option<Arc<MemoryRegion>> {
    obj.placements()
        .iter()
        .find(|r| r.kind() == RegionKind::Lmem)
        .cloned()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        mm::{
            page_prop::CachePolicy,
            region::MemoryRegion,
            SZ_2M, SZ_4K,
        },
        object::ObjectFlags,
        sync::{ww_retry, WwClass},
    };

    fn regions() -> (Arc<MemoryRegion>, Arc<MemoryRegion>) {
        let lmem = MemoryRegion::new("lmem", RegionKind::Lmem, 0x1_0000_0000, 8 * SZ_2M, SZ_4K);
        let smem = MemoryRegion::new("smem", RegionKind::Smem, 0, 8 * SZ_2M, SZ_4K);
        (lmem, smem)
    }

    #[test]
    fn migration_preserves_content_and_identity() {
        let (lmem, smem) = regions();
        let ww = Arc::new(WwClass::new());
        let obj = Object::create(
            &smem,
            SZ_2M,
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
        obj.write(0, b"migration test pattern").unwrap();
        obj.write(SZ_2M - 8, &[9u8; 8]).unwrap();
        obj.unpin_pages();

        let id_before = obj.id();
        ww_retry(&ww, |txn| migrate(&obj, txn, &lmem, false)).unwrap();

        assert_eq!(obj.id(), id_before);
        assert_eq!(
            obj.current_region().unwrap().kind(),
            RegionKind::Lmem
        );
        let mut buf = [0u8; 22];
        obj.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"migration test pattern");
        let mut tail = [0u8; 8];
        obj.read(SZ_2M - 8, &mut tail).unwrap();
        assert_eq!(tail, [9u8; 8]);

        // The source region got its bytes back.
        assert_eq!(smem.avail(), (8 * SZ_2M) as u64);
    }

    #[test]
    fn pinned_pages_fail_nowait_with_ebusy() {
        let (lmem, smem) = regions();
        let ww = Arc::new(WwClass::new());
        let obj = Object::create(
            &smem,
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

        let err = ww_retry(&ww, |txn| migrate(&obj, txn, &lmem, true)).unwrap_err();
        assert_eq!(err.error(), Errno::EBUSY);
        obj.unpin_pages();
    }

    #[test]
    fn absent_objects_just_retarget() {
        let (lmem, smem) = regions();
        let ww = Arc::new(WwClass::new());
        let obj = Object::create(
            &smem,
            SZ_4K,
            ObjectFlags::empty(),
            CachePolicy::Writeback,
            &ww,
            None,
            None,
        )
        .unwrap();
        ww_retry(&ww, |txn| migrate(&obj, txn, &lmem, true)).unwrap();
        let mut st = obj.lock_single();
        obj.pin_pages_locked(&mut st).unwrap();
        drop(st);
        assert_eq!(obj.current_region().unwrap().kind(), RegionKind::Lmem);
        obj.unpin_pages();
    }

    #[test]
    fn headroom_heuristic() {
        let (lmem, smem) = regions();
        let ww = Arc::new(WwClass::new());
        let obj = Object::create(
            &smem,
            SZ_4K,
            ObjectFlags::empty(),
            CachePolicy::Writeback,
            &ww,
            None,
            None,
        )
        .unwrap();
        assert!(should_migrate(&obj, &lmem));

        // Fill lmem beyond half.
        let hog = lmem.alloc(5 * SZ_2M, crate::mm::region::AllocFlags::empty(), 0).unwrap();
        assert!(!should_migrate(&obj, &lmem));
        lmem.free(hog);
        assert!(should_migrate(&obj, &lmem));
    }
}
