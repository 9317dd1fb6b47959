// SPDX-License-Identifier: MPL-2.0

//! Backing-store backends.
//!
//! Four strategies produce an object's pages: buddy-allocated
//! device-local memory, system memory, the BIOS stolen range, and
//! pinned user pages. Each yields a scatter list whose addresses are
//! immediately usable for PTE writes.

use crate::{
    gt::Gt,
    mm::{
        region::{AllocFlags, BlockList, MemoryRegion, RegionKind},
        sg::ScatterList,
        DeviceAddr, SZ_4K,
    },
    object::ObjectFlags,
    prelude::*,
};

/// Resident pages of an object.
#[derive(Debug)]
pub(crate) struct Residency {
    pub region: Arc<MemoryRegion>,
    pub blocks: BlockList,
    pub sg: ScatterList,
}

/// The swapped-out mirror of an LMEM object's content.
#[derive(Debug)]
pub(crate) struct Shadow {
    pub region: Arc<MemoryRegion>,
    pub blocks: BlockList,
    pub sg: ScatterList,
}

/// Where and how an object's pages are materialized.
pub(crate) enum Backend {
    /// Buddy-allocated device-local memory, optionally mirrored to a
    /// system-memory shadow instead of being freed on `put_pages`.
    Lmem {
        region: Arc<MemoryRegion>,
        swap_to: Option<Arc<MemoryRegion>>,
    },
    /// Plain system memory.
    Smem { region: Arc<MemoryRegion> },
    /// The BIOS-reserved range; absent on machines without one.
    Stolen { region: Option<Arc<MemoryRegion>> },
    /// Pinned user pages, bounced through system memory for DMA.
    Userptr {
        region: Arc<MemoryRegion>,
        host: Mutex<Vec<u8>>,
    },
}

impl Backend {
    pub(crate) fn region(&self) -> Option<&Arc<MemoryRegion>> {
        match self {
            Backend::Lmem { region, .. } => Some(region),
            Backend::Smem { region } => Some(region),
            Backend::Stolen { region } => region.as_ref(),
            Backend::Userptr { region, .. } => Some(region),
        }
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Backend::Lmem { .. } => "lmem",
            Backend::Smem { .. } => "smem",
            Backend::Stolen { .. } => "stolen",
            Backend::Userptr { .. } => "userptr",
        }
    }

    /// Materializes pages.
    ///
    /// Idempotency and locking are the caller's: this runs under the
    /// object's ww lock and only when no pages are resident. A
    /// present `shadow` means the content was swapped out earlier and
    /// must be copied back in.
    pub(crate) fn get_pages(
        &self,
        size: usize,
        flags: ObjectFlags,
        shadow: Option<Shadow>,
        blit: Option<&Arc<Gt>>,
        zero_on_alloc: bool,
    ) -> Result<Residency> {
        let (region, alloc_flags) = match self {
            Backend::Lmem { region, .. } | Backend::Smem { region } => {
                let af = if flags.contains(ObjectFlags::CONTIGUOUS) {
                    AllocFlags::CONTIGUOUS
                } else {
                    AllocFlags::empty()
                };
                (region.clone(), af)
            }
            Backend::Stolen { region } => {
                let Some(region) = region else {
                    return_errno_with_message!(Errno::ENODEV, "no stolen memory on this machine");
                };
                // Stolen carveouts are contiguous by construction.
                (region.clone(), AllocFlags::CONTIGUOUS)
            }
            Backend::Userptr { region, .. } => (region.clone(), AllocFlags::empty()),
        };

        let blocks = region.alloc(size, alloc_flags, 0)?;
        let sg = region.sg_of(&blocks);

        match self {
            Backend::Userptr { host, .. } => {
                // DMA-map the pinned user range: bounce the content in.
                let host = host.lock();
                copy_into_sg(&region, &sg, &host);
            }
            _ => {
                if let Some(shadow) = shadow {
                    swap_in(&region, &sg, shadow, blit)?;
                } else if zero_on_alloc {
                    for e in sg.entries() {
                        region.clear(e.addr, e.len);
                    }
                }
            }
        }

        trace!(
            "{}: got {} pages ({} runs)",
            self.kind_name(),
            size / SZ_4K,
            sg.nents()
        );
        Ok(Residency { region, blocks, sg })
    }

    /// Releases pages.
    ///
    /// On LMEM with a swap policy the content is preserved in a
    /// system-memory shadow for a later swap-in; the returned shadow
    /// replaces the residency so a double free is structurally
    /// impossible.
    pub(crate) fn put_pages(
        &self,
        resident: Residency,
        discard: bool,
        blit: Option<&Arc<Gt>>,
    ) -> Result<Option<Shadow>> {
        if let (Backend::Lmem { swap_to: Some(smem), .. }, false) = (self, discard) {
            let shadow = swap_out(&resident, smem, blit)?;
            resident.region.free(resident.blocks);
            return Ok(Some(shadow));
        }

        if let Backend::Userptr { host, .. } = self {
            if !discard {
                // Bounce the DMA view back to the pinned user range.
                let mut host = host.lock();
                copy_from_sg(&resident.region, &resident.sg, &mut host);
            }
        }

        resident.region.free(resident.blocks);
        Ok(None)
    }
}

/// Copies live content out to a freshly allocated shadow.
fn swap_out(
    resident: &Residency,
    smem: &Arc<MemoryRegion>,
    blit: Option<&Arc<Gt>>,
) -> Result<Shadow> {
    let blocks = smem.alloc(resident.sg.len(), AllocFlags::empty(), 0)?;
    let sg = smem.sg_of(&blocks);
    copy_between_sg(&resident.region, &resident.sg, smem, &sg, blit);
    debug!("swap-out: {} bytes to {}", sg.len(), smem.name());
    Ok(Shadow {
        region: smem.clone(),
        blocks,
        sg,
    })
}

/// Copies a shadow back into new device pages and releases it.
fn swap_in(
    region: &Arc<MemoryRegion>,
    sg: &ScatterList,
    shadow: Shadow,
    blit: Option<&Arc<Gt>>,
) -> Result<()> {
    copy_between_sg(&shadow.region, &shadow.sg, region, sg, blit);
    debug!("swap-in: {} bytes from {}", sg.len(), shadow.region.name());
    shadow.region.free(shadow.blocks);
    Ok(())
}

/// Copies content between two scatter lists of equal length, using
/// the blit engine when one is given and healthy, the CPU otherwise.
pub(crate) fn copy_between_sg(
    src_region: &MemoryRegion,
    src: &ScatterList,
    dst_region: &MemoryRegion,
    dst: &ScatterList,
    blit: Option<&Arc<Gt>>,
) {
    debug_assert_eq!(src.len(), dst.len());
    match blit {
        Some(gt) if !gt.is_wedged() => gt.note_blit(),
        Some(_) => trace!("blit engine wedged, copying with the CPU"),
        None => (),
    }

    let mut s = src.cursor();
    let mut d = dst.cursor();
    let mut buf = [0u8; SZ_4K];
    let mut left = src.len();
    while left > 0 {
        let n = s.contiguous_left().min(d.contiguous_left()).min(SZ_4K);
        let chunk = &mut buf[..n];
        src_region.read(s.addr(), chunk);
        dst_region.write(d.addr(), chunk);
        s.advance(n);
        d.advance(n);
        left -= n;
    }
}

fn copy_into_sg(region: &MemoryRegion, sg: &ScatterList, data: &[u8]) {
    let mut cur = sg.cursor();
    let mut off = 0;
    while off < data.len() {
        let n = cur.contiguous_left().min(data.len() - off);
        region.write(cur.addr(), &data[off..off + n]);
        cur.advance(n);
        off += n;
    }
}

fn copy_from_sg(region: &MemoryRegion, sg: &ScatterList, data: &mut [u8]) {
    let mut cur = sg.cursor();
    let mut off = 0;
    while off < data.len() {
        let n = cur.contiguous_left().min(data.len() - off);
        region.read(cur.addr(), &mut data[off..off + n]);
        cur.advance(n);
        off += n;
    }
}

/// Builds the backend for a region at object creation time.
pub(crate) fn backend_for(
    region: &Arc<MemoryRegion>,
    swap_to: Option<Arc<MemoryRegion>>,
) -> Backend {
    match region.kind() {
        RegionKind::Lmem => Backend::Lmem {
            region: region.clone(),
            swap_to,
        },
        RegionKind::Smem => Backend::Smem {
            region: region.clone(),
        },
        RegionKind::Stolen => Backend::Stolen {
            region: Some(region.clone()),
        },
    }
}

/// Total bytes of a scatter list that stay addressable from `addr`.
#[allow(dead_code)]
pub(crate) fn sg_contains(sg: &ScatterList, addr: DeviceAddr) -> bool {
    sg.entries()
        .iter()
        .any(|e| addr >= e.addr && addr < e.addr + e.len as DeviceAddr)
}
