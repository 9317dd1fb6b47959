// SPDX-License-Identifier: MPL-2.0

//! Memory regions: the physically contiguous pools objects live in.
//!
//! A region is either a device-local VRAM tile, a system-memory pool,
//! or the BIOS-reserved "stolen" range. All blocks handed out are
//! powers of two of the region's minimum page size and never overlap.

pub mod buddy;

use core::sync::atomic::{AtomicU64, Ordering};

use align_ext::AlignExt;

pub use self::buddy::{Block, BlockList, BuddyOrder};
use super::{sg::ScatterList, DeviceAddr};
use crate::prelude::*;

/// What a region is backed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// Device-local memory (VRAM).
    Lmem,
    /// System memory visible to the device.
    Smem,
    /// The BIOS-reserved range carved out of system memory.
    Stolen,
}

bitflags! {
    /// Allocation behavior requested by a backing store.
    pub struct AllocFlags: u32 {
        /// The whole allocation must be one contiguous block.
        const CONTIGUOUS = 1 << 0;
        /// Carve the allocation in blocks of exactly the requested
        /// chunk granularity, never larger and never smaller.
        const FORCE_CHUNK = 1 << 1;
    }
}

/// One physically contiguous pool of GPU-usable memory.
///
/// The region owns a byte store standing in for the physical medium,
/// so content-moving operations (swap, migration, scratch reads) are
/// exact rather than simulated.
pub struct MemoryRegion {
    name: &'static str,
    kind: RegionKind,
    base: DeviceAddr,
    size: usize,
    min_page_size: usize,
    buddy: Mutex<buddy::BuddySet>,
    avail: AtomicU64,
    store: Mutex<Vec<u8>>,
}

impl Debug for MemoryRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("base", &self.base)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl MemoryRegion {
    /// Creates a region over `base..base + size`.
    pub fn new(
        name: &'static str,
        kind: RegionKind,
        base: DeviceAddr,
        size: usize,
        min_page_size: usize,
    ) -> Arc<Self> {
        debug_assert!(min_page_size.is_power_of_two());
        debug_assert_eq!(size % min_page_size, 0);
        info!(
            "region {}: {:?} [{:#x}..{:#x}], min page {:#x}",
            name,
            kind,
            base,
            base + size as DeviceAddr,
            min_page_size
        );
        Arc::new(Self {
            name,
            kind,
            base,
            size,
            min_page_size,
            buddy: Mutex::new(buddy::BuddySet::new(base, size, min_page_size)),
            avail: AtomicU64::new(size as u64),
            store: Mutex::new(alloc::vec![0u8; size]),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    pub fn base(&self) -> DeviceAddr {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn min_page_size(&self) -> usize {
        self.min_page_size
    }

    /// Bytes currently available.
    ///
    /// Eventually accurate only; used as a migration heuristic, not an
    /// allocation gate.
    pub fn avail(&self) -> u64 {
        self.avail.load(Ordering::Relaxed)
    }

    /// Whether a migration destination should accept more data.
    ///
    /// Migration backs off from regions that are more than half full.
    pub fn has_migration_headroom(&self) -> bool {
        self.avail() * 2 > self.size as u64
    }

    pub fn contains(&self, addr: DeviceAddr) -> bool {
        addr >= self.base && addr < self.base + self.size as DeviceAddr
    }

    /// Allocates blocks covering `size` bytes, rounded up to the
    /// region's minimum page size.
    ///
    /// With [`AllocFlags::FORCE_CHUNK`], `chunk` fixes the granularity
    /// of every block; with [`AllocFlags::CONTIGUOUS`] a single block
    /// covers the whole request.
    pub fn alloc(&self, size: usize, flags: AllocFlags, chunk: usize) -> Result<BlockList> {
        if size == 0 {
            return_errno_with_message!(Errno::EINVAL, "empty allocation");
        }
        let size = size.align_up(self.min_page_size);
        if size > self.size {
            return_errno_with_message!(Errno::E2BIG, "allocation exceeds the region");
        }

        let mut buddy = self.buddy.lock();
        let mut blocks = BlockList::new();
        let res = if flags.contains(AllocFlags::CONTIGUOUS) {
            let order = buddy.greater_order_of(size);
            buddy.alloc_order(order).map(|b| blocks.push(b))
        } else if flags.contains(AllocFlags::FORCE_CHUNK) {
            debug_assert!(chunk.is_power_of_two() && chunk >= self.min_page_size);
            if size % chunk != 0 {
                return_errno_with_message!(Errno::EINVAL, "size not a chunk multiple");
            }
            let order = buddy.greater_order_of(chunk);
            self.alloc_pieces(&mut buddy, &mut blocks, size, order, order)
        } else {
            let max_order = buddy.lesser_order_of(size);
            self.alloc_pieces(&mut buddy, &mut blocks, size, 0, max_order)
        };

        if let Err(e) = res {
            for b in blocks.drain(..) {
                buddy.free_block(b);
            }
            debug!("region {}: allocation of {:#x} failed", self.name, size);
            return Err(e);
        }

        let allocated: usize = blocks
            .iter()
            .map(|b| buddy.size_of_order(b.order))
            .sum::<usize>();
        drop(buddy);
        self.avail.fetch_sub(allocated as u64, Ordering::Relaxed);
        Ok(blocks)
    }

    fn alloc_pieces(
        &self,
        buddy: &mut buddy::BuddySet,
        blocks: &mut BlockList,
        size: usize,
        min_order: BuddyOrder,
        max_order: BuddyOrder,
    ) -> Result<()> {
        let mut left = size;
        let mut order = max_order;
        while left > 0 {
            while order > min_order && buddy.size_of_order(order) > left {
                order -= 1;
            }
            match buddy.alloc_order(order) {
                Ok(b) => {
                    left = left.saturating_sub(buddy.size_of_order(order));
                    blocks.push(b);
                }
                Err(e) => {
                    if order > min_order {
                        // No block of this order; retry smaller.
                        order -= 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Returns blocks to the free lists, merging buddies.
    pub fn free(&self, blocks: BlockList) {
        let mut buddy = self.buddy.lock();
        let mut returned = 0usize;
        for b in blocks {
            returned += buddy.size_of_order(b.order);
            buddy.free_block(b);
        }
        drop(buddy);
        self.avail.fetch_add(returned as u64, Ordering::Relaxed);
    }

    /// Builds a scatter list over an allocated block list.
    pub fn sg_of(&self, blocks: &BlockList) -> ScatterList {
        let buddy = self.buddy.lock();
        let mut sg = ScatterList::new();
        for b in blocks.iter() {
            sg.push(b.addr, buddy.size_of_order(b.order));
        }
        drop(buddy);
        sg.trim();
        sg
    }

    /// Reads region content at a device address.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside the region.
    pub fn read(&self, addr: DeviceAddr, buf: &mut [u8]) {
        let off = self.offset_of(addr, buf.len());
        let store = self.store.lock();
        buf.copy_from_slice(&store[off..off + buf.len()]);
    }

    /// Writes region content at a device address.
    ///
    /// # Panics
    ///
    /// Panics if the range is outside the region.
    pub fn write(&self, addr: DeviceAddr, buf: &[u8]) {
        let off = self.offset_of(addr, buf.len());
        let mut store = self.store.lock();
        store[off..off + buf.len()].copy_from_slice(buf);
    }

    /// Zero-fills a range, as object creation does before publishing a
    /// handle.
    pub fn clear(&self, addr: DeviceAddr, len: usize) {
        let off = self.offset_of(addr, len);
        let mut store = self.store.lock();
        store[off..off + len].fill(0);
    }

    fn offset_of(&self, addr: DeviceAddr, len: usize) -> usize {
        assert!(self.contains(addr));
        assert!(addr + len as DeviceAddr <= self.base + self.size as DeviceAddr);
        (addr - self.base) as usize
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mm::{SZ_2M, SZ_4K, SZ_64K};

    fn region_2m() -> Arc<MemoryRegion> {
        MemoryRegion::new("lmem-test", RegionKind::Lmem, 0x1000_0000, 4 * SZ_2M, SZ_4K)
    }

    #[test]
    fn alloc_updates_avail() {
        let r = region_2m();
        assert_eq!(r.avail(), 4 * SZ_2M as u64);
        let blocks = r.alloc(SZ_2M + SZ_4K, AllocFlags::empty(), 0).unwrap();
        assert_eq!(r.avail(), (3 * SZ_2M - SZ_4K) as u64);
        let sg = r.sg_of(&blocks);
        assert_eq!(sg.len(), SZ_2M + SZ_4K);
        r.free(blocks);
        assert_eq!(r.avail(), 4 * SZ_2M as u64);
    }

    #[test]
    fn forced_chunk_granularity() {
        let r = region_2m();
        let blocks = r
            .alloc(4 * SZ_64K, AllocFlags::FORCE_CHUNK, SZ_64K)
            .unwrap();
        assert_eq!(blocks.len(), 4);
        for b in blocks.iter() {
            assert_eq!(b.addr % SZ_64K as DeviceAddr, 0);
        }
        r.free(blocks);
    }

    #[test]
    fn contiguous_allocation_is_one_block() {
        let r = region_2m();
        let blocks = r.alloc(SZ_2M, AllocFlags::CONTIGUOUS, 0).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].addr % SZ_2M as DeviceAddr, 0);
        r.free(blocks);
    }

    #[test]
    fn oversized_request_is_e2big() {
        let r = region_2m();
        assert_eq!(
            r.alloc(5 * SZ_2M, AllocFlags::empty(), 0).unwrap_err().error(),
            Errno::E2BIG
        );
    }

    #[test]
    fn content_round_trip() {
        let r = region_2m();
        let blocks = r.alloc(SZ_4K, AllocFlags::empty(), 0).unwrap();
        let addr = blocks[0].addr;
        r.write(addr, &[0xab; 16]);
        let mut buf = [0u8; 16];
        r.read(addr, &mut buf);
        assert_eq!(buf, [0xab; 16]);
        r.clear(addr, SZ_4K);
        r.read(addr, &mut buf);
        assert_eq!(buf, [0; 16]);
        r.free(blocks);
    }
}
