// SPDX-License-Identifier: MPL-2.0

//! Platform description.
//!
//! All generation-dependent behavior is decided once, at device probe,
//! from a [`Platform`] value: the PTE encoding, the supported page
//! sizes, whether binds must be performed by asynchronous work, and
//! whether the translation caches support selective invalidation.
//! Nothing else in the crate is allowed to branch on a generation
//! number.

use crate::mm::PageSizes;

/// The PTE encoding family of a hardware generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteFormat {
    /// The legacy encoding: 4K/64K/2M pages, 2-bit cache class, no
    /// atomic-enable bit.
    Legacy,
    /// The current encoding: adds 1G pages, compact 64K page tables,
    /// a device-atomics bit and a wider PAT index.
    Flat,
}

/// Static description of one device generation.
///
/// Created by the PCI probe glue (out of scope here) and owned by the
/// device for its lifetime.
#[derive(Debug, Clone)]
pub struct Platform {
    /// Virtual address width of the GPU MMU: 32, 48 or 57.
    pub va_bits: u8,
    /// The PTE encoding family.
    pub pte_format: PteFormat,
    /// Page sizes the MMU can express.
    pub page_sizes: PageSizes,
    /// Whether 64K pages may be stored in compacted page tables.
    pub has_compact_64k: bool,
    /// Whether faults on unbound ranges suspend and notify software
    /// instead of wedging the context.
    pub has_recoverable_faults: bool,
    /// Whether page-table updates must be issued as asynchronous work
    /// ordered against GPU activity.
    pub needs_async_bind: bool,
    /// Whether the TLBs accept ranged invalidations.
    pub has_selective_tlb_inv: bool,
    /// Whether unmapped leaves must point at scratch rather than be
    /// left absent.
    pub has_scratch: bool,
}

impl Platform {
    /// A current-generation part: 48-bit VA, all page sizes, compact
    /// 64K tables, recoverable faults and async binds.
    pub fn flat_48b() -> Self {
        Platform {
            va_bits: 48,
            pte_format: PteFormat::Flat,
            page_sizes: PageSizes::SZ_4K | PageSizes::SZ_64K | PageSizes::SZ_2M | PageSizes::SZ_1G,
            has_compact_64k: true,
            has_recoverable_faults: true,
            needs_async_bind: true,
            has_selective_tlb_inv: true,
            has_scratch: true,
        }
    }

    /// A legacy part: 48-bit VA, no 1G pages, synchronous binds, full
    /// scratch backing and full-TLB invalidations only.
    pub fn legacy_48b() -> Self {
        Platform {
            va_bits: 48,
            pte_format: PteFormat::Legacy,
            page_sizes: PageSizes::SZ_4K | PageSizes::SZ_64K | PageSizes::SZ_2M,
            has_compact_64k: false,
            has_recoverable_faults: false,
            needs_async_bind: false,
            has_selective_tlb_inv: false,
            has_scratch: true,
        }
    }

    /// Number of page-table levels implied by the VA width.
    pub fn nr_levels(&self) -> u8 {
        match self.va_bits {
            32 => 3,
            48 => 4,
            57 => 5,
            bits => panic!("unsupported VA width: {}", bits),
        }
    }
}
