// SPDX-License-Identifier: MPL-2.0

//! PTE encodings.
//!
//! The bit layout of a page-table entry differs between hardware
//! generations. Each layout is a [`PteCodec`] chosen once when an
//! address space is constructed; nothing outside this module may
//! interpret raw PTE bits.

use bit_field::BitField;

use crate::{
    mm::{
        page_prop::{CachePolicy, PageFlags, PageProperty},
        DeviceAddr, PageSizes, SZ_1G, SZ_2M, SZ_4K, SZ_64K,
    },
    platform::{Platform, PteFormat},
};

/// A decoded leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PteFields {
    pub addr: DeviceAddr,
    pub writable: bool,
    pub local: bool,
    pub atomic: bool,
    pub cache: CachePolicy,
    /// Set on 2M/1G entries.
    pub huge: bool,
    /// Set on 64K entries.
    pub ps64: bool,
}

/// Encoder/decoder for one PTE layout generation.
pub trait PteCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// Page sizes this layout can express.
    fn supported_sizes(&self) -> PageSizes;

    /// Encodes a leaf entry mapping `addr` with the given page size.
    fn encode(&self, addr: DeviceAddr, page_size: usize, prop: PageProperty) -> u64;

    /// Decodes a leaf entry; `None` when the entry is absent.
    fn decode(&self, pte: u64) -> Option<PteFields>;
}

/// Selects the codec for a platform.
pub fn codec_for(platform: &Platform) -> &'static dyn PteCodec {
    match platform.pte_format {
        PteFormat::Legacy => &LegacyPteCodec,
        PteFormat::Flat => &FlatPteCodec,
    }
}

const PTE_PRESENT: usize = 0;
const PTE_WRITABLE: usize = 1;
const PTE_HUGE: usize = 7;
const PTE_PS64: usize = 11;
const PTE_ADDR_RANGE: core::ops::Range<usize> = 12..47;
const PTE_ATOMIC: usize = 59;
const PTE_LOCAL: usize = 60;

fn encode_common(addr: DeviceAddr, page_size: usize, prop: PageProperty) -> u64 {
    debug_assert_eq!(addr % page_size as DeviceAddr, 0);
    let mut pte = 0u64;
    pte.set_bit(PTE_PRESENT, true);
    pte.set_bit(PTE_WRITABLE, prop.flags.contains(PageFlags::W));
    pte.set_bits(PTE_ADDR_RANGE, addr >> 12);
    match page_size {
        SZ_4K => (),
        SZ_64K => {
            pte.set_bit(PTE_PS64, true);
        }
        SZ_2M | SZ_1G => {
            pte.set_bit(PTE_HUGE, true);
        }
        _ => panic!("not a mappable page size"),
    }
    pte.set_bit(PTE_LOCAL, prop.local);
    pte
}

fn decode_common(pte: u64, cache: CachePolicy, atomic: bool) -> Option<PteFields> {
    if !pte.get_bit(PTE_PRESENT) {
        return None;
    }
    Some(PteFields {
        addr: pte.get_bits(PTE_ADDR_RANGE) << 12,
        writable: pte.get_bit(PTE_WRITABLE),
        local: pte.get_bit(PTE_LOCAL),
        atomic,
        cache,
        huge: pte.get_bit(PTE_HUGE),
        ps64: pte.get_bit(PTE_PS64),
    })
}

/// The legacy layout: 4K/64K/2M pages, a 2-bit cache class in bits
/// 3..5, no atomic-enable bit.
pub struct LegacyPteCodec;

const LEGACY_CACHE_RANGE: core::ops::Range<usize> = 3..5;

impl PteCodec for LegacyPteCodec {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn supported_sizes(&self) -> PageSizes {
        PageSizes::SZ_4K | PageSizes::SZ_64K | PageSizes::SZ_2M
    }

    fn encode(&self, addr: DeviceAddr, page_size: usize, prop: PageProperty) -> u64 {
        debug_assert_ne!(page_size, SZ_1G, "legacy parts cannot map 1G pages");
        let mut pte = encode_common(addr, page_size, prop);
        pte.set_bits(LEGACY_CACHE_RANGE, prop.cache as u64);
        pte
    }

    fn decode(&self, pte: u64) -> Option<PteFields> {
        let cache = cache_from_bits(pte.get_bits(LEGACY_CACHE_RANGE));
        decode_common(pte, cache, false)
    }
}

/// The current layout: adds 1G pages, a 3-bit PAT index in bits 2..5
/// and a device-atomics bit.
pub struct FlatPteCodec;

const FLAT_PAT_RANGE: core::ops::Range<usize> = 2..5;

impl PteCodec for FlatPteCodec {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn supported_sizes(&self) -> PageSizes {
        PageSizes::SZ_4K | PageSizes::SZ_64K | PageSizes::SZ_2M | PageSizes::SZ_1G
    }

    fn encode(&self, addr: DeviceAddr, page_size: usize, prop: PageProperty) -> u64 {
        let mut pte = encode_common(addr, page_size, prop);
        pte.set_bits(FLAT_PAT_RANGE, prop.cache as u64);
        pte.set_bit(PTE_ATOMIC, prop.flags.contains(PageFlags::ATOMIC));
        pte
    }

    fn decode(&self, pte: u64) -> Option<PteFields> {
        let cache = cache_from_bits(pte.get_bits(FLAT_PAT_RANGE));
        decode_common(pte, cache, pte.get_bit(PTE_ATOMIC))
    }
}

fn cache_from_bits(bits: u64) -> CachePolicy {
    match bits {
        0 => CachePolicy::Uncacheable,
        1 => CachePolicy::WriteCombining,
        _ => CachePolicy::Writeback,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip_flat() {
        let codec = FlatPteCodec;
        let prop = PageProperty::new(
            PageFlags::R | PageFlags::W | PageFlags::ATOMIC,
            CachePolicy::Writeback,
            true,
        );
        let pte = codec.encode(0x1_2345_6000, SZ_4K, prop);
        let f = codec.decode(pte).unwrap();
        assert_eq!(f.addr, 0x1_2345_6000);
        assert!(f.writable && f.local && f.atomic);
        assert!(!f.huge && !f.ps64);
        assert_eq!(f.cache, CachePolicy::Writeback);
    }

    #[test]
    fn page_size_marker_bits() {
        let codec = FlatPteCodec;
        let prop = PageProperty::new(PageFlags::R, CachePolicy::Uncacheable, false);
        assert!(codec.decode(codec.encode(0, SZ_64K, prop)).unwrap().ps64);
        assert!(codec
            .decode(codec.encode(SZ_2M as u64, SZ_2M, prop))
            .unwrap()
            .huge);
        assert!(codec
            .decode(codec.encode(SZ_1G as u64, SZ_1G, prop))
            .unwrap()
            .huge);
    }

    #[test]
    fn readonly_mapping_is_not_writable() {
        let codec = LegacyPteCodec;
        let prop = PageProperty::new(PageFlags::R, CachePolicy::WriteCombining, false);
        let f = codec.decode(codec.encode(0x8000, SZ_4K, prop)).unwrap();
        assert!(!f.writable);
        assert!(!f.atomic);
        assert_eq!(f.cache, CachePolicy::WriteCombining);
    }

    #[test]
    fn absent_entry_decodes_to_none() {
        assert!(FlatPteCodec.decode(0).is_none());
        assert!(LegacyPteCodec.decode(0).is_none());
    }
}
