// SPDX-License-Identifier: MPL-2.0

//! Page properties carried from an object's placement and access mode
//! into the PTE encodings.

use crate::prelude::*;

bitflags! {
    /// Access flags of a mapping.
    pub struct PageFlags: u8 {
        /// Readable.
        const R = 1 << 0;
        /// Writable.
        const W = 1 << 1;
        /// Device atomics may target this mapping.
        const ATOMIC = 1 << 2;
    }
}

/// The cache class programmed into a PTE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CachePolicy {
    /// Uncacheable, strongly ordered.
    Uncacheable = 0,
    /// Write-combining writes, uncached reads.
    WriteCombining = 1,
    /// Fully cache-coherent.
    Writeback = 2,
}

/// The property of a mapped range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageProperty {
    pub flags: PageFlags,
    pub cache: CachePolicy,
    /// Whether the backing pages live in device-local memory.
    pub local: bool,
}

impl PageProperty {
    pub const fn new(flags: PageFlags, cache: CachePolicy, local: bool) -> Self {
        Self {
            flags,
            cache,
            local,
        }
    }

    /// The property used for scratch mappings: readable sentinel data,
    /// never writable, never atomic-capable.
    pub const fn scratch() -> Self {
        Self {
            flags: PageFlags::R,
            cache: CachePolicy::Uncacheable,
            local: false,
        }
    }
}
