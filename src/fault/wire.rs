// SPDX-License-Identifier: MPL-2.0

//! Wire formats of the fault and access-counter messages.
//!
//! These are fixed bit-field layouts over 32-bit words, a hardware
//! ABI shared with the firmware. Every field range is a named
//! constant; nothing outside this module touches raw words.

use bit_field::BitField;

use crate::{gt::EngineId, mm::Vaddr, prelude::*};

/// Length of a fault-notification message, in words.
pub const FAULT_MSG_LEN: usize = 4;
/// Length of a fault reply, in words.
pub const FAULT_REPLY_LEN: usize = 3;
/// Length of an access-counter message, in words.
pub const ACCESS_COUNTER_MSG_LEN: usize = 4;

// Fault notification, word 0.
const F0_ASID: core::ops::Range<usize> = 0..20;
const F0_VFID: core::ops::Range<usize> = 20..26;
const F0_ACCESS_TYPE: core::ops::Range<usize> = 26..28;
const F0_FAULT_TYPE: core::ops::Range<usize> = 28..30;

// Fault notification, word 1.
const F1_FAULT_LEVEL: core::ops::Range<usize> = 0..3;
const F1_ENGINE_CLASS: core::ops::Range<usize> = 3..8;
const F1_ENGINE_INSTANCE: core::ops::Range<usize> = 8..14;
const F1_PDATA_LO: core::ops::Range<usize> = 14..32;

// Fault notification, word 2: VA bits 12..32 in place, low 12 zero.
const F2_VA_LO: core::ops::Range<usize> = 12..32;

// Fault notification, word 3: VA bits 32..44, PDATA high bits.
const F3_VA_HI: core::ops::Range<usize> = 0..12;
const F3_PDATA_HI: core::ops::Range<usize> = 26..32;

const PDATA_LO_BITS: usize = 18;

/// The GPU virtual address a fault message can carry: 44 bits.
pub const FAULT_VA_BITS: usize = 44;

/// How the faulting access touched memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessType {
    Read = 0,
    Write = 1,
    Atomic = 2,
}

impl AccessType {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => AccessType::Read,
            1 => AccessType::Write,
            _ => AccessType::Atomic,
        }
    }
}

/// Why the hardware faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultType {
    /// The PTE was not present; recoverable by binding.
    NotPresent = 0,
    /// The access violated the PTE's permissions; never recoverable.
    AccessViolation = 1,
}

impl FaultType {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => FaultType::NotPresent,
            _ => FaultType::AccessViolation,
        }
    }
}

/// A decoded fault notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoverablePageFaultInfo {
    pub va: Vaddr,
    pub asid: u32,
    pub vfid: u8,
    pub access_type: AccessType,
    pub fault_type: FaultType,
    pub fault_level: u8,
    pub engine: EngineId,
    /// Opaque correlation token echoed back in the reply.
    pub pdata: u32,
}

impl RecoverablePageFaultInfo {
    pub fn decode(msg: &[u32; FAULT_MSG_LEN]) -> Self {
        let pdata =
            msg[1].get_bits(F1_PDATA_LO) | (msg[3].get_bits(F3_PDATA_HI) << PDATA_LO_BITS);
        let va = (msg[2].get_bits(F2_VA_LO) as Vaddr) << 12
            | (msg[3].get_bits(F3_VA_HI) as Vaddr) << 32;
        Self {
            va,
            asid: msg[0].get_bits(F0_ASID),
            vfid: msg[0].get_bits(F0_VFID) as u8,
            access_type: AccessType::from_bits(msg[0].get_bits(F0_ACCESS_TYPE)),
            fault_type: FaultType::from_bits(msg[0].get_bits(F0_FAULT_TYPE)),
            fault_level: msg[1].get_bits(F1_FAULT_LEVEL) as u8,
            engine: EngineId {
                class: msg[1].get_bits(F1_ENGINE_CLASS) as u8,
                instance: msg[1].get_bits(F1_ENGINE_INSTANCE) as u8,
            },
            pdata,
        }
    }

    /// Encodes the message the way firmware builds it.
    pub fn encode(&self) -> [u32; FAULT_MSG_LEN] {
        debug_assert_eq!(self.va % crate::mm::PAGE_SIZE, 0);
        debug_assert!(self.va < 1 << FAULT_VA_BITS);
        let mut msg = [0u32; FAULT_MSG_LEN];
        msg[0].set_bits(F0_ASID, self.asid);
        msg[0].set_bits(F0_VFID, self.vfid as u32);
        msg[0].set_bits(F0_ACCESS_TYPE, self.access_type as u32);
        msg[0].set_bits(F0_FAULT_TYPE, self.fault_type as u32);
        msg[1].set_bits(F1_FAULT_LEVEL, self.fault_level as u32);
        msg[1].set_bits(F1_ENGINE_CLASS, self.engine.class as u32);
        msg[1].set_bits(F1_ENGINE_INSTANCE, self.engine.instance as u32);
        msg[1].set_bits(F1_PDATA_LO, self.pdata & ((1 << PDATA_LO_BITS) - 1));
        msg[2].set_bits(F2_VA_LO, (self.va >> 12) as u32 & 0xf_ffff);
        msg[3].set_bits(F3_VA_HI, (self.va >> 32) as u32);
        msg[3].set_bits(F3_PDATA_HI, self.pdata >> PDATA_LO_BITS);
        msg
    }
}

// Fault reply, word 0.
const R0_SUCCESS: usize = 0;
const R0_ASID: core::ops::Range<usize> = 4..24;
// Fault reply, word 1.
const R1_ENGINE_CLASS: core::ops::Range<usize> = 0..5;
const R1_ENGINE_INSTANCE: core::ops::Range<usize> = 5..11;
// Fault reply, word 2.
const R2_PDATA: core::ops::Range<usize> = 0..24;

/// The reply unblocking a faulted engine.
///
/// Exactly one reply is sent per fault request; firmware keeps the
/// engine suspended until it arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultReply {
    pub successful: bool,
    pub asid: u32,
    pub engine: EngineId,
    pub pdata: u32,
}

impl FaultReply {
    pub fn encode(&self) -> [u32; FAULT_REPLY_LEN] {
        let mut msg = [0u32; FAULT_REPLY_LEN];
        msg[0].set_bit(R0_SUCCESS, self.successful);
        msg[0].set_bits(R0_ASID, self.asid);
        msg[1].set_bits(R1_ENGINE_CLASS, self.engine.class as u32);
        msg[1].set_bits(R1_ENGINE_INSTANCE, self.engine.instance as u32);
        msg[2].set_bits(R2_PDATA, self.pdata);
        msg
    }

    pub fn decode(msg: &[u32; FAULT_REPLY_LEN]) -> Self {
        Self {
            successful: msg[0].get_bit(R0_SUCCESS),
            asid: msg[0].get_bits(R0_ASID),
            engine: EngineId {
                class: msg[1].get_bits(R1_ENGINE_CLASS) as u8,
                instance: msg[1].get_bits(R1_ENGINE_INSTANCE) as u8,
            },
            pdata: msg[2].get_bits(R2_PDATA),
        }
    }
}

// Access counter, word 0.
const A0_ASID: core::ops::Range<usize> = 0..20;
const A0_VFID: core::ops::Range<usize> = 20..26;
const A0_GRANULARITY: core::ops::Range<usize> = 26..28;
const A0_TRIGGER: usize = 28;
// Word 1 is the sub-granularity hit vector.
// Word 2: region base VA bits 12..32 in place.
const A2_VA_LO: core::ops::Range<usize> = 12..32;
// Word 3.
const A3_VA_HI: core::ops::Range<usize> = 0..12;
const A3_ENGINE_CLASS: core::ops::Range<usize> = 12..17;
const A3_ENGINE_INSTANCE: core::ops::Range<usize> = 17..23;

/// The number of sub-ranges a counter region is divided into.
pub const SUB_GRANULARITY_SLOTS: usize = 32;

/// Counter region coarseness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Granularity {
    Region128K = 0,
    Region2M = 1,
    Region16M = 2,
    Region64M = 3,
}

impl Granularity {
    fn from_bits(bits: u32) -> Self {
        match bits {
            0 => Granularity::Region128K,
            1 => Granularity::Region2M,
            2 => Granularity::Region16M,
            _ => Granularity::Region64M,
        }
    }

    /// The covered region size in bytes.
    pub fn region_size(&self) -> usize {
        match self {
            Granularity::Region128K => 128 << 10,
            Granularity::Region2M => 2 << 20,
            Granularity::Region16M => 16 << 20,
            Granularity::Region64M => 64 << 20,
        }
    }

    /// The size one hit-vector bit covers.
    pub fn sub_size(&self) -> usize {
        self.region_size() / SUB_GRANULARITY_SLOTS
    }
}

/// A decoded access-counter message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessCounterInfo {
    pub asid: u32,
    pub vfid: u8,
    pub granularity: Granularity,
    /// Trigger messages request action; notify messages are
    /// telemetry only.
    pub trigger: bool,
    /// One bit per sub-range of the region.
    pub sub_hits: u32,
    pub va_base: Vaddr,
    pub engine: EngineId,
}

impl AccessCounterInfo {
    pub fn decode(msg: &[u32; ACCESS_COUNTER_MSG_LEN]) -> Self {
        Self {
            asid: msg[0].get_bits(A0_ASID),
            vfid: msg[0].get_bits(A0_VFID) as u8,
            granularity: Granularity::from_bits(msg[0].get_bits(A0_GRANULARITY)),
            trigger: msg[0].get_bit(A0_TRIGGER),
            sub_hits: msg[1],
            va_base: (msg[2].get_bits(A2_VA_LO) as Vaddr) << 12
                | (msg[3].get_bits(A3_VA_HI) as Vaddr) << 32,
            engine: EngineId {
                class: msg[3].get_bits(A3_ENGINE_CLASS) as u8,
                instance: msg[3].get_bits(A3_ENGINE_INSTANCE) as u8,
            },
        }
    }

    pub fn encode(&self) -> [u32; ACCESS_COUNTER_MSG_LEN] {
        let mut msg = [0u32; ACCESS_COUNTER_MSG_LEN];
        msg[0].set_bits(A0_ASID, self.asid);
        msg[0].set_bits(A0_VFID, self.vfid as u32);
        msg[0].set_bits(A0_GRANULARITY, self.granularity as u32);
        msg[0].set_bit(A0_TRIGGER, self.trigger);
        msg[1] = self.sub_hits;
        msg[2].set_bits(A2_VA_LO, (self.va_base >> 12) as u32 & 0xf_ffff);
        msg[3].set_bits(A3_VA_HI, (self.va_base >> 32) as u32);
        msg[3].set_bits(A3_ENGINE_CLASS, self.engine.class as u32);
        msg[3].set_bits(A3_ENGINE_INSTANCE, self.engine.instance as u32);
        msg
    }

    /// The VA range of the first reported hit.
    pub fn first_hit_range(&self) -> Option<Range<Vaddr>> {
        if self.sub_hits == 0 {
            return None;
        }
        let slot = self.sub_hits.trailing_zeros() as usize;
        let sub = self.granularity.sub_size();
        let start = self.va_base + slot * sub;
        Some(start..start + sub)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mm::{SZ_2M, SZ_64K};

    #[test]
    fn fault_message_round_trip() {
        let info = RecoverablePageFaultInfo {
            va: 0x7ff_ffff_f000,
            asid: 0xf_fffe,
            vfid: 33,
            access_type: AccessType::Atomic,
            fault_type: FaultType::NotPresent,
            fault_level: 4,
            engine: EngineId {
                class: 17,
                instance: 42,
            },
            pdata: 0xab_cdef,
        };
        let msg = info.encode();
        assert_eq!(RecoverablePageFaultInfo::decode(&msg), info);
    }

    #[test]
    fn fault_message_exact_words() {
        // Hand-packed against the documented layout.
        let info = RecoverablePageFaultInfo {
            va: 0x1_0000_2000,
            asid: 5,
            vfid: 1,
            access_type: AccessType::Write,
            fault_type: FaultType::NotPresent,
            fault_level: 0,
            engine: EngineId { class: 3, instance: 0 },
            pdata: 0x11,
        };
        let msg = info.encode();
        // w0: asid 5 | vfid 1 << 20 | access 1 << 26.
        assert_eq!(msg[0], 5 | (1 << 20) | (1 << 26));
        // w1: class 3 << 3 | pdata 0x11 << 14.
        assert_eq!(msg[1], (3 << 3) | (0x11 << 14));
        // w2: va low word with the page offset bits zero.
        assert_eq!(msg[2], 0x2000);
        // w3: va bits 32..44.
        assert_eq!(msg[3], 0x1);
    }

    #[test]
    fn reply_round_trip() {
        let reply = FaultReply {
            successful: true,
            asid: 77,
            engine: EngineId { class: 1, instance: 2 },
            pdata: 0x123456,
        };
        assert_eq!(FaultReply::decode(&reply.encode()), reply);
        assert_eq!(reply.encode()[0] & 1, 1);
    }

    #[test]
    fn access_counter_granularity_math() {
        assert_eq!(Granularity::Region128K.sub_size(), 4096);
        assert_eq!(Granularity::Region2M.sub_size(), SZ_64K);
        assert_eq!(Granularity::Region64M.sub_size(), SZ_2M);
    }

    #[test]
    fn access_counter_first_hit() {
        let info = AccessCounterInfo {
            asid: 1,
            vfid: 0,
            granularity: Granularity::Region2M,
            trigger: true,
            sub_hits: 0b1010_0000,
            va_base: 10 * SZ_2M,
            engine: EngineId { class: 0, instance: 0 },
        };
        let msg = info.encode();
        let decoded = AccessCounterInfo::decode(&msg);
        assert_eq!(decoded, info);
        let hit = decoded.first_hit_range().unwrap();
        assert_eq!(hit.start, 10 * SZ_2M + 5 * SZ_64K);
        assert_eq!(hit.len(), SZ_64K);
    }
}
