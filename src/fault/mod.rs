// SPDX-License-Identifier: MPL-2.0

//! The recoverable page-fault handler and the access-counter path.
//!
//! Firmware suspends a faulting engine and delivers a notification;
//! this module resolves the address to a VMA, migrates and binds as
//! needed, and sends exactly one reply per request — the engine stays
//! suspended until it arrives, so the reply is a hard contract even
//! on every error path.

pub mod wire;

pub use self::wire::{
    AccessCounterInfo, AccessType, FaultReply, FaultType, Granularity,
    RecoverablePageFaultInfo, ACCESS_COUNTER_MSG_LEN, FAULT_MSG_LEN, FAULT_REPLY_LEN,
};
use crate::{
    device::Device,
    gt::Gt,
    mm::region::RegionKind,
    object::{migrate, Object},
    prelude::*,
    sync::ww_retry,
    vma::{PinOptions, Vma},
};

/// The channel replies leave through.
///
/// The firmware messaging layer implements this; tests record.
pub trait ReplyTransport {
    fn send_reply(&self, reply: &FaultReply);
}

/// A transport that keeps every reply, for tests and debugging.
#[derive(Default)]
pub struct ReplyLog {
    replies: Mutex<Vec<FaultReply>>,
}

impl ReplyLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replies(&self) -> Vec<FaultReply> {
        self.replies.lock().clone()
    }
}

impl ReplyTransport for ReplyLog {
    fn send_reply(&self, reply: &FaultReply) {
        self.replies.lock().push(*reply);
    }
}

/// Entry point for a fault-notification message.
///
/// Always sends exactly one reply, echoing the ASID, engine identity
/// and correlation token of the request.
pub fn handle_pagefault(
    dev: &Device,
    gt: &Arc<Gt>,
    msg: &[u32; FAULT_MSG_LEN],
    transport: &dyn ReplyTransport,
) {
    let info = RecoverablePageFaultInfo::decode(msg);
    trace!(
        "pagefault: asid {} va {:#x} {:?}/{:?} engine {}:{}",
        info.asid,
        info.va,
        info.access_type,
        info.fault_type,
        info.engine.class,
        info.engine.instance
    );

    let result = service_fault(dev, gt, &info);
    if let Err(e) = &result {
        debug!("pagefault at {:#x} failed: {:?}", info.va, e);
    }
    transport.send_reply(&FaultReply {
        successful: result.is_ok(),
        asid: info.asid,
        engine: info.engine,
        pdata: info.pdata,
    });
}

fn service_fault(dev: &Device, gt: &Arc<Gt>, info: &RecoverablePageFaultInfo) -> Result<()> {
    if gt.is_wedged() {
        return_errno_with_message!(Errno::ENODEV, "gt is wedged");
    }

    let Some(vm) = dev.vm_by_asid(info.asid) else {
        return_errno_with_message!(Errno::EINVAL, "no address space for this asid");
    };
    if !vm.is_faultable() {
        return_errno_with_message!(Errno::EINVAL, "faults are not recoverable on this vm");
    }

    let Some(vma) = vm.find_vma(info.va) else {
        // A hole. Nothing to bind; the access is bad.
        return_errno_with_message!(Errno::EFAULT, "no mapping covers the faulting address");
    };
    let obj = vma.object()?;

    validate_fault(info, &obj)?;

    // Idempotence: a repeated notification for an address that was
    // bound meanwhile resolves without re-migrating or re-binding.
    // An atomic access through a mapping that cannot do atomics is
    // the exception; that one must migrate.
    if vma.is_bound() {
        if let Some((fields, _, is_scratch)) = vm.lookup(info.va) {
            let atomic_mismatch = info.access_type == AccessType::Atomic && !fields.atomic;
            if !is_scratch && !atomic_mismatch {
                return Ok(());
            }
        }
    }

    // Migrate toward device memory when the access demands it
    // (atomics) or the placement prefers it. Only the atomic case is
    // allowed to fail the fault; preference is best-effort.
    let needs_lmem = info.access_type == AccessType::Atomic;
    let prefers_lmem = obj.prefers_lmem();
    if needs_lmem || prefers_lmem {
        let in_lmem = obj
            .current_region()
            .is_some_and(|r| r.kind() == RegionKind::Lmem);
        if !in_lmem {
            if let Some(dst) = migrate::preferred_lmem(&obj) {
                let allowed = needs_lmem || migrate::should_migrate(&obj, &dst);
                if allowed {
                    let prev_start = vma.start();
                    let res = ww_retry(obj.ww_class(), |txn| {
                        migrate::migrate(&obj, txn, &dst, false)
                    });
                    match res {
                        Ok(()) => {
                            if let Some(start) = prev_start {
                                // The migration tore the binding down;
                                // rebind at the address hardware will
                                // retry.
                                return bind_for_fault(&vma, Some(start));
                            }
                        }
                        Err(e) if needs_lmem => return Err(e),
                        Err(e) => {
                            debug!("fault migration skipped: {:?}", e);
                        }
                    }
                }
            }
        }
    }

    bind_for_fault(&vma, None)
}

fn bind_for_fault(vma: &Arc<Vma>, fixed: Option<crate::mm::Vaddr>) -> Result<()> {
    let opts = PinOptions {
        fixed,
        ..Default::default()
    };
    vma.pin(&opts)?;
    vma.unpin();
    // The reply unblocks the engine immediately; PTE writes must be
    // visible by then.
    vma.vm().bind_engine().flush();
    Ok(())
}

/// Checks whether the access/fault combination is legal at all.
///
/// The combinations form a small error-code space: read-not-present
/// is always benign, writes need a writable object, atomics need a
/// device-memory placement, and a reported access violation is never
/// recoverable.
fn validate_fault(info: &RecoverablePageFaultInfo, obj: &Arc<Object>) -> Result<()> {
    let code = ((info.fault_type as u32) << 2) | info.access_type as u32;
    match code {
        // Read, not present.
        0 => Ok(()),
        // Write, not present.
        1 => {
            if obj.is_readonly() {
                return_errno_with_message!(Errno::EACCES, "write fault on a read-only object");
            }
            Ok(())
        }
        // Atomic, not present: hardware atomics need device memory.
        2 => {
            if migrate::preferred_lmem(obj).is_none() {
                return_errno_with_message!(
                    Errno::EACCES,
                    "atomic fault on an object with no device-memory placement"
                );
            }
            Ok(())
        }
        // Any access violation.
        _ => return_errno_with_message!(Errno::EACCES, "access violation is not recoverable"),
    }
}

/// Entry point for an access-counter message.
///
/// A "trigger" message nominates the hottest sub-range for migration
/// toward device memory; failure here is telemetry, not an error —
/// correctness never depends on the migration happening.
pub fn handle_access_counter(dev: &Device, msg: &[u32; ACCESS_COUNTER_MSG_LEN]) {
    let info = AccessCounterInfo::decode(msg);
    if !info.trigger {
        trace!(
            "access counter notify: asid {} base {:#x} hits {:#010x}",
            info.asid,
            info.va_base,
            info.sub_hits
        );
        return;
    }

    let Some(vm) = dev.vm_by_asid(info.asid) else {
        return;
    };
    let Some(range) = info.first_hit_range() else {
        return;
    };
    let Some(vma) = vm.find_vma(range.start) else {
        return;
    };
    let Ok(obj) = vma.object() else {
        return;
    };
    let Some(dst) = migrate::preferred_lmem(&obj) else {
        return;
    };
    if !migrate::should_migrate(&obj, &dst) {
        return;
    }

    let prev_start = vma.start();
    let res = ww_retry(obj.ww_class(), |txn| migrate::migrate(&obj, txn, &dst, true));
    match res {
        Ok(()) => {
            debug!(
                "access counter: migrated object {} toward {}",
                obj.id(),
                dst.name()
            );
            if let Some(start) = prev_start {
                let _ = bind_for_fault(&vma, Some(start));
            }
        }
        Err(e) => {
            trace!("access counter migration ignored: {:?}", e);
        }
    }
}
