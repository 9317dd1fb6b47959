// SPDX-License-Identifier: MPL-2.0

//! The asynchronous bind/unbind work engine.
//!
//! Platforms whose page-table updates must be ordered against GPU
//! activity queue each binding transition as a work item gated by
//! fences. Work executes in submission order when the engine is
//! drained (the production driver drains from an interrupt-driven
//! workqueue; here whoever needs a completion pumps the queue), and
//! each item signals its own fence so dependents chain instead of
//! blocking.

use core::sync::atomic::AtomicU64;

use smallvec::SmallVec;

use crate::{
    mm::{page_prop::PageProperty, sg::ScatterList, Vaddr},
    prelude::*,
    sync::{Fence, FenceStatus},
    vm::AddressSpace,
    vma::Vma,
};

/// A user-supplied fence address written after a VM_BIND completes.
#[derive(Debug, Clone)]
pub struct UserFence {
    pub target: Arc<AtomicU64>,
    pub value: u64,
}

pub(crate) enum WorkOp {
    /// Populate PTEs.
    Insert {
        vm: Arc<AddressSpace>,
        range: Range<Vaddr>,
        sg: ScatterList,
        prop: PageProperty,
    },
    /// Tear PTEs down, coalescing the TLB invalidation.
    Clear {
        vm: Arc<AddressSpace>,
        range: Range<Vaddr>,
        detach: bool,
    },
    /// Publish a VM_BIND completion to userspace.
    WriteUserFence { ufence: UserFence },
}

struct Work {
    deps: SmallVec<[Arc<Fence>; 2]>,
    fence: Arc<Fence>,
    op: WorkOp,
    /// Marked on failure so later pins refuse the broken binding.
    vma: Option<Weak<Vma>>,
}

/// The device-wide bind work queue.
pub struct BindEngine {
    queue: Mutex<VecDeque<Work>>,
    /// Serializes drains so work executes strictly in order.
    drainer: Mutex<()>,
}

impl BindEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            drainer: Mutex::new(()),
        })
    }

    pub(crate) fn queue_work(
        &self,
        deps: SmallVec<[Arc<Fence>; 2]>,
        op: WorkOp,
        vma: Option<Weak<Vma>>,
    ) -> Arc<Fence> {
        let fence = Fence::new();
        self.queue.lock().push_back(Work {
            deps,
            fence: fence.clone(),
            op,
            vma,
        });
        fence
    }

    /// Executes queued work in order until the queue is empty or the
    /// head waits on an unsignalled dependency.
    pub fn drain(&self) {
        let _g = self.drainer.lock();
        loop {
            let mut q = self.queue.lock();
            let head_ready = q
                .front()
                .is_some_and(|w| w.deps.iter().all(|d| d.is_signaled()));
            if !head_ready {
                return;
            }
            let work = q.pop_front().unwrap();
            drop(q);
            self.execute(work);
        }
    }

    /// Drains, waiting out dependencies, until the queue is empty.
    pub fn flush(&self) {
        let _g = self.drainer.lock();
        loop {
            let work = {
                let mut q = self.queue.lock();
                match q.pop_front() {
                    Some(w) => w,
                    None => return,
                }
            };
            for d in &work.deps {
                // Dependencies precede us in submission order or are
                // external activity; spin them out.
                let _ = d.wait();
            }
            self.execute(work);
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queue.lock().is_empty()
    }

    fn execute(&self, work: Work) {
        // A failed dependency poisons the chain: skip the operation
        // and propagate the error.
        let dep_err = work.deps.iter().find_map(|d| match d.status() {
            FenceStatus::Error(e) => Some(e),
            _ => None,
        });
        if let Some(e) = dep_err {
            self.fail(work, e);
            return;
        }

        let res = match &work.op {
            WorkOp::Insert {
                vm,
                range,
                sg,
                prop,
            } => vm.insert_sg(range.clone(), sg, *prop),
            WorkOp::Clear { vm, range, detach } => {
                vm.clear_range(range.clone(), *detach);
                vm.invalidate_tlbs(Some(range.clone()));
                Ok(())
            }
            WorkOp::WriteUserFence { ufence } => {
                ufence
                    .target
                    .store(ufence.value, core::sync::atomic::Ordering::Release);
                Ok(())
            }
        };

        match res {
            Ok(()) => work.fence.signal(),
            Err(e) => {
                warn!("bind work failed: {:?}", e);
                self.fail(work, e.error());
            }
        }
    }

    fn fail(&self, work: Work, errno: Errno) {
        if let Some(vma) = work.vma.as_ref().and_then(Weak::upgrade) {
            vma.set_error();
        }
        work.fence.signal_with_error(errno);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn user_fence_write_waits_for_deps() {
        let engine = BindEngine::new();
        let gate = Fence::new();
        let target = Arc::new(AtomicU64::new(0));
        let fence = engine.queue_work(
            smallvec::smallvec![gate.clone()],
            WorkOp::WriteUserFence {
                ufence: UserFence {
                    target: target.clone(),
                    value: 7,
                },
            },
            None,
        );

        engine.drain();
        assert!(!fence.is_signaled());
        assert_eq!(target.load(core::sync::atomic::Ordering::Acquire), 0);

        gate.signal();
        engine.drain();
        assert!(fence.is_signaled());
        assert_eq!(target.load(core::sync::atomic::Ordering::Acquire), 7);
        assert!(engine.is_idle());
    }

    #[test]
    fn failed_dependency_poisons_the_chain() {
        let engine = BindEngine::new();
        let gate = Fence::new();
        let target = Arc::new(AtomicU64::new(0));
        let f1 = engine.queue_work(
            smallvec::smallvec![gate.clone()],
            WorkOp::WriteUserFence {
                ufence: UserFence {
                    target: target.clone(),
                    value: 1,
                },
            },
            None,
        );
        let f2 = engine.queue_work(
            smallvec::smallvec![f1.clone()],
            WorkOp::WriteUserFence {
                ufence: UserFence {
                    target: target.clone(),
                    value: 2,
                },
            },
            None,
        );

        gate.signal_with_error(Errno::EIO);
        engine.drain();
        assert_eq!(f1.status(), FenceStatus::Error(Errno::EIO));
        assert_eq!(f2.status(), FenceStatus::Error(Errno::EIO));
        // Neither write happened.
        assert_eq!(target.load(core::sync::atomic::Ordering::Acquire), 0);
    }
}
