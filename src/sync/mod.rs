// SPDX-License-Identifier: MPL-2.0

//! Synchronization primitives specific to the binding engine: fences
//! and wound-wait object locking.

mod fence;
mod ww;

pub use self::{
    fence::{Fence, FenceStatus},
    ww::{ww_retry, WwClass, WwGuard, WwMutex, WwTransaction},
};
