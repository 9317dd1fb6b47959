// SPDX-License-Identifier: MPL-2.0

//! The device: regions, GTs, the global address space, and the ASID
//! table that routes fault messages to per-context spaces.

use core::sync::atomic::{AtomicU32, Ordering};

use hashbrown::HashMap;

use crate::{
    gt::{EngineId, Gt},
    mm::{
        page_prop::CachePolicy,
        region::{MemoryRegion, RegionKind},
        SZ_4K,
    },
    object::{Object, ObjectFlags},
    platform::Platform,
    prelude::*,
    sync::WwClass,
    vm::AddressSpace,
    vma::bind::BindEngine,
};

/// Probe-time sizing of a device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub smem_size: usize,
    /// Device-local memory; integrated parts have none.
    pub lmem_size: Option<usize>,
    /// The BIOS-reserved carveout; often absent.
    pub stolen_size: Option<usize>,
    pub ggtt_size: usize,
    pub nr_gts: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            smem_size: 64 << 20,
            lmem_size: Some(64 << 20),
            stolen_size: Some(4 << 20),
            ggtt_size: 1 << 30,
            nr_gts: 1,
        }
    }
}

/// Device-address layout: system memory at zero, the stolen carveout
/// above it, device-local memory high.
const STOLEN_BASE: u64 = 0x80_0000_0000;
const LMEM_BASE: u64 = 0x100_0000_0000;

/// One graphics device.
pub struct Device {
    platform: Platform,
    ww: Arc<WwClass>,
    smem: Arc<MemoryRegion>,
    lmem: Option<Arc<MemoryRegion>>,
    stolen: Option<Arc<MemoryRegion>>,
    gts: Vec<Arc<Gt>>,
    bind_engine: Arc<BindEngine>,
    ggtt: Arc<AddressSpace>,
    asids: Mutex<HashMap<u32, Weak<AddressSpace>>>,
    next_asid: AtomicU32,
}

impl Device {
    pub fn new(platform: Platform, config: DeviceConfig) -> Result<Arc<Self>> {
        let smem = MemoryRegion::new("smem", RegionKind::Smem, 0, config.smem_size, SZ_4K);
        let lmem = config.lmem_size.map(|size| {
            MemoryRegion::new("lmem0", RegionKind::Lmem, LMEM_BASE, size, SZ_4K)
        });
        let stolen = config.stolen_size.map(|size| {
            MemoryRegion::new("stolen", RegionKind::Stolen, STOLEN_BASE, size, SZ_4K)
        });

        let engines = alloc::vec![
            EngineId { class: 0, instance: 0 }, // render
            EngineId { class: 1, instance: 0 }, // copy
            EngineId { class: 4, instance: 0 }, // compute
        ];
        let gts: Vec<Arc<Gt>> = (0..config.nr_gts.max(1))
            .map(|i| Gt::new(i as u32, engines.clone(), platform.has_selective_tlb_inv))
            .collect();

        let bind_engine = BindEngine::new();
        let ggtt = AddressSpace::new_ggtt(
            &platform,
            gts.clone(),
            bind_engine.clone(),
            &smem,
            config.ggtt_size,
        )?;

        info!(
            "device: va {}b, {} gt(s), lmem {}",
            platform.va_bits,
            gts.len(),
            lmem.as_ref().map_or("none", |r| r.name()),
        );

        Ok(Arc::new(Self {
            platform,
            ww: Arc::new(WwClass::new()),
            smem,
            lmem,
            stolen,
            gts,
            bind_engine,
            ggtt,
            asids: Mutex::new(HashMap::new()),
            // ASID 0 is the GGTT's.
            next_asid: AtomicU32::new(1),
        }))
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn ww_class(&self) -> &Arc<WwClass> {
        &self.ww
    }

    pub fn smem(&self) -> &Arc<MemoryRegion> {
        &self.smem
    }

    pub fn lmem(&self) -> Option<&Arc<MemoryRegion>> {
        self.lmem.as_ref()
    }

    pub fn stolen(&self) -> Option<&Arc<MemoryRegion>> {
        self.stolen.as_ref()
    }

    pub fn gts(&self) -> &[Arc<Gt>] {
        &self.gts
    }

    pub fn gt(&self, id: u32) -> Option<&Arc<Gt>> {
        self.gts.iter().find(|g| g.id() == id)
    }

    pub fn bind_engine(&self) -> &Arc<BindEngine> {
        &self.bind_engine
    }

    pub fn ggtt(&self) -> &Arc<AddressSpace> {
        &self.ggtt
    }

    /// Creates a per-context address space with a fresh ASID.
    pub fn create_ppgtt(&self) -> Result<Arc<AddressSpace>> {
        let asid = self.next_asid.fetch_add(1, Ordering::Relaxed);
        let vm = AddressSpace::new_ppgtt(
            &self.platform,
            self.gts.clone(),
            self.bind_engine.clone(),
            &self.smem,
            asid,
        )?;
        self.asids.lock().insert(asid, Arc::downgrade(&vm));
        Ok(vm)
    }

    /// Resolves the address space a fault message names.
    pub fn vm_by_asid(&self, asid: u32) -> Option<Arc<AddressSpace>> {
        self.asids.lock().get(&asid)?.upgrade()
    }

    /// A device-local object, mirrored to system memory when its
    /// pages are released (the swap policy of discrete parts).
    pub fn create_lmem_object(&self, size: usize, flags: ObjectFlags) -> Result<Arc<Object>> {
        let Some(lmem) = &self.lmem else {
            return_errno_with_message!(Errno::ENODEV, "no device-local memory");
        };
        Object::create(
            lmem,
            size,
            flags,
            CachePolicy::WriteCombining,
            &self.ww,
            Some(self.smem.clone()),
            self.gts.first().cloned(),
        )
    }

    /// A system-memory object.
    pub fn create_smem_object(&self, size: usize, flags: ObjectFlags) -> Result<Arc<Object>> {
        Object::create(
            &self.smem,
            size,
            flags,
            CachePolicy::Writeback,
            &self.ww,
            None,
            self.gts.first().cloned(),
        )
    }

    /// An object in the stolen range.
    pub fn create_stolen_object(&self, size: usize) -> Result<Arc<Object>> {
        Object::create_stolen(self.stolen.as_ref(), size, &self.ww)
    }

    /// Pinned user pages.
    pub fn create_userptr_object(&self, data: Vec<u8>) -> Result<Arc<Object>> {
        Object::create_userptr(&self.smem, data, &self.ww)
    }

    /// A segmented buffer whose pieces bind as an adjacent VMA chain.
    pub fn create_segmented_object(
        &self,
        total: usize,
        segment_size: usize,
    ) -> Result<Arc<Object>> {
        let region = self.lmem.as_ref().unwrap_or(&self.smem);
        Object::create_segmented(region, total, segment_size, &self.ww, self.gts.first().cloned())
    }

    /// Declares every GT dead. Outstanding GPU-dependent work falls
    /// back to CPU paths or fails fast.
    pub fn wedge(&self) {
        for gt in &self.gts {
            gt.set_wedged();
        }
    }

    /// Device teardown: flush pending binds and retire the per-GT
    /// node caches for good.
    pub fn shutdown(&self) {
        self.bind_engine.flush();
        for gt in &self.gts {
            gt.shutdown();
        }
    }
}

impl Debug for Device {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Device")
            .field("va_bits", &self.platform.va_bits)
            .field("gts", &self.gts.len())
            .finish_non_exhaustive()
    }
}
