use crate::addresses::{DmaAddress, PAGE_SHIFT, page_align, pages_for};
use crate::attrs::{GfpFlags, PageProtection};
use crate::backend::{self, AllocRequest, AtomicPool, Backend, contiguous, remap, simple};
use crate::buffer::{BufferKey, BufferRecord, Coherency, CpuMapping, DmaAllocation, Extent};
use crate::config::DmaConfig;
use crate::error::DmaError;
use crate::platform::DmaPlatform;
use crate::registry::BufferRegistry;
use log::{error, info, warn};

/// Process-wide DMA state: the platform, the buffer registry and the
/// atomic pool.
///
/// Created once at startup and shared (via `Arc`) by every operation table.
pub struct DmaSubsystem<P: DmaPlatform> {
    platform: P,
    config: DmaConfig,
    registry: BufferRegistry<P::Irq>,
    pool: Option<AtomicPool<P::Irq>>,
}

impl<P: DmaPlatform> DmaSubsystem<P> {
    /// Sets up the subsystem and preallocates the atomic pool.
    ///
    /// Failing to create the pool is logged and only disables non-blocking
    /// allocations for non-coherent devices.
    pub fn new(platform: P, config: DmaConfig) -> Self {
        let pool = Self::create_atomic_pool(&platform, &config);
        Self {
            platform,
            config,
            registry: BufferRegistry::new(),
            pool,
        }
    }

    fn create_atomic_pool(platform: &P, config: &DmaConfig) -> Option<AtomicPool<P::Irq>> {
        let size = config.atomic_pool_pages() << PAGE_SHIFT;
        if size == 0 {
            info!("DMA: atomic pool disabled");
            return None;
        }

        let req = AllocRequest {
            size,
            gfp: GfpFlags::KERNEL,
            prot: PageProtection::DmaCoherent,
            coherency: Coherency::Normal,
            want_vaddr: true,
            no_warn: true,
        };
        let allocated = if platform.has_area(None) {
            contiguous::allocate(platform, &req)
        } else {
            remap::allocate(platform, &req)
        };

        if let Some((extent, mapping)) = allocated
            && let (Some(va), Some(first)) = (mapping.address(), extent.first_frame())
        {
            info!("DMA: preallocated {} KiB pool for atomic coherent allocations", size / 1024);
            return Some(AtomicPool::new(va, first, extent.page_count()));
        }
        error!("DMA: failed to allocate {} KiB pool for atomic coherent allocation", size / 1024);
        None
    }

    pub const fn platform(&self) -> &P {
        &self.platform
    }

    pub const fn config(&self) -> &DmaConfig {
        &self.config
    }

    pub const fn registry(&self) -> &BufferRegistry<P::Irq> {
        &self.registry
    }

    pub const fn atomic_pool(&self) -> Option<&AtomicPool<P::Irq>> {
        self.pool.as_ref()
    }

    /// Runs `backend` for `req`.
    pub(crate) fn allocate_with(
        &self,
        backend: Backend,
        req: &AllocRequest,
    ) -> Result<(Extent, CpuMapping), DmaError> {
        let p = &self.platform;
        match backend {
            Backend::Contiguous => contiguous::allocate(p, req).ok_or(DmaError::OutOfMemory),
            Backend::Remap => remap::allocate(p, req).ok_or(DmaError::OutOfMemory),
            Backend::Simple => simple::allocate(p, req).ok_or(DmaError::OutOfMemory),
            Backend::AtomicPool => {
                let Some(pool) = &self.pool else {
                    error!("DMA: coherent pool not initialised");
                    return Err(DmaError::AtomicPoolUnavailable);
                };
                let (va, first) = pool.alloc(req.size).ok_or(DmaError::OutOfMemory)?;
                let extent = Extent::Contiguous {
                    first,
                    count: pages_for(req.size),
                };
                Ok((extent, CpuMapping::Pool(va)))
            }
        }
    }

    /// Undoes [`allocate_with`](Self::allocate_with).
    pub(crate) fn release_pages(&self, backend: Backend, extent: &Extent, mapping: CpuMapping) {
        let p = &self.platform;
        backend::undo_cpu_mapping(p, mapping, extent);
        match backend {
            Backend::Contiguous => contiguous::release(p, extent),
            Backend::Remap | Backend::Simple => backend::free_buffer(p, extent),
            Backend::AtomicPool => {
                let freed = match (&self.pool, mapping) {
                    (Some(pool), CpuMapping::Pool(va)) => pool.free(va, extent.size()),
                    _ => false,
                };
                if !freed {
                    error!("DMA: {mapping:?} is not part of the atomic pool");
                }
            }
        }
    }

    /// Records a fresh buffer and builds the caller's view of it.
    ///
    /// On failure the pages are released again.
    pub(crate) fn register(
        &self,
        backend: Backend,
        extent: Extent,
        mapping: CpuMapping,
        coherency: Coherency,
        dma_addr: DmaAddress,
        want_vaddr: bool,
    ) -> Result<DmaAllocation, DmaError> {
        self.register_or_unwind(backend, extent, mapping, coherency, dma_addr, want_vaddr, || {})
    }

    /// Like [`register`](Self::register), but runs `unpublish` before the
    /// pages are released on failure. Device-side translations for the
    /// buffer must be torn down there.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn register_or_unwind(
        &self,
        backend: Backend,
        extent: Extent,
        mapping: CpuMapping,
        coherency: Coherency,
        dma_addr: DmaAddress,
        want_vaddr: bool,
        unpublish: impl FnOnce(),
    ) -> Result<DmaAllocation, DmaError> {
        let cpu_addr = if want_vaddr { mapping.address() } else { None };
        let key = match (cpu_addr, extent.first_frame()) {
            (Some(va), _) => BufferKey::Virtual(va),
            (None, Some(first)) => BufferKey::Physical(first),
            (None, None) => {
                unpublish();
                self.release_pages(backend, &extent, mapping);
                return Err(DmaError::InvalidSize);
            }
        };
        let size = extent.size();
        let record = BufferRecord {
            key,
            backend,
            extent,
            mapping,
            coherency,
            dma_addr,
        };
        if let Err(record) = self.registry.register(record) {
            error!("DMA: buffer {key:?} is already registered");
            unpublish();
            self.release_pages(backend, &record.extent, record.mapping);
            return Err(DmaError::DuplicateBuffer(key));
        }
        Ok(DmaAllocation {
            cpu_addr,
            handle: key,
            dma_addr,
            size,
        })
    }

    /// Removes the record for `key`, complaining loudly if there is none.
    pub(crate) fn take_record(&self, key: BufferKey, size: u64) -> Result<BufferRecord, DmaError> {
        let Some(record) = self.registry.find_and_remove(key) else {
            error!("DMA: freeing invalid buffer {key:?}");
            return Err(DmaError::UnregisteredBuffer(key));
        };
        if page_align(size) != record.size() {
            warn!(
                "DMA: freeing {key:?} with size {size:#x}, allocated {:#x}",
                record.size()
            );
        }
        Ok(record)
    }
}
