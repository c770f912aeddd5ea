//! # DMA behind a translation unit
//!
//! [`IommuMapping`] pairs a translation domain with the IOVA space it
//! draws device addresses from. [`IommuDma`] implements the operation table
//! on top of it:
//!
//! - coherent allocations are gathered from pages that need not be
//!   physically contiguous and made device-contiguous through the domain;
//! - streaming mappings reserve an IOVA range per page, or per merged run of
//!   a scatter list;
//! - the IOVA lock is never held while the domain is programmed.

use crate::addresses::{
    DmaAddress, PAGE_SHIFT, PageFrame, PhysicalAddress, checked_page_align, get_order, page_align, pages_for,
};
use crate::attrs::{Direction, DmaAttrs, GfpFlags, IommuProt, PageProtection};
use crate::backend::{self, AllocRequest, Backend, clear_buffer, contiguous};
use crate::buffer::{BufferKey, Coherency, CpuMapping, DmaAllocation, Extent};
use crate::coherency::{Owner, hand_to_device, reclaim_for_cpu};
use crate::config::{DmaConfig, IOMMU_ORDER_LADDER};
use crate::device::Device;
use crate::error::DmaError;
use crate::iova::IovaSpace;
use crate::ops::{DmaMapOps, sync_entries};
use crate::platform::{DmaPlatform, IommuDomain};
use crate::scatterlist::{Run, ScatterEntry, physical_chunks, plan_runs};
use crate::subsystem::DmaSubsystem;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_sync::InterruptControl;
use log::{debug, info, trace, warn};

/// A translation domain and its IOVA space.
pub struct IommuMapping<D: IommuDomain, I: InterruptControl> {
    domain: D,
    space: IovaSpace<I>,
}

impl<D: IommuDomain, I: InterruptControl> IommuMapping<D, I> {
    /// Creates a mapping serving device addresses `[base, base + size)`.
    ///
    /// `size` may not exceed 4 GiB; only the first bitmap segment is
    /// allocated up front.
    pub fn create(domain: D, base: DmaAddress, size: u64, alignment_order: u32) -> Result<Arc<Self>, DmaError> {
        let space = IovaSpace::new(base, size, alignment_order)?;
        info!(
            "DMA: IOMMU mapping at {base} ({} MiB, up to {} segments)",
            size >> 20,
            space.max_segments()
        );
        Ok(Arc::new(Self { domain, space }))
    }

    /// [`create`](Self::create) with the IOVA alignment cap taken from
    /// `config`.
    pub fn with_config(domain: D, base: DmaAddress, size: u64, config: &DmaConfig) -> Result<Arc<Self>, DmaError> {
        Self::create(domain, base, size, config.iommu_alignment_order())
    }

    pub const fn domain(&self) -> &D {
        &self.domain
    }

    pub const fn space(&self) -> &IovaSpace<I> {
        &self.space
    }

    /// Maps `frames` at one fresh IOVA range, coalescing physically
    /// consecutive frames into single domain calls.
    pub fn create_mapping(&self, frames: &[PageFrame], prot: IommuProt) -> Result<DmaAddress, DmaError> {
        let size = (frames.len() as u64) << PAGE_SHIFT;
        let base = self.space.alloc(size)?;

        let mut iova = base;
        let mut i = 0;
        while i < frames.len() {
            let mut j = i + 1;
            while j < frames.len() && frames[j].pfn() == frames[j - 1].pfn() + 1 {
                j += 1;
            }
            let len = ((j - i) as u64) << PAGE_SHIFT;
            if let Err(e) = self.domain.map(iova, frames[i].base(), len, prot) {
                self.domain.unmap(base, iova - base);
                self.space.free(base, size);
                return Err(e.into());
            }
            iova += len;
            i = j;
        }
        Ok(base)
    }

    /// Unmaps and releases the IOVA range holding `[iova, iova + size)`.
    pub fn remove_mapping(&self, iova: DmaAddress, size: u64) {
        let len = page_align(iova.page_offset() + size);
        let base = iova.page_base();
        self.domain.unmap(base, len);
        self.space.free(base, len);
    }

    /// Maps `len` bytes at `pa` (page aligned) to a fresh IOVA range.
    fn map_range(&self, pa: PhysicalAddress, len: u64, prot: IommuProt) -> Result<DmaAddress, DmaError> {
        let iova = self.space.alloc(len)?;
        if let Err(e) = self.domain.map(iova, pa, len, prot) {
            self.space.free(iova, len);
            return Err(e.into());
        }
        Ok(iova)
    }

    /// Reserves an IOVA range for `run` and maps its entries into it.
    fn map_run(&self, entries: &[ScatterEntry], run: &Run, prot: IommuProt) -> Result<DmaAddress, DmaError> {
        let size = run.iova_size();
        let base = self.space.alloc(size)?;
        let mut mapped = 0;
        for (pa, len) in physical_chunks(entries) {
            if let Err(e) = self.domain.map(base + mapped, pa, len, prot) {
                self.domain.unmap(base, mapped);
                self.space.free(base, size);
                return Err(e.into());
            }
            mapped += len;
        }
        Ok(base)
    }
}

impl<D: IommuDomain, I: InterruptControl> Drop for IommuMapping<D, I> {
    fn drop(&mut self) {
        info!(
            "DMA: releasing IOMMU mapping at {} ({} segments)",
            self.space.base(),
            self.space.segment_count()
        );
    }
}

/// Page-aligned length of `size` bytes starting `offset` into a page.
fn span_len(offset: u64, size: u64) -> Result<u64, DmaError> {
    size.checked_add(offset)
        .and_then(checked_page_align)
        .ok_or(DmaError::InvalidSize)
}

/// Operation table for devices attached to an [`IommuMapping`].
pub struct IommuDma<P: DmaPlatform, D: IommuDomain> {
    dma: Arc<DmaSubsystem<P>>,
    mapping: Arc<IommuMapping<D, P::Irq>>,
}

impl<P: DmaPlatform, D: IommuDomain> IommuDma<P, D> {
    #[must_use]
    pub const fn new(dma: Arc<DmaSubsystem<P>>, mapping: Arc<IommuMapping<D, P::Irq>>) -> Self {
        Self { dma, mapping }
    }

    #[must_use]
    pub const fn subsystem(&self) -> &Arc<DmaSubsystem<P>> {
        &self.dma
    }

    #[must_use]
    pub const fn mapping(&self) -> &Arc<IommuMapping<D, P::Irq>> {
        &self.mapping
    }

    /// Gathers pages for a translated buffer.
    ///
    /// `force_contiguous` takes one run from the contiguous reservation.
    /// Otherwise chunks are taken greedily down [`IOMMU_ORDER_LADDER`],
    /// dropping an order at the first failure; only single-page failures
    /// are fatal.
    fn gather_pages(
        &self,
        size: u64,
        gfp: GfpFlags,
        attrs: DmaAttrs,
        coherency: Coherency,
    ) -> Result<(Backend, Extent), DmaError> {
        let p = self.dma.platform();
        let count = pages_for(size);

        if attrs.force_contiguous() {
            let no_warn = attrs.no_warn() || gfp.no_warn();
            let first = p
                .reserve(count, get_order(size), no_warn)
                .ok_or(DmaError::OutOfMemory)?;
            clear_buffer(p, first, size, coherency);
            return Ok((Backend::Contiguous, Extent::Contiguous { first, count }));
        }

        let mut pages = Vec::new();
        pages
            .try_reserve_exact(count)
            .map_err(|_| DmaError::OutOfMemory)?;

        let gfp = gfp.with_no_warn(true).with_highmem(true);
        let mut ladder: &[u32] = if attrs.alloc_single_pages() {
            &IOMMU_ORDER_LADDER[IOMMU_ORDER_LADDER.len() - 1..]
        } else {
            &IOMMU_ORDER_LADDER
        };

        let mut left = count;
        while left > 0 {
            let Some((&order, lower)) = ladder.split_first() else {
                backend::free_buffer(p, &Extent::Pages(pages));
                return Err(DmaError::OutOfMemory);
            };
            // Drop down when we get small.
            if left.ilog2() < order {
                ladder = lower;
                continue;
            }
            let chunk = if order > 0 {
                if let Some(chunk) = p.alloc_pages(order, gfp.with_no_retry(true)) {
                    chunk
                } else {
                    trace!("DMA: order-{order} chunk unavailable, dropping a notch");
                    ladder = lower;
                    continue;
                }
            } else if let Some(chunk) = p.alloc_pages(0, gfp) {
                chunk
            } else {
                backend::free_buffer(p, &Extent::Pages(pages));
                return Err(DmaError::OutOfMemory);
            };

            let n = 1usize << order;
            clear_buffer(p, chunk, (n as u64) << PAGE_SHIFT, coherency);
            pages.extend((0..n).map(|i| chunk.offset_by(i)));
            left -= n;
        }
        Ok((Backend::Remap, Extent::Pages(pages)))
    }

    fn release_gathered(&self, backend: Backend, extent: &Extent) {
        let p = self.dma.platform();
        match backend {
            Backend::Contiguous => contiguous::release(p, extent),
            _ => backend::free_buffer(p, extent),
        }
    }
}

impl<P: DmaPlatform, D: IommuDomain> DmaMapOps for IommuDma<P, D> {
    fn alloc(
        &self,
        dev: &Device,
        size: u64,
        gfp: GfpFlags,
        attrs: DmaAttrs,
    ) -> Result<DmaAllocation, DmaError> {
        if size == 0 {
            return Err(DmaError::InvalidSize);
        }
        let Some(size) = checked_page_align(size) else {
            warn!("DMA: {}: allocation of {size:#x} bytes cannot be satisfied", dev.name());
            return Err(DmaError::OutOfMemory);
        };
        // A buffer is mapped at one range, which never crosses a segment.
        if size > self.mapping.space().segment_size() {
            debug!("DMA: {}: {size:#x} bytes exceed one IOVA segment", dev.name());
            return Err(DmaError::NoIovaSpace);
        }
        let coherent = dev.is_coherent();
        let coherency = Coherency::from_device(coherent);
        let prot = PageProtection::for_allocation(attrs, coherent);
        let iommu_prot = IommuProt::from_direction(Direction::Bidirectional, attrs);
        let want_vaddr = !attrs.skip_cpu_mapping();

        if coherent || !gfp.can_block() {
            // One physically contiguous buffer behind one IOVA range.
            let backend = if coherent { Backend::Simple } else { Backend::AtomicPool };
            let req = AllocRequest {
                size,
                gfp,
                prot,
                coherency,
                want_vaddr,
                no_warn: attrs.no_warn() || gfp.no_warn(),
            };
            let (extent, mapping) = self.dma.allocate_with(backend, &req)?;
            let iova = match self.mapping.create_mapping(&extent.frames(), iommu_prot) {
                Ok(iova) => iova,
                Err(e) => {
                    self.dma.release_pages(backend, &extent, mapping);
                    return Err(e);
                }
            };
            debug!("DMA: {}: {size:#x} bytes via {backend:?} at {iova:?}", dev.name());
            return self.dma.register_or_unwind(backend, extent, mapping, coherency, iova, want_vaddr, || {
                self.mapping.remove_mapping(iova, size);
            });
        }

        let (backend, extent) = self.gather_pages(size, gfp, attrs, coherency)?;
        let frames = extent.frames();
        let iova = match self.mapping.create_mapping(&frames, iommu_prot) {
            Ok(iova) => iova,
            Err(e) => {
                self.release_gathered(backend, &extent);
                return Err(e);
            }
        };

        let mapping = if want_vaddr {
            if let Some(va) = self.dma.platform().remap(&frames, prot) {
                CpuMapping::Remapped(va)
            } else {
                self.mapping.remove_mapping(iova, size);
                self.release_gathered(backend, &extent);
                return Err(DmaError::OutOfMemory);
            }
        } else {
            CpuMapping::Unmapped
        };
        debug!("DMA: {}: {size:#x} bytes in {} pages at {iova:?}", dev.name(), frames.len());
        self.dma
            .register_or_unwind(backend, extent, mapping, coherency, iova, want_vaddr, || {
                self.mapping.remove_mapping(iova, size);
            })
    }

    fn free(
        &self,
        dev: &Device,
        size: u64,
        handle: BufferKey,
        dma: DmaAddress,
        _attrs: DmaAttrs,
    ) -> Result<(), DmaError> {
        let record = self.dma.take_record(handle, size)?;
        if record.dma_addr != dma {
            warn!(
                "DMA: {}: freeing {handle:?} at {dma:?}, mapped at {:?}",
                dev.name(),
                record.dma_addr
            );
        }
        self.mapping.remove_mapping(record.dma_addr, record.size());
        self.dma
            .release_pages(record.backend, &record.extent, record.mapping);
        Ok(())
    }

    fn map_page(
        &self,
        dev: &Device,
        page: PageFrame,
        offset: u64,
        size: u64,
        dir: Direction,
        attrs: DmaAttrs,
    ) -> Result<DmaAddress, DmaError> {
        let len = span_len(offset, size)?;
        if !dev.is_coherent() && !attrs.skip_cpu_sync() {
            hand_to_device(self.dma.platform(), page.base() + offset, size, dir);
        }
        let iova = self
            .mapping
            .map_range(page.base(), len, IommuProt::from_direction(dir, attrs))?;
        Ok(iova + offset)
    }

    fn unmap_page(&self, dev: &Device, dma: DmaAddress, size: u64, dir: Direction, attrs: DmaAttrs) {
        if !dev.is_coherent() && !attrs.skip_cpu_sync() {
            self.sync_single_for_cpu(dev, dma, size, dir);
        }
        self.mapping.remove_mapping(dma, size);
    }

    fn sync_single_for_cpu(&self, dev: &Device, dma: DmaAddress, size: u64, dir: Direction) {
        if dev.is_coherent() {
            return;
        }
        match self.mapping.domain().iova_to_phys(dma.page_base()) {
            Some(pa) => reclaim_for_cpu(self.dma.platform(), pa + dma.page_offset(), size, dir),
            None => warn!("DMA: {}: sync of unmapped IOVA {dma:?}", dev.name()),
        }
    }

    fn sync_single_for_device(&self, dev: &Device, dma: DmaAddress, size: u64, dir: Direction) {
        if dev.is_coherent() {
            return;
        }
        match self.mapping.domain().iova_to_phys(dma.page_base()) {
            Some(pa) => hand_to_device(self.dma.platform(), pa + dma.page_offset(), size, dir),
            None => warn!("DMA: {}: sync of unmapped IOVA {dma:?}", dev.name()),
        }
    }

    fn map_sg(
        &self,
        dev: &Device,
        sg: &mut [ScatterEntry],
        dir: Direction,
        attrs: DmaAttrs,
    ) -> Result<usize, DmaError> {
        for s in sg.iter_mut() {
            s.clear_dma();
        }
        let runs = plan_runs(sg, dev.max_segment_size());
        let prot = IommuProt::from_direction(dir, attrs);
        let sync = !dev.is_coherent() && !attrs.skip_cpu_sync();

        for (n, run) in runs.iter().enumerate() {
            let entries = &sg[run.first..run.end];
            if sync {
                for s in entries {
                    hand_to_device(self.dma.platform(), s.phys(), s.length, dir);
                }
            }
            match self.mapping.map_run(entries, run, prot) {
                Ok(iova) => {
                    let lead = &mut sg[run.first];
                    lead.dma_address = iova + run.offset;
                    lead.dma_length = run.dma_length();
                }
                Err(e) => {
                    debug!("DMA: {}: scatter list run {n} failed, unwinding", dev.name());
                    for done in &runs[..n] {
                        let lead = &mut sg[done.first];
                        self.mapping.remove_mapping(lead.dma_address, lead.dma_length);
                        lead.clear_dma();
                    }
                    return Err(e);
                }
            }
        }
        Ok(runs.len())
    }

    fn unmap_sg(&self, dev: &Device, sg: &[ScatterEntry], dir: Direction, attrs: DmaAttrs) {
        let sync = !dev.is_coherent() && !attrs.skip_cpu_sync();
        for s in sg {
            if s.is_mapped() {
                self.mapping.remove_mapping(s.dma_address, s.dma_length);
            }
            if sync {
                reclaim_for_cpu(self.dma.platform(), s.phys(), s.length, dir);
            }
        }
    }

    fn sync_sg_for_cpu(&self, dev: &Device, sg: &[ScatterEntry], dir: Direction) {
        sync_entries(self.dma.platform(), dev, sg, Owner::Processor, dir);
    }

    fn sync_sg_for_device(&self, dev: &Device, sg: &[ScatterEntry], dir: Direction) {
        sync_entries(self.dma.platform(), dev, sg, Owner::Device, dir);
    }

    fn map_resource(
        &self,
        _dev: &Device,
        pa: PhysicalAddress,
        size: u64,
        dir: Direction,
        attrs: DmaAttrs,
    ) -> Result<DmaAddress, DmaError> {
        let offset = pa.page_offset();
        let len = span_len(offset, size)?;
        let prot = IommuProt::from_direction(dir, attrs).with_mmio(true);
        let iova = self.mapping.map_range(pa.page_base(), len, prot)?;
        Ok(iova + offset)
    }

    fn unmap_resource(&self, _dev: &Device, dma: DmaAddress, size: u64, _dir: Direction, _attrs: DmaAttrs) {
        self.mapping.remove_mapping(dma, size);
    }
}
