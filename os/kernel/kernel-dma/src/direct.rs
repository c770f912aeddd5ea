//! DMA for devices that address physical memory directly.

use crate::addresses::{DmaAddress, PageFrame, PhysicalAddress, checked_page_align};
use crate::attrs::{Direction, DmaAttrs, GfpFlags, PageProtection};
use crate::backend::{AllocRequest, Backend};
use crate::buffer::{BufferKey, Coherency, DmaAllocation};
use crate::coherency::{Owner, hand_to_device, reclaim_for_cpu};
use crate::device::{Device, dma_bit_mask};
use crate::error::DmaError;
use crate::ops::{DmaMapOps, sync_entries};
use crate::platform::DmaPlatform;
use crate::scatterlist::ScatterEntry;
use crate::subsystem::DmaSubsystem;
use alloc::sync::Arc;
use log::{debug, warn};

/// Operation table for devices without a translation unit.
///
/// Bus addresses are physical addresses shifted by the device's DMA offset.
pub struct DirectDma<P: DmaPlatform> {
    dma: Arc<DmaSubsystem<P>>,
}

impl<P: DmaPlatform> DirectDma<P> {
    #[must_use]
    pub const fn new(dma: Arc<DmaSubsystem<P>>) -> Self {
        Self { dma }
    }

    #[must_use]
    pub const fn subsystem(&self) -> &Arc<DmaSubsystem<P>> {
        &self.dma
    }

    fn bus_address(dev: &Device, pa: PhysicalAddress, size: u64) -> Result<DmaAddress, DmaError> {
        let dma = dev.phys_to_dma(pa);
        if dev.can_reach(dma, size) {
            Ok(dma)
        } else {
            debug!("DMA: {} cannot reach {pa} (+{size:#x})", dev.name());
            Err(DmaError::AddressUnreachable(pa))
        }
    }
}

impl<P: DmaPlatform> DmaMapOps for DirectDma<P> {
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

        let mask = dev.coherent_limit_mask();
        let limit = mask.wrapping_add(1) & !mask;
        if limit != 0 && size >= limit {
            warn!(
                "DMA: {}: coherent allocation too big (requested {size:#x} mask {mask:#x})",
                dev.name()
            );
            return Err(DmaError::ExceedsDeviceMask);
        }

        let mut gfp = gfp;
        if mask < dma_bit_mask(32) {
            gfp.set_dma_zone(true);
        }

        let Some(size) = checked_page_align(size) else {
            warn!("DMA: {}: coherent allocation of {size:#x} bytes cannot be satisfied", dev.name());
            return Err(DmaError::OutOfMemory);
        };
        let coherent = dev.is_coherent();
        let blocking = gfp.can_block();
        let platform = self.dma.platform();
        let backend = Backend::select(blocking, coherent, blocking && platform.has_area(Some(dev)));
        debug_assert!(blocking || !backend.may_block());
        debug!("DMA: {}: {size:#x} bytes via {backend:?}", dev.name());

        let want_vaddr = !attrs.skip_cpu_mapping();
        let req = AllocRequest {
            size,
            gfp,
            prot: PageProtection::for_allocation(attrs, coherent),
            coherency: Coherency::from_device(coherent),
            want_vaddr,
            no_warn: attrs.no_warn() || gfp.no_warn(),
        };
        let (extent, mapping) = self.dma.allocate_with(backend, &req)?;
        let Some(first) = extent.first_frame() else {
            self.dma.release_pages(backend, &extent, mapping);
            return Err(DmaError::OutOfMemory);
        };
        let dma_addr = dev.phys_to_dma(first.base());
        self.dma
            .register(backend, extent, mapping, req.coherency, dma_addr, want_vaddr)
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
                "DMA: {}: freeing {handle:?} with bus address {dma:?}, allocated at {:?}",
                dev.name(),
                record.dma_addr
            );
        }
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
        let pa = page.base() + offset;
        let dma = Self::bus_address(dev, pa, size)?;
        if !dev.is_coherent() && !attrs.skip_cpu_sync() {
            hand_to_device(self.dma.platform(), pa, size, dir);
        }
        Ok(dma)
    }

    fn unmap_page(&self, dev: &Device, dma: DmaAddress, size: u64, dir: Direction, attrs: DmaAttrs) {
        if !dev.is_coherent() && !attrs.skip_cpu_sync() {
            reclaim_for_cpu(self.dma.platform(), dev.dma_to_phys(dma), size, dir);
        }
    }

    fn sync_single_for_cpu(&self, dev: &Device, dma: DmaAddress, size: u64, dir: Direction) {
        if !dev.is_coherent() {
            reclaim_for_cpu(self.dma.platform(), dev.dma_to_phys(dma), size, dir);
        }
    }

    fn sync_single_for_device(&self, dev: &Device, dma: DmaAddress, size: u64, dir: Direction) {
        if !dev.is_coherent() {
            hand_to_device(self.dma.platform(), dev.dma_to_phys(dma), size, dir);
        }
    }

    fn map_sg(
        &self,
        dev: &Device,
        sg: &mut [ScatterEntry],
        dir: Direction,
        attrs: DmaAttrs,
    ) -> Result<usize, DmaError> {
        for i in 0..sg.len() {
            let s = sg[i];
            match self.map_page(dev, s.page, s.offset, s.length, dir, attrs) {
                Ok(dma) => {
                    sg[i].dma_address = dma;
                    sg[i].dma_length = s.length;
                }
                Err(e) => {
                    for done in &mut sg[..i] {
                        self.unmap_page(dev, done.dma_address, done.dma_length, dir, attrs);
                        done.clear_dma();
                    }
                    return Err(e);
                }
            }
        }
        Ok(sg.len())
    }

    fn unmap_sg(&self, dev: &Device, sg: &[ScatterEntry], dir: Direction, attrs: DmaAttrs) {
        for s in sg.iter().filter(|s| s.is_mapped()) {
            self.unmap_page(dev, s.dma_address, s.dma_length, dir, attrs);
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
        dev: &Device,
        pa: PhysicalAddress,
        size: u64,
        _dir: Direction,
        _attrs: DmaAttrs,
    ) -> Result<DmaAddress, DmaError> {
        Self::bus_address(dev, pa, size)
    }

    fn unmap_resource(&self, _dev: &Device, _dma: DmaAddress, _size: u64, _dir: Direction, _attrs: DmaAttrs) {}
}
