//! The operation table device drivers call through.

use crate::addresses::{DmaAddress, PageFrame, PhysicalAddress};
use crate::attrs::{Direction, DmaAttrs, GfpFlags};
use crate::buffer::{BufferKey, DmaAllocation};
use crate::coherency::{Owner, transfer};
use crate::device::Device;
use crate::error::DmaError;
use crate::platform::{CacheMaintenance, DcacheTracking, PhysMapper};
use crate::scatterlist::ScatterEntry;

/// DMA mapping operations for one kind of bus attachment.
///
/// [`DirectDma`](crate::DirectDma) serves devices that see physical memory
/// directly; [`IommuDma`](crate::IommuDma) serves devices behind a
/// translation unit.
pub trait DmaMapOps {
    /// Allocates a coherent buffer of at least `size` bytes.
    fn alloc(
        &self,
        dev: &Device,
        size: u64,
        gfp: GfpFlags,
        attrs: DmaAttrs,
    ) -> Result<DmaAllocation, DmaError>;

    /// Frees a buffer returned by [`alloc`](Self::alloc).
    fn free(
        &self,
        dev: &Device,
        size: u64,
        handle: BufferKey,
        dma: DmaAddress,
        attrs: DmaAttrs,
    ) -> Result<(), DmaError>;

    /// Maps part of a page for a streaming transfer and hands it to the device.
    fn map_page(
        &self,
        dev: &Device,
        page: PageFrame,
        offset: u64,
        size: u64,
        dir: Direction,
        attrs: DmaAttrs,
    ) -> Result<DmaAddress, DmaError>;

    /// Ends a streaming transfer and returns the memory to the processor.
    fn unmap_page(&self, dev: &Device, dma: DmaAddress, size: u64, dir: Direction, attrs: DmaAttrs);

    fn sync_single_for_cpu(&self, dev: &Device, dma: DmaAddress, size: u64, dir: Direction);

    fn sync_single_for_device(&self, dev: &Device, dma: DmaAddress, size: u64, dir: Direction);

    /// Maps a scatter list; returns the number of device segments produced.
    ///
    /// Either every entry is mapped or none is.
    fn map_sg(
        &self,
        dev: &Device,
        sg: &mut [ScatterEntry],
        dir: Direction,
        attrs: DmaAttrs,
    ) -> Result<usize, DmaError>;

    fn unmap_sg(&self, dev: &Device, sg: &[ScatterEntry], dir: Direction, attrs: DmaAttrs);

    fn sync_sg_for_cpu(&self, dev: &Device, sg: &[ScatterEntry], dir: Direction);

    fn sync_sg_for_device(&self, dev: &Device, sg: &[ScatterEntry], dir: Direction);

    /// Maps a device-memory (MMIO) region; no cache maintenance is involved.
    fn map_resource(
        &self,
        dev: &Device,
        pa: PhysicalAddress,
        size: u64,
        dir: Direction,
        attrs: DmaAttrs,
    ) -> Result<DmaAddress, DmaError>;

    fn unmap_resource(&self, dev: &Device, dma: DmaAddress, size: u64, dir: Direction, attrs: DmaAttrs);

    /// Maps `[pa, pa + size)` for a streaming transfer.
    fn map_single(
        &self,
        dev: &Device,
        pa: PhysicalAddress,
        size: u64,
        dir: Direction,
        attrs: DmaAttrs,
    ) -> Result<DmaAddress, DmaError> {
        let (page, offset) = pa.split();
        self.map_page(dev, page, offset, size, dir, attrs)
    }

    fn unmap_single(&self, dev: &Device, dma: DmaAddress, size: u64, dir: Direction, attrs: DmaAttrs) {
        self.unmap_page(dev, dma, size, dir, attrs);
    }
}

/// Moves every entry of `sg` to `to`, unless the device is coherent.
pub(crate) fn sync_entries<P>(platform: &P, dev: &Device, sg: &[ScatterEntry], to: Owner, dir: Direction)
where
    P: CacheMaintenance + PhysMapper + DcacheTracking + ?Sized,
{
    if dev.is_coherent() {
        return;
    }
    for s in sg {
        transfer(platform, to, s.phys(), s.length, dir);
    }
}
