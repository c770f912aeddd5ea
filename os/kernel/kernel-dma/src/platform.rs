//! # Platform capabilities
//!
//! The DMA core does not touch caches, page tables or physical memory pools
//! directly. The host kernel supplies those through the traits in this module;
//! [`DmaPlatform`] bundles them for the subsystem, and [`IommuDomain`] stands
//! for one translation context of an IOMMU.
//!
//! All methods take `&self`: implementations are shared between concurrent
//! callers and must synchronize internally.

use crate::addresses::{DmaAddress, PageFrame, PhysicalAddress, VirtualAddress};
use crate::attrs::{GfpFlags, IommuProt, PageProtection};
use crate::device::Device;
use crate::error::IommuError;
use kernel_sync::InterruptControl;

/// Range-based cache maintenance.
///
/// Inner-cache operations take processor virtual addresses; outer-cache
/// operations take physical addresses and default to no-ops for platforms
/// without an outer cache.
pub trait CacheMaintenance {
    /// Write dirty lines back to memory.
    fn clean(&self, va: VirtualAddress, size: u64);

    /// Discard cached lines without writing them back.
    fn invalidate(&self, va: VirtualAddress, size: u64);

    fn clean_and_invalidate(&self, va: VirtualAddress, size: u64);

    fn outer_clean(&self, _pa: PhysicalAddress, _size: u64) {}

    fn outer_invalidate(&self, _pa: PhysicalAddress, _size: u64) {}

    fn outer_flush(&self, _pa: PhysicalAddress, _size: u64) {}
}

/// Access to physical pages from the processor.
///
/// # Safety
/// Implementors guarantee that every address returned by
/// [`linear_address`](Self::linear_address) and [`map_atomic`](Self::map_atomic)
/// is valid for reads and writes of the whole page it belongs to, for as long as
/// the page is owned by the caller (or until the matching `unmap_atomic`).
pub unsafe trait PhysMapper {
    /// Address of `pa` in the permanent linear map, or `None` for high memory.
    fn linear_address(&self, pa: PhysicalAddress) -> Option<VirtualAddress>;

    /// Inverse of [`linear_address`](Self::linear_address).
    fn linear_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress>;

    /// Temporarily maps one page; must not sleep.
    fn map_atomic(&self, frame: PageFrame) -> VirtualAddress;

    fn unmap_atomic(&self, va: VirtualAddress);
}

/// The buddy page allocator.
pub trait PageAllocator {
    /// Allocates `1 << order` physically contiguous pages.
    fn alloc_pages(&self, order: u32, gfp: GfpFlags) -> Option<PageFrame>;

    /// Frees `1 << order` pages starting at `frame`. Pages of a higher-order
    /// allocation may be returned one by one with `order == 0`.
    fn free_pages(&self, frame: PageFrame, order: u32);
}

/// A reserved region handing out physically contiguous page runs.
pub trait ContiguousReservation {
    /// Whether a reservation serves `dev` (`None`: the default area).
    fn has_area(&self, dev: Option<&Device>) -> bool;

    /// Reserves `count` pages aligned to `1 << order` pages.
    fn reserve(&self, count: usize, order: u32, no_warn: bool) -> Option<PageFrame>;

    /// Returns a run obtained from [`reserve`](Self::reserve).
    /// Returns `false` if the run does not belong to the reservation.
    fn release(&self, frame: PageFrame, count: usize) -> bool;
}

/// Creation and removal of processor-side mappings.
pub trait Remapper {
    /// Maps `frames` at a fresh virtually contiguous range.
    fn remap(&self, frames: &[PageFrame], prot: PageProtection) -> Option<VirtualAddress>;

    fn unremap(&self, va: VirtualAddress, size: u64);

    /// Changes the protection of existing linear-map entries.
    fn set_linear_protection(&self, frame: PageFrame, count: usize, prot: PageProtection);
}

/// Optional tracking of pages whose data cache is known to be clean.
///
/// The defaults never report a page as clean, which keeps every
/// maintenance operation in place.
pub trait DcacheTracking {
    fn mark_dcache_clean(&self, _frame: PageFrame) {}

    fn is_dcache_clean(&self, _frame: PageFrame) -> bool {
        false
    }
}

/// Everything the DMA subsystem needs from its host.
pub trait DmaPlatform:
    CacheMaintenance + PhysMapper + PageAllocator + ContiguousReservation + Remapper + DcacheTracking
{
    /// Interrupt masking used by the subsystem's locks.
    type Irq: InterruptControl;
}

/// One translation context of an IOMMU.
pub trait IommuDomain {
    /// Maps `[iova, iova + size)` to `[pa, pa + size)`.
    fn map(
        &self,
        iova: DmaAddress,
        pa: PhysicalAddress,
        size: u64,
        prot: IommuProt,
    ) -> Result<(), IommuError>;

    /// Removes translations in `[iova, iova + size)`, returning the bytes unmapped.
    fn unmap(&self, iova: DmaAddress, size: u64) -> u64;

    fn iova_to_phys(&self, iova: DmaAddress) -> Option<PhysicalAddress>;
}
