//! Buffers carved from the platform's contiguous reservation.

use super::{AllocRequest, clear_buffer};
use crate::addresses::{get_order, pages_for};
use crate::attrs::PageProtection;
use crate::buffer::{CpuMapping, Extent};
use crate::platform::DmaPlatform;
use log::{trace, warn};

/// Reserves one physically contiguous run and maps it for the processor.
///
/// Low-memory runs keep their linear mapping with the protection switched
/// to `req.prot`; high-memory runs get a fresh mapping.
pub(crate) fn allocate<P>(platform: &P, req: &AllocRequest) -> Option<(Extent, CpuMapping)>
where
    P: DmaPlatform + ?Sized,
{
    let count = pages_for(req.size);
    let first = platform.reserve(count, get_order(req.size), req.no_warn)?;
    clear_buffer(platform, first, req.size, req.coherency);
    let extent = Extent::Contiguous { first, count };

    if !req.want_vaddr {
        return Some((extent, CpuMapping::Unmapped));
    }

    let mapping = match platform.linear_address(first.base()) {
        Some(va) if req.prot == PageProtection::Kernel => CpuMapping::Linear(va),
        Some(va) => {
            platform.set_linear_protection(first, count, req.prot);
            CpuMapping::Reprotected(va)
        }
        None => {
            if let Some(va) = platform.remap(&extent.frames(), req.prot) {
                CpuMapping::Remapped(va)
            } else {
                trace!("DMA: remapping {count} reserved pages failed");
                release(platform, &extent);
                return None;
            }
        }
    };
    Some((extent, mapping))
}

/// Hands the run back to the reservation.
pub(crate) fn release<P>(platform: &P, extent: &Extent)
where
    P: DmaPlatform + ?Sized,
{
    let Some(first) = extent.first_frame() else {
        return;
    };
    if !platform.release(first, extent.page_count()) {
        warn!("DMA: {first:?} does not belong to the contiguous reservation");
    }
}
