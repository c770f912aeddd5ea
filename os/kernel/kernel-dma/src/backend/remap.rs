//! Ordinary pages behind a fresh processor mapping.

use super::{AllocRequest, alloc_buffer, free_buffer};
use crate::addresses::pages_for;
use crate::buffer::{CpuMapping, Extent};
use crate::platform::DmaPlatform;

pub(crate) fn allocate<P>(platform: &P, req: &AllocRequest) -> Option<(Extent, CpuMapping)>
where
    P: DmaPlatform + ?Sized,
{
    let first = alloc_buffer(platform, req.size, req.gfp, req.coherency)?;
    let extent = Extent::Contiguous {
        first,
        count: pages_for(req.size),
    };
    if !req.want_vaddr {
        return Some((extent, CpuMapping::Unmapped));
    }
    if let Some(va) = platform.remap(&extent.frames(), req.prot) {
        Some((extent, CpuMapping::Remapped(va)))
    } else {
        free_buffer(platform, &extent);
        None
    }
}
