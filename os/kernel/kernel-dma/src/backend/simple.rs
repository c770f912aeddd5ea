//! Zeroed pages used through the linear map; for coherent devices only,
//! so no flush and no protection change are needed.

use super::{AllocRequest, alloc_buffer, free_buffer};
use crate::addresses::pages_for;
use crate::buffer::{Coherency, CpuMapping, Extent};
use crate::platform::DmaPlatform;

pub(crate) fn allocate<P>(platform: &P, req: &AllocRequest) -> Option<(Extent, CpuMapping)>
where
    P: DmaPlatform + ?Sized,
{
    let gfp = req.gfp.with_highmem(false);
    let first = alloc_buffer(platform, req.size, gfp, Coherency::Coherent)?;
    let extent = Extent::Contiguous {
        first,
        count: pages_for(req.size),
    };
    if !req.want_vaddr {
        return Some((extent, CpuMapping::Unmapped));
    }
    if let Some(va) = platform.linear_address(first.base()) {
        Some((extent, CpuMapping::Linear(va)))
    } else {
        free_buffer(platform, &extent);
        None
    }
}
