//! # Allocation backends
//!
//! Four allocators can produce a coherent DMA buffer. Which one serves a
//! request is fixed by [`Backend::select`]; the chosen variant is stored in
//! the buffer's record so the same backend releases it.
//!
//! | Backend        | Pages from                | Processor mapping                     | Blocks |
//! |----------------|---------------------------|---------------------------------------|--------|
//! | `Contiguous`   | contiguous reservation    | linear map re-protected, or remapped  | yes    |
//! | `Simple`       | page allocator            | linear map, cached                    | no     |
//! | `Remap`        | page allocator            | fresh remap                           | yes    |
//! | `AtomicPool`   | preallocated pool         | pool's mapping                        | no     |

pub(crate) mod contiguous;
pub mod pool;
pub(crate) mod remap;
pub(crate) mod simple;

use crate::addresses::{PageFrame, get_order, pages_for};
use crate::attrs::{GfpFlags, PageProtection};
use crate::buffer::{Coherency, CpuMapping, Extent};
use crate::coherency::for_each_cpu_range;
use crate::platform::DmaPlatform;

pub use pool::AtomicPool;

/// The allocator that produced a buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Backend {
    Contiguous,
    AtomicPool,
    Remap,
    Simple,
}

impl Backend {
    /// Picks the backend for a request. The priority is fixed:
    ///
    /// 1. a contiguous reservation, if one exists and the caller may block;
    /// 2. plain zeroed pages for coherent devices;
    /// 3. remapped pages if the caller may block;
    /// 4. the atomic pool.
    ///
    /// ```
    /// # use kernel_dma::backend::Backend;
    /// assert_eq!(Backend::select(true, false, true), Backend::Contiguous);
    /// assert_eq!(Backend::select(false, true, true), Backend::Simple);
    /// assert_eq!(Backend::select(true, false, false), Backend::Remap);
    /// assert_eq!(Backend::select(false, false, true), Backend::AtomicPool);
    /// ```
    #[must_use]
    pub const fn select(blocking: bool, coherent: bool, contiguous_available: bool) -> Self {
        if contiguous_available && blocking {
            Self::Contiguous
        } else if coherent {
            Self::Simple
        } else if blocking {
            Self::Remap
        } else {
            Self::AtomicPool
        }
    }

    /// Whether this backend may sleep while allocating.
    #[must_use]
    pub const fn may_block(self) -> bool {
        matches!(self, Self::Contiguous | Self::Remap)
    }
}

/// Parameters shared by all backends.
#[derive(Debug, Copy, Clone)]
pub(crate) struct AllocRequest {
    /// Page-aligned size.
    pub size: u64,
    pub gfp: GfpFlags,
    pub prot: PageProtection,
    pub coherency: Coherency,
    pub want_vaddr: bool,
    pub no_warn: bool,
}

/// Zeroes `[first, first + size)` and, unless coherent, flushes it out of all
/// cache levels so no dirty line can later overwrite device data.
pub(crate) fn clear_buffer<P>(platform: &P, first: PageFrame, size: u64, coherency: Coherency)
where
    P: DmaPlatform + ?Sized,
{
    let base = first.base();
    for_each_cpu_range(platform, base, size, |va, len| {
        #[allow(clippy::cast_possible_truncation)]
        let bytes = len as usize;
        // Safety: PhysMapper guarantees the address is writable for the page
        // range it covers, and these pages were just handed to us.
        unsafe {
            core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, bytes);
        }
        if !coherency.is_coherent() {
            platform.clean_and_invalidate(va, len);
        }
    });
    if !coherency.is_coherent() {
        platform.outer_flush(base, size);
    }
}

/// Allocates and clears exactly `pages_for(size)` pages from the page
/// allocator. The surplus of the power-of-two block is returned at once.
pub(crate) fn alloc_buffer<P>(platform: &P, size: u64, gfp: GfpFlags, coherency: Coherency) -> Option<PageFrame>
where
    P: DmaPlatform + ?Sized,
{
    let order = get_order(size);
    let first = platform.alloc_pages(order, gfp)?;
    for i in pages_for(size)..(1 << order) {
        platform.free_pages(first.offset_by(i), 0);
    }
    clear_buffer(platform, first, size, coherency);
    Some(first)
}

/// Returns page-allocator pages one by one.
pub(crate) fn free_buffer<P>(platform: &P, extent: &Extent)
where
    P: DmaPlatform + ?Sized,
{
    for frame in extent.frames() {
        platform.free_pages(frame, 0);
    }
}

/// Tears down the processor mapping established for `extent`.
pub(crate) fn undo_cpu_mapping<P>(platform: &P, mapping: CpuMapping, extent: &Extent)
where
    P: DmaPlatform + ?Sized,
{
    match mapping {
        CpuMapping::Reprotected(_) => {
            if let Some(first) = extent.first_frame() {
                platform.set_linear_protection(first, extent.page_count(), PageProtection::Kernel);
            }
        }
        CpuMapping::Remapped(va) => platform.unremap(va, extent.size()),
        CpuMapping::Unmapped | CpuMapping::Linear(_) | CpuMapping::Pool(_) => {}
    }
}
