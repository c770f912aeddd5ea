//! # Ownership transfer
//!
//! A streaming buffer is owned either by the processor or by the device.
//! Handing it over requires cache maintenance on non-coherent platforms:
//!
//! | Transition        | `ToDevice` / `Bidirectional` / `NoTransfer` | `FromDevice` |
//! |-------------------|---------------------------------------------|--------------|
//! | processor→device  | clean                                       | invalidate   |
//! | device→processor  | invalidate (none for `ToDevice`)            | invalidate   |
//!
//! Cleaning happens before the device runs and invalidation after it
//! finished, since the processor may speculatively refill lines at any time
//! while the device owns the buffer.
//!
//! High-memory pages have no permanent mapping and are maintained one page at
//! a time through a temporary mapping.

use crate::addresses::{PAGE_SIZE, PageFrame, PhysicalAddress, VirtualAddress};
use crate::attrs::Direction;
use crate::platform::{CacheMaintenance, DcacheTracking, PhysMapper};

/// Who may access a streaming buffer right now.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Owner {
    Processor,
    Device,
}

#[derive(Copy, Clone)]
enum InnerOp {
    Clean,
    Invalidate,
}

/// Walks `[pa, pa + size)` page by page, applying `op` to processor-visible
/// ranges. Adjacent linear-map chunks are merged into one call.
pub(crate) fn for_each_cpu_range<P>(
    platform: &P,
    pa: PhysicalAddress,
    size: u64,
    mut op: impl FnMut(VirtualAddress, u64),
)
where
    P: PhysMapper + ?Sized,
{
    let (mut frame, mut offset) = pa.split();
    let mut left = size;
    let mut pending: Option<(VirtualAddress, u64)> = None;

    while left > 0 {
        let len = left.min(PAGE_SIZE - offset);
        match platform.linear_address(frame.base()) {
            Some(va) => {
                let va = va + offset;
                pending = match pending {
                    Some((start, run)) if start + run == va => Some((start, run + len)),
                    other => {
                        if let Some((start, run)) = other {
                            op(start, run);
                        }
                        Some((va, len))
                    }
                };
            }
            None => {
                if let Some((start, run)) = pending.take() {
                    op(start, run);
                }
                let va = platform.map_atomic(frame);
                op(va + offset, len);
                platform.unmap_atomic(va);
            }
        }
        offset = 0;
        frame = frame.offset_by(1);
        left -= len;
    }

    if let Some((start, run)) = pending {
        op(start, run);
    }
}

/// Full pages covered by `[pa, pa + size)`.
fn full_pages(pa: PhysicalAddress, size: u64) -> impl Iterator<Item = PageFrame> {
    let first = pa.as_u64().div_ceil(PAGE_SIZE);
    let end = (pa.as_u64() + size) / PAGE_SIZE;
    (first..end).map(PageFrame::from_pfn)
}

/// Whether every page of the range is whole and known to have a clean cache.
fn known_clean<P>(platform: &P, pa: PhysicalAddress, size: u64) -> bool
where
    P: DcacheTracking + ?Sized,
{
    pa.is_page_aligned()
        && size % PAGE_SIZE == 0
        && size > 0
        && full_pages(pa, size).all(|f| platform.is_dcache_clean(f))
}

/// Processor→device: prepares `[pa, pa + size)` for a transfer in `dir`.
///
/// `FromDevice` regions are always invalidated. Other directions are
/// cleaned, unless every page is known clean already.
pub fn hand_to_device<P>(platform: &P, pa: PhysicalAddress, size: u64, dir: Direction)
where
    P: CacheMaintenance + PhysMapper + DcacheTracking + ?Sized,
{
    if size == 0 {
        return;
    }
    let op = if dir == Direction::FromDevice {
        InnerOp::Invalidate
    } else {
        InnerOp::Clean
    };
    let skip_inner = matches!(op, InnerOp::Clean) && known_clean(platform, pa, size);

    if !skip_inner {
        for_each_cpu_range(platform, pa, size, |va, len| match op {
            InnerOp::Clean => platform.clean(va, len),
            InnerOp::Invalidate => platform.invalidate(va, len),
        });
    }

    match op {
        InnerOp::Invalidate => platform.outer_invalidate(pa, size),
        InnerOp::Clean => platform.outer_clean(pa, size),
    }
}

/// Device→processor: makes device-written data in `[pa, pa + size)` visible.
///
/// Nothing is done for `ToDevice`. Otherwise outer then inner caches are
/// invalidated, and fully covered pages are marked clean.
pub fn reclaim_for_cpu<P>(platform: &P, pa: PhysicalAddress, size: u64, dir: Direction)
where
    P: CacheMaintenance + PhysMapper + DcacheTracking + ?Sized,
{
    if size == 0 || dir == Direction::ToDevice {
        return;
    }
    platform.outer_invalidate(pa, size);
    for_each_cpu_range(platform, pa, size, |va, len| platform.invalidate(va, len));

    for frame in full_pages(pa, size) {
        platform.mark_dcache_clean(frame);
    }
}

/// Applies the maintenance for moving a region to `to`.
pub fn transfer<P>(platform: &P, to: Owner, pa: PhysicalAddress, size: u64, dir: Direction)
where
    P: CacheMaintenance + PhysMapper + DcacheTracking + ?Sized,
{
    match to {
        Owner::Device => hand_to_device(platform, pa, size, dir),
        Owner::Processor => reclaim_for_cpu(platform, pa, size, dir),
    }
}
