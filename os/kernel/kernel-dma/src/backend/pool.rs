//! # Atomic pool
//!
//! A single preallocated, already mapped region that serves coherent
//! allocations from contexts that must not sleep.
//!
//! The free list lives out of band (the pool memory is uncached and may be
//! handed to devices at any time) and is kept **sorted by page index** so that
//! neighbours coalesce on free:
//!
//! ```text
//! pool:  |####|....|##|........|####|
//! free:       [4,4)   [10,8)
//! ```
//!
//! Allocation is first-fit with the start aligned to the request's size
//! rounded up to a power of two (in pages, relative to the pool start).

use crate::addresses::{PAGE_SHIFT, PageFrame, VirtualAddress, pages_for};
use alloc::vec;
use alloc::vec::Vec;
use kernel_sync::{InterruptControl, IrqSpinLock};
use log::{error, trace};

/// A free run of pages, relative to the pool start.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct FreeExtent {
    start: usize,
    pages: usize,
}

impl FreeExtent {
    const fn end(self) -> usize {
        self.start + self.pages
    }
}

/// Align `index` upwards to `align` (must be a power of two).
#[inline]
const fn align_up(index: usize, align: usize) -> usize {
    (index + (align - 1)) & !(align - 1)
}

/// Fixed-size page pool for non-blocking allocations.
///
/// # Invariants
/// - Free extents are non-empty, non-overlapping, non-adjacent and sorted.
/// - Every allocation lies within `[virt_base, virt_base + size)`.
pub struct AtomicPool<I: InterruptControl> {
    virt_base: VirtualAddress,
    phys_base: PageFrame,
    pages: usize,
    free: IrqSpinLock<Vec<FreeExtent>, I>,
}

impl<I: InterruptControl> AtomicPool<I> {
    /// Manages `pages` pages mapped at `virt_base` and backed by the physically
    /// contiguous run starting at `phys_base`.
    #[must_use]
    pub fn new(virt_base: VirtualAddress, phys_base: PageFrame, pages: usize) -> Self {
        let free = if pages == 0 {
            Vec::new()
        } else {
            vec![FreeExtent { start: 0, pages }]
        };
        Self {
            virt_base,
            phys_base,
            pages,
            free: IrqSpinLock::new(free),
        }
    }

    #[must_use]
    pub const fn virt_base(&self) -> VirtualAddress {
        self.virt_base
    }

    #[must_use]
    pub const fn phys_base(&self) -> PageFrame {
        self.phys_base
    }

    /// Total size in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        (self.pages as u64) << PAGE_SHIFT
    }

    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        let pages: usize = self.free.lock().iter().map(|e| e.pages).sum();
        (pages as u64) << PAGE_SHIFT
    }

    /// Whether `[va, va + size)` lies entirely inside the pool.
    #[must_use]
    pub fn contains(&self, va: VirtualAddress, size: u64) -> bool {
        let start = self.virt_base.as_u64();
        let end = start + self.size();
        va.as_u64() >= start && va.as_u64().checked_add(size).is_some_and(|e| e <= end)
    }

    /// Carves out `size` bytes, returning the processor address and first page.
    pub fn alloc(&self, size: u64) -> Option<(VirtualAddress, PageFrame)> {
        let count = pages_for(size);
        if count == 0 {
            return None;
        }
        let align = count.next_power_of_two();

        let mut free = self.free.lock();
        let (idx, start) = free.iter().enumerate().find_map(|(i, ext)| {
            let start = align_up(ext.start, align);
            (start + count <= ext.end()).then_some((i, start))
        })?;

        // Split the chosen extent into up to two free parts around the allocation.
        let ext = free.remove(idx);
        let tail = FreeExtent {
            start: start + count,
            pages: ext.end() - (start + count),
        };
        if tail.pages > 0 {
            free.insert(idx, tail);
        }
        let head = FreeExtent {
            start: ext.start,
            pages: start - ext.start,
        };
        if head.pages > 0 {
            free.insert(idx, head);
        }
        drop(free);

        trace!("DMA: atomic pool handed out {count} pages at index {start}");
        Some((
            self.virt_base + ((start as u64) << PAGE_SHIFT),
            self.phys_base.offset_by(start),
        ))
    }

    /// Returns `[va, va + size)` to the pool.
    ///
    /// Returns `false` without touching the pool if the range is not part of it,
    /// so callers can probe several owners.
    pub fn free(&self, va: VirtualAddress, size: u64) -> bool {
        if !self.contains(va, size) {
            return false;
        }
        #[allow(clippy::cast_possible_truncation)]
        let start = ((va - self.virt_base) >> PAGE_SHIFT) as usize;
        let new = FreeExtent {
            start,
            pages: pages_for(size),
        };
        if new.pages == 0 {
            return true;
        }

        let mut free = self.free.lock();
        // Insert sorted by page index to enable coalescing.
        let idx = free.partition_point(|e| e.start < start);
        let overlaps_prev = idx > 0 && free[idx - 1].end() > new.start;
        let overlaps_next = free.get(idx).is_some_and(|e| e.start < new.end());
        if overlaps_prev || overlaps_next {
            drop(free);
            error!("DMA: atomic pool range {va:?}+{size:#x} is already free");
            return true;
        }
        free.insert(idx, new);

        // Coalesce with the successor, then with the predecessor.
        if idx + 1 < free.len() && free[idx].end() == free[idx + 1].start {
            free[idx].pages += free[idx + 1].pages;
            free.remove(idx + 1);
        }
        if idx > 0 && free[idx - 1].end() == free[idx].start {
            free[idx - 1].pages += free[idx].pages;
            free.remove(idx);
        }
        true
    }
}
