//! # I/O virtual address space
//!
//! Device addresses behind a translation unit are handed out from an
//! extensible array of bitmap segments, one bit per page. Each segment
//! covers at most one page worth of bits (128 MiB of IOVA space with 4 KiB
//! pages). Only the first segment exists initially; another is appended
//! when every existing one is exhausted, up to a maximum fixed at creation.
//!
//! ```text
//!  base                 base + seg_bytes        base + 2 * seg_bytes
//!   │ segment 0            │ segment 1             │ ...
//!   ├──────────────────────┼───────────────────────┼────
//!   │ 1 bit per page       │ appended on demand    │
//! ```
//!
//! The lock is held across bitmap search and update only, never across
//! translation-unit calls.

use crate::addresses::{DmaAddress, PAGE_SHIFT, PAGE_SIZE, checked_page_align, get_order, pages_for};
use crate::bitmap::Bitmap;
use crate::config::MAX_IOVA_SPACE_SIZE;
use crate::error::DmaError;
use alloc::vec::Vec;
use kernel_sync::{InterruptControl, IrqSpinLock};
use log::{debug, trace};

/// Bits in one page-sized bitmap.
const BITS_PER_PAGE: usize = (PAGE_SIZE as usize) * 8;

pub struct IovaSpace<I: InterruptControl> {
    base: DmaAddress,
    /// Pages covered by one segment.
    segment_pages: usize,
    max_segments: usize,
    alignment_order: u32,
    segments: IrqSpinLock<Vec<Bitmap>, I>,
}

impl<I: InterruptControl> IovaSpace<I> {
    /// Creates a space spanning `[base, base + size)`.
    ///
    /// Spaces with more pages than one bitmap page can track are split into
    /// whole segments of that size; a trailing partial segment is not usable.
    pub fn new(base: DmaAddress, size: u64, alignment_order: u32) -> Result<Self, DmaError> {
        let pages = pages_for(size & !(PAGE_SIZE - 1));
        if pages == 0 {
            return Err(DmaError::EmptyAddressSpace);
        }
        if size > MAX_IOVA_SPACE_SIZE {
            return Err(DmaError::AddressSpaceTooLarge);
        }

        let bitmap_bytes = pages.div_ceil(64) * 8;
        let (segment_pages, max_segments) = if bitmap_bytes > PAGE_SIZE as usize {
            (BITS_PER_PAGE, bitmap_bytes / PAGE_SIZE as usize)
        } else {
            (pages, 1)
        };

        let mut segments = Vec::new();
        segments
            .try_reserve_exact(max_segments)
            .map_err(|_| DmaError::OutOfMemory)?;
        segments.push(Bitmap::try_new(segment_pages).ok_or(DmaError::OutOfMemory)?);

        Ok(Self {
            base,
            segment_pages,
            max_segments,
            alignment_order,
            segments: IrqSpinLock::new(segments),
        })
    }

    #[must_use]
    pub const fn base(&self) -> DmaAddress {
        self.base
    }

    /// Bytes of IOVA space covered by one segment.
    #[must_use]
    pub const fn segment_size(&self) -> u64 {
        (self.segment_pages as u64) << PAGE_SHIFT
    }

    #[must_use]
    pub const fn max_segments(&self) -> usize {
        self.max_segments
    }

    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.lock().len()
    }

    /// Pages currently handed out across all segments.
    #[must_use]
    pub fn allocated_pages(&self) -> usize {
        self.segments.lock().iter().map(Bitmap::count_ones).sum()
    }

    /// Reserves a page-aligned range of at least `size` bytes, aligned to
    /// its own order up to the configured maximum.
    pub fn alloc(&self, size: u64) -> Result<DmaAddress, DmaError> {
        let Some(aligned) = checked_page_align(size) else {
            return Err(DmaError::InvalidSize);
        };
        let count = usize::try_from(aligned >> PAGE_SHIFT).map_err(|_| DmaError::InvalidSize)?;
        if count == 0 {
            return Err(DmaError::InvalidSize);
        }
        let order = get_order(size).min(self.alignment_order);
        let align_mask = (1usize << order) - 1;

        let mut segments = self.segments.lock();
        for (idx, seg) in segments.iter_mut().enumerate() {
            if let Some(start) = seg.find_next_zero_area(0, count, align_mask) {
                seg.set_range(start, count);
                return Ok(self.address_of(idx, start));
            }
        }

        // Every segment is full: grow once, then give up.
        if segments.len() >= self.max_segments {
            trace!("DMA: IOVA space at {} exhausted ({count} pages)", self.base);
            return Err(DmaError::NoIovaSpace);
        }
        let mut seg = Bitmap::try_new(self.segment_pages).ok_or(DmaError::OutOfMemory)?;
        let Some(start) = seg.find_next_zero_area(0, count, align_mask) else {
            return Err(DmaError::NoIovaSpace);
        };
        seg.set_range(start, count);
        segments.push(seg);
        let idx = segments.len() - 1;
        drop(segments);

        debug!("DMA: IOVA space at {} extended to {} segments", self.base, idx + 1);
        Ok(self.address_of(idx, start))
    }

    /// Releases a range obtained from [`alloc`](Self::alloc).
    ///
    /// # Panics
    /// If the range lies outside the space or crosses a segment boundary.
    /// The allocator never hands out such ranges.
    pub fn free(&self, addr: DmaAddress, size: u64) {
        if size == 0 {
            return;
        }
        let offset = addr
            .as_u64()
            .checked_sub(self.base.as_u64())
            .unwrap_or_else(|| panic!("IOVA {addr:?} below space base {:?}", self.base));
        let seg_size = self.segment_size();
        let idx = usize::try_from(offset / seg_size).unwrap_or(usize::MAX);
        let in_seg = offset % seg_size;
        assert!(
            in_seg + size <= seg_size,
            "IOVA range {addr:?}+{size:#x} crosses a segment boundary"
        );

        #[allow(clippy::cast_possible_truncation)]
        let start = (in_seg >> PAGE_SHIFT) as usize;
        let count = pages_for(size);

        let mut segments = self.segments.lock();
        let Some(seg) = segments.get_mut(idx) else {
            drop(segments);
            panic!("IOVA {addr:?} lies in unallocated segment {idx}");
        };
        seg.clear_range(start, count);
    }

    fn address_of(&self, segment: usize, bit: usize) -> DmaAddress {
        self.base + segment as u64 * self.segment_size() + ((bit as u64) << PAGE_SHIFT)
    }
}
