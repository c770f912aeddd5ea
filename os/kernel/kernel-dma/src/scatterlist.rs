//! Scatter-gather lists and the run-merging rule used when mapping them
//! through a translation unit.

use crate::addresses::{DmaAddress, PAGE_OFFSET_MASK, PageFrame, PhysicalAddress, page_align};
use alloc::vec::Vec;

/// One physically contiguous piece of a transfer.
///
/// `page`, `offset` and `length` describe the memory. `dma_address` and
/// `dma_length` are written by `map_sg`; a zero `dma_length` marks an entry
/// that was folded into an earlier one (or not mapped at all).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ScatterEntry {
    pub page: PageFrame,
    pub offset: u64,
    pub length: u64,
    pub dma_address: DmaAddress,
    pub dma_length: u64,
}

impl ScatterEntry {
    #[must_use]
    pub const fn new(page: PageFrame, offset: u64, length: u64) -> Self {
        Self {
            page,
            offset,
            length,
            dma_address: DmaAddress::zero(),
            dma_length: 0,
        }
    }

    /// Physical address of the first byte.
    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.page.base().as_u64() + self.offset)
    }

    /// Whether this entry carries a mapping (leads a run).
    #[must_use]
    pub const fn is_mapped(&self) -> bool {
        self.dma_length != 0
    }

    pub(crate) const fn clear_dma(&mut self) {
        self.dma_address = DmaAddress::zero();
        self.dma_length = 0;
    }
}

/// Entries `[first, end)` merged into one device-contiguous range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Run {
    pub first: usize,
    pub end: usize,
    /// In-page offset of the first entry.
    pub offset: u64,
    /// Bytes from the first entry's page start to the end of the last entry.
    pub span: u64,
}

impl Run {
    /// Length reported to the device.
    #[must_use]
    pub const fn dma_length(&self) -> u64 {
        self.span - self.offset
    }

    /// Page-aligned IOVA extent the run occupies.
    #[must_use]
    pub const fn iova_size(&self) -> u64 {
        page_align(self.span)
    }
}

/// Splits `list` into runs.
///
/// A new run starts at an entry with a non-zero offset, after a run whose end
/// is not page aligned, or where appending would exceed `max_segment`.
#[must_use]
pub fn plan_runs(list: &[ScatterEntry], max_segment: u64) -> Vec<Run> {
    let mut runs = Vec::new();
    let Some(head) = list.first() else {
        return runs;
    };

    let mut run = Run {
        first: 0,
        end: 1,
        offset: head.offset,
        span: head.offset + head.length,
    };
    for (i, s) in list.iter().enumerate().skip(1) {
        if s.offset != 0 || run.span & PAGE_OFFSET_MASK != 0 || run.span + s.length > max_segment {
            runs.push(run);
            run = Run {
                first: i,
                end: i,
                offset: s.offset,
                span: s.offset,
            };
        }
        run.span += s.length;
        run.end = i + 1;
    }
    runs.push(run);
    runs
}

/// Physically contiguous `(start, bytes)` chunks of a run, each page-granular.
#[must_use]
pub fn physical_chunks(entries: &[ScatterEntry]) -> Vec<(PhysicalAddress, u64)> {
    let mut chunks: Vec<(PhysicalAddress, u64)> = Vec::new();
    for s in entries {
        let pa = s.page.base();
        let len = page_align(s.offset + s.length);
        match chunks.last_mut() {
            Some((start, bytes)) if *start + *bytes == pa => *bytes += len,
            _ => chunks.push((pa, len)),
        }
    }
    chunks
}
