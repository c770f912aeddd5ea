//! Buffer records: what was allocated, by whom, and how the processor sees it.

use crate::addresses::{DmaAddress, PAGE_SHIFT, PageFrame, VirtualAddress};
use crate::backend::Backend;
use alloc::vec::Vec;

/// Identity of a live buffer in the [`BufferRegistry`](crate::BufferRegistry).
///
/// Buffers with a processor mapping are keyed by that address; buffers
/// allocated with `skip_cpu_mapping` are keyed by their first page.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BufferKey {
    Virtual(VirtualAddress),
    Physical(PageFrame),
}

/// Whether cache maintenance is needed for a buffer; fixed at creation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Coherency {
    Coherent,
    Normal,
}

impl Coherency {
    #[must_use]
    pub const fn from_device(coherent: bool) -> Self {
        if coherent { Self::Coherent } else { Self::Normal }
    }

    #[must_use]
    pub const fn is_coherent(self) -> bool {
        matches!(self, Self::Coherent)
    }
}

/// The physical pages backing a buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extent {
    /// A single physically contiguous run.
    Contiguous { first: PageFrame, count: usize },
    /// Individually allocated pages, in buffer order.
    Pages(Vec<PageFrame>),
}

impl Extent {
    #[must_use]
    pub fn page_count(&self) -> usize {
        match self {
            Self::Contiguous { count, .. } => *count,
            Self::Pages(pages) => pages.len(),
        }
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        (self.page_count() as u64) << PAGE_SHIFT
    }

    #[must_use]
    pub fn first_frame(&self) -> Option<PageFrame> {
        match self {
            Self::Contiguous { first, count } => (*count > 0).then_some(*first),
            Self::Pages(pages) => pages.first().copied(),
        }
    }

    /// All frames, in buffer order.
    #[must_use]
    pub fn frames(&self) -> Vec<PageFrame> {
        match self {
            Self::Contiguous { first, count } => (0..*count).map(|i| first.offset_by(i)).collect(),
            Self::Pages(pages) => pages.clone(),
        }
    }
}

/// How the processor reaches a buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CpuMapping {
    /// No processor mapping was established.
    Unmapped,
    /// The pages' linear-map address, protection untouched.
    Linear(VirtualAddress),
    /// The linear map with its protection changed for the buffer's lifetime.
    Reprotected(VirtualAddress),
    /// A mapping created just for this buffer.
    Remapped(VirtualAddress),
    /// A carve-out of the atomic pool's mapping.
    Pool(VirtualAddress),
}

impl CpuMapping {
    #[must_use]
    pub const fn address(self) -> Option<VirtualAddress> {
        match self {
            Self::Unmapped => None,
            Self::Linear(va) | Self::Reprotected(va) | Self::Remapped(va) | Self::Pool(va) => {
                Some(va)
            }
        }
    }
}

/// One live allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferRecord {
    pub key: BufferKey,
    pub backend: Backend,
    pub extent: Extent,
    pub mapping: CpuMapping,
    pub coherency: Coherency,
    pub dma_addr: DmaAddress,
}

impl BufferRecord {
    /// Page-aligned size of the buffer.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.extent.size()
    }
}

/// What a caller receives from an allocation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaAllocation {
    /// Processor address, unless `skip_cpu_mapping` was requested.
    pub cpu_addr: Option<VirtualAddress>,
    /// Opaque handle to pass back on free.
    pub handle: BufferKey,
    pub dma_addr: DmaAddress,
    /// Page-aligned size.
    pub size: u64,
}
