//! Request flags: allocation attributes, page-allocator flags, transfer
//! direction and the protections derived from them.

use bitfield_struct::bitfield;

/// Behavioral attributes of an allocation or mapping request.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct DmaAttrs {
    /// Do not establish a processor-side mapping; only a device handle is returned.
    pub skip_cpu_mapping: bool,
    /// Map with write-combining instead of fully uncached protection.
    pub write_combine: bool,
    /// Back the buffer with a single physically contiguous run.
    pub force_contiguous: bool,
    /// The caller performs cache maintenance itself.
    pub skip_cpu_sync: bool,
    /// Gather translated buffers from single pages only.
    pub alloc_single_pages: bool,
    /// Do not warn on allocation failure.
    pub no_warn: bool,
    /// Map for privileged device accesses only.
    pub privileged: bool,
    #[bits(25)]
    __: u32,
}

/// Flags passed down to the page allocators.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct GfpFlags {
    /// The caller may sleep.
    pub can_block: bool,
    /// Restrict to the low DMA zone.
    pub dma_zone: bool,
    /// Pages without a permanent linear mapping are acceptable.
    pub highmem: bool,
    pub no_warn: bool,
    /// Fail fast instead of reclaiming.
    pub no_retry: bool,
    #[bits(27)]
    __: u32,
}

impl GfpFlags {
    /// Regular, blocking allocation.
    pub const KERNEL: Self = Self::new().with_can_block(true);

    /// Allocation from a context that must not sleep.
    pub const ATOMIC: Self = Self::new();
}

/// Direction of a DMA transfer relative to the device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    Bidirectional,
    /// Device reads, processor wrote.
    ToDevice,
    /// Device writes, processor will read.
    FromDevice,
    NoTransfer,
}

impl Direction {
    /// Whether data moves from the device into memory.
    #[inline]
    #[must_use]
    pub const fn device_writes(self) -> bool {
        matches!(self, Self::Bidirectional | Self::FromDevice)
    }
}

/// Translation-unit access permissions.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct IommuProt {
    pub read: bool,
    pub write: bool,
    pub privileged: bool,
    /// Device memory rather than RAM.
    pub mmio: bool,
    #[bits(4)]
    __: u8,
}

impl IommuProt {
    /// Permissions needed for a transfer in `dir`.
    #[must_use]
    pub const fn from_direction(dir: Direction, attrs: DmaAttrs) -> Self {
        let prot = Self::new()
            .with_privileged(attrs.privileged())
            .with_write(dir.device_writes());
        match dir {
            Direction::Bidirectional | Direction::ToDevice => prot.with_read(true),
            Direction::FromDevice | Direction::NoTransfer => prot,
        }
    }
}

/// Processor-side page protection of a DMA buffer mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum PageProtection {
    /// Regular cached kernel memory.
    Kernel,
    /// Uncached, for buffers shared with a non-coherent device.
    DmaCoherent,
    WriteCombine,
}

impl PageProtection {
    /// Protection for an allocation on a device with the given coherency.
    #[must_use]
    pub const fn for_allocation(attrs: DmaAttrs, coherent: bool) -> Self {
        if coherent {
            Self::Kernel
        } else if attrs.write_combine() {
            Self::WriteCombine
        } else {
            Self::DmaCoherent
        }
    }
}
