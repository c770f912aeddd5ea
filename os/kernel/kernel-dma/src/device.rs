use crate::addresses::{DmaAddress, PhysicalAddress};
use crate::config::DEFAULT_MAX_SEGMENT_SIZE;

/// Mask of an `n`-bit device address bus.
#[inline]
#[must_use]
pub const fn dma_bit_mask(bits: u32) -> u64 {
    if bits >= 64 { u64::MAX } else { (1 << bits) - 1 }
}

/// `min(a, b)`, treating zero as "no limit".
#[inline]
#[must_use]
pub const fn min_not_zero(a: u64, b: u64) -> u64 {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) if a < b => a,
        (_, b) => b,
    }
}

/// The DMA-relevant properties of a bus-mastering device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    name: &'static str,
    coherent: bool,
    dma_mask: u64,
    coherent_dma_mask: u64,
    bus_dma_limit: u64,
    dma_offset: u64,
    max_segment_size: u64,
}

impl Device {
    /// A non-coherent device with 32-bit masks and no bus offset.
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            coherent: false,
            dma_mask: dma_bit_mask(32),
            coherent_dma_mask: dma_bit_mask(32),
            bus_dma_limit: 0,
            dma_offset: 0,
            max_segment_size: DEFAULT_MAX_SEGMENT_SIZE,
        }
    }

    #[must_use]
    pub const fn with_coherent(mut self, coherent: bool) -> Self {
        self.coherent = coherent;
        self
    }

    /// Sets both the streaming and the coherent mask.
    #[must_use]
    pub const fn with_dma_mask(mut self, mask: u64) -> Self {
        self.dma_mask = mask;
        self.coherent_dma_mask = mask;
        self
    }

    #[must_use]
    pub const fn with_coherent_dma_mask(mut self, mask: u64) -> Self {
        self.coherent_dma_mask = mask;
        self
    }

    /// Limit imposed by the interconnect; zero means none.
    #[must_use]
    pub const fn with_bus_dma_limit(mut self, limit: u64) -> Self {
        self.bus_dma_limit = limit;
        self
    }

    /// Difference between physical and bus addresses.
    #[must_use]
    pub const fn with_dma_offset(mut self, offset: u64) -> Self {
        self.dma_offset = offset;
        self
    }

    #[must_use]
    pub const fn with_max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the platform keeps caches coherent for this device's DMA.
    #[must_use]
    pub const fn is_coherent(&self) -> bool {
        self.coherent
    }

    #[must_use]
    pub const fn dma_mask(&self) -> u64 {
        self.dma_mask
    }

    #[must_use]
    pub const fn coherent_dma_mask(&self) -> u64 {
        self.coherent_dma_mask
    }

    #[must_use]
    pub const fn max_segment_size(&self) -> u64 {
        self.max_segment_size
    }

    /// Highest bus address coherent allocations may use.
    #[must_use]
    pub const fn coherent_limit_mask(&self) -> u64 {
        min_not_zero(self.coherent_dma_mask, self.bus_dma_limit)
    }

    #[inline]
    #[must_use]
    pub const fn phys_to_dma(&self, pa: PhysicalAddress) -> DmaAddress {
        DmaAddress::new(pa.as_u64().wrapping_sub(self.dma_offset))
    }

    #[inline]
    #[must_use]
    pub const fn dma_to_phys(&self, dma: DmaAddress) -> PhysicalAddress {
        PhysicalAddress::new(dma.as_u64().wrapping_add(self.dma_offset))
    }

    /// Whether `[dma, dma + size)` lies below the streaming mask and bus limit.
    #[must_use]
    pub const fn can_reach(&self, dma: DmaAddress, size: u64) -> bool {
        let limit = min_not_zero(self.dma_mask, self.bus_dma_limit);
        if size == 0 {
            return dma.as_u64() <= limit;
        }
        match dma.as_u64().checked_add(size - 1) {
            Some(end) => end <= limit,
            None => false,
        }
    }
}
