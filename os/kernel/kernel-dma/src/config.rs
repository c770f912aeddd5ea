//! Tunables and their defaults.

use crate::addresses::PAGE_SIZE;
use log::{error, info};

/// Size of the pool that services non-blocking coherent allocations.
pub const DEFAULT_ATOMIC_POOL_SIZE: u64 = 256 * 1024;

/// Upper bound on the alignment order of IOVA allocations; larger requests
/// are aligned to `PAGE_SIZE << DEFAULT_IOMMU_ALIGNMENT_ORDER` only.
pub const DEFAULT_IOMMU_ALIGNMENT_ORDER: u32 = 8;

/// Largest single transfer a device accepts unless it says otherwise.
pub const DEFAULT_MAX_SEGMENT_SIZE: u64 = 64 * 1024;

/// IOVA spaces are limited to 32-bit device addresses.
pub const MAX_IOVA_SPACE_SIZE: u64 = 1 << 32;

/// Orders tried, highest first, when gathering pages for a translated buffer.
pub const IOMMU_ORDER_LADDER: [u32; 4] = [9, 8, 4, 0];

/// Runtime configuration of the DMA subsystem.
///
/// ```
/// # use kernel_dma::config::DmaConfig;
/// let cfg = DmaConfig::new()
///     .with_coherent_pool_param("1M")
///     .with_iommu_alignment_order(4);
/// assert_eq!(cfg.atomic_pool_size(), 1024 * 1024);
/// assert_eq!(cfg.iommu_alignment_order(), 4);
/// ```
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DmaConfig {
    atomic_pool_size: u64,
    iommu_alignment_order: u32,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaConfig {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            atomic_pool_size: DEFAULT_ATOMIC_POOL_SIZE,
            iommu_alignment_order: DEFAULT_IOMMU_ALIGNMENT_ORDER,
        }
    }

    /// Sets the atomic pool size; zero disables the pool.
    #[must_use]
    pub const fn with_atomic_pool_size(mut self, size: u64) -> Self {
        self.atomic_pool_size = size;
        self
    }

    #[must_use]
    pub const fn with_iommu_alignment_order(mut self, order: u32) -> Self {
        self.iommu_alignment_order = order;
        self
    }

    /// Applies a `coherent_pool=<size>` boot parameter value.
    ///
    /// Unparsable values keep the current size.
    #[must_use]
    pub fn with_coherent_pool_param(self, value: &str) -> Self {
        match parse_memsize(value) {
            Some(size) => {
                info!("DMA: coherent pool size set to {} KiB", size / 1024);
                self.with_atomic_pool_size(size)
            }
            None => {
                error!("DMA: ignoring malformed coherent_pool value {value:?}");
                self
            }
        }
    }

    #[must_use]
    pub const fn atomic_pool_size(&self) -> u64 {
        self.atomic_pool_size
    }

    /// The pool size rounded up to whole pages.
    #[must_use]
    pub const fn atomic_pool_pages(&self) -> u64 {
        self.atomic_pool_size.div_ceil(PAGE_SIZE)
    }

    #[must_use]
    pub const fn iommu_alignment_order(&self) -> u32 {
        self.iommu_alignment_order
    }
}

/// Parses a memory size such as `256K`, `0x100000` or `2M`.
///
/// Accepts a decimal or `0x`-prefixed hexadecimal integer followed by an
/// optional binary suffix (`K`, `M`, `G`, `T`, case-insensitive).
#[must_use]
pub fn parse_memsize(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, shift) = match s.as_bytes().last()? {
        b'k' | b'K' => (&s[..s.len() - 1], 10),
        b'm' | b'M' => (&s[..s.len() - 1], 20),
        b'g' | b'G' => (&s[..s.len() - 1], 30),
        b't' | b'T' => (&s[..s.len() - 1], 40),
        _ => (s, 0),
    };
    let value = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        u64::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<u64>().ok()?
    };
    value.checked_mul(1 << shift)
}
