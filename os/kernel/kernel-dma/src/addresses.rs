//! # Address types
//!
//! Three address spaces meet in this crate and must never be confused:
//!
//! - [`PhysicalAddress`]: where the bytes live in RAM.
//! - [`VirtualAddress`]: where the processor sees them.
//! - [`DmaAddress`]: where the device sees them, either `phys - offset` on a
//!   direct bus or an I/O virtual address behind a translation unit.
//!
//! [`PageFrame`] names a 4 KiB physical page by its frame number and is the
//! granule every allocator in this crate hands out.

use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Log2 of the page granule.
pub const PAGE_SHIFT: u32 = 12;

/// The page granule (4 KiB).
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Mask selecting the in-page offset bits.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// Round `size` up to the next page boundary.
#[inline]
#[must_use]
pub const fn page_align(size: u64) -> u64 {
    (size + PAGE_OFFSET_MASK) & !PAGE_OFFSET_MASK
}

/// Round `size` up to the next page boundary, or `None` if that does not
/// fit in 64 bits.
///
/// ```
/// # use kernel_dma::addresses::checked_page_align;
/// assert_eq!(checked_page_align(1), Some(4096));
/// assert_eq!(checked_page_align(u64::MAX - 10), None);
/// ```
#[inline]
#[must_use]
pub const fn checked_page_align(size: u64) -> Option<u64> {
    match size.checked_add(PAGE_OFFSET_MASK) {
        Some(end) => Some(end & !PAGE_OFFSET_MASK),
        None => None,
    }
}

/// Number of pages needed to hold `size` bytes.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn pages_for(size: u64) -> usize {
    (page_align(size) >> PAGE_SHIFT) as usize
}

/// Smallest `order` such that `PAGE_SIZE << order >= size`.
///
/// ```
/// # use kernel_dma::addresses::get_order;
/// assert_eq!(get_order(1), 0);
/// assert_eq!(get_order(4096), 0);
/// assert_eq!(get_order(4097), 1);
/// assert_eq!(get_order(256 * 1024), 6);
/// ```
#[inline]
#[must_use]
pub const fn get_order(size: u64) -> u32 {
    if size <= PAGE_SIZE {
        return 0;
    }
    let pages = (size - 1) >> PAGE_SHIFT;
    u64::BITS - pages.leading_zeros()
}

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(v: u64) -> Self {
                Self(v)
            }

            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// Offset of this address within its page.
            #[inline]
            #[must_use]
            pub const fn page_offset(self) -> u64 {
                self.0 & PAGE_OFFSET_MASK
            }

            /// This address rounded down to its page boundary.
            #[inline]
            #[must_use]
            pub const fn page_base(self) -> Self {
                Self(self.0 & !PAGE_OFFSET_MASK)
            }

            #[inline]
            #[must_use]
            pub const fn is_page_aligned(self) -> bool {
                self.page_offset() == 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "(0x{:016X})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:016X}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(v: u64) -> Self {
                Self::new(v)
            }
        }

        impl Add<u64> for $name {
            type Output = Self;
            #[inline]
            fn add(self, rhs: u64) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<u64> for $name {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        impl Sub<$name> for $name {
            type Output = u64;
            #[inline]
            fn sub(self, rhs: $name) -> u64 {
                self.0 - rhs.0
            }
        }
    };
}

address_type!(
    /// Physical memory address.
    PhysicalAddress,
    "PA"
);

address_type!(
    /// Processor-side virtual address.
    VirtualAddress,
    "VA"
);

address_type!(
    /// Device-visible bus address (a physical bus address or an IOVA).
    DmaAddress,
    "DMA"
);

impl PhysicalAddress {
    /// The frame containing this address.
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PageFrame {
        PageFrame(self.0 >> PAGE_SHIFT)
    }

    /// Split into the containing frame and the in-page offset.
    #[inline]
    #[must_use]
    pub const fn split(self) -> (PageFrame, u64) {
        (self.frame(), self.page_offset())
    }
}

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    #[inline]
    #[must_use]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

/// A physical page, identified by its frame number.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageFrame(u64);

impl PageFrame {
    #[inline]
    #[must_use]
    pub const fn from_pfn(pfn: u64) -> Self {
        Self(pfn)
    }

    #[inline]
    #[must_use]
    pub const fn pfn(self) -> u64 {
        self.0
    }

    /// Physical address of the first byte of this frame.
    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0 << PAGE_SHIFT)
    }

    /// The frame `n` pages after this one.
    #[inline]
    #[must_use]
    pub const fn offset_by(self, n: usize) -> Self {
        Self(self.0 + n as u64)
    }
}

impl fmt::Debug for PageFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PFN(0x{:X})", self.0)
    }
}

impl From<PageFrame> for PhysicalAddress {
    fn from(value: PageFrame) -> Self {
        value.base()
    }
}
