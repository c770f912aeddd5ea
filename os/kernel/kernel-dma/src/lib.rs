//! # Kernel DMA Buffer Allocation and Device Address Management
//!
//! This crate produces memory that bus-mastering devices can access, tracks
//! whether the processor or the device owns a streaming buffer, and manages
//! the device-visible address space of translation units (IOMMUs).
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          Operation tables (DmaMapOps)               │
//! │    • DirectDma: bus address = phys - offset         │
//! │    • IommuDma: IOVA space + translation domain      │
//! └──────────┬─────────────────────────────┬────────────┘
//!            │                             │
//! ┌──────────▼──────────────┐  ┌───────────▼────────────┐
//! │  DmaSubsystem           │  │  IommuMapping          │
//! │  • Backend selection    │  │  • IovaSpace (bitmaps) │
//! │  • Buffer registry      │  │  • Scatter-list runs   │
//! │  • Atomic pool          │  │  • Domain programming  │
//! └──────────┬──────────────┘  └────────────────────────┘
//!            │
//! ┌──────────▼──────────────────────────────────────────┐
//! │     Platform (DmaPlatform): caches, page allocator, │
//! │     contiguous reservation, remapping               │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Coherent allocations
//!
//! [`Backend::select`] picks one of four allocators from the request's
//! blocking permission, the device's coherency and the availability of a
//! contiguous reservation. The buffer is recorded in the [`BufferRegistry`]
//! under its processor address, or under its first page when
//! [`DmaAttrs::skip_cpu_mapping`] was requested, and freed by the backend
//! that allocated it.
//!
//! ## Streaming mappings
//!
//! `map_*` hands caller-owned memory to the device and `unmap_*` returns it;
//! [`coherency`] performs the cache maintenance each transition needs on
//! non-coherent platforms.
//!
//! ## Locking
//!
//! The registry, the atomic pool and each IOVA space are guarded by their own
//! [`IrqSpinLock`](kernel_sync::IrqSpinLock), so all of them are usable with
//! interrupts disabled. No lock is held across calls into the platform's page
//! allocator, reservation or translation domain.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kernel_dma::{DirectDma, DmaConfig, DmaMapOps, DmaSubsystem, Device, DmaAttrs, GfpFlags};
//! use std::sync::Arc;
//!
//! let dma = Arc::new(DmaSubsystem::new(platform, DmaConfig::new()));
//! let ops = DirectDma::new(Arc::clone(&dma));
//! let dev = Device::new("nic");
//!
//! let buf = ops.alloc(&dev, 8192, GfpFlags::KERNEL, DmaAttrs::new())?;
//! // program buf.dma_addr into the device, touch buf.cpu_addr from the CPU ...
//! ops.free(&dev, buf.size, buf.handle, buf.dma_addr, DmaAttrs::new())?;
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod addresses;
pub mod attrs;
pub mod backend;
pub mod bitmap;
pub mod buffer;
pub mod coherency;
pub mod config;
mod device;
mod direct;
mod error;
mod iommu;
pub mod iova;
mod ops;
pub mod platform;
mod registry;
pub mod scatterlist;
mod subsystem;

pub use addresses::{DmaAddress, PAGE_SIZE, PageFrame, PhysicalAddress, VirtualAddress};
pub use attrs::{Direction, DmaAttrs, GfpFlags, IommuProt, PageProtection};
pub use backend::{AtomicPool, Backend};
pub use buffer::{BufferKey, BufferRecord, Coherency, CpuMapping, DmaAllocation, Extent};
pub use config::DmaConfig;
pub use device::{Device, dma_bit_mask, min_not_zero};
pub use direct::DirectDma;
pub use error::{DmaError, IommuError};
pub use iommu::{IommuDma, IommuMapping};
pub use iova::IovaSpace;
pub use ops::DmaMapOps;
pub use platform::{
    CacheMaintenance, ContiguousReservation, DcacheTracking, DmaPlatform, IommuDomain, PageAllocator,
    PhysMapper, Remapper,
};
pub use registry::BufferRegistry;
pub use scatterlist::ScatterEntry;
pub use subsystem::DmaSubsystem;
