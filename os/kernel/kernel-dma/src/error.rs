use crate::addresses::PhysicalAddress;
use crate::buffer::BufferKey;

/// Errors reported by a translation-unit domain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IommuError {
    #[error("out of page-table memory")]
    OutOfMemory,
    #[error("address range is already mapped")]
    AlreadyMapped,
    #[error("operation not supported by the domain")]
    Unsupported,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DmaError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("no free I/O virtual address space")]
    NoIovaSpace,
    #[error("atomic pool is not available")]
    AtomicPoolUnavailable,
    #[error("buffer {0:?} is not registered")]
    UnregisteredBuffer(BufferKey),
    #[error("buffer {0:?} is already registered")]
    DuplicateBuffer(BufferKey),
    #[error("invalid size")]
    InvalidSize,
    #[error("request exceeds the device's coherent DMA mask")]
    ExceedsDeviceMask,
    #[error("{0} is not reachable by the device")]
    AddressUnreachable(PhysicalAddress),
    #[error("I/O virtual address space exceeds 32-bit device addresses")]
    AddressSpaceTooLarge,
    #[error("I/O virtual address space is empty")]
    EmptyAddressSpace,
    #[error("translation unit: {0}")]
    Iommu(#[from] IommuError),
}
