mod common;

use common::{CacheOp, SimConfig, SimPlatform, subsystem};
use kernel_dma::{
    Device, DirectDma, Direction, DmaAddress, DmaAttrs, DmaError, DmaMapOps, PAGE_SIZE, PhysicalAddress,
    ScatterEntry, dma_bit_mask,
};

fn direct(cfg: SimConfig) -> DirectDma<SimPlatform> {
    let ops = DirectDma::new(subsystem(cfg));
    ops.subsystem().platform().take_cache_log();
    ops
}

fn platform(ops: &DirectDma<SimPlatform>) -> &SimPlatform {
    ops.subsystem().platform()
}

#[test]
fn to_device_is_cleaned_and_left_alone_afterwards() {
    let ops = direct(SimConfig::default());
    let p = platform(&ops);
    let dev = Device::new("tx");
    let frame = p.frame(10);
    let va = p.va_of(frame);

    let dma = ops
        .map_page(&dev, frame, 0x100, 0x200, Direction::ToDevice, DmaAttrs::new())
        .unwrap();
    assert_eq!(dma.as_u64(), frame.base().as_u64() + 0x100);
    assert_eq!(
        p.take_cache_log(),
        vec![CacheOp::Clean(va + 0x100, 0x200), CacheOp::OuterClean(frame.base() + 0x100, 0x200)]
    );

    ops.unmap_page(&dev, dma, 0x200, Direction::ToDevice, DmaAttrs::new());
    assert!(p.take_cache_log().is_empty());
}

#[test]
fn from_device_is_invalidated_both_ways() {
    let ops = direct(SimConfig::default());
    let p = platform(&ops);
    let dev = Device::new("rx");
    let frame = p.frame(11);
    let (va, pa) = (p.va_of(frame), frame.base());

    let dma = ops
        .map_page(&dev, frame, 0, PAGE_SIZE, Direction::FromDevice, DmaAttrs::new())
        .unwrap();
    assert_eq!(
        p.take_cache_log(),
        vec![CacheOp::Invalidate(va, PAGE_SIZE), CacheOp::OuterInvalidate(pa, PAGE_SIZE)]
    );

    ops.unmap_page(&dev, dma, PAGE_SIZE, Direction::FromDevice, DmaAttrs::new());
    assert_eq!(
        p.take_cache_log(),
        vec![CacheOp::OuterInvalidate(pa, PAGE_SIZE), CacheOp::Invalidate(va, PAGE_SIZE)]
    );
}

#[test]
fn bidirectional_cleans_then_invalidates() {
    let ops = direct(SimConfig::default());
    let p = platform(&ops);
    let dev = Device::new("nic");
    let frame = p.frame(12);
    let (va, pa) = (p.va_of(frame), frame.base());

    let dma = ops
        .map_page(&dev, frame, 0x40, 0x80, Direction::Bidirectional, DmaAttrs::new())
        .unwrap();
    ops.unmap_page(&dev, dma, 0x80, Direction::Bidirectional, DmaAttrs::new());
    assert_eq!(
        p.take_cache_log(),
        vec![
            CacheOp::Clean(va + 0x40, 0x80),
            CacheOp::OuterClean(pa + 0x40, 0x80),
            CacheOp::OuterInvalidate(pa + 0x40, 0x80),
            CacheOp::Invalidate(va + 0x40, 0x80),
        ]
    );
}

#[test]
fn linear_pages_are_maintained_in_one_call() {
    let ops = direct(SimConfig::default());
    let p = platform(&ops);
    let frame = p.frame(20);

    ops.map_page(&Device::new("dma"), frame, 0x800, 3 * PAGE_SIZE, Direction::ToDevice, DmaAttrs::new())
        .unwrap();
    assert_eq!(
        p.take_cache_log(),
        vec![
            CacheOp::Clean(p.va_of(frame) + 0x800, 3 * PAGE_SIZE),
            CacheOp::OuterClean(frame.base() + 0x800, 3 * PAGE_SIZE),
        ]
    );
}

#[test]
fn highmem_pages_are_maintained_through_temporary_mappings() {
    let ops = direct(SimConfig::default().with_high_pages(8));
    let p = platform(&ops);
    let dev = Device::new("cam");
    let last_low = p.frame(767);
    let before = p.atomic_maps_total();

    // Straddles the end of the linear map.
    ops.map_page(&dev, last_low, 0xC00, 0x1400, Direction::ToDevice, DmaAttrs::new())
        .unwrap();
    let log = p.take_cache_log();
    assert_eq!(log.len(), 3);
    assert_eq!(log[0], CacheOp::Clean(p.va_of(last_low) + 0xC00, 0x400));
    assert!(matches!(log[1], CacheOp::Clean(_, 0x1000)));
    assert_eq!(log[2], CacheOp::OuterClean(last_low.base() + 0xC00, 0x1400));
    assert_eq!(p.atomic_maps_total(), before + 1);
    assert_eq!(p.outstanding_atomic_maps(), 0);

    let high = p.first_high_frame();
    ops.map_page(&dev, high, 0, 2 * PAGE_SIZE, Direction::FromDevice, DmaAttrs::new())
        .unwrap();
    let log = p.take_cache_log();
    assert_eq!(
        log.iter()
            .filter(|op| matches!(op, CacheOp::Invalidate(_, 0x1000)))
            .count(),
        2
    );
    assert_eq!(p.atomic_maps_total(), before + 3);
    assert_eq!(p.outstanding_atomic_maps(), 0);
}

#[test]
fn coherent_devices_and_skip_sync_need_no_maintenance() {
    let ops = direct(SimConfig::default());
    let p = platform(&ops);
    let frame = p.frame(30);

    let coherent = Device::new("pcie").with_coherent(true);
    let dma = ops
        .map_page(&coherent, frame, 0, PAGE_SIZE, Direction::Bidirectional, DmaAttrs::new())
        .unwrap();
    ops.sync_single_for_cpu(&coherent, dma, PAGE_SIZE, Direction::Bidirectional);
    ops.sync_single_for_device(&coherent, dma, PAGE_SIZE, Direction::Bidirectional);
    ops.unmap_page(&coherent, dma, PAGE_SIZE, Direction::Bidirectional, DmaAttrs::new());

    let dev = Device::new("dsp");
    let skip = DmaAttrs::new().with_skip_cpu_sync(true);
    let dma = ops
        .map_page(&dev, frame, 0, PAGE_SIZE, Direction::FromDevice, skip)
        .unwrap();
    ops.unmap_page(&dev, dma, PAGE_SIZE, Direction::FromDevice, skip);

    assert!(p.take_cache_log().is_empty());
}

#[test]
fn explicit_syncs_transfer_ownership() {
    let ops = direct(SimConfig::default());
    let p = platform(&ops);
    let dev = Device::new("audio");
    let frame = p.frame(31);
    let (va, pa) = (p.va_of(frame), frame.base());

    let dma = ops
        .map_single(&dev, pa + 0x10, 0x20, Direction::Bidirectional, DmaAttrs::new())
        .unwrap();
    p.take_cache_log();

    ops.sync_single_for_cpu(&dev, dma, 0x20, Direction::Bidirectional);
    ops.sync_single_for_device(&dev, dma, 0x20, Direction::Bidirectional);
    assert_eq!(
        p.take_cache_log(),
        vec![
            CacheOp::OuterInvalidate(pa + 0x10, 0x20),
            CacheOp::Invalidate(va + 0x10, 0x20),
            CacheOp::Clean(va + 0x10, 0x20),
            CacheOp::OuterClean(pa + 0x10, 0x20),
        ]
    );
    ops.unmap_single(&dev, dma, 0x20, Direction::Bidirectional, DmaAttrs::new());
}

#[test]
fn known_clean_pages_skip_the_inner_clean() {
    let ops = direct(SimConfig::default().with_dcache_tracking());
    let p = platform(&ops);
    let dev = Device::new("blk");
    let frame = p.frame(40);
    let (va, pa) = (p.va_of(frame), frame.base());

    // A completed read leaves the page clean.
    let dma = ops
        .map_page(&dev, frame, 0, PAGE_SIZE, Direction::FromDevice, DmaAttrs::new())
        .unwrap();
    ops.unmap_page(&dev, dma, PAGE_SIZE, Direction::FromDevice, DmaAttrs::new());
    p.take_cache_log();

    ops.map_page(&dev, frame, 0, PAGE_SIZE, Direction::ToDevice, DmaAttrs::new())
        .unwrap();
    assert_eq!(p.take_cache_log(), vec![CacheOp::OuterClean(pa, PAGE_SIZE)]);

    // Partial ranges are never skipped.
    ops.map_page(&dev, frame, 0, 0x100, Direction::ToDevice, DmaAttrs::new())
        .unwrap();
    assert_eq!(
        p.take_cache_log(),
        vec![CacheOp::Clean(va, 0x100), CacheOp::OuterClean(pa, 0x100)]
    );

    // Invalidation is never skipped.
    ops.map_page(&dev, frame, 0, PAGE_SIZE, Direction::FromDevice, DmaAttrs::new())
        .unwrap();
    assert_eq!(
        p.take_cache_log(),
        vec![CacheOp::Invalidate(va, PAGE_SIZE), CacheOp::OuterInvalidate(pa, PAGE_SIZE)]
    );

    p.dirty(frame);
    ops.map_page(&dev, frame, 0, PAGE_SIZE, Direction::ToDevice, DmaAttrs::new())
        .unwrap();
    assert_eq!(
        p.take_cache_log(),
        vec![CacheOp::Clean(va, PAGE_SIZE), CacheOp::OuterClean(pa, PAGE_SIZE)]
    );
}

#[test]
fn without_tracking_pages_are_always_cleaned() {
    let ops = direct(SimConfig::default());
    let p = platform(&ops);
    let dev = Device::new("blk");
    let frame = p.frame(41);

    let dma = ops
        .map_page(&dev, frame, 0, PAGE_SIZE, Direction::FromDevice, DmaAttrs::new())
        .unwrap();
    ops.unmap_page(&dev, dma, PAGE_SIZE, Direction::FromDevice, DmaAttrs::new());
    p.take_cache_log();

    ops.map_page(&dev, frame, 0, PAGE_SIZE, Direction::ToDevice, DmaAttrs::new())
        .unwrap();
    assert_eq!(p.take_cache_log().len(), 2);
}

#[test]
fn unreachable_memory_is_refused_before_maintenance() {
    let ops = direct(SimConfig::default());
    let p = platform(&ops);
    let dev = Device::new("legacy").with_dma_mask(dma_bit_mask(24));
    let frame = p.frame(50);

    assert_eq!(
        ops.map_page(&dev, frame, 0, PAGE_SIZE, Direction::ToDevice, DmaAttrs::new()),
        Err(DmaError::AddressUnreachable(frame.base()))
    );
    assert!(p.take_cache_log().is_empty());

    let mmio = PhysicalAddress::new(0x1_2000_0000);
    assert_eq!(
        ops.map_resource(&Device::new("dma"), mmio, 0x100, Direction::ToDevice, DmaAttrs::new()),
        Err(DmaError::AddressUnreachable(mmio))
    );
}

#[test]
fn bus_offset_is_applied_and_undone() {
    let ops = direct(SimConfig::default());
    let p = platform(&ops);
    let dev = Device::new("soc")
        .with_dma_offset(0x8000_0000)
        .with_dma_mask(dma_bit_mask(28));
    let frame = p.frame(60);

    let dma = ops
        .map_page(&dev, frame, 0, PAGE_SIZE, Direction::FromDevice, DmaAttrs::new())
        .unwrap();
    assert_eq!(dma, DmaAddress::new(60 * PAGE_SIZE));
    p.take_cache_log();

    ops.unmap_page(&dev, dma, PAGE_SIZE, Direction::FromDevice, DmaAttrs::new());
    assert_eq!(
        p.take_cache_log(),
        vec![
            CacheOp::OuterInvalidate(frame.base(), PAGE_SIZE),
            CacheOp::Invalidate(p.va_of(frame), PAGE_SIZE),
        ]
    );

    let regs = PhysicalAddress::new(0x8000_0000 + 0x10_0040);
    let bus = ops
        .map_resource(&dev, regs, 0x20, Direction::Bidirectional, DmaAttrs::new())
        .unwrap();
    assert_eq!(bus, DmaAddress::new(0x10_0040));
    ops.unmap_resource(&dev, bus, 0x20, Direction::Bidirectional, DmaAttrs::new());
    assert!(p.take_cache_log().is_empty());
}

#[test]
fn direct_scatter_list_maps_every_entry() {
    let ops = direct(SimConfig::default());
    let p = platform(&ops);
    let dev = Device::new("sata");
    let mut sg = [
        ScatterEntry::new(p.frame(70), 0, PAGE_SIZE),
        ScatterEntry::new(p.frame(90), 0x200, 0x400),
        ScatterEntry::new(p.frame(71), 0, 0x10),
    ];

    let n = ops
        .map_sg(&dev, &mut sg, Direction::ToDevice, DmaAttrs::new())
        .unwrap();
    assert_eq!(n, 3);
    for s in &sg {
        assert_eq!(s.dma_address.as_u64(), s.phys().as_u64());
        assert_eq!(s.dma_length, s.length);
    }
    assert_eq!(p.take_cache_log().len(), 6);

    ops.sync_sg_for_cpu(&dev, &sg, Direction::FromDevice);
    assert_eq!(p.take_cache_log().len(), 6);
    ops.sync_sg_for_device(&dev, &sg, Direction::ToDevice);
    assert_eq!(p.take_cache_log().len(), 6);

    ops.unmap_sg(&dev, &sg, Direction::ToDevice, DmaAttrs::new());
    assert!(p.take_cache_log().is_empty());
}

#[test]
fn direct_scatter_list_failure_unwinds() {
    let ops = direct(SimConfig::default());
    let p = platform(&ops);
    // Reaches only the first 256 pages of RAM.
    let dev = Device::new("narrow").with_dma_mask(common::RAM_BASE + 256 * PAGE_SIZE - 1);
    let mut sg = [
        ScatterEntry::new(p.frame(1), 0, PAGE_SIZE),
        ScatterEntry::new(p.frame(2), 0, PAGE_SIZE),
        ScatterEntry::new(p.frame(300), 0, PAGE_SIZE),
    ];

    let err = ops
        .map_sg(&dev, &mut sg, Direction::Bidirectional, DmaAttrs::new())
        .unwrap_err();
    assert_eq!(err, DmaError::AddressUnreachable(p.frame(300).base()));
    assert!(sg.iter().all(|s| !s.is_mapped()));

    // Two cleans on the way in, two invalidates on the way out.
    let log = p.take_cache_log();
    assert_eq!(log.len(), 8);
    assert!(matches!(log[4], CacheOp::OuterInvalidate(pa, PAGE_SIZE) if pa == p.frame(1).base()));
    assert!(matches!(log[6], CacheOp::OuterInvalidate(pa, PAGE_SIZE) if pa == p.frame(2).base()));
}

#[test]
fn coherent_scatter_list_syncs_are_free() {
    let ops = direct(SimConfig::default());
    let p = platform(&ops);
    let dev = Device::new("pcie").with_coherent(true);
    let mut sg = [ScatterEntry::new(p.frame(5), 0, PAGE_SIZE)];

    ops.map_sg(&dev, &mut sg, Direction::Bidirectional, DmaAttrs::new())
        .unwrap();
    ops.sync_sg_for_cpu(&dev, &sg, Direction::Bidirectional);
    ops.sync_sg_for_device(&dev, &sg, Direction::Bidirectional);
    ops.unmap_sg(&dev, &sg, Direction::Bidirectional, DmaAttrs::new());
    assert!(p.take_cache_log().is_empty());
}
