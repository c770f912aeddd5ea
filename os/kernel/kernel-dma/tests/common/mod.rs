//! A simulated platform backed by host memory.
//!
//! Frames are laid out as
//!
//! ```text
//! [ low pages | CMA | high pages ]     (default)
//! [ low pages | high pages | CMA ]     (cma_in_highmem)
//! ```
//!
//! starting at physical address `RAM_BASE`. Everything before the first
//! high-memory frame is linearly mapped at the host allocation; high memory is
//! only reachable through `map_atomic`. Fresh RAM is filled with `POISON` so
//! tests can observe zeroing.

#![allow(dead_code)]

use kernel_dma::{
    CacheMaintenance, ContiguousReservation, DcacheTracking, Device, DmaAddress, DmaConfig, DmaPlatform,
    DmaSubsystem, GfpFlags, IommuDomain, IommuError, IommuProt, PAGE_SIZE, PageAllocator, PageFrame,
    PageProtection, PhysMapper, PhysicalAddress, Remapper, VirtualAddress,
};
use kernel_sync::NoInterrupts;
use std::alloc::{Layout, alloc, dealloc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const RAM_BASE: u64 = 0x8000_0000;
pub const REMAP_BASE: u64 = 0xFFFF_C000_0000_0000;
pub const POISON: u8 = 0xA5;

const BASE_PFN: u64 = RAM_BASE / PAGE_SIZE;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CacheOp {
    Clean(VirtualAddress, u64),
    Invalidate(VirtualAddress, u64),
    Flush(VirtualAddress, u64),
    OuterClean(PhysicalAddress, u64),
    OuterInvalidate(PhysicalAddress, u64),
    OuterFlush(PhysicalAddress, u64),
}

#[derive(Debug, Copy, Clone)]
pub struct SimConfig {
    pub low_pages: usize,
    pub cma_pages: usize,
    pub high_pages: usize,
    pub cma_in_highmem: bool,
    pub dcache_tracking: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            low_pages: 512,
            cma_pages: 256,
            high_pages: 0,
            cma_in_highmem: false,
            dcache_tracking: false,
        }
    }
}

impl SimConfig {
    pub fn without_cma(mut self) -> Self {
        self.cma_pages = 0;
        self
    }

    pub fn with_high_pages(mut self, pages: usize) -> Self {
        self.high_pages = pages;
        self
    }

    pub fn with_cma_in_highmem(mut self) -> Self {
        self.cma_in_highmem = true;
        self
    }

    pub fn with_low_pages(mut self, pages: usize) -> Self {
        self.low_pages = pages;
        self
    }

    pub fn with_dcache_tracking(mut self) -> Self {
        self.dcache_tracking = true;
        self
    }
}

pub struct SimPlatform {
    mem: usize,
    layout: Layout,
    total: usize,
    highmem_start: usize,
    low: Range<usize>,
    high: Range<usize>,
    cma: Option<Range<usize>>,
    used: Mutex<Vec<bool>>,
    max_order: AtomicU32,
    single_page_budget: AtomicUsize,
    cache_log: Mutex<Vec<CacheOp>>,
    remaps: Mutex<HashMap<u64, Vec<PageFrame>>>,
    next_remap: AtomicU64,
    fail_remap: AtomicBool,
    protections: Mutex<HashMap<u64, PageProtection>>,
    clean: Mutex<HashSet<u64>>,
    dcache_tracking: bool,
    atomic_maps: AtomicUsize,
    atomic_maps_total: AtomicUsize,
}

impl SimPlatform {
    pub fn new(cfg: SimConfig) -> Self {
        let total = cfg.low_pages + cfg.cma_pages + cfg.high_pages;
        let (cma, high, highmem_start) = if cfg.cma_in_highmem {
            let high_end = cfg.low_pages + cfg.high_pages;
            (high_end..total, cfg.low_pages..high_end, cfg.low_pages)
        } else {
            let cma_end = cfg.low_pages + cfg.cma_pages;
            (cfg.low_pages..cma_end, cma_end..total, cma_end)
        };

        let layout = Layout::from_size_align(total.max(1) * PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
        let mem = unsafe { alloc(layout) };
        assert!(!mem.is_null());
        unsafe { std::ptr::write_bytes(mem, POISON, layout.size()) };

        Self {
            mem: mem as usize,
            layout,
            total,
            highmem_start,
            low: 0..cfg.low_pages,
            high,
            cma: (cfg.cma_pages > 0).then_some(cma),
            used: Mutex::new(vec![false; total]),
            max_order: AtomicU32::new(u32::MAX),
            single_page_budget: AtomicUsize::new(usize::MAX),
            cache_log: Mutex::new(Vec::new()),
            remaps: Mutex::new(HashMap::new()),
            next_remap: AtomicU64::new(REMAP_BASE),
            fail_remap: AtomicBool::new(false),
            protections: Mutex::new(HashMap::new()),
            clean: Mutex::new(HashSet::new()),
            dcache_tracking: cfg.dcache_tracking,
            atomic_maps: AtomicUsize::new(0),
            atomic_maps_total: AtomicUsize::new(0),
        }
    }

    /// The frame at page index `idx` of simulated RAM.
    pub fn frame(&self, idx: usize) -> PageFrame {
        assert!(idx < self.total);
        PageFrame::from_pfn(BASE_PFN + idx as u64)
    }

    pub fn first_high_frame(&self) -> PageFrame {
        self.frame(self.high.start)
    }

    fn index(&self, frame: PageFrame) -> usize {
        let idx = usize::try_from(frame.pfn() - BASE_PFN).unwrap();
        assert!(idx < self.total, "{frame:?} outside simulated RAM");
        idx
    }

    fn host(&self, pa: PhysicalAddress) -> *mut u8 {
        (self.mem + usize::try_from(pa.as_u64() - RAM_BASE).unwrap()) as *mut u8
    }

    pub fn read_phys(&self, pa: PhysicalAddress, len: usize) -> Vec<u8> {
        let ptr = self.host(pa);
        unsafe { std::slice::from_raw_parts(ptr, len).to_vec() }
    }

    pub fn write_phys(&self, pa: PhysicalAddress, bytes: &[u8]) {
        let ptr = self.host(pa);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
    }

    pub fn is_zeroed(&self, first: PageFrame, len: u64) -> bool {
        self.read_phys(first.base(), len as usize).iter().all(|b| *b == 0)
    }

    /// Frames in use from the page allocator.
    pub fn used_pages(&self) -> usize {
        let used = self.used.lock().unwrap();
        self.low.clone().chain(self.high.clone()).filter(|&i| used[i]).count()
    }

    pub fn cma_used(&self) -> usize {
        let used = self.used.lock().unwrap();
        self.cma.clone().map_or(0, |r| r.filter(|&i| used[i]).count())
    }

    pub fn is_used(&self, frame: PageFrame) -> bool {
        self.used.lock().unwrap()[self.index(frame)]
    }

    /// Caps the order the page allocator can satisfy.
    pub fn set_max_order(&self, order: u32) {
        self.max_order.store(order, Ordering::SeqCst);
    }

    /// Number of further order-0 allocations that succeed.
    pub fn set_single_page_budget(&self, pages: usize) {
        self.single_page_budget.store(pages, Ordering::SeqCst);
    }

    pub fn set_fail_remap(&self, fail: bool) {
        self.fail_remap.store(fail, Ordering::SeqCst);
    }

    pub fn take_cache_log(&self) -> Vec<CacheOp> {
        std::mem::take(&mut *self.cache_log.lock().unwrap())
    }

    pub fn active_remaps(&self) -> usize {
        self.remaps.lock().unwrap().len()
    }

    pub fn is_remapped(&self, va: VirtualAddress) -> bool {
        self.remaps.lock().unwrap().contains_key(&va.as_u64())
    }

    pub fn remapped_frames(&self, va: VirtualAddress) -> Option<Vec<PageFrame>> {
        self.remaps.lock().unwrap().get(&va.as_u64()).cloned()
    }

    pub fn protection(&self, frame: PageFrame) -> PageProtection {
        self.protections
            .lock()
            .unwrap()
            .get(&frame.pfn())
            .copied()
            .unwrap_or(PageProtection::Kernel)
    }

    /// Simulates a processor write dirtying `frame`.
    pub fn dirty(&self, frame: PageFrame) {
        self.clean.lock().unwrap().remove(&frame.pfn());
    }

    pub fn outstanding_atomic_maps(&self) -> usize {
        self.atomic_maps.load(Ordering::SeqCst)
    }

    pub fn atomic_maps_total(&self) -> usize {
        self.atomic_maps_total.load(Ordering::SeqCst)
    }

    /// Linear address of a low-memory frame.
    pub fn va_of(&self, frame: PageFrame) -> VirtualAddress {
        self.linear_address(frame.base()).expect("frame is not in low memory")
    }

    fn take_run(&self, region: Range<usize>, count: usize, align: usize) -> Option<usize> {
        let mut used = self.used.lock().unwrap();
        let mut start = region.start.next_multiple_of(align);
        while start + count <= region.end {
            if used[start..start + count].iter().all(|u| !u) {
                used[start..start + count].iter_mut().for_each(|u| *u = true);
                return Some(start);
            }
            start += align;
        }
        None
    }

    fn give_back(&self, start: usize, count: usize) {
        let mut used = self.used.lock().unwrap();
        for u in &mut used[start..start + count] {
            assert!(*u, "double free of simulated page {start}");
            *u = false;
        }
    }

    fn log(&self, op: CacheOp) {
        self.cache_log.lock().unwrap().push(op);
    }
}

impl Drop for SimPlatform {
    fn drop(&mut self) {
        unsafe { dealloc(self.mem as *mut u8, self.layout) };
    }
}

impl CacheMaintenance for SimPlatform {
    fn clean(&self, va: VirtualAddress, size: u64) {
        self.log(CacheOp::Clean(va, size));
    }

    fn invalidate(&self, va: VirtualAddress, size: u64) {
        self.log(CacheOp::Invalidate(va, size));
    }

    fn clean_and_invalidate(&self, va: VirtualAddress, size: u64) {
        self.log(CacheOp::Flush(va, size));
    }

    fn outer_clean(&self, pa: PhysicalAddress, size: u64) {
        self.log(CacheOp::OuterClean(pa, size));
    }

    fn outer_invalidate(&self, pa: PhysicalAddress, size: u64) {
        self.log(CacheOp::OuterInvalidate(pa, size));
    }

    fn outer_flush(&self, pa: PhysicalAddress, size: u64) {
        self.log(CacheOp::OuterFlush(pa, size));
    }
}

// Safety: every address handed out points into the host allocation, which
// lives as long as the platform.
unsafe impl PhysMapper for SimPlatform {
    fn linear_address(&self, pa: PhysicalAddress) -> Option<VirtualAddress> {
        let offset = pa.as_u64().checked_sub(RAM_BASE)?;
        let idx = usize::try_from(offset / PAGE_SIZE).ok()?;
        if idx >= self.highmem_start {
            return None;
        }
        Some(VirtualAddress::new(self.mem as u64 + offset))
    }

    fn linear_to_phys(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let offset = va.as_u64().checked_sub(self.mem as u64)?;
        ((offset / PAGE_SIZE) < self.highmem_start as u64).then(|| PhysicalAddress::new(RAM_BASE + offset))
    }

    fn map_atomic(&self, frame: PageFrame) -> VirtualAddress {
        self.atomic_maps.fetch_add(1, Ordering::SeqCst);
        self.atomic_maps_total.fetch_add(1, Ordering::SeqCst);
        VirtualAddress::new(self.host(frame.base()) as u64)
    }

    fn unmap_atomic(&self, _va: VirtualAddress) {
        self.atomic_maps.fetch_sub(1, Ordering::SeqCst);
    }
}

impl PageAllocator for SimPlatform {
    fn alloc_pages(&self, order: u32, gfp: GfpFlags) -> Option<PageFrame> {
        if order > self.max_order.load(Ordering::SeqCst) {
            return None;
        }
        if order == 0 {
            let budget = self.single_page_budget.load(Ordering::SeqCst);
            if budget == 0 {
                return None;
            }
            if budget != usize::MAX {
                self.single_page_budget.store(budget - 1, Ordering::SeqCst);
            }
        }
        let count = 1usize << order;
        let regions = if gfp.highmem() {
            vec![self.high.clone(), self.low.clone()]
        } else {
            vec![self.low.clone()]
        };
        regions
            .into_iter()
            .find_map(|r| self.take_run(r, count, count))
            .map(|idx| self.frame(idx))
    }

    fn free_pages(&self, frame: PageFrame, order: u32) {
        let idx = self.index(frame);
        assert!(
            self.low.contains(&idx) || self.high.contains(&idx),
            "{frame:?} was not handed out by the page allocator"
        );
        self.give_back(idx, 1 << order);
    }
}

impl ContiguousReservation for SimPlatform {
    fn has_area(&self, _dev: Option<&Device>) -> bool {
        self.cma.is_some()
    }

    fn reserve(&self, count: usize, order: u32, _no_warn: bool) -> Option<PageFrame> {
        let region = self.cma.clone()?;
        let align = 1usize << order.min(8);
        self.take_run(region, count, align).map(|idx| self.frame(idx))
    }

    fn release(&self, frame: PageFrame, count: usize) -> bool {
        let Some(region) = self.cma.clone() else {
            return false;
        };
        let idx = self.index(frame);
        if !region.contains(&idx) || idx + count > region.end {
            return false;
        }
        self.give_back(idx, count);
        true
    }
}

impl Remapper for SimPlatform {
    fn remap(&self, frames: &[PageFrame], _prot: PageProtection) -> Option<VirtualAddress> {
        if self.fail_remap.load(Ordering::SeqCst) {
            return None;
        }
        // leave a guard page between mappings
        let span = (frames.len() as u64 + 1) * PAGE_SIZE;
        let va = self.next_remap.fetch_add(span, Ordering::SeqCst);
        self.remaps.lock().unwrap().insert(va, frames.to_vec());
        Some(VirtualAddress::new(va))
    }

    fn unremap(&self, va: VirtualAddress, size: u64) {
        let frames = self
            .remaps
            .lock()
            .unwrap()
            .remove(&va.as_u64())
            .expect("unremap of unknown mapping");
        assert_eq!(frames.len() as u64 * PAGE_SIZE, size, "unremap size mismatch");
    }

    fn set_linear_protection(&self, frame: PageFrame, count: usize, prot: PageProtection) {
        let mut protections = self.protections.lock().unwrap();
        for i in 0..count {
            let pfn = frame.offset_by(i).pfn();
            if prot == PageProtection::Kernel {
                protections.remove(&pfn);
            } else {
                protections.insert(pfn, prot);
            }
        }
    }
}

impl DcacheTracking for SimPlatform {
    fn mark_dcache_clean(&self, frame: PageFrame) {
        if self.dcache_tracking {
            self.clean.lock().unwrap().insert(frame.pfn());
        }
    }

    fn is_dcache_clean(&self, frame: PageFrame) -> bool {
        self.dcache_tracking && self.clean.lock().unwrap().contains(&frame.pfn())
    }
}

impl DmaPlatform for SimPlatform {
    type Irq = NoInterrupts;
}

pub fn subsystem(cfg: SimConfig) -> Arc<DmaSubsystem<SimPlatform>> {
    subsystem_with(cfg, DmaConfig::new())
}

pub fn subsystem_with(cfg: SimConfig, config: DmaConfig) -> Arc<DmaSubsystem<SimPlatform>> {
    Arc::new(DmaSubsystem::new(SimPlatform::new(cfg), config))
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MapCall {
    pub iova: DmaAddress,
    pub pa: PhysicalAddress,
    pub len: u64,
    pub prot: IommuProt,
}

/// A translation domain that records what it is asked to do.
#[derive(Default)]
pub struct SimDomain {
    mappings: Mutex<BTreeMap<u64, (PhysicalAddress, u64, IommuProt)>>,
    calls: Mutex<Vec<MapCall>>,
    fail_on_call: AtomicUsize,
}

impl SimDomain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the `n`-th map call from now fail (1-based); 0 disables.
    pub fn fail_on_call(&self, n: usize) {
        let base = self.calls.lock().unwrap().len();
        self.fail_on_call
            .store(if n == 0 { 0 } else { base + n }, Ordering::SeqCst);
    }

    pub fn map_calls(&self) -> Vec<MapCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
        self.fail_on_call.store(0, Ordering::SeqCst);
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.lock().unwrap().len()
    }

    pub fn mapped_bytes(&self) -> u64 {
        self.mappings.lock().unwrap().values().map(|(_, len, _)| len).sum()
    }

    pub fn prot_at(&self, iova: DmaAddress) -> Option<IommuProt> {
        let mappings = self.mappings.lock().unwrap();
        let (start, (_, len, prot)) = mappings.range(..=iova.as_u64()).next_back()?;
        (iova.as_u64() < start + len).then_some(*prot)
    }
}

impl IommuDomain for SimDomain {
    fn map(&self, iova: DmaAddress, pa: PhysicalAddress, size: u64, prot: IommuProt) -> Result<(), IommuError> {
        let n = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(MapCall { iova, pa, len: size, prot });
            calls.len()
        };
        if n == self.fail_on_call.load(Ordering::SeqCst) {
            return Err(IommuError::OutOfMemory);
        }
        let mut mappings = self.mappings.lock().unwrap();
        let start = iova.as_u64();
        let overlaps = mappings
            .iter()
            .any(|(s, (_, len, _))| start < s + len && *s < start + size);
        if overlaps {
            return Err(IommuError::AlreadyMapped);
        }
        mappings.insert(start, (pa, size, prot));
        Ok(())
    }

    fn unmap(&self, iova: DmaAddress, size: u64) -> u64 {
        let start = iova.as_u64();
        let mut mappings = self.mappings.lock().unwrap();
        let keys: Vec<u64> = mappings.range(start..start + size).map(|(k, _)| *k).collect();
        keys.iter()
            .filter_map(|k| mappings.remove(k))
            .map(|(_, len, _)| len)
            .sum()
    }

    fn iova_to_phys(&self, iova: DmaAddress) -> Option<PhysicalAddress> {
        let mappings = self.mappings.lock().unwrap();
        let (start, (pa, len, _)) = mappings.range(..=iova.as_u64()).next_back()?;
        let off = iova.as_u64() - start;
        (off < *len).then(|| *pa + off)
    }
}
