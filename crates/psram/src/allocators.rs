//! Per-region allocators and the manager that picks between them.
//!
//! Every pseudo-SRAM region gets a [`RegionAllocator`]: the region is
//! mapped once, lazily, and an embedded block allocator serves requests
//! out of the mapping. DRAM-level regions share the process heap through
//! a single [`DramAllocator`]. [`AllocatorsManager`] walks the regions in
//! preference order, creates allocators on first use, and routes
//! `realloc`/`free` back to the allocator owning the pointer.

use std::collections::HashSet;

use umm_alloc::UmmAlloc;

use crate::{
    config::Config,
    properties::{MemoryLevel, Requirements},
    region::{MappedRegion, RegionManager},
};

/// A block allocator over one mapped region.
pub struct RegionAllocator {
    umm: UmmAlloc,
    region: MappedRegion,
}

impl RegionAllocator {
    /// Maps nothing itself; takes an already-mapped region and formats it.
    pub fn new(region: MappedRegion) -> Option<Self> {
        let umm = unsafe { UmmAlloc::init(region.as_ptr(), region.len()) }
            .inspect_err(|err| log::error!("unable to format region memory: {err}"))
            .ok()?;
        Some(Self { umm, region })
    }

    pub fn malloc(&mut self, size: usize) -> Option<*mut u8> {
        self.umm.malloc(size)
    }

    pub fn calloc(&mut self, num: usize, size: usize) -> Option<*mut u8> {
        self.umm.calloc(num, size)
    }

    pub fn realloc(&mut self, ptr: *mut u8, size: usize) -> Option<*mut u8> {
        self.umm.realloc(ptr, size)
    }

    pub fn free(&mut self, ptr: *mut u8) {
        self.umm.free(ptr);
    }

    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.region.contains(ptr)
    }
}

/// The process-heap allocator shared by all DRAM regions.
///
/// Outstanding allocations are tracked by address so that a pointer can be
/// attributed to this allocator, which the region allocators get for free
/// from their address ranges.
#[derive(Default)]
pub struct DramAllocator {
    owned: HashSet<usize>,
}

impl DramAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn malloc(&mut self, size: usize) -> Option<*mut u8> {
        if size == 0 {
            return None;
        }
        let ptr = unsafe { libc::malloc(size) };
        if ptr.is_null() {
            return None;
        }
        self.owned.insert(ptr.addr());
        Some(ptr.cast())
    }

    pub fn calloc(&mut self, num: usize, size: usize) -> Option<*mut u8> {
        if num == 0 || size == 0 {
            return None;
        }
        let ptr = unsafe { libc::calloc(num, size) };
        if ptr.is_null() {
            return None;
        }
        self.owned.insert(ptr.addr());
        Some(ptr.cast())
    }

    /// Resizes an allocation this allocator owns. On failure the original
    /// allocation stays valid.
    pub fn realloc(&mut self, ptr: *mut u8, size: usize) -> Option<*mut u8> {
        if size == 0 {
            self.free(ptr);
            return None;
        }
        let new_ptr = unsafe { libc::realloc(ptr.cast(), size) };
        if new_ptr.is_null() {
            return None;
        }
        self.owned.remove(&ptr.addr());
        self.owned.insert(new_ptr.addr());
        Some(new_ptr.cast())
    }

    pub fn free(&mut self, ptr: *mut u8) {
        if self.owned.remove(&ptr.addr()) {
            unsafe {
                libc::free(ptr.cast());
            }
        } else {
            log::error!("free of pointer {ptr:p} not owned by the DRAM allocator");
        }
    }

    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.owned.contains(&ptr.addr())
    }
}

/// A lazily-created per-region allocator slot.
enum Slot {
    /// No allocator yet; creation is retried on every use.
    Empty,
    Region(RegionAllocator),
    /// Delegates to the shared DRAM allocator.
    Dram,
}

/// Picks the allocator serving each request.
pub struct AllocatorsManager {
    region_manager: RegionManager,
    slots: Vec<Slot>,
    required_buffer_size: Vec<usize>,
    dram: DramAllocator,
}

enum Request {
    Malloc { size: usize },
    Calloc { num: usize, size: usize },
}

impl AllocatorsManager {
    /// Builds the manager over an enumerated region set, resolving each
    /// region's buffer size from the configuration.
    #[must_use]
    pub fn new(region_manager: RegionManager, config: &Config) -> Self {
        let count = region_manager.count();
        let mut required_buffer_size = Vec::with_capacity(count);
        for index in 0..count {
            let Some(region) = region_manager.get(index) else {
                required_buffer_size.push(0);
                continue;
            };
            let size = match config.size_for(region.level) {
                Some(size) if size > 0 && size <= region.size => size,
                Some(_) => {
                    log::warn!(
                        "buffer size for region #{index} ({}) in config is abnormal, \
                         using entire region size",
                        region.level
                    );
                    region.size
                }
                None => {
                    log::warn!(
                        "no configuration for region #{index} ({}), using entire region size",
                        region.level
                    );
                    region.size
                }
            };
            log::debug!("allocation size for region #{index} ({}) = {size}", region.level);
            required_buffer_size.push(size);
        }

        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, || Slot::Empty);
        let manager = Self {
            region_manager,
            slots,
            required_buffer_size,
            dram: DramAllocator::new(),
        };
        manager.log_regions_table();
        manager
    }

    fn log_regions_table(&self) {
        for index in 0..self.region_manager.count() {
            let Some(region) = self.region_manager.get(index) else {
                continue;
            };
            if region.level == MemoryLevel::Dram {
                log::info!("region #{index}: {} (regular RAM)", region.level);
            } else {
                log::info!(
                    "region #{index}: {} buffer_size={} latency_ns={} mask={}",
                    region.level,
                    self.required_buffer_size[index],
                    region.latency_ns,
                    region.mask
                );
            }
        }
    }

    /// Allocates from the first suitable region, in preference order.
    pub fn malloc(&mut self, requirements: &Requirements, size: usize) -> Option<*mut u8> {
        self.allocate(requirements, &Request::Malloc { size })
    }

    /// Zero-filled variant of [`malloc`](Self::malloc).
    pub fn calloc(
        &mut self,
        requirements: &Requirements,
        num: usize,
        size: usize,
    ) -> Option<*mut u8> {
        self.allocate(requirements, &Request::Calloc { num, size })
    }

    fn allocate(&mut self, requirements: &Requirements, request: &Request) -> Option<*mut u8> {
        log::info!(
            "searching for memory to satisfy requirements: latency={} ns, affinity={}",
            requirements.latency_ns,
            requirements.mask
        );
        for index in 0..self.region_manager.count() {
            let Some(region) = self.region_manager.get(index).copied() else {
                break;
            };
            if !region.satisfies(requirements) {
                log::debug!("region #{index} ({}) does not satisfy requirements", region.level);
                continue;
            }
            if !self.ensure_allocator(index, region.level) {
                log::warn!("unable to create allocator for region #{index} ({})", region.level);
                continue;
            }
            let ptr = match (&mut self.slots[index], request) {
                (Slot::Region(allocator), Request::Malloc { size }) => allocator.malloc(*size),
                (Slot::Region(allocator), Request::Calloc { num, size }) => {
                    allocator.calloc(*num, *size)
                }
                (Slot::Dram, Request::Malloc { size }) => self.dram.malloc(*size),
                (Slot::Dram, Request::Calloc { num, size }) => self.dram.calloc(*num, *size),
                (Slot::Empty, _) => None,
            };
            if let Some(ptr) = ptr {
                log::debug!("allocated {ptr:p} from region #{index} ({})", region.level);
                return Some(ptr);
            }
        }
        log::warn!("no suitable memory found to satisfy requirements");
        None
    }

    /// Creates the allocator for a region on first use. Region-level slots
    /// map the region's configured buffer size at this point.
    fn ensure_allocator(&mut self, index: usize, level: MemoryLevel) -> bool {
        if !matches!(self.slots[index], Slot::Empty) {
            return true;
        }
        if level == MemoryLevel::Unknown {
            log::warn!("region #{index} has an invalid memory level");
            return false;
        }
        if level == MemoryLevel::Dram {
            self.slots[index] = Slot::Dram;
            return true;
        }

        let size = self.required_buffer_size[index];
        let region = match self.region_manager.mmap(index, size) {
            Ok(region) => region,
            Err(err) => {
                log::warn!("unable to get memory for region #{index}, size {size}: {err}");
                return false;
            }
        };
        let Some(allocator) = RegionAllocator::new(region) else {
            log::warn!("unable to create allocator for region #{index}");
            return false;
        };
        log::debug!("created allocator for region #{index}");
        self.slots[index] = Slot::Region(allocator);
        true
    }

    /// Resizes an outstanding allocation through the allocator owning it.
    /// A pointer no allocator owns yields `None` and leaves every
    /// allocator untouched.
    pub fn realloc(&mut self, ptr: *mut u8, size: usize) -> Option<*mut u8> {
        for slot in &mut self.slots {
            if let Slot::Region(allocator) = slot
                && allocator.contains(ptr)
            {
                return allocator.realloc(ptr, size);
            }
        }
        if self.dram.contains(ptr) {
            return self.dram.realloc(ptr, size);
        }
        log::error!("realloc of pointer {ptr:p} owned by no allocator");
        None
    }

    /// Releases an outstanding allocation. A pointer no allocator owns is
    /// logged and ignored.
    pub fn free(&mut self, ptr: *mut u8) {
        for slot in &mut self.slots {
            if let Slot::Region(allocator) = slot
                && allocator.contains(ptr)
            {
                allocator.free(ptr);
                return;
            }
        }
        if self.dram.contains(ptr) {
            self.dram.free(ptr);
            return;
        }
        log::error!("free of pointer {ptr:p} owned by no allocator");
    }
}
