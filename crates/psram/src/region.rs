//! Region managers: enumeration of allocatable memory regions and mapping
//! of buffers out of them.
//!
//! Two backends exist. [`DriverManager`] talks to the cache buffer kernel
//! driver and enumerates the real pseudo-SRAM regions plus one synthetic
//! DRAM slot carrying the DRAM latency from the firmware RTCT table.
//! [`DefaultManager`] is the fallback for systems without the driver: a
//! single synthetic DRAM region backed by anonymous memory. The
//! [`RegionManager`] enum closes over both.

use std::{
    fs::{self, OpenOptions},
    io,
    os::fd::{AsRawFd as _, FromRawFd as _, OwnedFd},
    path::PathBuf,
    ptr::NonNull,
};

use snafu::{ResultExt as _, Snafu, ensure};

use crate::{
    driver::{Driver, DriverError, TCC_BUFFER_NAME},
    properties::{CpuSet, MemoryLevel, MemoryProperties, clk2ns},
};

/// DRAM latency in clock cycles assumed when the RTCT table lacks a
/// latency entry.
pub const HARDCODED_DRAM_LATENCY_CLK: u32 = 12402;

/// Region id of the synthetic DRAM slot.
const DRAM_REGION_ID: u32 = u32::MAX;

/// Errors creating a region manager.
#[derive(Debug, Snafu)]
pub enum CreateError {
    #[snafu(display("unable to open the cache buffer driver"))]
    Open {
        source: DriverError,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("unable to enumerate driver regions"))]
    Enumerate {
        source: DriverError,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// Errors mapping a buffer out of a region.
#[derive(Debug, Snafu)]
pub enum MmapError {
    #[snafu(display("region index {index} out of range, have {count}"))]
    BadIndex {
        index: usize,
        count: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("mapping size is zero"))]
    ZeroSize {
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("unable to create anonymous memory of {size} bytes"))]
    AnonymousMemory {
        size: usize,
        source: io::Error,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("unable to request a buffer from the driver"))]
    RequestBuffer {
        source: DriverError,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("unable to open buffer node {}", path.display()))]
    OpenNode {
        path: PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("unable to unlink buffer node {}", path.display()))]
    UnlinkNode {
        path: PathBuf,
        source: io::Error,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("mmap of {size} bytes failed"))]
    Mmap {
        size: usize,
        source: io::Error,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// A shared read-write mapping, unmapped on drop.
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The mapping is exclusively owned; nothing else aliases it.
unsafe impl Send for MappedRegion {}

impl MappedRegion {
    fn map(fd: &OwnedFd, len: usize) -> Result<Self, MmapError> {
        let memory = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd.as_raw_fd(),
                0,
            )
        };
        if memory == libc::MAP_FAILED {
            return Err(io::Error::last_os_error()).context(MmapSnafu { size: len });
        }
        let ptr = NonNull::new(memory.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned the null page"))
            .context(MmapSnafu { size: len })?;
        Ok(Self { ptr, len })
    }

    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Does `ptr` point inside this mapping.
    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.ptr.as_ptr().addr();
        ptr.addr() >= base && ptr.addr() < base + self.len
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        let res = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if res != 0 {
            log::error!(
                "munmap({:p}, {}) failed: {}",
                self.ptr,
                self.len,
                io::Error::last_os_error()
            );
        }
    }
}

/// Anonymous memory descriptor for DRAM-backed mappings.
fn dram_region_fd(size: usize) -> Result<OwnedFd, MmapError> {
    let fd = unsafe { libc::memfd_create(c"cache_dram_region".as_ptr(), 0) };
    if fd == -1 {
        return Err(io::Error::last_os_error()).context(AnonymousMemorySnafu { size });
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let len = libc::off_t::try_from(size)
        .map_err(io::Error::other)
        .context(AnonymousMemorySnafu { size })?;
    let res = unsafe { libc::ftruncate(fd.as_raw_fd(), len) };
    if res < 0 {
        return Err(io::Error::last_os_error()).context(AnonymousMemorySnafu { size });
    }
    Ok(fd)
}

fn dram_mmap(size: usize) -> Result<MappedRegion, MmapError> {
    log::debug!("allocating {size} bytes of anonymous DRAM");
    let fd = dram_region_fd(size)?;
    MappedRegion::map(&fd, size)
}

/// The fallback manager: one synthetic DRAM region.
pub struct DefaultManager {
    dram_region: MemoryProperties,
}

impl DefaultManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            dram_region: MemoryProperties {
                id: DRAM_REGION_ID,
                mask: CpuSet::all(),
                latency_ns: 0,
                latency_clk: 0,
                level: MemoryLevel::Dram,
                size_drv: usize::MAX,
                size: usize::MAX,
            },
        }
    }

    fn mmap(&self, index: usize, size: usize) -> Result<MappedRegion, MmapError> {
        ensure!(index == 0, BadIndexSnafu { index, count: 1_usize });
        ensure!(size != 0, ZeroSizeSnafu);
        dram_mmap(size)
    }
}

impl Default for DefaultManager {
    fn default() -> Self {
        Self::new()
    }
}

/// The driver-backed manager: the real pseudo-SRAM regions plus one
/// synthetic DRAM slot for latency comparison.
pub struct DriverManager {
    driver: Driver,
    regions: Vec<MemoryProperties>,
}

impl DriverManager {
    /// Opens the driver and enumerates its regions.
    ///
    /// # Errors
    ///
    /// Fails when the driver cannot be opened or a region cannot be read.
    pub fn new() -> Result<Self, CreateError> {
        let driver = Driver::open().context(OpenSnafu)?;
        let count = driver.region_count().context(EnumerateSnafu)?;
        let mut regions = Vec::with_capacity(count as usize + 1);
        for id in 0..count {
            let properties = driver.memory_config(id).context(EnumerateSnafu)?;
            log::debug!("read region {id}");
            regions.push(properties);
        }
        regions.push(Self::dram_region(&driver));

        // Stable: regions with equal latency and mask population keep
        // driver order.
        regions.sort_by(MemoryProperties::preference_cmp);

        for (index, region) in regions.iter().enumerate() {
            log::debug!("region#{index} {region}");
        }
        Ok(Self { driver, regions })
    }

    /// The synthetic DRAM slot. Its latency comes from the RTCT table so
    /// the allocation policy can compare DRAM against the real regions.
    fn dram_region(driver: &Driver) -> MemoryProperties {
        let latency_clk = Self::dram_latency_clk(driver).unwrap_or_else(|| {
            log::warn!(
                "DRAM latency unavailable, using hardcoded {HARDCODED_DRAM_LATENCY_CLK} clocks"
            );
            HARDCODED_DRAM_LATENCY_CLK
        });
        MemoryProperties {
            id: DRAM_REGION_ID,
            mask: CpuSet::all(),
            latency_ns: clk2ns(u64::from(latency_clk)),
            latency_clk,
            level: MemoryLevel::Dram,
            size_drv: usize::MAX,
            size: usize::MAX,
        }
    }

    fn dram_latency_clk(driver: &Driver) -> Option<u32> {
        let table = driver
            .read_rtct()
            .inspect_err(|err| log::error!("unable to read RTCT table: {err}"))
            .ok()?;
        let entries = rtct::Entries::new(&table)
            .inspect_err(|err| log::error!("unable to parse RTCT table: {err}"))
            .ok()?;
        entries
            .dram_latency_clk()
            .inspect_err(|err| log::error!("unable to scan RTCT table: {err}"))
            .ok()?
    }

    fn mmap(&self, index: usize, size: usize) -> Result<MappedRegion, MmapError> {
        let count = self.regions.len();
        let Some(region) = self.regions.get(index) else {
            return BadIndexSnafu { index, count }.fail();
        };
        ensure!(size != 0, ZeroSizeSnafu);
        if region.level == MemoryLevel::Dram {
            return dram_mmap(size);
        }

        log::debug!("allocating {size} bytes of pseudo-SRAM from region {}", region.id);
        let devnode = self
            .driver
            .request_buffer(region.id, size)
            .context(RequestBufferSnafu)?;
        let path = PathBuf::from(format!("{TCC_BUFFER_NAME}{devnode}"));
        let node = OpenOptions::new().read(true).write(true).open(&path);
        // The node is single-use; removing it right away keeps a crashed
        // process from leaking buffer nodes. On open failure the unlink is
        // best-effort and the open error is the one reported.
        match node {
            Ok(node) => {
                fs::remove_file(&path).context(UnlinkNodeSnafu { path })?;
                let fd = OwnedFd::from(node);
                MappedRegion::map(&fd, size)
            }
            Err(source) => {
                if let Err(unlink_err) = fs::remove_file(&path) {
                    log::warn!("unable to unlink {}: {unlink_err}", path.display());
                    log::error!("buffer node leaked, remove {} manually", path.display());
                }
                Err(source).context(OpenNodeSnafu { path })
            }
        }
    }
}

/// Enumerates allocatable regions and maps buffers out of them.
pub enum RegionManager {
    Default(DefaultManager),
    Driver(DriverManager),
}

impl RegionManager {
    /// Builds the driver-backed manager when the driver device exists, the
    /// default manager otherwise.
    ///
    /// # Errors
    ///
    /// Fails when the driver exists but cannot be used.
    pub fn create() -> Result<Self, CreateError> {
        if Driver::exists() {
            Ok(Self::Driver(DriverManager::new()?))
        } else {
            Ok(Self::Default(DefaultManager::new()))
        }
    }

    /// Is the kernel driver behind this manager.
    #[must_use]
    pub fn driver_exists(&self) -> bool {
        matches!(self, Self::Driver(_))
    }

    /// Number of regions, synthetic DRAM slots included.
    #[must_use]
    pub fn count(&self) -> usize {
        match self {
            Self::Default(_) => 1,
            Self::Driver(manager) => manager.regions.len(),
        }
    }

    /// The properties of one region, in preference order.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&MemoryProperties> {
        match self {
            Self::Default(manager) => (index == 0).then_some(&manager.dram_region),
            Self::Driver(manager) => manager.regions.get(index),
        }
    }

    /// Maps `size` bytes out of the region at `index`.
    ///
    /// # Errors
    ///
    /// Fails for a bad index, a zero size, or when the backing memory
    /// cannot be obtained or mapped.
    pub fn mmap(&self, index: usize, size: usize) -> Result<MappedRegion, MmapError> {
        match self {
            Self::Default(manager) => manager.mmap(index, size),
            Self::Driver(manager) => manager.mmap(index, size),
        }
    }
}
