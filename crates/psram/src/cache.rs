//! The top-level cache buffer allocation handle.
//!
//! [`Cache`] ties the pieces together: it reads the optional buffer size
//! configuration, enumerates the allocatable regions, and serves
//! latency-constrained allocation requests. The handle owns all state;
//! dropping it (or calling [`Cache::finish`]) releases every mapping and
//! outstanding bookkeeping.

use std::io;

use snafu::{ResultExt as _, Snafu, ensure};

use crate::{
    allocators::AllocatorsManager,
    config::{Config, find_config_file},
    properties::{CpuSet, Requirements, nprocs},
    region::{self, RegionManager},
};

/// Errors initializing the cache handle.
#[derive(Debug, Snafu)]
pub enum InitError {
    #[snafu(display("cpu index {cpuid} out of range, max {nprocs}"))]
    CpuOutOfRange {
        cpuid: i32,
        nprocs: usize,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("unable to pin the process to cpu {cpuid}"))]
    SetAffinity {
        cpuid: i32,
        source: io::Error,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("unable to create the region manager"))]
    RegionManager {
        source: region::CreateError,
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// The cache buffer allocation handle.
///
/// Allocation methods hand out raw pointers into memory the handle owns;
/// every pointer must be released through [`free`](Self::free) (or
/// [`realloc`](Self::realloc) to zero) before the handle is dropped.
pub struct Cache {
    default_latency_ns: Option<u64>,
    allocators: AllocatorsManager,
}

impl Cache {
    /// Creates the handle.
    ///
    /// `cpuid >= 0` pins the whole process to that processor first, so the
    /// affinity-based region selection sees the final mask; `-1` keeps the
    /// current affinity. Without the kernel driver the handle still works
    /// and serves every request from regular memory.
    ///
    /// # Errors
    ///
    /// Fails for an out-of-range `cpuid`, an affinity change failure, or a
    /// driver that exists but cannot be used.
    pub fn init(cpuid: i32) -> Result<Self, InitError> {
        set_cpu_affinity(cpuid)?;

        let config = match find_config_file() {
            Some(path) => {
                log::info!("reading config file {}", path.display());
                Config::read(&path).unwrap_or_else(|err| {
                    log::warn!("unable to read config: {err}, running without one");
                    Config::empty()
                })
            }
            None => {
                log::warn!("no configuration file available, running without one");
                Config::empty()
            }
        };

        let region_manager = RegionManager::create().context(RegionManagerSnafu)?;
        if !region_manager.driver_exists() {
            log::warn!("cache buffer driver not found, regular memory is used");
        }
        let allocators = AllocatorsManager::new(region_manager, &config);
        Ok(Self {
            default_latency_ns: None,
            allocators,
        })
    }

    /// Releases the handle and everything it owns.
    pub fn finish(self) {
        drop(self);
    }

    /// Sets the latency used by the `*_default` allocation methods.
    pub fn set_default_latency(&mut self, latency_ns: u64) {
        self.default_latency_ns = Some(latency_ns);
    }

    /// Allocates `size` bytes from the lowest-level memory satisfying the
    /// latency requirement on the caller's current affinity mask.
    pub fn malloc(&mut self, size: usize, latency_ns: u64) -> Option<*mut u8> {
        let requirements = requirements(latency_ns)?;
        self.allocators.malloc(&requirements, size)
    }

    /// [`malloc`](Self::malloc) with the default latency. Fails when no
    /// default latency has been set.
    pub fn malloc_default(&mut self, size: usize) -> Option<*mut u8> {
        let latency_ns = self.default_latency()?;
        self.malloc(size, latency_ns)
    }

    /// Zero-filled allocation for `num` elements of `size` bytes.
    pub fn calloc(&mut self, num: usize, size: usize, latency_ns: u64) -> Option<*mut u8> {
        let requirements = requirements(latency_ns)?;
        self.allocators.calloc(&requirements, num, size)
    }

    /// [`calloc`](Self::calloc) with the default latency. Fails when no
    /// default latency has been set.
    pub fn calloc_default(&mut self, num: usize, size: usize) -> Option<*mut u8> {
        let latency_ns = self.default_latency()?;
        self.calloc(num, size, latency_ns)
    }

    /// Resizes an allocation through the allocator owning it. The latency
    /// class of the original allocation is preserved; a pointer this
    /// handle did not produce yields `None` with no state change.
    pub fn realloc(&mut self, ptr: *mut u8, size: usize) -> Option<*mut u8> {
        if ptr.is_null() {
            log::error!("realloc of a null pointer");
            return None;
        }
        self.allocators.realloc(ptr, size)
    }

    /// Releases an allocation. A null pointer is a no-op; a pointer this
    /// handle did not produce is logged and ignored.
    pub fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            log::debug!("free of a null pointer, nothing to do");
            return;
        }
        self.allocators.free(ptr);
    }

    fn default_latency(&self) -> Option<u64> {
        if self.default_latency_ns.is_none() {
            log::error!("default latency was not provided");
        }
        self.default_latency_ns
    }
}

/// Requirement for one allocation: the requested latency plus the
/// caller's current affinity mask.
fn requirements(latency_ns: u64) -> Option<Requirements> {
    let mask = CpuSet::current_affinity()
        .inspect_err(|err| log::error!("unable to get affinity: {err}"))
        .ok()?;
    Some(Requirements { latency_ns, mask })
}

fn set_cpu_affinity(cpuid: i32) -> Result<(), InitError> {
    let nprocs = nprocs();
    let in_range = cpuid == -1 || usize::try_from(cpuid).is_ok_and(|id| id < nprocs);
    ensure!(in_range, CpuOutOfRangeSnafu { cpuid, nprocs });
    if cpuid == -1 {
        log::info!("cpuid is -1, keeping current affinity");
        return Ok(());
    }
    let mut mask = CpuSet::new();
    #[expect(clippy::cast_sign_loss, reason = "negative cpuid handled above")]
    mask.set(cpuid as usize);
    let res = unsafe {
        libc::sched_setaffinity(libc::getpid(), size_of::<libc::cpu_set_t>(), mask.raw())
    };
    if res == -1 {
        return Err(io::Error::last_os_error()).context(SetAffinitySnafu { cpuid });
    }
    Ok(())
}
