//! Client for the cache buffer kernel driver.
//!
//! The driver exposes a character device whose ioctls enumerate the
//! reserved pseudo-SRAM regions, hand out buffer device nodes, and dump
//! the firmware RTCT table. [`Driver`] owns the device file descriptor and
//! closes it on drop.

use std::{
    fs::{File, OpenOptions},
    io,
    os::fd::AsRawFd as _,
    path::Path,
};

use snafu::{ResultExt as _, Snafu, ensure};

use crate::properties::{CpuSet, MemoryLevel, MemoryProperties, clk2ns};

/// Path of the driver device node. Buffer nodes append their devnode id.
pub const TCC_BUFFER_NAME: &str = "/dev/tcc/tcc_buffer";

const IOCTL_MAGIC: libc::c_ulong = b'T' as libc::c_ulong;

const IOC_WRITE: libc::c_ulong = 1;
const IOC_READ: libc::c_ulong = 2;

const IOC_NRSHIFT: libc::c_ulong = 0;
const IOC_TYPESHIFT: libc::c_ulong = 8;
const IOC_SIZESHIFT: libc::c_ulong = 16;
const IOC_DIRSHIFT: libc::c_ulong = 30;

/// The Linux `_IOC` request encoding. All requests here carry a
/// pointer-sized argument.
const fn ioc(dir: libc::c_ulong, nr: libc::c_ulong) -> libc::c_ulong {
    let size = size_of::<usize>() as libc::c_ulong;
    (dir << IOC_DIRSHIFT) | (size << IOC_SIZESHIFT) | (IOCTL_MAGIC << IOC_TYPESHIFT)
        | (nr << IOC_NRSHIFT)
}

const TCC_GET_REGION_COUNT: libc::c_ulong = ioc(IOC_READ, 1);
const TCC_GET_MEMORY_CONFIG: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, 2);
const TCC_REQ_BUFFER: libc::c_ulong = ioc(IOC_READ | IOC_WRITE, 3);
const TCC_QUERY_RTCT_SIZE: libc::c_ulong = ioc(IOC_READ, 4);
const TCC_GET_RTCT: libc::c_ulong = ioc(IOC_READ, 5);

/// `struct tcc_buf_mem_config_s` of the driver ABI.
#[repr(C)]
struct MemConfig {
    id: libc::c_uint,
    latency: libc::c_uint,
    size: libc::size_t,
    type_: libc::c_uint,
    ways: libc::c_uint,
    cpu_mask_p: *mut libc::cpu_set_t,
}

/// `struct tcc_buf_mem_req_s` of the driver ABI.
#[repr(C)]
struct MemRequest {
    id: libc::c_uint,
    size: libc::size_t,
    devnode: libc::c_uint,
}

/// Errors talking to the driver.
#[derive(Debug, Snafu)]
pub enum DriverError {
    #[snafu(display("unable to open driver {TCC_BUFFER_NAME}"))]
    OpenDevice {
        source: io::Error,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("{op} ioctl failed"))]
    Ioctl {
        op: &'static str,
        source: io::Error,
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("requested buffer size is zero"))]
    ZeroSize {
        #[snafu(implicit)]
        location: snafu::Location,
    },
    #[snafu(display("driver rewrote the cpu mask pointer"))]
    MaskPointerRewritten {
        #[snafu(implicit)]
        location: snafu::Location,
    },
}

/// An open handle to the cache buffer driver.
pub struct Driver {
    device: File,
}

impl Driver {
    /// Is the driver device node present on this system.
    #[must_use]
    pub fn exists() -> bool {
        Path::new(TCC_BUFFER_NAME).exists()
    }

    /// Opens the driver device.
    ///
    /// # Errors
    ///
    /// Fails when the device node cannot be opened read-write.
    pub fn open() -> Result<Self, DriverError> {
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(TCC_BUFFER_NAME)
            .context(OpenDeviceSnafu)?;
        log::debug!("opened driver {TCC_BUFFER_NAME}");
        Ok(Self { device })
    }

    fn ioctl<T>(
        &self,
        op: &'static str,
        request: libc::c_ulong,
        arg: *mut T,
    ) -> Result<(), DriverError> {
        let res = unsafe { libc::ioctl(self.device.as_raw_fd(), request, arg) };
        if res < 0 {
            return Err(io::Error::last_os_error()).context(IoctlSnafu { op });
        }
        Ok(())
    }

    /// Number of pseudo-SRAM regions the driver manages.
    ///
    /// # Errors
    ///
    /// Fails when the ioctl fails.
    pub fn region_count(&self) -> Result<u32, DriverError> {
        let mut count: libc::c_uint = 0;
        self.ioctl("TCC_GET_REGION_COUNT", TCC_GET_REGION_COUNT, &raw mut count)?;
        log::debug!("driver reports {count} regions");
        Ok(count)
    }

    /// Reads the properties of one region: latency, size, level, and the
    /// set of processors with low-latency access.
    ///
    /// The driver-reported size is kept as `size_drv`; the usable `size` is
    /// aligned down to the page size.
    ///
    /// # Errors
    ///
    /// Fails when the ioctl fails or the driver misbehaves on the mask
    /// pointer.
    pub fn memory_config(&self, region_id: u32) -> Result<MemoryProperties, DriverError> {
        let mut mask = CpuSet::new();
        let mut config = MemConfig {
            id: region_id,
            latency: 0,
            size: 0,
            type_: 0,
            ways: 0,
            cpu_mask_p: core::ptr::from_mut(mask.raw_mut()),
        };
        let expected_mask_p = config.cpu_mask_p;
        self.ioctl("TCC_GET_MEMORY_CONFIG", TCC_GET_MEMORY_CONFIG, &raw mut config)?;
        ensure!(
            core::ptr::eq(config.cpu_mask_p, expected_mask_p),
            MaskPointerRewrittenSnafu
        );
        log::debug!(
            "region config: id={} latency={} size={} type={} ways={}",
            config.id,
            config.latency,
            config.size,
            config.type_,
            config.ways
        );

        let pagesize = page_size();
        let properties = MemoryProperties {
            id: config.id,
            mask,
            latency_ns: clk2ns(u64::from(config.latency)),
            latency_clk: config.latency,
            level: MemoryLevel::from_driver_type(config.type_),
            size_drv: config.size,
            size: (config.size / pagesize) * pagesize,
        };
        if properties.size != properties.size_drv {
            log::warn!(
                "region {} size not page aligned, using {} of {}",
                properties.id,
                properties.size,
                properties.size_drv
            );
        }
        Ok(properties)
    }

    /// Requests a buffer of `size` bytes from a region, returning the
    /// devnode id of the node to map it through.
    ///
    /// # Errors
    ///
    /// Fails for a zero size or when the ioctl fails.
    pub fn request_buffer(&self, region_id: u32, size: usize) -> Result<u32, DriverError> {
        ensure!(size != 0, ZeroSizeSnafu);
        let mut request = MemRequest {
            id: region_id,
            size,
            devnode: libc::c_uint::MAX,
        };
        self.ioctl("TCC_REQ_BUFFER", TCC_REQ_BUFFER, &raw mut request)?;
        log::debug!(
            "allocated {} bytes (requested {size}) from region {}, devnode {}",
            request.size,
            request.id,
            request.devnode
        );
        Ok(request.devnode)
    }

    /// Dumps the firmware RTCT table.
    ///
    /// # Errors
    ///
    /// Fails when either the size query or the table read ioctl fails.
    pub fn read_rtct(&self) -> Result<Vec<u8>, DriverError> {
        let mut size: libc::size_t = 0;
        self.ioctl("TCC_QUERY_RTCT_SIZE", TCC_QUERY_RTCT_SIZE, &raw mut size)?;
        log::debug!("RTCT size is {size}");
        let mut table = vec![0_u8; size];
        self.ioctl("TCC_GET_RTCT", TCC_GET_RTCT, table.as_mut_ptr())?;
        Ok(table)
    }
}

pub(crate) fn page_size() -> usize {
    let res = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(res).unwrap_or(4096)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Request codes as the driver ABI's _IOR/_IOWR macros expand on
    // x86_64.
    #[test]
    fn ioctl_request_encoding() {
        assert_eq!(TCC_GET_REGION_COUNT, 0x8008_5401);
        assert_eq!(TCC_GET_MEMORY_CONFIG, 0xc008_5402);
        assert_eq!(TCC_REQ_BUFFER, 0xc008_5403);
        assert_eq!(TCC_QUERY_RTCT_SIZE, 0x8008_5404);
        assert_eq!(TCC_GET_RTCT, 0x8008_5405);
    }

    #[test]
    fn abi_struct_layout() {
        assert_eq!(size_of::<MemConfig>(), 32);
        assert_eq!(core::mem::offset_of!(MemConfig, size), 8);
        assert_eq!(core::mem::offset_of!(MemConfig, cpu_mask_p), 24);
        assert_eq!(size_of::<MemRequest>(), 24);
        assert_eq!(core::mem::offset_of!(MemRequest, devnode), 16);
    }

    #[test]
    fn page_size_is_sane() {
        let page = page_size();
        assert!(page >= 4096);
        assert!(page.is_power_of_two());
    }
}
