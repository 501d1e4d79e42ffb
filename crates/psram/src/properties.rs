//! Descriptions of allocatable memory: hierarchy levels, CPU affinity
//! masks, and the per-region property record the region managers hand out.

use core::{cmp::Ordering, fmt};
use std::{io, sync::OnceLock};

/// Level of the memory hierarchy a region is carved from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryLevel {
    #[default]
    Unknown,
    L1,
    L2,
    L3,
    Edram,
    Dram,
}

impl MemoryLevel {
    /// Maps a region type code reported by the kernel driver.
    #[must_use]
    pub fn from_driver_type(raw: u32) -> Self {
        match raw {
            1 => Self::L1,
            2 => Self::L2,
            3 => Self::L3,
            4 => Self::Edram,
            5 => Self::Dram,
            _ => Self::Unknown,
        }
    }

    /// Maps a level name as spelled in configuration files.
    #[must_use]
    pub fn from_config_key(key: &str) -> Option<Self> {
        let level = match key {
            "L1" => Self::L1,
            "L2" => Self::L2,
            "L3" => Self::L3,
            "EDRAM" => Self::Edram,
            "DRAM" => Self::Dram,
            _ => return None,
        };
        Some(level)
    }
}

impl fmt::Display for MemoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unknown => "UNKNOWN",
            Self::L1 => "L1",
            Self::L2 => "L2",
            Self::L3 => "L3",
            Self::Edram => "EDRAM",
            Self::Dram => "DRAM",
        };
        f.write_str(name)
    }
}

/// A processor affinity mask over `libc::cpu_set_t`.
#[derive(Clone, Copy)]
pub struct CpuSet(libc::cpu_set_t);

impl CpuSet {
    /// An empty mask.
    #[must_use]
    pub fn new() -> Self {
        // cpu_set_t is a plain bit array; all-zero is the empty set.
        Self(unsafe { core::mem::zeroed() })
    }

    /// A mask covering every online processor.
    #[must_use]
    pub fn all() -> Self {
        let mut set = Self::new();
        for cpu in 0..nprocs() {
            set.set(cpu);
        }
        set
    }

    /// The calling process's current affinity mask.
    ///
    /// # Errors
    ///
    /// Fails when `sched_getaffinity` fails.
    pub fn current_affinity() -> io::Result<Self> {
        let mut set = Self::new();
        let res = unsafe {
            libc::sched_getaffinity(libc::getpid(), size_of::<libc::cpu_set_t>(), &raw mut set.0)
        };
        if res == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(set)
    }

    pub fn set(&mut self, cpu: usize) {
        unsafe {
            libc::CPU_SET(cpu, &mut self.0);
        }
    }

    #[must_use]
    pub fn is_set(&self, cpu: usize) -> bool {
        unsafe { libc::CPU_ISSET(cpu, &self.0) }
    }

    /// Number of processors in the mask.
    #[must_use]
    pub fn count(&self) -> usize {
        usize::try_from(unsafe { libc::CPU_COUNT(&self.0) }).unwrap_or(0)
    }

    /// Superset test: every processor of `other` is also in `self`.
    #[must_use]
    pub fn contains_all(&self, other: &Self) -> bool {
        #[expect(clippy::cast_sign_loss, reason = "CPU_SETSIZE is a small positive constant")]
        let setsize = libc::CPU_SETSIZE as usize;
        (0..setsize).all(|cpu| !other.is_set(cpu) || self.is_set(cpu))
    }

    #[must_use]
    pub fn raw(&self) -> &libc::cpu_set_t {
        &self.0
    }

    pub fn raw_mut(&mut self) -> &mut libc::cpu_set_t {
        &mut self.0
    }
}

impl Default for CpuSet {
    fn default() -> Self {
        Self::new()
    }
}

impl From<libc::cpu_set_t> for CpuSet {
    fn from(raw: libc::cpu_set_t) -> Self {
        Self(raw)
    }
}

/// Renders the first processors of the mask as a bit string, lowest CPU
/// first.
impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const DISPLAY_CPUS: usize = 8;
        for cpu in 0..DISPLAY_CPUS {
            let bit = if self.is_set(cpu) { '1' } else { '0' };
            write!(f, "{bit}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuSet({self})")
    }
}

/// Properties of one allocatable memory region.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryProperties {
    /// Driver region id; `u32::MAX` marks a synthetic DRAM slot.
    pub id: u32,
    /// Processors with low-latency access to the region.
    pub mask: CpuSet,
    /// Worst-case access latency in nanoseconds.
    pub latency_ns: u64,
    /// Worst-case access latency in CPU clock cycles.
    pub latency_clk: u32,
    pub level: MemoryLevel,
    /// Raw region size reported by the driver.
    pub size_drv: usize,
    /// Usable region size, aligned down to the page size.
    pub size: usize,
}

impl MemoryProperties {
    /// Enumeration preference: higher latency first, then smaller affinity
    /// mask population. Used with a stable sort so driver order breaks the
    /// remaining ties.
    #[must_use]
    pub fn preference_cmp(&self, other: &Self) -> Ordering {
        other
            .latency_ns
            .cmp(&self.latency_ns)
            .then_with(|| self.mask.count().cmp(&other.mask.count()))
    }

    /// Does this region satisfy an allocation requirement: at most the
    /// required latency, covering every processor the caller may run on.
    #[must_use]
    pub fn satisfies(&self, requirements: &Requirements) -> bool {
        self.latency_ns <= requirements.latency_ns && self.mask.contains_all(&requirements.mask)
    }
}

impl fmt::Display for MemoryProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "\"id\":{}, \"mask\":\"{}\", \"latency_ns\":{}, \"latency_clk\":{}, \
             \"level\":\"{}\", \"size_drv\":{}, \"size\":{}",
            self.id, self.mask, self.latency_ns, self.latency_clk, self.level, self.size_drv,
            self.size
        )
    }
}

/// An allocation requirement: the latency the caller can tolerate and the
/// processors it may run on.
#[derive(Debug, Clone, Copy)]
pub struct Requirements {
    pub latency_ns: u64,
    pub mask: CpuSet,
}

/// Number of online processors.
#[must_use]
pub fn nprocs() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    usize::try_from(n).unwrap_or(1)
}

/// Nominal TSC frequency in Hz from CPUID leaf 0x15, or `None` when the
/// processor does not enumerate it.
#[cfg(target_arch = "x86_64")]
fn read_nominal_tsc_hz() -> Option<u64> {
    let leaf = unsafe { core::arch::x86_64::__cpuid(0x15) };
    if leaf.eax == 0 || leaf.ebx == 0 || leaf.ecx == 0 {
        log::error!(
            "CPUID leaf 0x15 does not enumerate the TSC frequency: eax={} ebx={} ecx={}",
            leaf.eax,
            leaf.ebx,
            leaf.ecx
        );
        return None;
    }
    Some(u64::from(leaf.ecx) * u64::from(leaf.ebx) / u64::from(leaf.eax))
}

#[cfg(not(target_arch = "x86_64"))]
fn read_nominal_tsc_hz() -> Option<u64> {
    None
}

fn nominal_tsc_hz() -> Option<u64> {
    static TSC_HZ: OnceLock<Option<u64>> = OnceLock::new();
    *TSC_HZ.get_or_init(read_nominal_tsc_hz)
}

const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Converts clock cycles to nanoseconds with the given TSC frequency.
#[must_use]
pub fn clk2ns_with_hz(clk: u64, tsc_hz: u64) -> u64 {
    if tsc_hz == 0 {
        return 0;
    }
    let secs = clk / tsc_hz;
    let rem = clk % tsc_hz;
    secs * NSEC_PER_SEC + rem * NSEC_PER_SEC / tsc_hz
}

/// Converts clock cycles to nanoseconds with the processor's nominal TSC
/// frequency. Yields 0 when the frequency cannot be determined.
#[must_use]
pub fn clk2ns(clk: u64) -> u64 {
    clk2ns_with_hz(clk, nominal_tsc_hz().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_contains_nothing() {
        let set = CpuSet::new();
        assert_eq!(set.count(), 0);
        assert!(!set.is_set(0));
    }

    #[test]
    fn set_and_count() {
        let mut set = CpuSet::new();
        set.set(0);
        set.set(3);
        assert_eq!(set.count(), 2);
        assert!(set.is_set(0));
        assert!(!set.is_set(1));
        assert!(set.is_set(3));
        assert_eq!(set.to_string(), "10010000");
    }

    #[test]
    fn superset_test() {
        let mut small = CpuSet::new();
        small.set(1);
        let mut big = CpuSet::new();
        big.set(0);
        big.set(1);
        assert!(big.contains_all(&small));
        assert!(!small.contains_all(&big));
        // Every mask contains the empty one, including itself.
        assert!(small.contains_all(&CpuSet::new()));
        assert!(small.contains_all(&small));
    }

    #[test]
    fn all_covers_every_processor() {
        let all = CpuSet::all();
        assert_eq!(all.count(), nprocs());
        let current = CpuSet::current_affinity().unwrap();
        assert!(all.contains_all(&current));
    }

    #[test]
    fn level_mappings() {
        assert_eq!(MemoryLevel::from_driver_type(3), MemoryLevel::L3);
        assert_eq!(MemoryLevel::from_driver_type(5), MemoryLevel::Dram);
        assert_eq!(MemoryLevel::from_driver_type(77), MemoryLevel::Unknown);
        assert_eq!(MemoryLevel::from_config_key("L2"), Some(MemoryLevel::L2));
        assert_eq!(MemoryLevel::from_config_key("l2"), None);
    }

    #[test]
    fn preference_orders_by_latency_then_mask() {
        let slow = MemoryProperties {
            latency_ns: 500,
            ..MemoryProperties::default()
        };
        let mut fast_wide = MemoryProperties {
            latency_ns: 100,
            ..MemoryProperties::default()
        };
        fast_wide.mask.set(0);
        fast_wide.mask.set(1);
        let mut fast_narrow = MemoryProperties {
            latency_ns: 100,
            ..MemoryProperties::default()
        };
        fast_narrow.mask.set(0);

        let mut regions = vec![fast_wide, slow, fast_narrow];
        regions.sort_by(MemoryProperties::preference_cmp);
        assert_eq!(regions[0].latency_ns, 500);
        assert_eq!(regions[1].mask.count(), 1);
        assert_eq!(regions[2].mask.count(), 2);
    }

    #[test]
    fn requirement_satisfaction() {
        let mut region = MemoryProperties {
            latency_ns: 100,
            ..MemoryProperties::default()
        };
        region.mask.set(0);
        region.mask.set(1);

        let mut req_mask = CpuSet::new();
        req_mask.set(1);
        let req = Requirements {
            latency_ns: 150,
            mask: req_mask,
        };
        assert!(region.satisfies(&req));

        let too_strict = Requirements {
            latency_ns: 50,
            mask: req_mask,
        };
        assert!(!region.satisfies(&too_strict));

        let mut foreign_mask = CpuSet::new();
        foreign_mask.set(9);
        let elsewhere = Requirements {
            latency_ns: 150,
            mask: foreign_mask,
        };
        assert!(!region.satisfies(&elsewhere));
    }

    #[test]
    fn selection_scenario_l2_versus_dram() {
        // An L2 region at 20 ns covering CPUs {0, 1} next to a DRAM slot
        // covering a wider CPU set. Selection is: sort by preference, take
        // the first region satisfying the requirement.
        let mut l2 = MemoryProperties {
            latency_ns: 20,
            level: MemoryLevel::L2,
            ..MemoryProperties::default()
        };
        l2.mask.set(0);
        l2.mask.set(1);
        let mut dram = MemoryProperties {
            latency_ns: 15,
            level: MemoryLevel::Dram,
            ..MemoryProperties::default()
        };
        for cpu in 0..4 {
            dram.mask.set(cpu);
        }
        let mut regions = vec![l2, dram];
        regions.sort_by(MemoryProperties::preference_cmp);

        let select = |req: &Requirements| {
            regions
                .iter()
                .find(|region| region.satisfies(req))
                .map(|region| region.level)
        };
        let pinned = |cpu: usize| {
            let mut mask = CpuSet::new();
            mask.set(cpu);
            mask
        };

        // Pinned to CPU 0, 20 ns tolerated: L2 wins over DRAM.
        let req = Requirements {
            latency_ns: 20,
            mask: pinned(0),
        };
        assert_eq!(select(&req), Some(MemoryLevel::L2));

        // 19 ns excludes L2; DRAM at 15 ns still qualifies.
        let req = Requirements {
            latency_ns: 19,
            mask: pinned(0),
        };
        assert_eq!(select(&req), Some(MemoryLevel::Dram));

        // 10 ns excludes everything.
        let req = Requirements {
            latency_ns: 10,
            mask: pinned(0),
        };
        assert_eq!(select(&req), None);

        // Pinned outside L2's mask: DRAM is the only candidate.
        let req = Requirements {
            latency_ns: 20,
            mask: pinned(2),
        };
        assert_eq!(select(&req), Some(MemoryLevel::Dram));
    }

    #[test]
    fn clock_conversion() {
        assert_eq!(clk2ns_with_hz(0, 1_000_000_000), 0);
        assert_eq!(clk2ns_with_hz(1_000, 1_000_000_000), 1_000);
        assert_eq!(clk2ns_with_hz(2_000, 2_000_000_000), 1_000);
        // 12402 clocks at a 2.1 GHz nominal frequency.
        assert_eq!(clk2ns_with_hz(12_402, 2_100_000_000), 5_905);
        // Unknown frequency degrades to zero latency.
        assert_eq!(clk2ns_with_hz(12_402, 0), 0);
    }
}
