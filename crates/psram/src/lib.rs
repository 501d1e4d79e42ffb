//! Latency-driven buffer allocation over cache-reserved memory.
//!
//! On platforms with cache-reservation support, firmware and the cache
//! buffer kernel driver expose regions of pseudo-SRAM: physical memory
//! pinned into a level of the cache hierarchy. This crate lets real-time
//! applications ask for buffers by the worst-case access latency they can
//! tolerate, and transparently falls back to regular memory where no
//! reserved region qualifies.
//!
//! The entry point is [`cache::Cache`]:
//!
//! ```no_run
//! use psram::cache::Cache;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cache = Cache::init(-1)?;
//! if let Some(ptr) = cache.malloc(4096, 100) {
//!     // ... use the low-latency buffer ...
//!     cache.free(ptr);
//! }
//! cache.finish();
//! # Ok(())
//! # }
//! ```
//!
//! Underneath, [`region`] enumerates the allocatable regions (through the
//! driver, or a regular-memory fallback), [`allocators`] runs an embedded
//! block allocator over each mapped region, [`config`] supplies per-level
//! buffer sizes, and [`properties`] holds the latency and affinity model
//! the selection policy works on.

pub mod allocators;
pub mod cache;
pub mod config;
pub mod driver;
pub mod properties;
pub mod region;

pub use self::cache::Cache;
