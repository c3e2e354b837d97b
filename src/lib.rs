//! Autotuned data-parallel primitives for OpenCL.
//!
//! This crate provides exclusive prefix scan ([`Scan`]), reduction
//! ([`Reduce`]) and stable radix sort ([`RadixSort`]) over device buffers,
//! built on the [`ocl`] crate. Each engine is specialized for a device and
//! an element type at construction time; the kernel parameters (work group
//! sizes, per-item work scales, block counts) are chosen empirically by an
//! autotuner and cached in a per-user SQLite database, so only the first
//! construction for a given device and problem shape pays the tuning cost.
//!
//! ## Example
//!
//! ```no_run
//! use ocl_prims::{BaseType, Scan, ScanProblem, Type};
//! use ocl::{Buffer, Context, Device, Platform, Queue};
//!
//! # fn main() -> ocl_prims::Result<()> {
//! let platform = Platform::default();
//! let device = Device::first(platform)?;
//! let context = Context::builder().platform(platform).devices(device).build()?;
//! let queue = Queue::new(&context, device, None)?;
//!
//! let problem = ScanProblem::new(Type::new(BaseType::Uint, 1)?)?;
//! let mut scan = Scan::new(&context, &device, &problem)?;
//!
//! let data = vec![3u32, 1, 4, 1, 5, 9, 2, 6];
//! let buffer = Buffer::builder()
//!     .queue(queue.clone())
//!     .len(data.len())
//!     .copy_host_slice(&data)
//!     .build()?;
//! let event = scan.enqueue(&queue, &buffer, &buffer, data.len(), None, None)?;
//! event.wait_for()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! An engine is a plain value: it owns its program, kernels and scratch
//! buffer, and releases them when dropped. `enqueue` only submits work and
//! returns the final event of the kernel chain; it does not block. The
//! `&mut self` receiver reflects that an engine rebinds kernel arguments
//! per call and therefore must not be driven from two threads at once;
//! separate engine instances are independent.
//!
//! ## The parameter cache
//!
//! Tuned parameters live in `cache.sqlite` under `$CLOGS_CACHE_DIR` if
//! set, else `~/.clogs/cache` (or the local app-data equivalent on
//! Windows). Concurrent processes may race to tune the same entry; they
//! all write the same answer, and the last writer wins. Construct engines
//! with a disabled [`TunePolicy`] to fail fast instead of tuning on a
//! cache miss, and run `ocl-prims-tune` ahead of time to fill the cache
//! for every supported type.

pub use ocl;

#[cfg(test)]
mod tests;

mod cache;
mod error;
mod kernels;
mod program;
mod radix_sort;
mod reduce;
mod scan;
mod tune;
mod types;
mod util;

pub use crate::error::{Error, Result};
pub use crate::radix_sort::{RadixSort, RadixsortProblem};
pub use crate::reduce::{Reduce, ReduceProblem};
pub use crate::scan::{Scan, ScanProblem};
pub use crate::tune::{TunePolicy, TuneVerbosity, Tuner};
pub use crate::types::{BaseType, Type};
