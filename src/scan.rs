//! Exclusive prefix sum over a device buffer.
//!
//! The scan runs as three kernels: a per-block reduction into an internal
//! `sums` buffer, a single-workgroup exclusive scan of the block sums
//! (optionally seeded from a host value or a cell of another buffer), and a
//! per-block scan that folds the scanned block sums back in. Host-side work
//! decomposition and kernel-side indexing agree through the parameters
//! compiled into the program as `#define`s.

use std::cmp::{max, min};
use std::mem;

use ocl::core::{self, ArgVal, Kernel as KernelCore, Mem as MemCore, MemFlags, MemInfo, MemInfoResult};
use ocl::{Buffer, Context, Device, Event, EventList, OclPrm, Program, Queue};

use crate::cache::{self, sql_record, DeviceKey};
use crate::error::{Error, Result};
use crate::program;
use crate::tune::{self, TunePolicy, FUNNEL_RATIO};
use crate::types::Type;
use crate::util;

const ALGORITHM: &str = "scan";
const VERSION: u32 = 1;

sql_record! {
    pub struct ScanKey {
        pub platform_name: String,
        pub device_name: String,
        pub device_vendor_id: u32,
        pub driver_version: String,
        pub element_type: String,
    }
}

sql_record! {
    pub struct ScanRecord {
        pub warp_size_mem: usize,
        pub warp_size_schedule: usize,
        pub reduce_work_group_size: usize,
        pub scan_work_group_size: usize,
        pub scan_work_scale: usize,
        pub scan_blocks: usize,
        pub program_binary: Vec<u8>,
    }
}

/// Describes a scan problem: the element type, plus the tuning policy to
/// apply if the parameter cache has no entry for it.
#[derive(Debug, Clone)]
pub struct ScanProblem {
    ty: Type,
    policy: TunePolicy,
}

impl ScanProblem {
    /// Creates a problem for the given element type.
    ///
    /// Only integral types can be scanned; floating-point types are
    /// rejected here because addition over them is not associative enough
    /// to reorder freely.
    pub fn new(ty: Type) -> Result<ScanProblem> {
        if !ty.is_integral() {
            return Err(Error::invalid_arg(format!(
                "{} is not a supported integral format",
                ty
            )));
        }
        Ok(ScanProblem { ty, policy: TunePolicy::default() })
    }

    pub fn element_type(&self) -> Type {
        self.ty
    }

    pub fn set_tune_policy(&mut self, policy: TunePolicy) {
        self.policy = policy;
    }
}

/// Seed for the exclusive scan, resolved by `enqueue_raw`.
enum OffsetSpec<'a> {
    /// Raw bytes of one element, passed as a kernel argument.
    Host(Vec<u8>),
    /// Read from `buffer[index]` on the device.
    Buffer(&'a MemCore, u32),
}

/// An exclusive prefix-sum engine, specialized for one device and element
/// type.
///
/// Construction performs the cache-lookup-or-tune flow and compiles the
/// kernels; `enqueue` submits work without blocking. An engine is not safe
/// for concurrent `enqueue` calls (it rebinds kernel arguments), which the
/// `&mut self` receivers encode.
pub struct Scan {
    reduce_work_group_size: usize,
    scan_work_group_size: usize,
    scan_work_scale: usize,
    max_blocks: usize,
    element_size: usize,
    #[allow(dead_code)]
    program: Program,
    reduce_kernel: KernelCore,
    scan_small_kernel: KernelCore,
    scan_small_kernel_offset: KernelCore,
    scan_kernel: KernelCore,
    /// Kept alive for the kernels that have it bound as an argument.
    #[allow(dead_code)]
    sums: Buffer<u8>,
    event_callback: Option<Box<dyn FnMut(&Event) + Send>>,
}

impl Scan {
    /// Whether `ty` can be scanned on `device`.
    pub fn type_supported(device: &Device, ty: &Type) -> Result<bool> {
        Ok(ty.is_integral() && ty.is_computable(device)? && ty.is_storable(device)?)
    }

    fn make_key(device: &Device, problem: &ScanProblem) -> Result<ScanKey> {
        // Signed and unsigned variants compile to identical kernels, so
        // they share a cache entry.
        let canon = problem.ty.canonical();
        let device_key = DeviceKey::for_device(device)?;
        Ok(ScanKey {
            platform_name: device_key.platform_name,
            device_name: device_key.device_name,
            device_vendor_id: device_key.device_vendor_id,
            driver_version: device_key.driver_version,
            element_type: canon.name(),
        })
    }

    /// Constructs the engine, tuning first if the parameter cache has no
    /// entry for this device and element type.
    pub fn new(context: &Context, device: &Device, problem: &ScanProblem) -> Result<Scan> {
        if !Self::type_supported(device, &problem.ty)? {
            return Err(Error::invalid_arg(format!(
                "{} is not a supported integral format on this device",
                problem.ty
            )));
        }
        let key = Self::make_key(device, problem)?;
        match cache::lookup::<ScanKey, ScanRecord>(ALGORITHM, VERSION, &key)? {
            Some(mut record) => {
                match Self::with_params(context, device, problem, &mut record, false) {
                    // A driver update can orphan the stored binary without
                    // changing the fingerprint; the tuned parameters are
                    // still good, so rebuild from source and refresh it.
                    Err(Error::Cache(_)) => {
                        let scan = Self::with_params(context, device, problem, &mut record, true)?;
                        cache::store(ALGORITHM, VERSION, &key, &record)?;
                        Ok(scan)
                    }
                    other => other,
                }
            }
            None => {
                problem.policy.check_enabled()?;
                let mut record = Self::tune(device, problem)?;
                cache::store(ALGORITHM, VERSION, &key, &record)?;
                Self::with_params(context, device, problem, &mut record, false)
            }
        }
    }

    /// Second construction phase, shared between the cached path and the
    /// tuning callbacks. With `tuning` set the program may be built from
    /// source and the fresh binary is written back into `params`.
    fn with_params(
        context: &Context,
        device: &Device,
        problem: &ScanProblem,
        params: &mut ScanRecord,
        tuning: bool,
    ) -> Result<Scan> {
        let element_size = problem.ty.size();
        let defines: [(&str, usize); 6] = [
            ("WARP_SIZE_MEM", params.warp_size_mem),
            ("WARP_SIZE_SCHEDULE", params.warp_size_schedule),
            ("REDUCE_WORK_GROUP_SIZE", params.reduce_work_group_size),
            ("SCAN_WORK_GROUP_SIZE", params.scan_work_group_size),
            ("SCAN_WORK_SCALE", params.scan_work_scale),
            ("SCAN_BLOCKS", params.scan_blocks),
        ];
        let mut string_defines: Vec<(&str, String)> = vec![("SCAN_T", problem.ty.name())];
        if problem.ty.length() == 3 {
            let padded = Type::new(problem.ty.base(), 4)?;
            string_defines.push(("SCAN_PAD_T", padded.name()));
        }

        let sums = Buffer::<u8>::builder()
            .context(context)
            .len(params.scan_blocks * element_size)
            .flags(MemFlags::new().read_write())
            .build()?;

        let program = program::build(
            context,
            device,
            "scan.cl",
            &defines,
            &string_defines,
            "",
            &mut params.program_binary,
            tuning,
        )?;

        let build_kernel = |name: &str| -> Result<KernelCore> {
            core::create_kernel(&program, name)
                .map_err(|err| Error::Internal(format!("error preparing kernels for scan: {}", err)))
        };
        let reduce_kernel = build_kernel("reduce")?;
        let scan_small_kernel = build_kernel("scanExclusiveSmall")?;
        let scan_small_kernel_offset = build_kernel("scanExclusiveSmallOffset")?;
        let scan_kernel = build_kernel("scanExclusive")?;

        core::set_kernel_arg(&reduce_kernel, 0, ArgVal::mem(sums.as_core()))?;
        core::set_kernel_arg(&scan_small_kernel, 0, ArgVal::mem(sums.as_core()))?;
        core::set_kernel_arg(&scan_small_kernel_offset, 0, ArgVal::mem(sums.as_core()))?;
        core::set_kernel_arg(&scan_kernel, 2, ArgVal::mem(sums.as_core()))?;

        Ok(Scan {
            reduce_work_group_size: params.reduce_work_group_size,
            scan_work_group_size: params.scan_work_group_size,
            scan_work_scale: params.scan_work_scale,
            max_blocks: params.scan_blocks,
            element_size,
            program,
            reduce_kernel,
            scan_small_kernel,
            scan_small_kernel_offset,
            scan_kernel,
            sums,
            event_callback: None,
        })
    }

    /// Registers a callback receiving every event the engine enqueues, in
    /// submission order. Useful for profiling the intermediate kernels.
    /// Note that this is not a completion callback: it runs during
    /// `enqueue`, generally before the events complete.
    pub fn set_event_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.event_callback = Some(Box::new(callback));
    }

    pub fn clear_event_callback(&mut self) {
        self.event_callback = None;
    }

    fn fire_event_callback(&mut self, event: &Event) {
        if let Some(ref mut callback) = self.event_callback {
            callback(event);
        }
    }

    /// Enqueues an exclusive scan of `elements` items from `input` into
    /// `output`, seeded with `offset` (zero if `None`).
    ///
    /// In-place operation (`input` == `output`) is supported; partially
    /// overlapping ranges are not. The buffers are only borrowed for the
    /// duration of the call but must stay valid until the returned event
    /// completes.
    pub fn enqueue<T: OclPrm>(
        &mut self,
        queue: &Queue,
        input: &Buffer<T>,
        output: &Buffer<T>,
        elements: usize,
        offset: Option<T>,
        wait: Option<&EventList>,
    ) -> Result<Event> {
        self.check_element_type::<T>()?;
        let offset_bytes = match offset {
            Some(value) => unsafe { core::util::into_bytes(value) },
            None => vec![0u8; self.element_size],
        };
        self.enqueue_raw(
            queue,
            input.as_core(),
            output.as_core(),
            elements,
            OffsetSpec::Host(offset_bytes),
            wait,
        )
    }

    /// Enqueues an exclusive scan seeded from `offset_buffer[offset_index]`.
    ///
    /// The offset buffer may alias the input or output buffer; the seed is
    /// read before any element of the output is written.
    pub fn enqueue_with_offset_buffer<T: OclPrm>(
        &mut self,
        queue: &Queue,
        input: &Buffer<T>,
        output: &Buffer<T>,
        elements: usize,
        offset_buffer: &Buffer<T>,
        offset_index: u32,
        wait: Option<&EventList>,
    ) -> Result<Event> {
        self.check_element_type::<T>()?;
        self.enqueue_raw(
            queue,
            input.as_core(),
            output.as_core(),
            elements,
            OffsetSpec::Buffer(offset_buffer.as_core(), offset_index),
            wait,
        )
    }

    fn check_element_type<T: OclPrm>(&self) -> Result<()> {
        if mem::size_of::<T>() != self.element_size {
            return Err(Error::invalid_arg(format!(
                "buffer element size {} does not match the problem element size {}",
                mem::size_of::<T>(),
                self.element_size
            )));
        }
        Ok(())
    }

    fn enqueue_raw(
        &mut self,
        queue: &Queue,
        input: &MemCore,
        output: &MemCore,
        elements: usize,
        offset: OffsetSpec,
        wait: Option<&EventList>,
    ) -> Result<Event> {
        let byte_len = elements
            .checked_mul(self.element_size)
            .ok_or_else(|| Error::invalid_arg("element count overflows"))?;
        if mem_size(input)? < byte_len || mem_size(output)? < byte_len {
            return Err(Error::invalid_arg("range out of buffer bounds"));
        }
        if !readable(input)? {
            return Err(Error::invalid_arg("input buffer is not readable"));
        }
        if !writable(output)? {
            return Err(Error::invalid_arg("output buffer is not writable"));
        }
        if let OffsetSpec::Buffer(buffer, index) = &offset {
            if mem_size(buffer)? < (*index as usize + 1) * self.element_size {
                return Err(Error::invalid_arg("offset index out of buffer bounds"));
            }
            if !readable(buffer)? {
                return Err(Error::invalid_arg("offset buffer is not readable"));
            }
        }
        if elements == 0 {
            return Err(Error::invalid_arg("elements is zero"));
        }

        let (block_size, all_blocks) = self.decompose(elements);
        debug_assert!(all_blocks >= 1 && all_blocks <= self.max_blocks);
        debug_assert!((all_blocks - 1) * block_size <= elements);
        debug_assert!(all_blocks * block_size >= elements);

        let block_size_arg = block_size as u32;
        let elements_arg = elements as u32;
        core::set_kernel_arg(&self.reduce_kernel, 1, ArgVal::mem(input))?;
        core::set_kernel_arg(&self.reduce_kernel, 2, ArgVal::scalar(&block_size_arg))?;
        core::set_kernel_arg(&self.scan_kernel, 0, ArgVal::mem(input))?;
        core::set_kernel_arg(&self.scan_kernel, 1, ArgVal::mem(output))?;
        core::set_kernel_arg(&self.scan_kernel, 3, ArgVal::scalar(&block_size_arg))?;
        core::set_kernel_arg(&self.scan_kernel, 4, ArgVal::scalar(&elements_arg))?;

        let use_offset_kernel = match offset {
            OffsetSpec::Buffer(buffer, index) => {
                core::set_kernel_arg(&self.scan_small_kernel_offset, 1, ArgVal::mem(buffer))?;
                core::set_kernel_arg(&self.scan_small_kernel_offset, 2, ArgVal::scalar(&index))?;
                true
            }
            OffsetSpec::Host(ref bytes) => {
                debug_assert_eq!(bytes.len(), self.element_size);
                let arg = unsafe {
                    ArgVal::from_raw(bytes.len(), bytes.as_ptr() as *const std::ffi::c_void, false)
                };
                core::set_kernel_arg(&self.scan_small_kernel, 1, arg)?;
                false
            }
        };

        let reduce_event = if all_blocks > 1 {
            let mut event = Event::empty();
            unsafe {
                core::enqueue_kernel(
                    queue.as_core(),
                    &self.reduce_kernel,
                    1,
                    None,
                    &[self.reduce_work_group_size * (all_blocks - 1), 1, 1],
                    Some([self.reduce_work_group_size, 1, 1]),
                    wait,
                    Some(&mut event),
                )?;
            }
            Some(event)
        } else {
            None
        };
        if let Some(ref event) = reduce_event {
            self.fire_event_callback(event);
        }

        let mut small_event = Event::empty();
        {
            let small_kernel = if use_offset_kernel {
                &self.scan_small_kernel_offset
            } else {
                &self.scan_small_kernel
            };
            let small_dims = [self.max_blocks / 2, 1, 1];
            unsafe {
                match reduce_event {
                    Some(ref event) => core::enqueue_kernel(
                        queue.as_core(),
                        small_kernel,
                        1,
                        None,
                        &small_dims,
                        Some(small_dims),
                        Some(event),
                        Some(&mut small_event),
                    )?,
                    None => core::enqueue_kernel(
                        queue.as_core(),
                        small_kernel,
                        1,
                        None,
                        &small_dims,
                        Some(small_dims),
                        wait,
                        Some(&mut small_event),
                    )?,
                }
            }
        }
        self.fire_event_callback(&small_event);

        let mut scan_event = Event::empty();
        unsafe {
            core::enqueue_kernel(
                queue.as_core(),
                &self.scan_kernel,
                1,
                None,
                &[self.scan_work_group_size * all_blocks, 1, 1],
                Some([self.scan_work_group_size, 1, 1]),
                Some(&small_event),
                Some(&mut scan_event),
            )?;
        }
        self.fire_event_callback(&scan_event);
        Ok(scan_event)
    }

    /// Splits `elements` into `(block_size, blocks)` with the block size a
    /// multiple of the largest tile any kernel consumes in one pass.
    fn decompose(&self, elements: usize) -> (usize, usize) {
        let tile_size = max(
            self.reduce_work_group_size,
            self.scan_work_scale * self.scan_work_group_size,
        );
        let block_size = util::round_up(elements, tile_size * self.max_blocks) / self.max_blocks;
        (block_size, util::div_ceil(elements, block_size))
    }

    // ----- Tuning ------------------------------------------------------

    fn tune_reduce_callback(
        device: &Device,
        problem: &ScanProblem,
        elements: usize,
        params: &ScanRecord,
    ) -> Result<(f64, f64)> {
        let (context, queue) = tune::profiling_queue(device)?;
        let element_size = problem.ty.size();
        let buffer = Buffer::<u8>::builder()
            .context(&context)
            .len(elements * element_size)
            .flags(MemFlags::new().read_write())
            .build()?;

        let mut params = params.clone();
        let scan = Self::with_params(&context, device, problem, &mut params, true)?;
        let block_size = util::round_up(elements, params.reduce_work_group_size * params.scan_blocks)
            / params.scan_blocks;
        let n_blocks = util::div_ceil(elements, block_size);
        if n_blocks <= 1 {
            return Err(Error::Internal("no blocks to operate on".into()));
        }

        let block_size_arg = block_size as u32;
        core::set_kernel_arg(&scan.reduce_kernel, 1, ArgVal::mem(buffer.as_core()))?;
        core::set_kernel_arg(&scan.reduce_kernel, 2, ArgVal::scalar(&block_size_arg))?;

        let gws = [params.reduce_work_group_size * (n_blocks - 1), 1, 1];
        let lws = [params.reduce_work_group_size, 1, 1];
        let mut event = Event::empty();
        unsafe {
            // Warm-up pass.
            core::enqueue_kernel(
                queue.as_core(),
                &scan.reduce_kernel,
                1,
                None,
                &gws,
                Some(lws),
                None::<&EventList>,
                None::<&mut Event>,
            )?;
            queue.finish()?;
            // Timing pass.
            core::enqueue_kernel(
                queue.as_core(),
                &scan.reduce_kernel,
                1,
                None,
                &gws,
                Some(lws),
                None::<&EventList>,
                Some(&mut event),
            )?;
            queue.finish()?;
        }
        event.wait_for()?;
        let elapsed = tune::profiled_seconds(&event)?;
        let rate = ((n_blocks - 1) * block_size) as f64 / elapsed;
        Ok((rate, rate))
    }

    fn tune_scan_callback(
        device: &Device,
        problem: &ScanProblem,
        elements: usize,
        params: &ScanRecord,
    ) -> Result<(f64, f64)> {
        let (context, queue) = tune::profiling_queue(device)?;
        let element_size = problem.ty.size();
        let buffer = Buffer::<u8>::builder()
            .context(&context)
            .len(elements * element_size)
            .flags(MemFlags::new().read_write())
            .build()?;

        let mut params = params.clone();
        let scan = Self::with_params(&context, device, problem, &mut params, true)?;
        let tile_size = params.scan_work_group_size * params.scan_work_scale;
        let block_size =
            util::round_up(elements, tile_size * params.scan_blocks) / params.scan_blocks;
        let n_blocks = util::div_ceil(elements, block_size);

        let block_size_arg = block_size as u32;
        let elements_arg = elements as u32;
        core::set_kernel_arg(&scan.scan_kernel, 0, ArgVal::mem(buffer.as_core()))?;
        core::set_kernel_arg(&scan.scan_kernel, 1, ArgVal::mem(buffer.as_core()))?;
        core::set_kernel_arg(&scan.scan_kernel, 3, ArgVal::scalar(&block_size_arg))?;
        core::set_kernel_arg(&scan.scan_kernel, 4, ArgVal::scalar(&elements_arg))?;

        let gws = [params.scan_work_group_size * n_blocks, 1, 1];
        let lws = [params.scan_work_group_size, 1, 1];
        let mut event = Event::empty();
        unsafe {
            core::enqueue_kernel(
                queue.as_core(),
                &scan.scan_kernel,
                1,
                None,
                &gws,
                Some(lws),
                None::<&EventList>,
                None::<&mut Event>,
            )?;
            queue.finish()?;
            core::enqueue_kernel(
                queue.as_core(),
                &scan.scan_kernel,
                1,
                None,
                &gws,
                Some(lws),
                None::<&EventList>,
                Some(&mut event),
            )?;
            queue.finish()?;
        }
        event.wait_for()?;
        let elapsed = tune::profiled_seconds(&event)?;
        let rate = elements as f64 / elapsed;
        Ok((rate, rate))
    }

    fn tune_blocks_callback(
        device: &Device,
        problem: &ScanProblem,
        elements: usize,
        params: &ScanRecord,
    ) -> Result<(f64, f64)> {
        let (context, queue) = tune::profiling_queue(device)?;
        let element_size = problem.ty.size();
        let buffer = Buffer::<u8>::builder()
            .context(&context)
            .len(elements * element_size)
            .flags(MemFlags::new().read_write())
            .build()?;

        let mut params = params.clone();
        let mut scan = Self::with_params(&context, device, problem, &mut params, true)?;
        let zero = vec![0u8; element_size];
        // Warm-up pass.
        scan.enqueue_raw(
            &queue,
            buffer.as_core(),
            buffer.as_core(),
            elements,
            OffsetSpec::Host(zero.clone()),
            None,
        )?;
        queue.finish()?;
        // Timing pass.
        let event = scan.enqueue_raw(
            &queue,
            buffer.as_core(),
            buffer.as_core(),
            elements,
            OffsetSpec::Host(zero),
            None,
        )?;
        queue.finish()?;
        event.wait_for()?;
        let elapsed = tune::profiled_seconds(&event)?;
        let rate = elements as f64 / elapsed;
        // Throughput levels off beyond some block count, while more blocks
        // hurt small problem sizes; require a 5% win to go higher.
        Ok((rate, rate * 1.05))
    }

    /// Runs the three tuning funnels for this problem and returns the
    /// winning record with its program binary captured.
    pub(crate) fn tune(device: &Device, problem: &ScanProblem) -> Result<ScanRecord> {
        let policy = &problem.policy;
        policy.log_start_algorithm(&format!(
            "scan for {} elements on {}",
            problem.ty,
            device.name()?
        ));

        let element_size = problem.ty.size();
        let max_work_group_size = util::max_work_group_size(device)?;
        let local_mem_elements = util::local_mem_size(device)? / element_size;
        // The small-scan kernel holds all block sums in local memory, and
        // its launch geometry needs a power of two.
        let max_blocks = max(
            2,
            util::round_down_power2(min(2 * max_work_group_size, local_mem_elements)),
        );
        // Some devices cannot actually deliver all the local memory they
        // advertise, so tune the block count upward from a safe start.
        let start_blocks = max(2, max_blocks / 2);

        let problem_sizes = [65536, 32 * 1024 * 1024 / element_size];
        let warp_size_mem = util::warp_size_mem(device)?;
        let warp_size_schedule = util::warp_size_schedule(device)?;

        let base = ScanRecord {
            warp_size_mem,
            warp_size_schedule,
            reduce_work_group_size: 1,
            scan_work_group_size: 1,
            scan_work_scale: 1,
            scan_blocks: start_blocks,
            program_binary: Vec::new(),
        };

        // Tune the reduce kernel.
        let mut sets = Vec::new();
        let mut wg = 1;
        while wg <= max_work_group_size {
            sets.push(ScanRecord { reduce_work_group_size: wg, ..base.clone() });
            wg *= 2;
        }
        let best = tune::tune_one(
            policy,
            &sets,
            &problem_sizes,
            |size, params| Self::tune_reduce_callback(device, problem, size, params),
            FUNNEL_RATIO,
        )?;
        let base = ScanRecord { reduce_work_group_size: best.reduce_work_group_size, ..base };

        // Tune the scan kernel. Work group size and work scale interact
        // through register pressure, so they are tuned jointly.
        let mut sets = Vec::new();
        let mut wg = 1;
        while wg <= max_work_group_size {
            let max_scale = min(local_mem_elements / wg, 16);
            let mut scale = 1;
            while scale <= max_scale {
                sets.push(ScanRecord {
                    scan_work_group_size: wg,
                    scan_work_scale: scale,
                    ..base.clone()
                });
                scale *= 2;
            }
            wg *= 2;
        }
        let best = tune::tune_one(
            policy,
            &sets,
            &problem_sizes,
            |size, params| Self::tune_scan_callback(device, problem, size, params),
            FUNNEL_RATIO,
        )?;
        let base = ScanRecord {
            scan_work_group_size: best.scan_work_group_size,
            scan_work_scale: best.scan_work_scale,
            ..base
        };

        // Tune the number of blocks.
        let mut sets = Vec::new();
        let mut blocks = 2;
        while blocks <= max_blocks {
            sets.push(ScanRecord { scan_blocks: blocks, ..base.clone() });
            blocks *= 2;
        }
        let best = tune::tune_one(
            policy,
            &sets,
            &problem_sizes,
            |size, params| Self::tune_blocks_callback(device, problem, size, params),
            FUNNEL_RATIO,
        )?;

        // Instantiate once more to capture the winning program binary.
        let mut record = best;
        let context = util::context_for_device(device)?;
        Self::with_params(&context, device, problem, &mut record, true)?;

        policy.log_end_algorithm();
        Ok(record)
    }

    pub(crate) fn tune_and_save(device: &Device, problem: &ScanProblem) -> Result<()> {
        let key = Self::make_key(device, problem)?;
        let record = Self::tune(device, problem)?;
        cache::store(ALGORITHM, VERSION, &key, &record)
    }

    pub(crate) fn key_fingerprint(device: &Device, problem: &ScanProblem) -> Result<String> {
        Ok(format!("{}:{:?}", ALGORITHM, Self::make_key(device, problem)?))
    }

    /// True if a cached parameter set exists and still initializes cleanly
    /// (the driver may have invalidated old binaries or kernels).
    pub(crate) fn is_cached(device: &Device, problem: &ScanProblem) -> Result<bool> {
        let context = util::context_for_device(device)?;
        let mut check = problem.clone();
        let mut policy = check.policy.clone();
        policy.set_enabled(false);
        check.set_tune_policy(policy);
        Ok(Scan::new(&context, device, &check).is_ok())
    }
}

pub(crate) fn mem_size(mem: &MemCore) -> Result<usize> {
    match core::get_mem_object_info(mem, MemInfo::Size)? {
        MemInfoResult::Size(size) => Ok(size),
        _ => Err(Error::Internal("unexpected mem info result".into())),
    }
}

fn mem_flags(mem: &MemCore) -> Result<MemFlags> {
    match core::get_mem_object_info(mem, MemInfo::Flags)? {
        MemInfoResult::Flags(flags) => Ok(flags),
        _ => Err(Error::Internal("unexpected mem info result".into())),
    }
}

pub(crate) fn readable(mem: &MemCore) -> Result<bool> {
    let flags = mem_flags(mem)?;
    Ok(flags.intersects(MemFlags::new().read_write() | MemFlags::new().read_only()))
}

pub(crate) fn writable(mem: &MemCore) -> Result<bool> {
    let flags = mem_flags(mem)?;
    Ok(flags.intersects(MemFlags::new().read_write() | MemFlags::new().write_only()))
}

pub(crate) fn read_write(mem: &MemCore) -> Result<bool> {
    Ok(mem_flags(mem)?.contains(MemFlags::new().read_write()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_geometry(reduce_wg: usize, scan_wg: usize, scale: usize, blocks: usize) -> impl Fn(usize) -> (usize, usize) {
        move |elements| {
            let tile = max(reduce_wg, scale * scan_wg);
            let block_size = util::round_up(elements, tile * blocks) / blocks;
            (block_size, util::div_ceil(elements, block_size))
        }
    }

    #[test]
    fn decomposition_postconditions() {
        let cases = [
            (64, 128, 4, 256),
            (1, 1, 1, 2),
            (256, 64, 8, 1024),
        ];
        let sizes = [
            1usize,
            128,
            128 * 256,
            128 * 256 + 1,
            (1 << 20) - 1,
            1_000_003,
        ];
        for &(rwg, swg, scale, blocks) in &cases {
            let geom = engine_geometry(rwg, swg, scale, blocks);
            let tile = max(rwg, scale * swg);
            for &n in &sizes {
                let (block_size, all_blocks) = geom(n);
                assert_eq!(block_size % tile, 0, "n={}", n);
                assert!(all_blocks >= 1 && all_blocks <= blocks, "n={}", n);
                assert!((all_blocks - 1) * block_size <= n, "n={}", n);
                assert!(all_blocks * block_size >= n, "n={}", n);
            }
        }
    }

    #[test]
    fn problem_rejects_non_integral_types() {
        use crate::types::BaseType;
        assert!(ScanProblem::new(Type::new(BaseType::Float, 1).unwrap()).is_err());
        assert!(ScanProblem::new(Type::new(BaseType::Double, 4).unwrap()).is_err());
        assert!(ScanProblem::new(Type::new(BaseType::Uint, 1).unwrap()).is_ok());
    }

    #[test]
    fn key_canonicalizes_signedness() {
        use crate::types::BaseType;
        let u = Type::new(BaseType::Uint, 1).unwrap();
        assert_eq!(u.canonical().name(), "int");
    }
}
