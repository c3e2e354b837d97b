//! Folding a device buffer to a single value under addition.
//!
//! Structured like the scan engine's first phase: one kernel reduces each
//! block of the input into an internal `sums` buffer, then a single
//! workgroup folds the block sums and writes the result at the requested
//! element index. A device-to-host form stages the result through an
//! internal one-element buffer and reads it back.

use std::cmp::{max, min};
use std::mem;

use ocl::core::{self, ArgVal, Kernel as KernelCore, Mem as MemCore, MemFlags};
use ocl::{Buffer, Context, Device, Event, EventList, OclPrm, Program, Queue};

use crate::cache::{self, sql_record, DeviceKey};
use crate::error::{Error, Result};
use crate::program;
use crate::scan::{mem_size, readable, writable};
use crate::tune::{self, TunePolicy, FUNNEL_RATIO};
use crate::types::Type;
use crate::util;

const ALGORITHM: &str = "reduce";
const VERSION: u32 = 1;

sql_record! {
    pub struct ReduceKey {
        pub platform_name: String,
        pub device_name: String,
        pub device_vendor_id: u32,
        pub driver_version: String,
        pub element_type: String,
    }
}

sql_record! {
    pub struct ReduceRecord {
        pub warp_size_mem: usize,
        pub warp_size_schedule: usize,
        pub reduce_work_group_size: usize,
        pub reduce_blocks: usize,
        pub program_binary: Vec<u8>,
    }
}

/// Describes a reduction problem.
#[derive(Debug, Clone)]
pub struct ReduceProblem {
    ty: Type,
    policy: TunePolicy,
}

impl ReduceProblem {
    pub fn new(ty: Type) -> Result<ReduceProblem> {
        if ty.is_void() {
            return Err(Error::invalid_arg("cannot reduce void elements"));
        }
        Ok(ReduceProblem { ty, policy: TunePolicy::default() })
    }

    pub fn element_type(&self) -> Type {
        self.ty
    }

    pub fn set_tune_policy(&mut self, policy: TunePolicy) {
        self.policy = policy;
    }
}

/// A reduction engine, specialized for one device and element type.
pub struct Reduce {
    reduce_work_group_size: usize,
    max_blocks: usize,
    element_size: usize,
    #[allow(dead_code)]
    program: Program,
    reduce_kernel: KernelCore,
    small_kernel: KernelCore,
    /// Kept alive for the kernels that have it bound as an argument.
    #[allow(dead_code)]
    sums: Buffer<u8>,
    /// Staging cell for the device-to-host form.
    out_cell: Buffer<u8>,
    event_callback: Option<Box<dyn FnMut(&Event) + Send>>,
}

impl Reduce {
    /// Whether `ty` can be reduced on `device`.
    pub fn type_supported(device: &Device, ty: &Type) -> Result<bool> {
        Ok(!ty.is_void() && ty.is_computable(device)? && ty.is_storable(device)?)
    }

    fn make_key(device: &Device, problem: &ReduceProblem) -> Result<ReduceKey> {
        let canon = problem.ty.canonical();
        let device_key = DeviceKey::for_device(device)?;
        Ok(ReduceKey {
            platform_name: device_key.platform_name,
            device_name: device_key.device_name,
            device_vendor_id: device_key.device_vendor_id,
            driver_version: device_key.driver_version,
            element_type: canon.name(),
        })
    }

    /// Constructs the engine, tuning first if the parameter cache has no
    /// entry for this device and element type.
    pub fn new(context: &Context, device: &Device, problem: &ReduceProblem) -> Result<Reduce> {
        if !Self::type_supported(device, &problem.ty)? {
            return Err(Error::invalid_arg(format!(
                "{} is not a supported format on this device",
                problem.ty
            )));
        }
        let key = Self::make_key(device, problem)?;
        match cache::lookup::<ReduceKey, ReduceRecord>(ALGORITHM, VERSION, &key)? {
            Some(mut record) => {
                match Self::with_params(context, device, problem, &mut record, false) {
                    // Stale cached binary: rebuild from source with the
                    // same parameters and refresh the stored copy.
                    Err(Error::Cache(_)) => {
                        let reduce =
                            Self::with_params(context, device, problem, &mut record, true)?;
                        cache::store(ALGORITHM, VERSION, &key, &record)?;
                        Ok(reduce)
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

    fn with_params(
        context: &Context,
        device: &Device,
        problem: &ReduceProblem,
        params: &mut ReduceRecord,
        tuning: bool,
    ) -> Result<Reduce> {
        let element_size = problem.ty.size();
        let defines: [(&str, usize); 4] = [
            ("WARP_SIZE_MEM", params.warp_size_mem),
            ("WARP_SIZE_SCHEDULE", params.warp_size_schedule),
            ("REDUCE_WORK_GROUP_SIZE", params.reduce_work_group_size),
            ("REDUCE_BLOCKS", params.reduce_blocks),
        ];
        let mut string_defines: Vec<(&str, String)> = vec![("REDUCE_T", problem.ty.name())];
        if problem.ty.length() == 3 {
            let padded = Type::new(problem.ty.base(), 4)?;
            string_defines.push(("REDUCE_PAD_T", padded.name()));
        }

        let sums = Buffer::<u8>::builder()
            .context(context)
            .len(params.reduce_blocks * element_size)
            .flags(MemFlags::new().read_write())
            .build()?;
        let out_cell = Buffer::<u8>::builder()
            .context(context)
            .len(element_size)
            .flags(MemFlags::new().read_write())
            .build()?;

        let program = program::build(
            context,
            device,
            "reduce.cl",
            &defines,
            &string_defines,
            "",
            &mut params.program_binary,
            tuning,
        )?;

        let build_kernel = |name: &str| -> Result<KernelCore> {
            core::create_kernel(&program, name).map_err(|err| {
                Error::Internal(format!("error preparing kernels for reduce: {}", err))
            })
        };
        let reduce_kernel = build_kernel("reduce")?;
        let small_kernel = build_kernel("reduceSmall")?;

        core::set_kernel_arg(&reduce_kernel, 0, ArgVal::mem(sums.as_core()))?;
        core::set_kernel_arg(&small_kernel, 2, ArgVal::mem(sums.as_core()))?;

        Ok(Reduce {
            reduce_work_group_size: params.reduce_work_group_size,
            max_blocks: params.reduce_blocks,
            element_size,
            program,
            reduce_kernel,
            small_kernel,
            sums,
            out_cell,
            event_callback: None,
        })
    }

    /// Registers a callback receiving every event the engine enqueues, in
    /// submission order. Not a completion callback.
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

    /// Enqueues a reduction of `elements` items of `input` starting at
    /// element index `first`; the result lands at element index
    /// `out_position` of `output`.
    pub fn enqueue<T: OclPrm>(
        &mut self,
        queue: &Queue,
        input: &Buffer<T>,
        output: &Buffer<T>,
        first: usize,
        elements: usize,
        out_position: usize,
        wait: Option<&EventList>,
    ) -> Result<Event> {
        self.check_element_type::<T>()?;
        self.enqueue_raw(queue, input.as_core(), output.as_core(), first, elements, out_position, wait)
    }

    /// Reduces on the device and copies the result back to the host,
    /// blocking until it is available.
    pub fn enqueue_to_host<T: OclPrm>(
        &mut self,
        queue: &Queue,
        input: &Buffer<T>,
        first: usize,
        elements: usize,
        wait: Option<&EventList>,
    ) -> Result<T> {
        self.check_element_type::<T>()?;
        let mut value = T::default();
        unsafe {
            self.enqueue_read(queue, input, first, elements, &mut value, true, wait)?;
        }
        Ok(value)
    }

    /// Reduces on the device and reads the result into `out`.
    ///
    /// # Safety
    ///
    /// With `blocking` false the read is asynchronous: `out` must remain
    /// valid and unobserved until the returned event completes.
    pub unsafe fn enqueue_read<T: OclPrm>(
        &mut self,
        queue: &Queue,
        input: &Buffer<T>,
        first: usize,
        elements: usize,
        out: &mut T,
        blocking: bool,
        wait: Option<&EventList>,
    ) -> Result<Event> {
        self.check_element_type::<T>()?;
        let out_cell = self.out_cell.as_core().clone();
        let device_event =
            self.enqueue_raw(queue, input.as_core(), &out_cell, first, elements, 0, wait)?;
        let mut read_event = Event::empty();
        let data = std::slice::from_raw_parts_mut(out as *mut T as *mut u8, self.element_size);
        core::enqueue_read_buffer(
            queue.as_core(),
            self.out_cell.as_core(),
            blocking,
            0,
            data,
            Some(&device_event),
            Some(&mut read_event),
        )?;
        self.fire_event_callback(&read_event);
        Ok(read_event)
    }

    fn enqueue_raw(
        &mut self,
        queue: &Queue,
        input: &MemCore,
        output: &MemCore,
        first: usize,
        elements: usize,
        out_position: usize,
        wait: Option<&EventList>,
    ) -> Result<Event> {
        if elements == 0 {
            return Err(Error::invalid_arg("elements is zero"));
        }
        let end = first
            .checked_add(elements)
            .and_then(|e| e.checked_mul(self.element_size))
            .ok_or_else(|| Error::invalid_arg("element range overflows"))?;
        if mem_size(input)? < end {
            return Err(Error::invalid_arg("input range out of buffer bounds"));
        }
        if mem_size(output)? < (out_position + 1) * self.element_size {
            return Err(Error::invalid_arg("output position out of buffer bounds"));
        }
        if !readable(input)? {
            return Err(Error::invalid_arg("input buffer is not readable"));
        }
        if !writable(output)? {
            return Err(Error::invalid_arg("output buffer is not writable"));
        }

        let (block_size, blocks) = self.decompose(elements);
        debug_assert!(blocks >= 1 && blocks <= self.max_blocks);

        let first_arg = first as u32;
        let block_size_arg = block_size as u32;
        let elements_arg = elements as u32;
        let blocks_arg = blocks as u32;
        let out_position_arg = out_position as u32;
        core::set_kernel_arg(&self.reduce_kernel, 1, ArgVal::mem(input))?;
        core::set_kernel_arg(&self.reduce_kernel, 2, ArgVal::scalar(&first_arg))?;
        core::set_kernel_arg(&self.reduce_kernel, 3, ArgVal::scalar(&block_size_arg))?;
        core::set_kernel_arg(&self.reduce_kernel, 4, ArgVal::scalar(&elements_arg))?;
        core::set_kernel_arg(&self.small_kernel, 0, ArgVal::mem(output))?;
        core::set_kernel_arg(&self.small_kernel, 1, ArgVal::scalar(&out_position_arg))?;
        core::set_kernel_arg(&self.small_kernel, 3, ArgVal::scalar(&blocks_arg))?;

        let mut reduce_event = Event::empty();
        let mut small_event = Event::empty();
        unsafe {
            core::enqueue_kernel(
                queue.as_core(),
                &self.reduce_kernel,
                1,
                None,
                &[self.reduce_work_group_size * blocks, 1, 1],
                Some([self.reduce_work_group_size, 1, 1]),
                wait,
                Some(&mut reduce_event),
            )?;
        }
        self.fire_event_callback(&reduce_event);
        unsafe {
            core::enqueue_kernel(
                queue.as_core(),
                &self.small_kernel,
                1,
                None,
                &[self.reduce_work_group_size, 1, 1],
                Some([self.reduce_work_group_size, 1, 1]),
                Some(&reduce_event),
                Some(&mut small_event),
            )?;
        }
        self.fire_event_callback(&small_event);
        Ok(small_event)
    }

    /// Splits `elements` into `(block_size, blocks)` with the block size a
    /// multiple of the reduce workgroup size.
    fn decompose(&self, elements: usize) -> (usize, usize) {
        let block_size = util::round_up(elements, self.reduce_work_group_size * self.max_blocks)
            / self.max_blocks;
        (block_size, util::div_ceil(elements, block_size))
    }

    // ----- Tuning ------------------------------------------------------

    fn tune_reduce_callback(
        device: &Device,
        problem: &ReduceProblem,
        elements: usize,
        params: &ReduceRecord,
    ) -> Result<(f64, f64)> {
        let (context, queue) = tune::profiling_queue(device)?;
        let element_size = problem.ty.size();
        let buffer = Buffer::<u8>::builder()
            .context(&context)
            .len(elements * element_size)
            .flags(MemFlags::new().read_write())
            .build()?;

        let mut params = params.clone();
        let reduce = Self::with_params(&context, device, problem, &mut params, true)?;
        let (block_size, blocks) = reduce.decompose(elements);

        let first_arg = 0u32;
        let block_size_arg = block_size as u32;
        let elements_arg = elements as u32;
        core::set_kernel_arg(&reduce.reduce_kernel, 1, ArgVal::mem(buffer.as_core()))?;
        core::set_kernel_arg(&reduce.reduce_kernel, 2, ArgVal::scalar(&first_arg))?;
        core::set_kernel_arg(&reduce.reduce_kernel, 3, ArgVal::scalar(&block_size_arg))?;
        core::set_kernel_arg(&reduce.reduce_kernel, 4, ArgVal::scalar(&elements_arg))?;

        let gws = [reduce.reduce_work_group_size * blocks, 1, 1];
        let lws = [reduce.reduce_work_group_size, 1, 1];
        let mut event = Event::empty();
        unsafe {
            core::enqueue_kernel(
                queue.as_core(),
                &reduce.reduce_kernel,
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
                &reduce.reduce_kernel,
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
        problem: &ReduceProblem,
        elements: usize,
        params: &ReduceRecord,
    ) -> Result<(f64, f64)> {
        let (context, queue) = tune::profiling_queue(device)?;
        let element_size = problem.ty.size();
        let buffer = Buffer::<u8>::builder()
            .context(&context)
            .len(elements * element_size)
            .flags(MemFlags::new().read_write())
            .build()?;

        let mut params = params.clone();
        let mut reduce = Self::with_params(&context, device, problem, &mut params, true)?;
        let out_cell = reduce.out_cell.as_core().clone();
        // Warm-up pass.
        reduce.enqueue_raw(&queue, buffer.as_core(), &out_cell, 0, elements, 0, None)?;
        queue.finish()?;
        // Timing pass.
        let event = reduce.enqueue_raw(&queue, buffer.as_core(), &out_cell, 0, elements, 0, None)?;
        queue.finish()?;
        event.wait_for()?;
        let elapsed = tune::profiled_seconds(&event)?;
        let rate = elements as f64 / elapsed;
        // More blocks only help large problems; demand a clear win.
        Ok((rate, rate * 1.05))
    }

    /// Runs the two tuning funnels for this problem and returns the
    /// winning record with its program binary captured.
    pub(crate) fn tune(device: &Device, problem: &ReduceProblem) -> Result<ReduceRecord> {
        let policy = &problem.policy;
        policy.log_start_algorithm(&format!(
            "reduce for {} elements on {}",
            problem.ty,
            device.name()?
        ));

        let element_size = problem.ty.size();
        let max_work_group_size = util::max_work_group_size(device)?;
        let local_mem_elements = util::local_mem_size(device)? / element_size;
        let max_blocks = max(
            2,
            util::round_down_power2(min(2 * max_work_group_size, local_mem_elements)),
        );
        let start_blocks = max(2, max_blocks / 2);

        let problem_sizes = [65536, 32 * 1024 * 1024 / element_size];
        let warp_size_mem = util::warp_size_mem(device)?;
        let warp_size_schedule = util::warp_size_schedule(device)?;

        let base = ReduceRecord {
            warp_size_mem,
            warp_size_schedule,
            reduce_work_group_size: 1,
            reduce_blocks: start_blocks,
            program_binary: Vec::new(),
        };

        // Tune the per-block reduction kernel.
        let mut sets = Vec::new();
        let mut wg = 1;
        while wg <= max_work_group_size {
            sets.push(ReduceRecord { reduce_work_group_size: wg, ..base.clone() });
            wg *= 2;
        }
        let best = tune::tune_one(
            policy,
            &sets,
            &problem_sizes,
            |size, params| Self::tune_reduce_callback(device, problem, size, params),
            FUNNEL_RATIO,
        )?;
        let base = ReduceRecord {
            reduce_work_group_size: best.reduce_work_group_size,
            ..base
        };

        // Tune the number of blocks.
        let mut sets = Vec::new();
        let mut blocks = 2;
        while blocks <= max_blocks {
            sets.push(ReduceRecord { reduce_blocks: blocks, ..base.clone() });
            blocks *= 2;
        }
        let best = tune::tune_one(
            policy,
            &sets,
            &problem_sizes,
            |size, params| Self::tune_blocks_callback(device, problem, size, params),
            FUNNEL_RATIO,
        )?;

        let mut record = best;
        let context = util::context_for_device(device)?;
        Self::with_params(&context, device, problem, &mut record, true)?;

        policy.log_end_algorithm();
        Ok(record)
    }

    pub(crate) fn tune_and_save(device: &Device, problem: &ReduceProblem) -> Result<()> {
        let key = Self::make_key(device, problem)?;
        let record = Self::tune(device, problem)?;
        cache::store(ALGORITHM, VERSION, &key, &record)
    }

    pub(crate) fn key_fingerprint(device: &Device, problem: &ReduceProblem) -> Result<String> {
        Ok(format!("{}:{:?}", ALGORITHM, Self::make_key(device, problem)?))
    }

    pub(crate) fn is_cached(device: &Device, problem: &ReduceProblem) -> Result<bool> {
        let context = util::context_for_device(device)?;
        let mut check = problem.clone();
        let mut policy = check.policy.clone();
        policy.set_enabled(false);
        check.set_tune_policy(policy);
        Ok(Reduce::new(&context, device, &check).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BaseType;

    #[test]
    fn problem_rejects_void() {
        assert!(ReduceProblem::new(Type::default()).is_err());
        assert!(ReduceProblem::new(Type::new(BaseType::Short, 1).unwrap()).is_ok());
        assert!(ReduceProblem::new(Type::new(BaseType::Float, 4).unwrap()).is_ok());
    }

    #[test]
    fn decomposition_covers_range() {
        for &(wg, max_blocks) in &[(64usize, 256usize), (1, 2), (512, 1024)] {
            for &n in &[1usize, 63, 64, 64 * 256, 64 * 256 + 1, 999_983] {
                let block_size = util::round_up(n, wg * max_blocks) / max_blocks;
                let blocks = util::div_ceil(n, block_size);
                assert_eq!(block_size % wg, 0);
                assert!(blocks >= 1 && blocks <= max_blocks);
                assert!(blocks * block_size >= n);
                assert!((blocks - 1) * block_size <= n);
            }
        }
    }
}
