//! Stable LSB radix sort of key/value pairs.
//!
//! Each digit pass runs three kernels: a per-block histogram reduction, a
//! single-workgroup exclusive scan of the histogram (digit-major, so the
//! scanned values are global starting positions), and a scatter in which
//! slices of work items cooperatively partition their block into the radix
//! streams. Passes ping-pong between the caller's buffers and temporaries;
//! an odd pass count ends with a copy back so the caller always finds the
//! sorted data in place.

use std::cmp::max;
use std::mem;

use ocl::core::{
    self, ArgVal, ClWaitListPtr, Kernel as KernelCore, Mem as MemCore, MemFlags,
};
use ocl::{Buffer, Context, Device, Event, EventList, OclPrm, Program, Queue};

use crate::cache::{self, sql_record, DeviceKey};
use crate::error::{Error, Result};
use crate::program;
use crate::scan::{mem_size, read_write};
use crate::tune::{self, TunePolicy, FUNNEL_RATIO};
use crate::types::Type;
use crate::util;

const ALGORITHM: &str = "radixsort";
const VERSION: u32 = 2;

sql_record! {
    pub struct RadixsortKey {
        pub platform_name: String,
        pub device_name: String,
        pub device_vendor_id: u32,
        pub driver_version: String,
        pub key_type: String,
        pub value_size: usize,
    }
}

sql_record! {
    pub struct RadixsortRecord {
        pub warp_size: usize,
        pub reduce_work_group_size: usize,
        pub scan_work_group_size: usize,
        pub scatter_work_group_size: usize,
        pub scatter_work_scale: usize,
        pub scan_blocks: usize,
        pub radix_bits: u32,
        pub program_binary: Vec<u8>,
    }
}

/// Describes a radix-sort problem: the key type, an optional value type and
/// the tuning policy.
#[derive(Debug, Clone)]
pub struct RadixsortProblem {
    key_type: Type,
    value_type: Type,
    policy: TunePolicy,
}

impl RadixsortProblem {
    /// Creates a problem sorting `key_type` keys carrying `value_type`
    /// payloads. Pass `Type::default()` (void) for a keys-only sort, or
    /// use [`RadixsortProblem::keys_only`].
    pub fn new(key_type: Type, value_type: Type) -> Result<RadixsortProblem> {
        if !key_type.is_integral() || key_type.is_signed() || key_type.length() != 1 {
            return Err(Error::invalid_arg(
                "sort keys must be unsigned integral scalars",
            ));
        }
        Ok(RadixsortProblem {
            key_type,
            value_type,
            policy: TunePolicy::default(),
        })
    }

    pub fn keys_only(key_type: Type) -> Result<RadixsortProblem> {
        RadixsortProblem::new(key_type, Type::default())
    }

    pub fn key_type(&self) -> Type {
        self.key_type
    }

    pub fn value_type(&self) -> Type {
        self.value_type
    }

    pub fn set_tune_policy(&mut self, policy: TunePolicy) {
        self.policy = policy;
    }
}

/// A stable radix-sort engine, specialized for one device, key type and
/// value type.
pub struct RadixSort {
    reduce_work_group_size: usize,
    scan_work_group_size: usize,
    scatter_work_group_size: usize,
    scatter_work_scale: usize,
    /// Number of work items that cooperate on one block in the scatter.
    scatter_slice: usize,
    max_blocks: usize,
    key_size: usize,
    value_size: usize,
    radix_bits: u32,
    #[allow(dead_code)]
    program: Program,
    reduce_kernel: KernelCore,
    scan_kernel: KernelCore,
    scatter_kernel: KernelCore,
    /// Per-(block, digit) counts, `max_blocks * radix` entries. Kept alive
    /// for the kernels that have it bound as an argument.
    #[allow(dead_code)]
    histogram: Buffer<u32>,
    tmp_keys: Option<MemCore>,
    tmp_values: Option<MemCore>,
    event_callback: Option<Box<dyn FnMut(&Event) + Send>>,
}

impl RadixSort {
    /// Whether `key_type` can key a sort on `device`.
    pub fn key_type_supported(device: &Device, key_type: &Type) -> Result<bool> {
        Ok(key_type.is_integral()
            && !key_type.is_signed()
            && key_type.length() == 1
            && key_type.is_computable(device)?
            && key_type.is_storable(device)?)
    }

    /// Whether `value_type` can ride along on `device`.
    pub fn value_type_supported(device: &Device, value_type: &Type) -> Result<bool> {
        Ok(value_type.is_void() || value_type.is_storable(device)?)
    }

    fn make_key(device: &Device, problem: &RadixsortProblem) -> Result<RadixsortKey> {
        let device_key = DeviceKey::for_device(device)?;
        Ok(RadixsortKey {
            platform_name: device_key.platform_name,
            device_name: device_key.device_name,
            device_vendor_id: device_key.device_vendor_id,
            driver_version: device_key.driver_version,
            key_type: problem.key_type.name(),
            // Only the footprint matters to the kernels; value types of
            // equal size share an entry.
            value_size: problem.value_type.size(),
        })
    }

    /// Constructs the engine, tuning first if the parameter cache has no
    /// entry for this device and problem shape.
    pub fn new(context: &Context, device: &Device, problem: &RadixsortProblem) -> Result<RadixSort> {
        if !Self::key_type_supported(device, &problem.key_type)? {
            return Err(Error::invalid_arg("key type is not valid on this device"));
        }
        if !Self::value_type_supported(device, &problem.value_type)? {
            return Err(Error::invalid_arg("value type is not valid on this device"));
        }
        let key = Self::make_key(device, problem)?;
        match cache::lookup::<RadixsortKey, RadixsortRecord>(ALGORITHM, VERSION, &key)? {
            Some(mut record) => {
                match Self::with_params(context, device, problem, &mut record, false) {
                    // Stale cached binary: rebuild from source with the
                    // same parameters and refresh the stored copy.
                    Err(Error::Cache(_)) => {
                        let sort = Self::with_params(context, device, problem, &mut record, true)?;
                        cache::store(ALGORITHM, VERSION, &key, &record)?;
                        Ok(sort)
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
        problem: &RadixsortProblem,
        params: &mut RadixsortRecord,
        tuning: bool,
    ) -> Result<RadixSort> {
        let radix = 1usize << params.radix_bits;
        let scatter_slice = max(params.warp_size, radix);
        let key_size = problem.key_type.size();
        let value_size = problem.value_type.size();

        let defines: [(&str, usize); 8] = [
            ("WARP_SIZE", params.warp_size),
            ("REDUCE_WORK_GROUP_SIZE", params.reduce_work_group_size),
            ("SCAN_WORK_GROUP_SIZE", params.scan_work_group_size),
            ("SCATTER_WORK_GROUP_SIZE", params.scatter_work_group_size),
            ("SCATTER_WORK_SCALE", params.scatter_work_scale),
            ("SCATTER_SLICE", scatter_slice),
            ("SCAN_BLOCKS", params.scan_blocks),
            ("RADIX_BITS", params.radix_bits as usize),
        ];
        let mut string_defines: Vec<(&str, String)> = vec![("KEY_T", problem.key_type.name())];
        if !problem.value_type.is_void() {
            string_defines.push(("VALUE_T", problem.value_type.name()));
        }

        let histogram = Buffer::<u32>::builder()
            .context(context)
            .len(params.scan_blocks * radix)
            .flags(MemFlags::new().read_write())
            .build()?;

        let program = program::build(
            context,
            device,
            "radixsort.cl",
            &defines,
            &string_defines,
            "",
            &mut params.program_binary,
            tuning,
        )?;

        let build_kernel = |name: &str| -> Result<KernelCore> {
            core::create_kernel(&program, name).map_err(|err| {
                Error::Internal(format!("error preparing kernels for radixsort: {}", err))
            })
        };
        let reduce_kernel = build_kernel("radixsortReduce")?;
        let scan_kernel = build_kernel("radixsortScan")?;
        let scatter_kernel = build_kernel("radixsortScatter")?;

        core::set_kernel_arg(&reduce_kernel, 0, ArgVal::mem(histogram.as_core()))?;
        core::set_kernel_arg(&scan_kernel, 0, ArgVal::mem(histogram.as_core()))?;
        core::set_kernel_arg(&scatter_kernel, 2, ArgVal::mem(histogram.as_core()))?;

        Ok(RadixSort {
            reduce_work_group_size: params.reduce_work_group_size,
            scan_work_group_size: params.scan_work_group_size,
            scatter_work_group_size: params.scatter_work_group_size,
            scatter_work_scale: params.scatter_work_scale,
            scatter_slice,
            max_blocks: params.scan_blocks,
            key_size,
            value_size,
            radix_bits: params.radix_bits,
            program,
            reduce_kernel,
            scan_kernel,
            scatter_kernel,
            histogram,
            tmp_keys: None,
            tmp_values: None,
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

    /// Provides ping-pong buffers reused by every subsequent `enqueue`.
    ///
    /// The engine holds references for its lifetime or until replaced.
    /// Buffers smaller than a call needs are ignored for that call in
    /// favour of a one-shot allocation.
    pub fn set_temporary_buffers<K: OclPrm, V: OclPrm>(
        &mut self,
        keys: Option<&Buffer<K>>,
        values: Option<&Buffer<V>>,
    ) {
        self.tmp_keys = keys.map(|b| b.as_core().clone());
        self.tmp_values = values.map(|b| b.as_core().clone());
    }

    fn tile_size(&self) -> usize {
        max(
            self.reduce_work_group_size,
            self.scatter_work_scale * self.scatter_work_group_size,
        )
    }

    fn block_size(&self, elements: usize) -> usize {
        let tile = self.tile_size();
        util::div_ceil(elements, tile * self.max_blocks) * tile
    }

    fn blocks(&self, elements: usize, len: usize) -> usize {
        let slices_per_group = self.scatter_work_group_size / self.scatter_slice;
        let blocks = util::round_up(util::div_ceil(elements, len), slices_per_group);
        debug_assert!(blocks <= self.max_blocks);
        blocks
    }

    /// Sorts keys only. The engine must have been constructed with a void
    /// value type.
    pub fn enqueue_keys<K: OclPrm>(
        &mut self,
        queue: &Queue,
        keys: &Buffer<K>,
        elements: usize,
        max_bits: u32,
        wait: Option<&EventList>,
    ) -> Result<Event> {
        if self.value_size != 0 {
            return Err(Error::invalid_arg(
                "this sort carries values; use enqueue instead",
            ));
        }
        self.check_key_type::<K>()?;
        self.enqueue_raw(queue, keys.as_core(), None, elements, max_bits, wait)
    }

    /// Sorts key/value pairs in place.
    ///
    /// Both buffers must be read-write; they are borrowed only for the
    /// duration of the call but must stay valid until the returned event
    /// completes.
    pub fn enqueue<K: OclPrm, V: OclPrm>(
        &mut self,
        queue: &Queue,
        keys: &Buffer<K>,
        values: &Buffer<V>,
        elements: usize,
        max_bits: u32,
        wait: Option<&EventList>,
    ) -> Result<Event> {
        if self.value_size == 0 {
            return Err(Error::invalid_arg(
                "this sort is keys-only; use enqueue_keys instead",
            ));
        }
        self.check_key_type::<K>()?;
        if mem::size_of::<V>() != self.value_size {
            return Err(Error::invalid_arg(format!(
                "value size {} does not match the problem value size {}",
                mem::size_of::<V>(),
                self.value_size
            )));
        }
        self.enqueue_raw(
            queue,
            keys.as_core(),
            Some(values.as_core()),
            elements,
            max_bits,
            wait,
        )
    }

    fn check_key_type<K: OclPrm>(&self) -> Result<()> {
        if mem::size_of::<K>() != self.key_size {
            return Err(Error::invalid_arg(format!(
                "key size {} does not match the problem key size {}",
                mem::size_of::<K>(),
                self.key_size
            )));
        }
        Ok(())
    }

    fn enqueue_raw(
        &mut self,
        queue: &Queue,
        keys: &MemCore,
        values: Option<&MemCore>,
        elements: usize,
        max_bits: u32,
        wait: Option<&EventList>,
    ) -> Result<Event> {
        let key_bytes = elements
            .checked_mul(self.key_size)
            .ok_or_else(|| Error::invalid_arg("element count overflows"))?;
        if mem_size(keys)? < key_bytes {
            return Err(Error::invalid_arg("range out of buffer bounds for keys"));
        }
        if !read_write(keys)? {
            return Err(Error::invalid_arg("keys buffer is not read-write"));
        }
        let value_bytes = elements * self.value_size;
        if let Some(values) = values {
            if mem_size(values)? < value_bytes {
                return Err(Error::invalid_arg("range out of buffer bounds for values"));
            }
            if !read_write(values)? {
                return Err(Error::invalid_arg("values buffer is not read-write"));
            }
        }
        if elements == 0 {
            return Err(Error::invalid_arg("elements is zero"));
        }
        let key_bits = 8 * self.key_size as u32;
        let max_bits = match max_bits {
            0 => key_bits,
            bits if bits > key_bits => {
                return Err(Error::invalid_arg("maxBits is too large"));
            }
            bits => bits,
        };

        let context = queue.context();

        // Reuse the caller-provided temporaries when they are big enough,
        // otherwise fall back to a one-shot allocation for this call.
        let reusable = |mem: &Option<MemCore>, needed: usize| -> Result<Option<MemCore>> {
            match mem {
                Some(mem) => {
                    if mem_size(mem)? >= needed {
                        Ok(Some(mem.clone()))
                    } else {
                        Ok(None)
                    }
                }
                None => Ok(None),
            }
        };
        let tmp_keys: MemCore = match reusable(&self.tmp_keys, key_bytes)? {
            Some(mem) => mem,
            None => Buffer::<u8>::builder()
                .context(&context)
                .len(key_bytes)
                .flags(MemFlags::new().read_write())
                .build()?
                .as_core()
                .clone(),
        };
        let tmp_values: Option<MemCore> = if values.is_some() {
            Some(match reusable(&self.tmp_values, value_bytes)? {
                Some(mem) => mem,
                None => Buffer::<u8>::builder()
                    .context(&context)
                    .len(value_bytes)
                    .flags(MemFlags::new().read_write())
                    .build()?
                    .as_core()
                    .clone(),
            })
        } else {
            None
        };

        let len = self.block_size(elements);
        let blocks = self.blocks(elements, len);
        debug_assert!(blocks <= self.max_blocks);

        let mut cur_keys = keys.clone();
        let mut cur_values = values.cloned();
        let mut next_keys = tmp_keys;
        let mut next_values = tmp_values;

        let mut last: Option<Event> = None;
        let mut passes = 0u32;
        let mut first_bit = 0u32;
        while first_bit < max_bits {
            let reduce_event = match last {
                Some(ref prev) => {
                    self.enqueue_reduce(queue, &cur_keys, len, elements, first_bit, Some(prev))?
                }
                None => self.enqueue_reduce(queue, &cur_keys, len, elements, first_bit, wait)?,
            };
            let scan_event = self.enqueue_scan(queue, blocks, Some(&reduce_event))?;
            let scatter_event = self.enqueue_scatter(
                queue,
                &next_keys,
                next_values.as_ref(),
                &cur_keys,
                cur_values.as_ref(),
                len,
                elements,
                first_bit,
                Some(&scan_event),
            )?;
            last = Some(scatter_event);
            mem::swap(&mut cur_keys, &mut next_keys);
            mem::swap(&mut cur_values, &mut next_values);
            passes += 1;
            first_bit += self.radix_bits;
        }

        let mut last = last.expect("at least one digit pass runs");
        if passes % 2 == 1 {
            // The sorted data sits in the temporaries; copy it home. The
            // copies do not strictly need to be serialized, but it keeps
            // the event management simple.
            let mut copy_event = Event::empty();
            core::enqueue_copy_buffer::<u8, _, _, _>(
                queue.as_core(),
                &cur_keys,
                &next_keys,
                0,
                0,
                key_bytes,
                Some(&last),
                Some(&mut copy_event),
            )?;
            self.fire_event_callback(&copy_event);
            last = copy_event;
            if let (Some(src), Some(dst)) = (cur_values.as_ref(), next_values.as_ref()) {
                let mut copy_event = Event::empty();
                core::enqueue_copy_buffer::<u8, _, _, _>(
                    queue.as_core(),
                    src,
                    dst,
                    0,
                    0,
                    value_bytes,
                    Some(&last),
                    Some(&mut copy_event),
                )?;
                self.fire_event_callback(&copy_event);
                last = copy_event;
            }
        }
        Ok(last)
    }

    fn enqueue_reduce<Ewl: ClWaitListPtr>(
        &mut self,
        queue: &Queue,
        keys: &MemCore,
        len: usize,
        elements: usize,
        first_bit: u32,
        wait: Option<Ewl>,
    ) -> Result<Event> {
        let len_arg = len as u32;
        let elements_arg = elements as u32;
        core::set_kernel_arg(&self.reduce_kernel, 1, ArgVal::mem(keys))?;
        core::set_kernel_arg(&self.reduce_kernel, 2, ArgVal::scalar(&len_arg))?;
        core::set_kernel_arg(&self.reduce_kernel, 3, ArgVal::scalar(&elements_arg))?;
        core::set_kernel_arg(&self.reduce_kernel, 4, ArgVal::scalar(&first_bit))?;
        let blocks = self.blocks(elements, len);
        let mut event = Event::empty();
        unsafe {
            core::enqueue_kernel(
                queue.as_core(),
                &self.reduce_kernel,
                1,
                None,
                &[self.reduce_work_group_size * blocks, 1, 1],
                Some([self.reduce_work_group_size, 1, 1]),
                wait,
                Some(&mut event),
            )?;
        }
        self.fire_event_callback(&event);
        Ok(event)
    }

    fn enqueue_scan<Ewl: ClWaitListPtr>(
        &mut self,
        queue: &Queue,
        blocks: usize,
        wait: Option<Ewl>,
    ) -> Result<Event> {
        let blocks_arg = blocks as u32;
        core::set_kernel_arg(&self.scan_kernel, 1, ArgVal::scalar(&blocks_arg))?;
        let mut event = Event::empty();
        unsafe {
            core::enqueue_kernel(
                queue.as_core(),
                &self.scan_kernel,
                1,
                None,
                &[self.scan_work_group_size, 1, 1],
                Some([self.scan_work_group_size, 1, 1]),
                wait,
                Some(&mut event),
            )?;
        }
        self.fire_event_callback(&event);
        Ok(event)
    }

    #[allow(clippy::too_many_arguments)]
    fn enqueue_scatter<Ewl: ClWaitListPtr>(
        &mut self,
        queue: &Queue,
        out_keys: &MemCore,
        out_values: Option<&MemCore>,
        in_keys: &MemCore,
        in_values: Option<&MemCore>,
        len: usize,
        elements: usize,
        first_bit: u32,
        wait: Option<Ewl>,
    ) -> Result<Event> {
        let len_arg = len as u32;
        let elements_arg = elements as u32;
        core::set_kernel_arg(&self.scatter_kernel, 0, ArgVal::mem(out_keys))?;
        core::set_kernel_arg(&self.scatter_kernel, 1, ArgVal::mem(in_keys))?;
        core::set_kernel_arg(&self.scatter_kernel, 3, ArgVal::scalar(&len_arg))?;
        core::set_kernel_arg(&self.scatter_kernel, 4, ArgVal::scalar(&elements_arg))?;
        core::set_kernel_arg(&self.scatter_kernel, 5, ArgVal::scalar(&first_bit))?;
        if self.value_size != 0 {
            let out_values =
                out_values.ok_or_else(|| Error::Internal("missing value temporaries".into()))?;
            let in_values =
                in_values.ok_or_else(|| Error::Internal("missing value temporaries".into()))?;
            core::set_kernel_arg(&self.scatter_kernel, 6, ArgVal::mem(out_values))?;
            core::set_kernel_arg(&self.scatter_kernel, 7, ArgVal::mem(in_values))?;
        }
        let blocks = self.blocks(elements, len);
        let slices_per_group = self.scatter_work_group_size / self.scatter_slice;
        debug_assert_eq!(blocks % slices_per_group, 0);
        let work_groups = blocks / slices_per_group;
        let mut event = Event::empty();
        unsafe {
            core::enqueue_kernel(
                queue.as_core(),
                &self.scatter_kernel,
                1,
                None,
                &[self.scatter_work_group_size * work_groups, 1, 1],
                Some([self.scatter_work_group_size, 1, 1]),
                wait,
                Some(&mut event),
            )?;
        }
        self.fire_event_callback(&event);
        Ok(event)
    }

    // ----- Tuning ------------------------------------------------------

    /// Uploads `size` bytes of deterministic pseudo-random data.
    fn make_random_buffer(context: &Context, queue: &Queue, size: usize) -> Result<Buffer<u8>> {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};
        let mut rng = SmallRng::seed_from_u64(0x5eed);
        let data: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
        let buffer = Buffer::<u8>::builder()
            .context(context)
            .len(size)
            .flags(MemFlags::new().read_write())
            .build()?;
        buffer.write(&data).queue(queue).enq()?;
        Ok(buffer)
    }

    fn tune_reduce_callback(
        device: &Device,
        problem: &RadixsortProblem,
        elements: usize,
        params: &RadixsortRecord,
    ) -> Result<(f64, f64)> {
        let (context, queue) = tune::profiling_queue(device)?;
        let key_buffer =
            Self::make_random_buffer(&context, &queue, elements * problem.key_type.size())?;

        let mut params = params.clone();
        let mut sort = Self::with_params(&context, device, problem, &mut params, true)?;
        let len = sort.block_size(elements);
        // Warm-up pass.
        sort.enqueue_reduce(&queue, key_buffer.as_core(), len, elements, 0, None::<&EventList>)?;
        queue.finish()?;
        // Timing pass.
        let event =
            sort.enqueue_reduce(&queue, key_buffer.as_core(), len, elements, 0, None::<&EventList>)?;
        queue.finish()?;
        event.wait_for()?;
        let elapsed = tune::profiled_seconds(&event)?;
        let rate = elements as f64 / elapsed;
        Ok((rate, rate))
    }

    fn tune_scatter_callback(
        device: &Device,
        problem: &RadixsortProblem,
        elements: usize,
        params: &RadixsortRecord,
    ) -> Result<(f64, f64)> {
        let (context, queue) = tune::profiling_queue(device)?;
        let key_size = problem.key_type.size();
        let value_size = problem.value_type.size();
        let key_buffer = Self::make_random_buffer(&context, &queue, elements * key_size)?;
        let out_keys = Buffer::<u8>::builder()
            .context(&context)
            .len(elements * key_size)
            .flags(MemFlags::new().read_write())
            .build()?;
        let value_buffers = if value_size != 0 {
            let values = Self::make_random_buffer(&context, &queue, elements * value_size)?;
            let out_values = Buffer::<u8>::builder()
                .context(&context)
                .len(elements * value_size)
                .flags(MemFlags::new().read_write())
                .build()?;
            Some((values, out_values))
        } else {
            None
        };

        let mut params = params.clone();
        let mut sort = Self::with_params(&context, device, problem, &mut params, true)?;
        let len = sort.block_size(elements);
        let blocks = sort.blocks(elements, len);

        // Prepare a scanned histogram so the scatter writes real positions.
        sort.enqueue_reduce(&queue, key_buffer.as_core(), len, elements, 0, None::<&EventList>)?;
        sort.enqueue_scan(&queue, blocks, None::<&EventList>)?;

        let in_values = value_buffers.as_ref().map(|(v, _)| v.as_core().clone());
        let out_values = value_buffers.as_ref().map(|(_, o)| o.as_core().clone());
        // Warm-up pass.
        sort.enqueue_scatter(
            &queue,
            out_keys.as_core(),
            out_values.as_ref(),
            key_buffer.as_core(),
            in_values.as_ref(),
            len,
            elements,
            0,
            None::<&EventList>,
        )?;
        queue.finish()?;
        // Timing pass.
        let event = sort.enqueue_scatter(
            &queue,
            out_keys.as_core(),
            out_values.as_ref(),
            key_buffer.as_core(),
            in_values.as_ref(),
            len,
            elements,
            0,
            None::<&EventList>,
        )?;
        queue.finish()?;
        event.wait_for()?;
        let elapsed = tune::profiled_seconds(&event)?;
        let rate = elements as f64 / elapsed;
        Ok((rate, rate))
    }

    fn tune_blocks_callback(
        device: &Device,
        problem: &RadixsortProblem,
        elements: usize,
        params: &RadixsortRecord,
    ) -> Result<(f64, f64)> {
        let (context, queue) = tune::profiling_queue(device)?;
        let key_size = problem.key_type.size();
        let value_size = problem.value_type.size();
        let key_buffer = Self::make_random_buffer(&context, &queue, elements * key_size)?;
        let out_keys = Buffer::<u8>::builder()
            .context(&context)
            .len(elements * key_size)
            .flags(MemFlags::new().read_write())
            .build()?;
        let value_buffers = if value_size != 0 {
            let values = Self::make_random_buffer(&context, &queue, elements * value_size)?;
            let out_values = Buffer::<u8>::builder()
                .context(&context)
                .len(elements * value_size)
                .flags(MemFlags::new().read_write())
                .build()?;
            Some((values, out_values))
        } else {
            None
        };

        let mut params = params.clone();
        let mut sort = Self::with_params(&context, device, problem, &mut params, true)?;
        let len = sort.block_size(elements);
        let blocks = sort.blocks(elements, len);
        let in_values = value_buffers.as_ref().map(|(v, _)| v.as_core().clone());
        let out_values = value_buffers.as_ref().map(|(_, o)| o.as_core().clone());

        // One full warm-up pass, then a measured pass over the whole
        // reduce/scan/scatter chain.
        let mut first_event = None;
        let mut last_event = None;
        for _ in 0..2 {
            let reduce_event = sort.enqueue_reduce(
                &queue,
                key_buffer.as_core(),
                len,
                elements,
                0,
                None::<&EventList>,
            )?;
            sort.enqueue_scan(&queue, blocks, None::<&EventList>)?;
            let scatter_event = sort.enqueue_scatter(
                &queue,
                out_keys.as_core(),
                out_values.as_ref(),
                key_buffer.as_core(),
                in_values.as_ref(),
                len,
                elements,
                0,
                None::<&EventList>,
            )?;
            queue.finish()?;
            first_event = Some(reduce_event);
            last_event = Some(scatter_event);
        }
        let first_event = first_event.expect("two passes ran");
        let last_event = last_event.expect("two passes ran");
        first_event.wait_for()?;
        last_event.wait_for()?;

        use ocl::core::ProfilingInfo;
        let start = first_event.profiling_info(ProfilingInfo::Start)?.time()?;
        let end = last_event.profiling_info(ProfilingInfo::End)?.time()?;
        let elapsed = (end.saturating_sub(start)) as f64 * 1e-9;
        let rate = elements as f64 / elapsed;
        // Fewer blocks win on small problem sizes; only take more for a
        // real improvement.
        Ok((rate, rate * 1.05))
    }

    /// Runs the three tuning funnels for this problem and returns the
    /// winning record with its program binary captured.
    pub(crate) fn tune(device: &Device, problem: &RadixsortProblem) -> Result<RadixsortRecord> {
        let policy = &problem.policy;
        policy.log_start_algorithm(&format!(
            "radixsort for {} keys and {} byte values on {}",
            problem.key_type,
            problem.value_type.size(),
            device.name()?
        ));

        let key_size = problem.key_type.size();
        let value_size = problem.value_type.size();
        // Cap the large problem size so keys, values and temporaries fit
        // comfortably in global memory.
        let data_size = util::global_mem_size(device)? / 8;
        let large = data_size / (key_size + value_size).max(1);
        let problem_sizes = [65536, max(large, 65536)];

        let max_work_group_size = util::max_work_group_size(device)?;
        let warp_size = util::warp_size_mem(device)?;

        let radix_bits = 4u32;
        let radix = 1usize << radix_bits;
        if max_work_group_size < radix {
            return Err(Error::Tune("device work groups are too small".into()));
        }
        let scatter_slice = max(warp_size, radix);
        let max_blocks = max(
            2,
            (util::local_mem_size(device)? / radix).saturating_sub(1) / mem::size_of::<u32>(),
        );

        let base = RadixsortRecord {
            warp_size,
            reduce_work_group_size: radix,
            scan_work_group_size: radix,
            scatter_work_group_size: scatter_slice,
            scatter_work_scale: 1,
            scan_blocks: max_blocks,
            radix_bits,
            program_binary: Vec::new(),
        };

        // Tune the histogram reduction kernel, assuming a generous block
        // count.
        let mut sets = Vec::new();
        let mut wg = radix;
        while wg <= max_work_group_size {
            sets.push(RadixsortRecord { reduce_work_group_size: wg, ..base.clone() });
            wg *= 2;
        }
        let best = tune::tune_one(
            policy,
            &sets,
            &problem_sizes,
            |size, params| Self::tune_reduce_callback(device, problem, size, params),
            FUNNEL_RATIO,
        )?;
        let base = RadixsortRecord {
            reduce_work_group_size: best.reduce_work_group_size,
            ..base
        };

        // Tune the scatter kernel: work group size and per-item work scale
        // interact, so sweep them jointly. The block count must stay a
        // multiple of the slices per work group.
        let mut sets = Vec::new();
        let mut wg = scatter_slice;
        while wg <= max_work_group_size {
            let slices_per_group = wg / scatter_slice;
            for scale in 1..=8 {
                sets.push(RadixsortRecord {
                    scatter_work_group_size: wg,
                    scatter_work_scale: scale,
                    scan_blocks: util::round_down(max_blocks, slices_per_group).max(slices_per_group),
                    ..base.clone()
                });
            }
            wg *= 2;
        }
        let best = tune::tune_one(
            policy,
            &sets,
            &problem_sizes,
            |size, params| Self::tune_scatter_callback(device, problem, size, params),
            FUNNEL_RATIO,
        )?;
        let base = RadixsortRecord {
            scatter_work_group_size: best.scatter_work_group_size,
            scatter_work_scale: best.scatter_work_scale,
            scan_blocks: best.scan_blocks,
            ..base
        };

        // Tune the block count.
        let slices_per_group = base.scatter_work_group_size / scatter_slice;
        let max_blocks = util::round_down(max_blocks, slices_per_group).max(slices_per_group);
        let mut sets = Vec::new();
        let mut blocks = max(base.scan_work_group_size / radix, slices_per_group);
        while blocks <= max_blocks {
            sets.push(RadixsortRecord { scan_blocks: blocks, ..base.clone() });
            blocks *= 2;
        }
        if sets.last().map(|s| s.scan_blocks) != Some(max_blocks) {
            sets.push(RadixsortRecord { scan_blocks: max_blocks, ..base.clone() });
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

    pub(crate) fn tune_and_save(device: &Device, problem: &RadixsortProblem) -> Result<()> {
        let key = Self::make_key(device, problem)?;
        let record = Self::tune(device, problem)?;
        cache::store(ALGORITHM, VERSION, &key, &record)
    }

    pub(crate) fn key_fingerprint(device: &Device, problem: &RadixsortProblem) -> Result<String> {
        Ok(format!("{}:{:?}", ALGORITHM, Self::make_key(device, problem)?))
    }

    pub(crate) fn is_cached(device: &Device, problem: &RadixsortProblem) -> Result<bool> {
        let context = util::context_for_device(device)?;
        let mut check = problem.clone();
        let mut policy = check.policy.clone();
        policy.set_enabled(false);
        check.set_tune_policy(policy);
        Ok(RadixSort::new(&context, device, &check).is_ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BaseType;

    #[test]
    fn problem_rejects_bad_key_types() {
        let uint = Type::new(BaseType::Uint, 1).unwrap();
        let int = Type::new(BaseType::Int, 1).unwrap();
        let uint2 = Type::new(BaseType::Uint, 2).unwrap();
        let float = Type::new(BaseType::Float, 1).unwrap();
        assert!(RadixsortProblem::keys_only(uint).is_ok());
        assert!(RadixsortProblem::keys_only(int).is_err());
        assert!(RadixsortProblem::keys_only(uint2).is_err());
        assert!(RadixsortProblem::keys_only(float).is_err());
        assert!(RadixsortProblem::new(uint, Type::new(BaseType::Float, 4).unwrap()).is_ok());
    }

    fn geometry(
        reduce_wg: usize,
        scatter_wg: usize,
        scale: usize,
        slice: usize,
        blocks: usize,
    ) -> impl Fn(usize) -> (usize, usize) {
        move |elements| {
            let tile = max(reduce_wg, scale * scatter_wg);
            let len = util::div_ceil(elements, tile * blocks) * tile;
            let slices_per_group = scatter_wg / slice;
            let b = util::round_up(util::div_ceil(elements, len), slices_per_group);
            (len, b)
        }
    }

    #[test]
    fn decomposition_postconditions() {
        // (reduce_wg, scatter_wg, scale, slice, scan_blocks)
        let configs = [
            (128usize, 64usize, 3usize, 32usize, 256usize),
            (16, 16, 1, 16, 2),
            (256, 512, 8, 64, 1024),
        ];
        let sizes = [1usize, 15, 16, 65536, 65537, (1 << 22) - 1, 1_000_003];
        for &(rwg, swg, scale, slice, blocks) in &configs {
            let geom = geometry(rwg, swg, scale, slice, blocks);
            let slices_per_group = swg / slice;
            for &n in &sizes {
                let (len, b) = geom(n);
                let tile = max(rwg, scale * swg);
                assert_eq!(len % tile, 0, "n={}", n);
                assert!(b <= blocks, "n={}", n);
                assert_eq!(b % slices_per_group, 0, "n={}", n);
                assert!(b * len >= n, "n={}", n);
            }
        }
    }

    #[test]
    fn value_size_collapses_cache_keys() {
        let uint = Type::new(BaseType::Uint, 1).unwrap();
        let f4 = Type::new(BaseType::Float, 4).unwrap();
        let i4 = Type::new(BaseType::Int, 4).unwrap();
        let a = RadixsortProblem::new(uint, f4).unwrap();
        let b = RadixsortProblem::new(uint, i4).unwrap();
        assert_eq!(a.value_type().size(), b.value_type().size());
    }
}
