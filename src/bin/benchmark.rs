//! Exercises one engine on random data and reports throughput.

use std::process;
use std::time::Instant;

use clap::{Parser, ValueEnum};
use ocl::{Buffer, Context, Device, Platform, Queue};
use ocl_prims::{
    BaseType, Error, RadixSort, RadixsortProblem, Reduce, ReduceProblem, Scan, ScanProblem, Type,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Algorithm {
    Scan,
    Reduce,
    Sort,
}

#[derive(Parser)]
#[command(
    name = "ocl-prims-benchmark",
    about = "Benchmark the data-parallel primitives on an OpenCL device"
)]
struct Args {
    /// Which primitive to run.
    #[arg(long, value_enum)]
    algorithm: Algorithm,
    /// Number of elements per iteration.
    #[arg(long, default_value_t = 1 << 22)]
    items: usize,
    /// Number of timed iterations.
    #[arg(long, default_value_t = 10)]
    iterations: usize,
    /// Sort only: skip the value payload.
    #[arg(long)]
    keys_only: bool,
    /// Only consider devices whose name contains this string.
    #[arg(long, value_name = "NAME")]
    device: Option<String>,
}

fn pick_device(filter: Option<&str>) -> Result<Device, Error> {
    for platform in Platform::list() {
        let devices = match Device::list_all(platform) {
            Ok(devices) => devices,
            Err(_) => continue,
        };
        for device in devices {
            match filter {
                Some(name) if !device.name()?.contains(name) => continue,
                _ => return Ok(device),
            }
        }
    }
    Err(Error::InvalidArgument("no matching OpenCL device found".into()))
}

fn random_data(n: usize) -> Vec<u32> {
    let mut rng = SmallRng::seed_from_u64(0xb0a710ad);
    (0..n).map(|_| rng.gen()).collect()
}

fn upload(queue: &Queue, data: &[u32]) -> Result<Buffer<u32>, Error> {
    Ok(Buffer::builder()
        .queue(queue.clone())
        .len(data.len())
        .copy_host_slice(data)
        .build()?)
}

fn bench_scan(context: &Context, device: &Device, queue: &Queue, args: &Args) -> Result<f64, Error> {
    let problem = ScanProblem::new(Type::new(BaseType::Uint, 1)?)?;
    let mut scan = Scan::new(context, device, &problem)?;
    let input = upload(queue, &random_data(args.items))?;
    let output = upload(queue, &vec![0u32; args.items])?;

    scan.enqueue(queue, &input, &output, args.items, None, None)?;
    queue.finish()?;
    let start = Instant::now();
    for _ in 0..args.iterations {
        scan.enqueue(queue, &input, &output, args.items, None, None)?;
    }
    queue.finish()?;
    Ok(start.elapsed().as_secs_f64())
}

fn bench_reduce(
    context: &Context,
    device: &Device,
    queue: &Queue,
    args: &Args,
) -> Result<f64, Error> {
    let problem = ReduceProblem::new(Type::new(BaseType::Uint, 1)?)?;
    let mut reduce = Reduce::new(context, device, &problem)?;
    let input = upload(queue, &random_data(args.items))?;
    let output = upload(queue, &[0u32])?;

    reduce.enqueue(queue, &input, &output, 0, args.items, 0, None)?;
    queue.finish()?;
    let start = Instant::now();
    for _ in 0..args.iterations {
        reduce.enqueue(queue, &input, &output, 0, args.items, 0, None)?;
    }
    queue.finish()?;
    Ok(start.elapsed().as_secs_f64())
}

fn run(args: &Args) -> Result<(), Error> {
    let device = pick_device(args.device.as_deref())?;
    let context = Context::builder().devices(device).build()?;
    let queue = Queue::new(&context, device, None)?;
    println!("Benchmarking on {}", device.name()?);

    let elapsed = match args.algorithm {
        Algorithm::Scan => bench_scan(&context, &device, &queue, args)?,
        Algorithm::Reduce => bench_reduce(&context, &device, &queue, args)?,
        Algorithm::Sort => {
            let key_type = Type::new(BaseType::Uint, 1)?;
            let problem = if args.keys_only {
                RadixsortProblem::keys_only(key_type)?
            } else {
                RadixsortProblem::new(key_type, Type::new(BaseType::Uint, 1)?)?
            };
            let mut sort = RadixSort::new(&context, &device, &problem)?;

            let keys = random_data(args.items);
            let pristine_keys = upload(&queue, &keys)?;
            let work_keys = upload(&queue, &keys)?;
            let values = random_data(args.items);
            let pristine_values = upload(&queue, &values)?;
            let work_values = upload(&queue, &values)?;

            let run_pass = |sort: &mut RadixSort| -> Result<(), Error> {
                pristine_keys.copy(&work_keys, None, None).enq()?;
                if !args.keys_only {
                    pristine_values.copy(&work_values, None, None).enq()?;
                }
                if args.keys_only {
                    sort.enqueue_keys(&queue, &work_keys, args.items, 0, None)?;
                } else {
                    sort.enqueue(&queue, &work_keys, &work_values, args.items, 0, None)?;
                }
                Ok(())
            };

            run_pass(&mut sort)?;
            queue.finish()?;
            let start = Instant::now();
            for _ in 0..args.iterations {
                run_pass(&mut sort)?;
            }
            queue.finish()?;
            start.elapsed().as_secs_f64()
        }
    };

    let rate = args.items as f64 * args.iterations as f64 / elapsed / 1e6;
    println!(
        "{} iterations of {} elements in {:.3} s: {:.1} M elements/s",
        args.iterations, args.items, elapsed, rate
    );
    Ok(())
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => {}
        Err(err @ Error::InvalidArgument(_)) => {
            eprintln!("{}", err);
            process::exit(1);
        }
        Err(err) => {
            eprintln!("{}", err);
            process::exit(2);
        }
    }
}
