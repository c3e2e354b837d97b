//! Fills the parameter cache for every supported algorithm and type
//! combination on the selected devices.

use std::process;

use clap::Parser;
use ocl::core::{DeviceInfo, DeviceInfoResult};
use ocl::{Device, DeviceType, Platform};
use ocl_prims::{Error, TunePolicy, TuneVerbosity, Tuner};

#[derive(Parser)]
#[command(name = "ocl-prims-tune", about = "Tune the data-parallel primitives for OpenCL devices")]
struct Args {
    /// Re-tune combinations that already have cache entries.
    #[arg(long)]
    force: bool,
    /// Keep tuning the remaining combinations when one fails.
    #[arg(long)]
    keep_going: bool,
    /// Only tune devices whose name contains this string.
    #[arg(long, value_name = "NAME")]
    device: Option<String>,
    /// Only tune CPU devices.
    #[arg(long)]
    cpu: bool,
    /// Only tune GPU devices.
    #[arg(long)]
    gpu: bool,
    /// Suppress per-test progress output.
    #[arg(long)]
    quiet: bool,
}

fn device_type(device: &Device) -> Option<DeviceType> {
    match device.info(DeviceInfo::Type) {
        Ok(DeviceInfoResult::Type(ty)) => Some(ty),
        _ => None,
    }
}

fn matching_devices(args: &Args) -> Result<Vec<Device>, Error> {
    let mut selected = Vec::new();
    for platform in Platform::list() {
        let devices = match Device::list_all(platform) {
            Ok(devices) => devices,
            Err(err) => {
                log::warn!("skipping platform {}: {}", platform.name().unwrap_or_default(), err);
                continue;
            }
        };
        for device in devices {
            if let Some(ref name) = args.device {
                if !device.name()?.contains(name) {
                    continue;
                }
            }
            if args.cpu || args.gpu {
                let ty = device_type(&device).unwrap_or_else(DeviceType::empty);
                let wanted = (args.cpu && ty.contains(DeviceType::CPU))
                    || (args.gpu && ty.contains(DeviceType::GPU));
                if !wanted {
                    continue;
                }
            }
            selected.push(device);
        }
    }
    Ok(selected)
}

fn run(args: &Args) -> Result<(), Error> {
    let devices = matching_devices(args)?;
    if devices.is_empty() {
        return Err(Error::InvalidArgument("no matching OpenCL device found".into()));
    }

    let mut policy = TunePolicy::new();
    policy.set_verbosity(if args.quiet {
        TuneVerbosity::Terse
    } else {
        TuneVerbosity::Normal
    });

    let mut tuner = Tuner::new();
    tuner.set_force(args.force);
    tuner.set_keep_going(args.keep_going);
    tuner.set_policy(policy);
    tuner.tune_all(&devices)
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
