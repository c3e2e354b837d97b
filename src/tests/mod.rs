//! Tests that exercise the engines on a real OpenCL device.
//!
//! Each test grabs the first available device and skips (with a note) when
//! the machine has no OpenCL platform at all. The parameter cache is
//! redirected to a per-process temporary directory so test runs neither
//! read nor pollute the user's cache, and unit-test mode forces programs to
//! be built from source.

use std::env;

use lazy_static::lazy_static;
use ocl::{Context, Device, Platform, Queue};

use crate::program;
use crate::util;

mod reduce;
mod scan;
mod tune;

struct TestEnv {
    // Held for the lifetime of the process so the cache database has a
    // stable home.
    _cache_dir: tempfile::TempDir,
}

lazy_static! {
    static ref TEST_ENV: TestEnv = {
        let cache_dir = tempfile::tempdir().expect("create test cache dir");
        env::set_var("CLOGS_CACHE_DIR", cache_dir.path());
        program::enable_unit_tests();
        TestEnv { _cache_dir: cache_dir }
    };
}

/// The first device of the first platform that has one, or `None` when the
/// machine has no usable OpenCL installation.
pub fn first_device() -> Option<(Platform, Device)> {
    lazy_static::initialize(&TEST_ENV);
    for platform in Platform::list() {
        if let Ok(devices) = Device::list_all(platform) {
            if let Some(device) = devices.into_iter().next() {
                return Some((platform, device));
            }
        }
    }
    None
}

pub fn device_context(device: &Device) -> (Context, Queue) {
    let context = util::context_for_device(device).expect("create context");
    let queue = Queue::new(&context, *device, None).expect("create queue");
    (context, queue)
}

/// Skips the current test when no OpenCL device is present.
macro_rules! require_device {
    () => {
        match crate::tests::first_device() {
            Some(pair) => pair,
            None => {
                println!("no OpenCL device available; skipping");
                return;
            }
        }
    };
}
pub(crate) use require_device;
