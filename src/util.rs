//! Device probing and arithmetic helpers shared by the engines.

use std::mem;
use std::os::raw::c_void;

use ocl::core::{self, ClDeviceIdPtr, DeviceInfo, DeviceInfoResult, PlatformInfo, PlatformInfoResult};
use ocl::ffi;
use ocl::{Context, Device};

use crate::error::{Error, Result};

/// Returns true if `device` advertises `extension` in `CL_DEVICE_EXTENSIONS`.
///
/// The extensions string is whitespace-delimited; substring hits inside a
/// longer extension name do not count.
pub fn device_has_extension(device: &Device, extension: &str) -> Result<bool> {
    let extensions = match device.info(DeviceInfo::Extensions)? {
        DeviceInfoResult::Extensions(s) => s,
        _ => return Err(Error::Internal("unexpected device info result".into())),
    };
    Ok(extensions.split_whitespace().any(|e| e == extension))
}

/// `CL_DEVICE_WARP_SIZE_NV` from `cl_nv_device_attribute_query`. Not part of
/// the standard info enum, so it is queried through the raw API.
fn device_warp_size_nv(device: &Device) -> Option<u32> {
    const CL_DEVICE_WARP_SIZE_NV: ffi::cl_device_info = 0x4003;
    let mut value: ffi::cl_uint = 0;
    let mut size_ret: usize = 0;
    let status = unsafe {
        ffi::clGetDeviceInfo(
            device.as_ptr(),
            CL_DEVICE_WARP_SIZE_NV,
            mem::size_of::<ffi::cl_uint>(),
            &mut value as *mut ffi::cl_uint as *mut c_void,
            &mut size_ret,
        )
    };
    if status == ffi::CL_SUCCESS as i32 && value > 0 {
        Some(value)
    } else {
        None
    }
}

/// Sub-groups of this size are guaranteed a synchronized view of local
/// memory at sequence points, provided the memory is declared volatile.
///
/// AMD wavefronts do not guarantee these semantics, so only NVIDIA hardware
/// reports a value greater than one.
pub fn warp_size_mem(device: &Device) -> Result<usize> {
    if device_has_extension(device, "cl_nv_device_attribute_query")? {
        if let Some(warp) = device_warp_size_nv(device) {
            return Ok(warp as usize);
        }
    }
    Ok(1)
}

/// Sub-groups of this size are expected to be scheduled as SIMD, making
/// branch divergence below this level worth avoiding. A hint only; does not
/// affect correctness.
pub fn warp_size_schedule(device: &Device) -> Result<usize> {
    if device_has_extension(device, "cl_nv_device_attribute_query")? {
        if let Some(warp) = device_warp_size_nv(device) {
            return Ok(warp as usize);
        }
    }
    if platform_name(device)? == "AMD Accelerated Parallel Processing" {
        if let DeviceInfoResult::Type(ty) = device.info(DeviceInfo::Type)? {
            if ty.contains(ocl::DeviceType::GPU) {
                // true for many AMD GPUs, not all
                return Ok(64);
            }
        }
    }
    Ok(1)
}

/// Name of the platform `device` belongs to.
pub fn platform_name(device: &Device) -> Result<String> {
    let platform_id = match device.info(DeviceInfo::Platform)? {
        DeviceInfoResult::Platform(p) => p,
        _ => return Err(Error::Internal("unexpected device info result".into())),
    };
    match core::get_platform_info(platform_id, PlatformInfo::Name)? {
        PlatformInfoResult::Name(name) => Ok(name),
        _ => Err(Error::Internal("unexpected platform info result".into())),
    }
}

/// Creates a context containing only `device`, on its own platform.
pub fn context_for_device(device: &Device) -> Result<Context> {
    let platform_id = match device.info(DeviceInfo::Platform)? {
        DeviceInfoResult::Platform(p) => p,
        _ => return Err(Error::Internal("unexpected device info result".into())),
    };
    let context = Context::builder()
        .platform(ocl::Platform::new(platform_id))
        .devices(*device)
        .build()?;
    Ok(context)
}

pub fn max_work_group_size(device: &Device) -> Result<usize> {
    Ok(device.max_wg_size()?)
}

pub fn local_mem_size(device: &Device) -> Result<usize> {
    match device.info(DeviceInfo::LocalMemSize)? {
        DeviceInfoResult::LocalMemSize(s) => Ok(s as usize),
        _ => Err(Error::Internal("unexpected device info result".into())),
    }
}

pub fn global_mem_size(device: &Device) -> Result<usize> {
    match device.info(DeviceInfo::GlobalMemSize)? {
        DeviceInfoResult::GlobalMemSize(s) => Ok(s as usize),
        _ => Err(Error::Internal("unexpected device info result".into())),
    }
}

pub fn round_down_power2(x: usize) -> usize {
    let mut y = 1;
    while y * 2 <= x {
        y <<= 1;
    }
    y
}

pub fn round_down(x: usize, y: usize) -> usize {
    x / y * y
}

pub fn round_up(x: usize, y: usize) -> usize {
    (x + y - 1) / y * y
}

pub fn div_ceil(x: usize, y: usize) -> usize {
    (x + y - 1) / y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_up(0, 8), 0);
        assert_eq!(round_up(1, 8), 8);
        assert_eq!(round_up(8, 8), 8);
        assert_eq!(round_up(9, 8), 16);
        assert_eq!(round_down(15, 8), 8);
        assert_eq!(round_down(16, 8), 16);
        assert_eq!(div_ceil(17, 8), 3);
        assert_eq!(round_down_power2(1), 1);
        assert_eq!(round_down_power2(5), 4);
        assert_eq!(round_down_power2(4096), 4096);
        assert_eq!(round_down_power2(4097), 4096);
    }
}
