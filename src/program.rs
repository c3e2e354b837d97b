//! Program construction with binary-first caching.
//!
//! Compiled programs are cached alongside the tuned parameters as device
//! binaries. Construction first tries the cached binary and falls back to
//! compiling the embedded source with the parameter set injected as
//! `#define`s; the fresh binary is then handed back for persistence.

use std::ffi::CString;
use std::sync::atomic::{AtomicBool, Ordering};

use ocl::core::{ProgramInfo, ProgramInfoResult};
use ocl::{Context, Device, Program};

use crate::error::{Error, Result};
use crate::kernels;

static UNIT_TESTS: AtomicBool = AtomicBool::new(false);

/// Defines `UNIT_TESTS` when building programs and disables binary reuse.
/// Only for use by the test code.
pub fn enable_unit_tests() {
    UNIT_TESTS.store(true, Ordering::SeqCst);
}

fn unit_tests_enabled() -> bool {
    UNIT_TESTS.load(Ordering::SeqCst)
}

/// Builds the named kernel fragment for one device.
///
/// If `binary` is non-empty it is tried first and used on success. If the
/// binary is absent or rejected and `allow_source` is false, the call fails
/// with a cache error. Otherwise the embedded source is compiled beneath a
/// synthesized header of `#define` lines and `binary` is replaced with the
/// newly built program binary.
pub(crate) fn build(
    context: &Context,
    device: &Device,
    name: &str,
    defines: &[(&str, usize)],
    string_defines: &[(&str, String)],
    options: &str,
    binary: &mut Vec<u8>,
    allow_source: bool,
) -> Result<Program> {
    let devices = [*device];

    if !binary.is_empty() && !unit_tests_enabled() {
        let binaries: [&[u8]; 1] = [binary.as_slice()];
        let cmplr_opts = CString::new(options)
            .map_err(|_| Error::invalid_arg("build options contain a nul byte"))?;
        match Program::with_binary(context, &devices, &binaries, &cmplr_opts) {
            Ok(program) => return Ok(program),
            Err(err) => {
                // Binary from another driver revision, or a rebuild failure;
                // fall back to source.
                log::debug!("cached binary for {} rejected: {}", name, err);
            }
        }
    }

    if !allow_source && !unit_tests_enabled() {
        return Err(Error::Cache("cached program binary missing or invalid".into()));
    }

    let source = kernels::source(name)
        .ok_or_else(|| Error::invalid_arg(format!("no such program {}", name)))?;

    let mut header = String::new();
    for &(key, value) in defines {
        header.push_str(&format!("#define {} {}\n", key, value));
    }
    for &(key, ref value) in string_defines {
        header.push_str(&format!("#define {} {}\n", key, value));
    }
    if unit_tests_enabled() {
        header.push_str("#define UNIT_TESTS 1\n");
    }
    header.push_str(&format!("#line 1 \"{}\"\n", name));

    let src_strings = [
        CString::new(header).map_err(|_| Error::Internal("nul byte in program header".into()))?,
        CString::new(source).map_err(|_| Error::Internal("nul byte in program source".into()))?,
    ];
    let cmplr_opts = CString::new(options)
        .map_err(|_| Error::invalid_arg("build options contain a nul byte"))?;

    let program = Program::with_source(context, &src_strings, Some(&devices), &cmplr_opts)
        .map_err(|err| Error::Internal(format!("error compiling {}: {}", name, err)))?;

    *binary = program_binary(&program)?;
    Ok(program)
}

/// Extracts the (single) device binary of a freshly built program.
fn program_binary(program: &Program) -> Result<Vec<u8>> {
    match program.info(ProgramInfo::Binaries)? {
        ProgramInfoResult::Binaries(mut binaries) if !binaries.is_empty() => Ok(binaries.swap_remove(0)),
        _ => Err(Error::Internal("program binary unavailable".into())),
    }
}
