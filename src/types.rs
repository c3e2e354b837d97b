//! Runtime descriptors for the OpenCL element types the primitives operate
//! on.
//!
//! The engines are specialized at runtime rather than by a Rust type
//! parameter so that one tuning database and one kernel bundle cover every
//! supported element type. A [`Type`] pairs a scalar base type with a vector
//! length and knows its in-buffer footprint, its OpenCL source name and
//! whether a given device can store and compute with it.

use std::fmt;

use ocl::Device;

use crate::error::{Error, Result};
use crate::util;

/// Scalar base of an OpenCL element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseType {
    Void,
    Uchar,
    Char,
    Ushort,
    Short,
    Uint,
    Int,
    Ulong,
    Long,
    Half,
    Float,
    Double,
}

impl BaseType {
    /// Size of the scalar base in bytes (zero for `Void`).
    pub fn size(self) -> usize {
        match self {
            BaseType::Void => 0,
            BaseType::Uchar | BaseType::Char => 1,
            BaseType::Ushort | BaseType::Short | BaseType::Half => 2,
            BaseType::Uint | BaseType::Int | BaseType::Float => 4,
            BaseType::Ulong | BaseType::Long | BaseType::Double => 8,
        }
    }

    /// The OpenCL source name of the scalar base.
    pub fn name(self) -> &'static str {
        match self {
            BaseType::Void => "void",
            BaseType::Uchar => "uchar",
            BaseType::Char => "char",
            BaseType::Ushort => "ushort",
            BaseType::Short => "short",
            BaseType::Uint => "uint",
            BaseType::Int => "int",
            BaseType::Ulong => "ulong",
            BaseType::Long => "long",
            BaseType::Half => "half",
            BaseType::Float => "float",
            BaseType::Double => "double",
        }
    }

    const ALL: [BaseType; 11] = [
        BaseType::Uchar,
        BaseType::Char,
        BaseType::Ushort,
        BaseType::Short,
        BaseType::Uint,
        BaseType::Int,
        BaseType::Ulong,
        BaseType::Long,
        BaseType::Half,
        BaseType::Float,
        BaseType::Double,
    ];
}

/// An OpenCL scalar or vector element type, e.g. `uint` or `float4`.
///
/// The default value is the `void` type, which is only useful as the value
/// type of a keys-only radix sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Type {
    base: BaseType,
    length: u32,
}

impl Default for Type {
    fn default() -> Type {
        Type { base: BaseType::Void, length: 0 }
    }
}

impl Type {
    /// Creates a type descriptor from a base type and vector length.
    ///
    /// Valid lengths are 1, 2, 3, 4, 8 and 16. `Void` cannot be constructed
    /// explicitly; use `Type::default()` for the void type.
    pub fn new(base: BaseType, length: u32) -> Result<Type> {
        if base == BaseType::Void {
            return Err(Error::invalid_arg("a Type cannot be explicitly constructed with void base"));
        }
        match length {
            1 | 2 | 3 | 4 | 8 | 16 => Ok(Type { base, length }),
            _ => Err(Error::invalid_arg(format!("{} is not a valid vector length", length))),
        }
    }

    pub fn base(&self) -> BaseType {
        self.base
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn is_void(&self) -> bool {
        self.base == BaseType::Void
    }

    pub fn is_integral(&self) -> bool {
        match self.base {
            BaseType::Uchar
            | BaseType::Char
            | BaseType::Ushort
            | BaseType::Short
            | BaseType::Uint
            | BaseType::Int
            | BaseType::Ulong
            | BaseType::Long => true,
            BaseType::Void | BaseType::Half | BaseType::Float | BaseType::Double => false,
        }
    }

    pub fn is_signed(&self) -> bool {
        match self.base {
            BaseType::Char
            | BaseType::Short
            | BaseType::Int
            | BaseType::Long
            | BaseType::Half
            | BaseType::Float
            | BaseType::Double => true,
            BaseType::Uchar
            | BaseType::Ushort
            | BaseType::Uint
            | BaseType::Ulong
            | BaseType::Void => false,
        }
    }

    pub fn base_size(&self) -> usize {
        self.base.size()
    }

    /// In-buffer footprint in bytes. Length-3 vectors occupy the storage of
    /// length 4.
    pub fn size(&self) -> usize {
        let padded = if self.length == 3 { 4 } else { self.length };
        self.base.size() * padded as usize
    }

    /// The canonical OpenCL source name, e.g. `"uint3"` or `"float"`. Used
    /// both for kernel `#define`s and for cache keys.
    pub fn name(&self) -> String {
        if self.length <= 1 {
            self.base.name().to_owned()
        } else {
            format!("{}{}", self.base.name(), self.length)
        }
    }

    /// Whether buffers of this type can be read and written on `device`.
    ///
    /// Sub-32-bit scalars of length 1-2 need `cl_khr_byte_addressable_store`
    /// (longer vectors are loaded whole); `half` and `double` need their
    /// respective extensions.
    pub fn is_storable(&self, device: &Device) -> Result<bool> {
        Ok(match self.base {
            BaseType::Void => false,
            BaseType::Uchar | BaseType::Char => {
                self.length >= 3 || util::device_has_extension(device, "cl_khr_byte_addressable_store")?
            }
            BaseType::Ushort | BaseType::Short => {
                self.length >= 2 || util::device_has_extension(device, "cl_khr_byte_addressable_store")?
            }
            // half is a valid storage type whenever fp16 is present, even
            // though loads and stores need the built-in conversions.
            BaseType::Half => util::device_has_extension(device, "cl_khr_fp16")?,
            BaseType::Double => util::device_has_extension(device, "cl_khr_fp64")?,
            BaseType::Uint | BaseType::Int | BaseType::Ulong | BaseType::Long | BaseType::Float => true,
        })
    }

    /// Whether arithmetic on this type is available on `device`.
    pub fn is_computable(&self, device: &Device) -> Result<bool> {
        Ok(match self.base {
            BaseType::Void => false,
            BaseType::Half => util::device_has_extension(device, "cl_khr_fp16")?,
            BaseType::Double => util::device_has_extension(device, "cl_khr_fp64")?,
            BaseType::Uchar
            | BaseType::Char
            | BaseType::Ushort
            | BaseType::Short
            | BaseType::Uint
            | BaseType::Int
            | BaseType::Ulong
            | BaseType::Long
            | BaseType::Float => true,
        })
    }

    /// Every constructible `(base, length)` combination, in a fixed order.
    /// Used by the bulk tuner to sweep the whole type space.
    pub fn all_types() -> Vec<Type> {
        const LENGTHS: [u32; 6] = [1, 2, 3, 4, 8, 16];
        let mut all = Vec::with_capacity(BaseType::ALL.len() * LENGTHS.len());
        for &base in BaseType::ALL.iter() {
            for &length in LENGTHS.iter() {
                all.push(Type { base, length });
            }
        }
        all
    }

    /// Collapses unsigned integer types onto their signed counterparts.
    ///
    /// The scan and reduce kernels are bitwise identical for signed and
    /// unsigned bases of the same width, so cache entries are shared.
    pub(crate) fn canonical(&self) -> Type {
        let base = match self.base {
            BaseType::Uchar => BaseType::Char,
            BaseType::Ushort => BaseType::Short,
            BaseType::Uint => BaseType::Int,
            BaseType::Ulong => BaseType::Long,
            other => other,
        };
        Type { base, length: self.length }
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
