//! Scalar, string and array marshalling
//!
//! Converts between native values and their little-endian representation in
//! guest linear memory. Every numeric conversion goes through [`Scalar::cast`]
//! so the coercion rules are identical at every call site:
//!
//! - non-finite floats become zero
//! - booleans become 0/1, anything non-zero becomes `true`
//! - floats truncate toward zero, then integers wrap to the target width
//!
//! Encoders never write past the capacity they are given. When a value does
//! not fit they write a prefix, report it through [`Encoded`] and log a
//! buffer-too-small warning; that is not an error.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use super::memory::{GuestPtr, MemoryView};
use super::types::{EeaError, EeaResult};

/// Scalar types understood by the guest ABI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Bool,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    F32,
    I64,
    U64,
    F64,
}

impl ScalarType {
    pub const ALL: [ScalarType; 11] = [
        ScalarType::Bool,
        ScalarType::I8,
        ScalarType::U8,
        ScalarType::I16,
        ScalarType::U16,
        ScalarType::I32,
        ScalarType::U32,
        ScalarType::F32,
        ScalarType::I64,
        ScalarType::U64,
        ScalarType::F64,
    ];

    /// Encoded width in bytes
    pub const fn width(self) -> u32 {
        match self {
            ScalarType::Bool | ScalarType::I8 | ScalarType::U8 => 1,
            ScalarType::I16 | ScalarType::U16 => 2,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 => 4,
            ScalarType::I64 | ScalarType::U64 | ScalarType::F64 => 8,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScalarType::Bool => "bool",
            ScalarType::I8 => "i8",
            ScalarType::U8 => "u8",
            ScalarType::I16 => "i16",
            ScalarType::U16 => "u16",
            ScalarType::I32 => "i32",
            ScalarType::U32 => "u32",
            ScalarType::F32 => "f32",
            ScalarType::I64 => "i64",
            ScalarType::U64 => "u64",
            ScalarType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// A native scalar value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    F32(f32),
    I64(i64),
    U64(u64),
    F64(f64),
}

/// Intermediate form every cast passes through
enum Numeric {
    Int(i128),
    Float(f64),
}

impl Scalar {
    pub fn scalar_type(&self) -> ScalarType {
        match self {
            Scalar::Bool(_) => ScalarType::Bool,
            Scalar::I8(_) => ScalarType::I8,
            Scalar::U8(_) => ScalarType::U8,
            Scalar::I16(_) => ScalarType::I16,
            Scalar::U16(_) => ScalarType::U16,
            Scalar::I32(_) => ScalarType::I32,
            Scalar::U32(_) => ScalarType::U32,
            Scalar::F32(_) => ScalarType::F32,
            Scalar::I64(_) => ScalarType::I64,
            Scalar::U64(_) => ScalarType::U64,
            Scalar::F64(_) => ScalarType::F64,
        }
    }

    fn numeric(self) -> Numeric {
        let float = |f: f64| {
            if f.is_finite() {
                Numeric::Float(f)
            } else {
                Numeric::Int(0)
            }
        };
        match self {
            Scalar::Bool(b) => Numeric::Int(b as i128),
            Scalar::I8(v) => Numeric::Int(v as i128),
            Scalar::U8(v) => Numeric::Int(v as i128),
            Scalar::I16(v) => Numeric::Int(v as i128),
            Scalar::U16(v) => Numeric::Int(v as i128),
            Scalar::I32(v) => Numeric::Int(v as i128),
            Scalar::U32(v) => Numeric::Int(v as i128),
            Scalar::I64(v) => Numeric::Int(v as i128),
            Scalar::U64(v) => Numeric::Int(v as i128),
            Scalar::F32(v) => float(v as f64),
            Scalar::F64(v) => float(v),
        }
    }

    /// Convert to `ty` using the shared cast table
    pub fn cast(self, ty: ScalarType) -> Scalar {
        let int = match self.numeric() {
            Numeric::Int(i) => i,
            Numeric::Float(f) => match ty {
                ScalarType::Bool => return Scalar::Bool(f != 0.0),
                ScalarType::F32 => return Scalar::F32(f as f32),
                ScalarType::F64 => return Scalar::F64(f),
                _ => f.trunc() as i128,
            },
        };

        match ty {
            ScalarType::Bool => Scalar::Bool(int != 0),
            ScalarType::I8 => Scalar::I8(int as i8),
            ScalarType::U8 => Scalar::U8(int as u8),
            ScalarType::I16 => Scalar::I16(int as i16),
            ScalarType::U16 => Scalar::U16(int as u16),
            ScalarType::I32 => Scalar::I32(int as i32),
            ScalarType::U32 => Scalar::U32(int as u32),
            ScalarType::I64 => Scalar::I64(int as i64),
            ScalarType::U64 => Scalar::U64(int as u64),
            ScalarType::F32 => Scalar::F32(int as f32),
            ScalarType::F64 => Scalar::F64(int as f64),
        }
    }

    /// Little-endian bytes; only the first `width` bytes are meaningful
    fn le_bytes(self) -> ([u8; 8], usize) {
        let mut out = [0u8; 8];
        let width = self.scalar_type().width() as usize;
        match self {
            Scalar::Bool(b) => out[0] = b as u8,
            Scalar::I8(v) => out[..1].copy_from_slice(&v.to_le_bytes()),
            Scalar::U8(v) => out[..1].copy_from_slice(&v.to_le_bytes()),
            Scalar::I16(v) => out[..2].copy_from_slice(&v.to_le_bytes()),
            Scalar::U16(v) => out[..2].copy_from_slice(&v.to_le_bytes()),
            Scalar::I32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Scalar::U32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Scalar::F32(v) => out[..4].copy_from_slice(&v.to_le_bytes()),
            Scalar::I64(v) => out.copy_from_slice(&v.to_le_bytes()),
            Scalar::U64(v) => out.copy_from_slice(&v.to_le_bytes()),
            Scalar::F64(v) => out.copy_from_slice(&v.to_le_bytes()),
        }
        (out, width)
    }

    fn from_le_bytes(ty: ScalarType, bytes: &[u8]) -> Scalar {
        let mut buf = [0u8; 8];
        buf[..bytes.len()].copy_from_slice(bytes);
        let b2 = [buf[0], buf[1]];
        let b4 = [buf[0], buf[1], buf[2], buf[3]];
        match ty {
            ScalarType::Bool => Scalar::Bool(buf[0] != 0),
            ScalarType::I8 => Scalar::I8(buf[0] as i8),
            ScalarType::U8 => Scalar::U8(buf[0]),
            ScalarType::I16 => Scalar::I16(i16::from_le_bytes(b2)),
            ScalarType::U16 => Scalar::U16(u16::from_le_bytes(b2)),
            ScalarType::I32 => Scalar::I32(i32::from_le_bytes(b4)),
            ScalarType::U32 => Scalar::U32(u32::from_le_bytes(b4)),
            ScalarType::F32 => Scalar::F32(f32::from_le_bytes(b4)),
            ScalarType::I64 => Scalar::I64(i64::from_le_bytes(buf)),
            ScalarType::U64 => Scalar::U64(u64::from_le_bytes(buf)),
            ScalarType::F64 => Scalar::F64(f64::from_le_bytes(buf)),
        }
    }

    pub fn as_u64(self) -> u64 {
        match self.cast(ScalarType::U64) {
            Scalar::U64(v) => v,
            _ => 0,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self.cast(ScalarType::I64) {
            Scalar::I64(v) => v,
            _ => 0,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self.cast(ScalarType::F64) {
            Scalar::F64(v) => v,
            _ => 0.0,
        }
    }

    pub fn as_bool(self) -> bool {
        matches!(self.cast(ScalarType::Bool), Scalar::Bool(true))
    }
}

macro_rules! scalar_from {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Scalar {
                fn from(v: $ty) -> Self {
                    Scalar::$variant(v)
                }
            }
        )*
    };
}

scalar_from! {
    bool => Bool,
    i8 => I8,
    u8 => U8,
    i16 => I16,
    u16 => U16,
    i32 => I32,
    u32 => U32,
    f32 => F32,
    i64 => I64,
    u64 => U64,
    f64 => F64,
}

/// Outcome of a capacity-limited encode
///
/// Units are bytes for strings and items for arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoded {
    pub written: u32,
    pub required: u32,
}

impl Encoded {
    pub fn is_truncated(&self) -> bool {
        self.written < self.required
    }
}

fn clamp_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Read a single scalar
pub fn decode_scalar(view: &MemoryView<'_>, ptr: GuestPtr, ty: ScalarType) -> EeaResult<Scalar> {
    let bytes = view.read(ptr, ty.width())?;
    Ok(Scalar::from_le_bytes(ty, bytes))
}

/// Cast `value` to `ty` and write it at `ptr`
pub fn encode_scalar(
    view: &mut MemoryView<'_>,
    value: impl Into<Scalar>,
    ptr: GuestPtr,
    ty: ScalarType,
) -> EeaResult<()> {
    let (bytes, width) = value.into().cast(ty).le_bytes();
    view.write(ptr, &bytes[..width])
}

/// Read `len` bytes as UTF-8
pub fn decode_string(view: &MemoryView<'_>, ptr: GuestPtr, len: u32) -> EeaResult<String> {
    let bytes = view.read(ptr, len)?;
    Ok(std::str::from_utf8(bytes)?.to_owned())
}

/// Read `len` bytes, replacing invalid UTF-8 sequences
pub fn decode_string_lossy(view: &MemoryView<'_>, ptr: GuestPtr, len: u32) -> EeaResult<String> {
    let bytes = view.read(ptr, len)?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

/// Write raw bytes, truncated to `capacity`
pub fn encode_bytes(
    view: &mut MemoryView<'_>,
    bytes: &[u8],
    ptr: GuestPtr,
    capacity: u32,
) -> EeaResult<Encoded> {
    let written = bytes.len().min(capacity as usize);
    write_prefix(view, bytes, written, ptr, capacity)
}

/// Write a UTF-8 string, truncated on a character boundary to `capacity`
pub fn encode_string(
    view: &mut MemoryView<'_>,
    s: &str,
    ptr: GuestPtr,
    capacity: u32,
) -> EeaResult<Encoded> {
    let mut written = s.len().min(capacity as usize);
    while !s.is_char_boundary(written) {
        written -= 1;
    }
    write_prefix(view, s.as_bytes(), written, ptr, capacity)
}

fn write_prefix(
    view: &mut MemoryView<'_>,
    bytes: &[u8],
    written: usize,
    ptr: GuestPtr,
    capacity: u32,
) -> EeaResult<Encoded> {
    view.write(ptr, &bytes[..written])?;

    let encoded = Encoded {
        written: clamp_u32(written),
        required: clamp_u32(bytes.len()),
    };
    if encoded.is_truncated() {
        warn!(
            capacity,
            required = encoded.required,
            "Buffer not large enough to encode string"
        );
    }
    Ok(encoded)
}

/// Encode a string, then write the byte count as `len_ty` at `len_ptr`
pub fn encode_string_and_length(
    view: &mut MemoryView<'_>,
    s: &str,
    ptr: GuestPtr,
    capacity: u32,
    len_ptr: GuestPtr,
    len_ty: ScalarType,
) -> EeaResult<Encoded> {
    // Validate the length slot first so a bad pointer leaves memory untouched
    view.check(len_ptr, len_ty.width())?;
    let encoded = encode_string(view, s, ptr, capacity)?;
    encode_scalar(view, encoded.written, len_ptr, len_ty)?;
    Ok(encoded)
}

/// Byte-oriented variant of [`encode_string_and_length`]
pub fn encode_bytes_and_length(
    view: &mut MemoryView<'_>,
    bytes: &[u8],
    ptr: GuestPtr,
    capacity: u32,
    len_ptr: GuestPtr,
    len_ty: ScalarType,
) -> EeaResult<Encoded> {
    view.check(len_ptr, len_ty.width())?;
    let encoded = encode_bytes(view, bytes, ptr, capacity)?;
    encode_scalar(view, encoded.written, len_ptr, len_ty)?;
    Ok(encoded)
}

/// Read `count` homogeneous scalars
pub fn decode_array(
    view: &MemoryView<'_>,
    ptr: GuestPtr,
    count: u32,
    ty: ScalarType,
) -> EeaResult<Vec<Scalar>> {
    let width = ty.width();
    let total = count
        .checked_mul(width)
        .ok_or(EeaError::MemoryOutOfBounds {
            offset: ptr.0,
            size: u32::MAX,
        })?;
    let bytes = view.read(ptr, total)?;

    Ok(bytes
        .chunks_exact(width as usize)
        .map(|chunk| Scalar::from_le_bytes(ty, chunk))
        .collect())
}

/// Cast and write at most `max_items` scalars
pub fn encode_array(
    view: &mut MemoryView<'_>,
    items: &[Scalar],
    ptr: GuestPtr,
    max_items: u32,
    ty: ScalarType,
) -> EeaResult<Encoded> {
    let count = items.len().min(max_items as usize);
    if count < items.len() {
        warn!(
            capacity = max_items,
            required = items.len(),
            "Buffer not large enough to encode array"
        );
    }

    let mut bytes = Vec::with_capacity(count * ty.width() as usize);
    for item in &items[..count] {
        let (le, width) = item.cast(ty).le_bytes();
        bytes.extend_from_slice(&le[..width]);
    }
    view.write(ptr, &bytes)?;

    Ok(Encoded {
        written: clamp_u32(count),
        required: clamp_u32(items.len()),
    })
}
