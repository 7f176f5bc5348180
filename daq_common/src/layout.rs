//! Element layout of signals and parameters.
//!
//! An [`ElementLayout`] is the only type information the transport ever sees:
//! primitive type, dimensions, element width and total byte size. The core
//! copies `byte_size` bytes around and never interprets them; the
//! [`Primitive`] trait exists for the process image and for sessions that
//! want to decode values.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while constructing a layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    /// Element count evaluates to zero.
    #[error("Invalid layout: element count must be > 0")]
    ZeroElements,

    /// One of the dimensions is zero.
    #[error("Invalid layout: dimension {axis} is zero")]
    ZeroDimension {
        /// Position of the offending dimension.
        axis: usize,
    },

    /// Element count times width does not fit in `usize`.
    #[error("Invalid layout: size overflows")]
    Overflow,
}

/// Primitive element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PrimitiveType {
    /// Boolean stored as one byte (0 / 1).
    Bool,
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 8-bit integer.
    I8,
    /// Unsigned 16-bit integer.
    U16,
    /// Signed 16-bit integer.
    I16,
    /// Unsigned 32-bit integer.
    U32,
    /// Signed 32-bit integer.
    I32,
    /// Unsigned 64-bit integer.
    U64,
    /// Signed 64-bit integer.
    I64,
    /// IEEE-754 single precision.
    F32,
    /// IEEE-754 double precision.
    F64,
}

impl PrimitiveType {
    /// Width of one element in bytes.
    #[inline]
    pub const fn width(self) -> usize {
        match self {
            Self::Bool | Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }

    /// Short name used in logs and session listings.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::U64 => "u64",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }
}

impl std::fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Binary shape of a signal or parameter. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementLayout {
    primitive: PrimitiveType,
    dims: Vec<usize>,
    element_count: usize,
}

impl ElementLayout {
    /// Single element.
    pub fn scalar(primitive: PrimitiveType) -> Self {
        Self {
            primitive,
            dims: Vec::new(),
            element_count: 1,
        }
    }

    /// Flat vector of `count` elements.
    pub fn vector(primitive: PrimitiveType, count: usize) -> Result<Self, LayoutError> {
        if count == 0 {
            return Err(LayoutError::ZeroElements);
        }
        checked_size(primitive, count)?;
        Ok(Self {
            primitive,
            dims: Vec::new(),
            element_count: count,
        })
    }

    /// Multi-dimensional array; the element count is the product of `dims`.
    ///
    /// Empty `dims` yields a scalar.
    pub fn with_dims(primitive: PrimitiveType, dims: &[usize]) -> Result<Self, LayoutError> {
        if let Some(axis) = dims.iter().position(|&d| d == 0) {
            return Err(LayoutError::ZeroDimension { axis });
        }
        let element_count = element_count(dims)?;
        checked_size(primitive, element_count)?;
        Ok(Self {
            primitive,
            dims: dims.to_vec(),
            element_count,
        })
    }

    /// Primitive element type.
    #[inline]
    pub fn primitive(&self) -> PrimitiveType {
        self.primitive
    }

    /// Dimensions (empty for scalars and flat vectors).
    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Number of elements.
    #[inline]
    pub fn element_count(&self) -> usize {
        self.element_count
    }

    /// Bytes per element.
    #[inline]
    pub fn element_width(&self) -> usize {
        self.primitive.width()
    }

    /// Total bytes (`element_count * element_width`).
    #[inline]
    pub fn byte_size(&self) -> usize {
        self.element_count * self.primitive.width()
    }
}

/// Product of `dims`, or 1 for an empty slice.
pub fn element_count(dims: &[usize]) -> Result<usize, LayoutError> {
    dims.iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or(LayoutError::Overflow)
}

fn checked_size(primitive: PrimitiveType, count: usize) -> Result<usize, LayoutError> {
    count
        .checked_mul(primitive.width())
        .ok_or(LayoutError::Overflow)
}

/// Rust types that map onto a [`PrimitiveType`].
///
/// Values are stored in native byte order.
pub trait Primitive: Copy + PartialEq + std::fmt::Debug {
    /// Matching primitive type tag.
    const TYPE: PrimitiveType;

    /// Encode into `out[..width]`.
    fn write_ne(self, out: &mut [u8]);

    /// Decode from `bytes[..width]`.
    fn read_ne(bytes: &[u8]) -> Self;
}

macro_rules! impl_primitive {
    ($($ty:ty => $tag:ident),* $(,)?) => {
        $(
            impl Primitive for $ty {
                const TYPE: PrimitiveType = PrimitiveType::$tag;

                #[inline]
                fn write_ne(self, out: &mut [u8]) {
                    out[..size_of::<$ty>()].copy_from_slice(&self.to_ne_bytes());
                }

                #[inline]
                fn read_ne(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; size_of::<$ty>()];
                    raw.copy_from_slice(&bytes[..size_of::<$ty>()]);
                    <$ty>::from_ne_bytes(raw)
                }
            }
        )*
    };
}

impl_primitive! {
    u8 => U8, i8 => I8, u16 => U16, i16 => I16, u32 => U32, i32 => I32,
    u64 => U64, i64 => I64, f32 => F32, f64 => F64,
}

impl Primitive for bool {
    const TYPE: PrimitiveType = PrimitiveType::Bool;

    #[inline]
    fn write_ne(self, out: &mut [u8]) {
        out[0] = self as u8;
    }

    #[inline]
    fn read_ne(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}
