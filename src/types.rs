//! Core data types for adaptio
//!
//! This module contains the closed set of element types a variable or
//! attribute may carry, plus the small value types shared by every layer.
//!
//! # Main Types
//!
//! - [`DataTypeTag`] - Runtime tag naming one element type (int8, double, ...)
//! - [`DataType`] - Compile-time side of the same set, implemented for every
//!   supported primitive and used to select the typed bucket in a catalog
//! - [`Complex`] - Complex floating point element ([`Complex32`], [`Complex64`])
//! - [`Mode`] - Engine access mode (write, read, append)
//! - [`Dims`] / [`Params`] - Dimension lists and string parameter maps
//!
//! # Element Types
//!
//! - Signed integers: int8, int16, int32, int64
//! - Unsigned integers: uint8, uint16, uint32, uint64
//! - Floating point: float, double
//! - Complex floating point: float complex, double complex
//! - Text: string
//! - Structured: compound (raw records described by a [`crate::catalog::CompoundLayout`])
//!
//! The set is closed. Code that must act on a runtime tag dispatches through
//! [`DataTypeTag::visit`], which calls back into a generic function for the
//! matching Rust type instead of going through dynamic typing.

use crate::catalog::{Attribute, Bucket, TypedBuckets, Variable};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Ordered list of dimension extents
pub type Dims = Vec<usize>;

/// String parameter map used for engine, transport and operator settings
pub type Params = BTreeMap<String, String>;

/// Engine access mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Mode {
    /// Create or truncate, then produce steps
    #[default]
    Write,
    /// Consume steps
    Read,
    /// Produce steps after the ones already present
    Append,
}

impl Mode {
    /// True for the producing modes
    pub fn is_write(&self) -> bool {
        matches!(self, Mode::Write | Mode::Append)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Write => write!(f, "write"),
            Mode::Read => write!(f, "read"),
            Mode::Append => write!(f, "append"),
        }
    }
}

/// Independent or collective IO (stored on the IO and handed to engines)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IoMode {
    #[default]
    Independent,
    Collective,
}

/// Complex floating point value
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Complex<T> {
    pub re: T,
    pub im: T,
}

impl<T> Complex<T> {
    pub const fn new(re: T, im: T) -> Self {
        Self { re, im }
    }
}

impl<T: fmt::Display> fmt::Display for Complex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.re, self.im)
    }
}

/// Single precision complex element
pub type Complex32 = Complex<f32>;
/// Double precision complex element
pub type Complex64 = Complex<f64>;

/// Runtime tag of an element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataTypeTag {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    ComplexFloat,
    ComplexDouble,
    String,
    Compound,
}

impl DataTypeTag {
    /// Every tag, in declaration order
    pub const ALL: [DataTypeTag; 14] = [
        DataTypeTag::Int8,
        DataTypeTag::Int16,
        DataTypeTag::Int32,
        DataTypeTag::Int64,
        DataTypeTag::UInt8,
        DataTypeTag::UInt16,
        DataTypeTag::UInt32,
        DataTypeTag::UInt64,
        DataTypeTag::Float,
        DataTypeTag::Double,
        DataTypeTag::ComplexFloat,
        DataTypeTag::ComplexDouble,
        DataTypeTag::String,
        DataTypeTag::Compound,
    ];

    /// Canonical type name, as stored in data maps and reported by introspection
    pub fn as_str(&self) -> &'static str {
        match self {
            DataTypeTag::Int8 => "int8",
            DataTypeTag::Int16 => "int16",
            DataTypeTag::Int32 => "int32",
            DataTypeTag::Int64 => "int64",
            DataTypeTag::UInt8 => "uint8",
            DataTypeTag::UInt16 => "uint16",
            DataTypeTag::UInt32 => "uint32",
            DataTypeTag::UInt64 => "uint64",
            DataTypeTag::Float => "float",
            DataTypeTag::Double => "double",
            DataTypeTag::ComplexFloat => "float complex",
            DataTypeTag::ComplexDouble => "double complex",
            DataTypeTag::String => "string",
            DataTypeTag::Compound => "compound",
        }
    }

    /// Size in bytes of one element, if fixed
    pub fn size_bytes(&self) -> Option<usize> {
        match self {
            DataTypeTag::Int8 | DataTypeTag::UInt8 => Some(1),
            DataTypeTag::Int16 | DataTypeTag::UInt16 => Some(2),
            DataTypeTag::Int32 | DataTypeTag::UInt32 | DataTypeTag::Float => Some(4),
            DataTypeTag::Int64
            | DataTypeTag::UInt64
            | DataTypeTag::Double
            | DataTypeTag::ComplexFloat => Some(8),
            DataTypeTag::ComplexDouble => Some(16),
            DataTypeTag::String | DataTypeTag::Compound => None,
        }
    }

    /// Dispatch to a generic callback for the Rust type behind this tag.
    ///
    /// Returns `None` for [`DataTypeTag::Compound`], which has no single
    /// element type.
    pub fn visit<V: TypeVisitor>(self, visitor: V) -> Option<V::Output> {
        Some(match self {
            DataTypeTag::Int8 => visitor.visit::<i8>(),
            DataTypeTag::Int16 => visitor.visit::<i16>(),
            DataTypeTag::Int32 => visitor.visit::<i32>(),
            DataTypeTag::Int64 => visitor.visit::<i64>(),
            DataTypeTag::UInt8 => visitor.visit::<u8>(),
            DataTypeTag::UInt16 => visitor.visit::<u16>(),
            DataTypeTag::UInt32 => visitor.visit::<u32>(),
            DataTypeTag::UInt64 => visitor.visit::<u64>(),
            DataTypeTag::Float => visitor.visit::<f32>(),
            DataTypeTag::Double => visitor.visit::<f64>(),
            DataTypeTag::ComplexFloat => visitor.visit::<Complex32>(),
            DataTypeTag::ComplexDouble => visitor.visit::<Complex64>(),
            DataTypeTag::String => visitor.visit::<String>(),
            DataTypeTag::Compound => return None,
        })
    }
}

impl fmt::Display for DataTypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataTypeTag {
    type Err = crate::error::AdaptioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataTypeTag::ALL
            .iter()
            .copied()
            .find(|tag| tag.as_str() == s)
            .ok_or_else(|| crate::error::AdaptioError::Config(format!("unknown data type '{}'", s)))
    }
}

/// Generic callback used by [`DataTypeTag::visit`]
pub trait TypeVisitor {
    type Output;

    fn visit<T: DataType>(self) -> Self::Output;
}

/// An element type from the closed set.
///
/// Implemented for `i8..i64`, `u8..u64`, `f32`, `f64`, [`Complex32`],
/// [`Complex64`] and `String`. The bucket accessors select the typed
/// container inside a catalog, so typed access never needs a cast.
pub trait DataType:
    Clone + fmt::Debug + fmt::Display + PartialEq + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// Runtime tag for this type
    const TAG: DataTypeTag;

    #[doc(hidden)]
    fn variables(buckets: &TypedBuckets) -> &Bucket<Variable<Self>>;
    #[doc(hidden)]
    fn variables_mut(buckets: &mut TypedBuckets) -> &mut Bucket<Variable<Self>>;
    #[doc(hidden)]
    fn attributes(buckets: &TypedBuckets) -> &Bucket<Attribute<Self>>;
    #[doc(hidden)]
    fn attributes_mut(buckets: &mut TypedBuckets) -> &mut Bucket<Attribute<Self>>;

    /// Minimum and maximum of a block, for ordered types
    fn min_max(_values: &[Self]) -> Option<(Self, Self)> {
        None
    }
}

/// Fold a slice into (min, max) skipping unordered values (NaN)
pub(crate) fn ordered_min_max<T: PartialOrd + Copy>(values: &[T]) -> Option<(T, T)> {
    let mut iter = values.iter().copied().filter(|v| v.partial_cmp(v).is_some());
    let first = iter.next()?;
    Some(iter.fold((first, first), |(lo, hi), v| {
        (if v < lo { v } else { lo }, if v > hi { v } else { hi })
    }))
}

/// Number of elements selected by a count vector (1 for a single value).
///
/// `None` when the product does not fit in `usize`.
pub fn element_count(count: &[usize]) -> Option<usize> {
    count.iter().try_fold(1usize, |total, &c| total.checked_mul(c))
}

/// Render dimensions the way introspection reports them ("10, 20")
pub fn format_dims(dims: &[usize]) -> String {
    dims.iter()
        .map(|d| d.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
