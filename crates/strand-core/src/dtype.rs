use std::fmt;
use std::str::FromStr;

use crate::error::Error;

// DType: Element types a matrix can hold
//
// Matrices carry exactly one element kind. Two are supported:
//
//   F32: 32-bit float ("float"), every arithmetic kernel runs on it
//   I32: 32-bit signed int ("int"), used for column index vectors
//
// The string tags are the configuration surface: block configs and host
// interchange name dtypes as "float" / "int".

/// Enum of supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DType {
    #[default]
    F32,
    I32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::I32 => 4,
        }
    }

    /// Whether arithmetic kernels accept this dtype.
    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32)
    }

    /// The configuration tag for this dtype.
    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "float",
            DType::I32 => "int",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float" | "f32" => Ok(DType::F32),
            "int" | "i32" => Ok(DType::I32),
            other => Err(Error::msg(format!("data type {other:?} not understood"))),
        }
    }
}

// WithDType: Rust element types that map onto a DType
//
// Host interchange goes through this trait so `HostArray::from_rows` and
// friends can be written once for both element kinds.

/// Trait implemented by Rust types that can be stored in a matrix.
pub trait WithDType:
    Copy + Send + Sync + 'static + num_traits::NumCast + fmt::Debug + PartialEq
{
    /// The corresponding DType enum variant.
    const DTYPE: DType;

    /// Convert this value to f64 (for generic numeric code).
    fn to_f64(self) -> f64;

    /// Create a value of this type from f64.
    fn from_f64(v: f64) -> Self;
}

impl WithDType for f32 {
    const DTYPE: DType = DType::F32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
}

impl WithDType for i32 {
    const DTYPE: DType = DType::I32;
    fn to_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i32
    }
}
