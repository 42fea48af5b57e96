use crate::dtype::DType;

/// All errors that can occur within strand.
///
/// Shape, index, dtype and device checks run on the host before any work is
/// enqueued, so those variants are raised synchronously by the call that
/// detects them. Failures inside already-launched device work surface later,
/// from `Context::synchronize`, as [`Error::Backend`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Stacking, splitting, elementwise or matmul dimensions disagree.
    #[error("shape mismatch in {op}: {detail}")]
    ShapeMismatch { op: &'static str, detail: String },

    /// Host data that is not a 2-d array was handed to a matrix constructor.
    #[error("matrices work only with 2-d arrays, got {ndim} dimensions")]
    Shape { ndim: usize },

    /// A slice with a non-unit step, or an assignment touching more than one element.
    #[error("unsupported slice: {0}")]
    UnsupportedSlice(String),

    /// Single-element access outside the matrix.
    #[error("index ({row}, {col}) is out of bounds for matrix with shape ({nrows}, {ncols})")]
    IndexOutOfBounds {
        row: usize,
        col: usize,
        nrows: usize,
        ncols: usize,
    },

    /// The device could not satisfy an allocation.
    #[error("failed to allocate {bytes} bytes on device {device}: {reason}")]
    Allocation {
        bytes: usize,
        device: usize,
        reason: String,
    },

    /// Operands and context live on different devices.
    #[error("device mismatch: context is on device {expected}, operand is on device {got}")]
    DeviceMismatch { expected: usize, got: usize },

    /// An operand has the wrong element type for the operation.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// A sequence is longer than the number of unrolled timesteps.
    #[error("sequence has length {len} that is too long, the maximum is {max}")]
    SequenceTooLong { len: usize, max: usize },

    /// Block weights violate the block's shape constraints.
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    /// Operation exists in the interface but has no kernel.
    #[error("{0} is not implemented")]
    Unimplemented(&'static str),

    /// Deferred device-side failure (launch, copy or synchronize).
    #[error("backend error: {0}")]
    Backend(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// Wrap a device/driver failure.
    pub fn backend(s: impl std::fmt::Display) -> Self {
        Error::Backend(s.to_string())
    }

    pub(crate) fn shape(op: &'static str, detail: impl Into<String>) -> Self {
        Error::ShapeMismatch {
            op,
            detail: detail.into(),
        }
    }
}

/// Convenience Result type used throughout strand.
pub type Result<T> = std::result::Result<T, Error>;

/// Macro for early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
