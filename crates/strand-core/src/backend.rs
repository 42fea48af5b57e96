use std::fmt;

use crate::dtype::DType;
use crate::error::Result;
use crate::host::HostData;
use crate::layout::Layout;

// Backend: The fixed set of device operations strand is built from
//
// A backend provides three associated types and a flat list of kernels:
//
//   Device : an addressable compute device (ordinal + name)
//   Stream : an ordered work queue on one device, carrying whatever handles
//             the kernels need (BLAS handle, compiled modules)
//   Storage: one flat allocation on a device
//
// Operands are never whole buffers: every kernel receives `MatRef`s, a
// storage plus a column-major `Layout` (offset + leading dimension), so row
// slices, column slices and owning matrices all go through the same entry
// points. Kernels must honour `ld` for every operand, including the output.
//
// Writes go through `&Storage`. Views share their parent's buffer, so the
// storage type provides its own interior mutability (a lock on the host, raw
// device pointers on CUDA).
//
// Shape, dtype and device validation happens in `Matrix` before dispatch;
// backends may assume operands are consistent.

/// Identifies a compute device.
pub trait BackendDevice: Clone + fmt::Debug + PartialEq + Send + Sync + 'static {
    /// Device ordinal, used for device-equality checks.
    fn id(&self) -> usize;

    /// A human-readable name for this device (e.g., "cpu:0", "cuda:0").
    fn name(&self) -> String;
}

/// An ordered queue of device work.
pub trait BackendStream: fmt::Debug + Send + Sync + 'static {
    type Device: BackendDevice;

    /// The device this stream enqueues work on.
    fn device(&self) -> &Self::Device;

    /// Make this stream's device current for the calling thread.
    fn activate(&self) -> Result<()>;

    /// Block until all enqueued work has finished.
    ///
    /// Failures of previously launched work are reported here.
    fn synchronize(&self) -> Result<()>;
}

/// One flat device allocation.
pub trait BackendStorage: fmt::Debug + Send + Sync + 'static {
    /// The data type of the elements in this storage.
    fn dtype(&self) -> DType;

    /// Total number of elements that fit in this storage.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ordinal of the device holding this allocation.
    fn device_id(&self) -> usize;
}

// Operation parameters

/// Pointwise activations with a closed-form derivative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Tanh,
    Sigmoid,
    Relu,
}

impl Activation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Activation::Tanh => "tanh",
            Activation::Sigmoid => "sigmoid",
            Activation::Relu => "relu",
        }
    }
}

/// Whether a GEMM operand is used as stored or transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatOp {
    #[default]
    N,
    T,
}

impl MatOp {
    /// (rows, cols) of `op(x)` for an operand of shape `dims`.
    pub fn apply(&self, dims: (usize, usize)) -> (usize, usize) {
        match self {
            MatOp::N => dims,
            MatOp::T => (dims.1, dims.0),
        }
    }
}

/// A matrix axis.
///
/// `Rows` is the row dimension (dimension 0): splitting along rows cuts
/// horizontal bands, tiling along rows repeats a row vector down the matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Rows,
    Cols,
}

/// A borrowed kernel operand: a storage seen through a layout.
pub struct MatRef<'a, B: Backend> {
    pub storage: &'a B::Storage,
    pub layout: Layout,
}

impl<'a, B: Backend> MatRef<'a, B> {
    pub fn new(storage: &'a B::Storage, layout: Layout) -> Self {
        MatRef { storage, layout }
    }
}

impl<B: Backend> Clone for MatRef<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: Backend> Copy for MatRef<'_, B> {}

impl<B: Backend> fmt::Debug for MatRef<'_, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatRef")
            .field("layout", &self.layout)
            .field("dtype", &self.storage.dtype())
            .finish()
    }
}

// Backend Trait: The kernel and BLAS surface every backend implements

/// A complete compute backend.
///
/// Functions taking a `stream` are stream-ordered: they enqueue work and may
/// return before it runs. The others are synchronous.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    /// The device type for this backend.
    type Device: BackendDevice;
    /// The stream type for this backend.
    type Stream: BackendStream<Device = Self::Device>;
    /// The storage type for this backend.
    type Storage: BackendStorage;

    //  Devices and streams

    /// The device currently selected on the calling thread.
    fn current_device() -> Result<Self::Device>;

    /// Create a new stream (and its BLAS handle) on `device`.
    fn create_stream(device: &Self::Device) -> Result<Self::Stream>;

    //  Allocation and host transfer (synchronous)

    /// Allocate `len` elements. Contents are unspecified.
    fn alloc(len: usize, dtype: DType, device: &Self::Device) -> Result<Self::Storage>;

    /// Allocate a buffer holding `data` (dense, column-major).
    fn from_host(data: &HostData, device: &Self::Device) -> Result<Self::Storage>;

    /// Read the elements of `src` back, dense and column-major.
    fn to_host(src: MatRef<'_, Self>) -> Result<HostData>;

    /// Set every element of `dst` to `value` through a host-staged copy.
    fn fill_sync(dst: MatRef<'_, Self>, value: f64) -> Result<()>;

    /// Write one element at flat buffer `index`.
    fn set_element(storage: &Self::Storage, index: usize, value: f64) -> Result<()>;

    /// Read one element at flat buffer `index`.
    fn get_element(storage: &Self::Storage, index: usize) -> Result<f64>;

    //  Data movement

    /// Upload dense column-major `data` into `dst`.
    fn upload(stream: &Self::Stream, data: &HostData, dst: MatRef<'_, Self>) -> Result<()>;

    /// Set every element of `dst` to `value`.
    fn fill(stream: &Self::Stream, dst: MatRef<'_, Self>, value: f64) -> Result<()>;

    /// `dst = src`, both possibly strided.
    fn copy(stream: &Self::Stream, src: MatRef<'_, Self>, dst: MatRef<'_, Self>) -> Result<()>;

    //  Level-1 arithmetic

    /// `dst = alpha * src`.
    fn scale(
        stream: &Self::Stream,
        alpha: f32,
        src: MatRef<'_, Self>,
        dst: MatRef<'_, Self>,
    ) -> Result<()>;

    /// `y += alpha * x`.
    fn axpy(stream: &Self::Stream, alpha: f32, x: MatRef<'_, Self>, y: MatRef<'_, Self>)
        -> Result<()>;

    /// `dst = Σ parts` (or `dst += Σ parts` when `accumulate`).
    fn batch_sum(
        stream: &Self::Stream,
        parts: &[MatRef<'_, Self>],
        dst: MatRef<'_, Self>,
        accumulate: bool,
    ) -> Result<()>;

    //  Pointwise kernels

    /// `dst = act(src)`, and `derivative = act'(src)` when requested.
    fn activation(
        stream: &Self::Stream,
        act: Activation,
        src: MatRef<'_, Self>,
        dst: MatRef<'_, Self>,
        derivative: Option<MatRef<'_, Self>>,
    ) -> Result<()>;

    /// tanh on the first quarter of `axis`, sigmoid on the other three.
    fn tanh_sigmoid(
        stream: &Self::Stream,
        axis: Axis,
        src: MatRef<'_, Self>,
        dst: MatRef<'_, Self>,
        derivative: Option<MatRef<'_, Self>>,
    ) -> Result<()>;

    /// `dst = Π factors` (2 or 3 factors), or `dst = Π factors + alpha * dst`
    /// when `alpha` is given.
    fn hprod(
        stream: &Self::Stream,
        factors: &[MatRef<'_, Self>],
        dst: MatRef<'_, Self>,
        alpha: Option<f32>,
    ) -> Result<()>;

    /// `dst = Σ_k Π terms[k]`.
    fn sum_hprod(
        stream: &Self::Stream,
        terms: &[Vec<MatRef<'_, Self>>],
        dst: MatRef<'_, Self>,
    ) -> Result<()>;

    /// `dst[:, 0] = Σ_j a[:, j] * b[:, j]`.
    fn hprod_sum(
        stream: &Self::Stream,
        a: MatRef<'_, Self>,
        b: MatRef<'_, Self>,
        dst: MatRef<'_, Self>,
    ) -> Result<()>;

    /// Elementwise `-(p ln q + (1 - p) ln(1 - q))`.
    fn cross_entropy(
        stream: &Self::Stream,
        p: MatRef<'_, Self>,
        q: MatRef<'_, Self>,
        dst: MatRef<'_, Self>,
    ) -> Result<()>;

    //  Column gather / scatter

    /// `dst[:, j] = src[:, idx[j]]`, or `src[:, idx[n-1-j]]` when `reverse`.
    fn slice_columns(
        stream: &Self::Stream,
        src: MatRef<'_, Self>,
        indices: MatRef<'_, Self>,
        dst: MatRef<'_, Self>,
        reverse: bool,
    ) -> Result<()>;

    /// `dst[:, idx[j]] += alpha * src[:, j]`.
    fn add_scaled_at_columns(
        stream: &Self::Stream,
        indices: MatRef<'_, Self>,
        alpha: f32,
        src: MatRef<'_, Self>,
        dst: MatRef<'_, Self>,
    ) -> Result<()>;

    //  BLAS

    /// `c = alpha * op_a(a) * op_b(b) + beta * c`.
    #[allow(clippy::too_many_arguments)]
    fn gemm(
        stream: &Self::Stream,
        op_a: MatOp,
        op_b: MatOp,
        alpha: f32,
        a: MatRef<'_, Self>,
        b: MatRef<'_, Self>,
        beta: f32,
        c: MatRef<'_, Self>,
    ) -> Result<()>;

    /// `y = alpha * op_a(a) * x + beta * y` for column vectors `x`, `y`.
    fn gemv(
        stream: &Self::Stream,
        op_a: MatOp,
        alpha: f32,
        a: MatRef<'_, Self>,
        x: MatRef<'_, Self>,
        beta: f32,
        y: MatRef<'_, Self>,
    ) -> Result<()>;
}
