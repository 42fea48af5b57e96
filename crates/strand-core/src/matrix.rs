use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::backend::{Activation, Axis, Backend, BackendDevice, BackendStorage, MatOp, MatRef};
use crate::context::Context;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::host::{checked_len, HostArray};
use crate::layout::{Layout, SliceSpec};

// Matrix: A 2-d, column-major handle onto device memory
//
// A Matrix is a (storage, layout) pair. The storage is an `Arc` around one
// device allocation; the layout says which part of it this handle covers.
//
// OWNERSHIP:
//
//   Constructors (`empty`, `zeros`, `from_host`, `empty_like`) return owning
//   handles. Slices, column views, reshapes and clones return views sharing
//   the same `Arc`. The allocation is released exactly once, when the last
//   handle to it goes away, so a view can never dangle. `is_owner` only
//   records which handle created the buffer.
//
// WRITES:
//
//   Every operation writes through `&self`. Writing through a view is
//   visible through the parent and every other view of the same region;
//   that aliasing is how the LSTM gate quarters and the gradient sinks work.
//
// ORDERING:
//
//   Operations taking a `Context` validate their operands on the host, then
//   enqueue work on the context's stream and return. Host reads (`to_host`,
//   `get_element`) and host-staged writes (`fill`, `set_element`) are
//   synchronous and do not wait for streams: synchronize the producing
//   context first.

/// A device matrix: owning or viewing handle.
///
/// Cloning a matrix yields a view of the same elements.
pub struct Matrix<B: Backend> {
    storage: Arc<B::Storage>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
    owner: bool,
}

impl<B: Backend> Clone for Matrix<B> {
    fn clone(&self) -> Self {
        self.view_with_layout(self.layout)
    }
}

impl<B: Backend> fmt::Debug for Matrix<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Matrix(shape=({}, {}), dtype={}, device={}, owner={})",
            self.nrows(),
            self.ncols(),
            self.dtype,
            self.device.name(),
            self.owner,
        )
    }
}

impl<B: Backend> Matrix<B> {
    // Internal constructors

    fn from_storage(storage: B::Storage, nrows: usize, ncols: usize, device: B::Device) -> Self {
        let dtype = storage.dtype();
        Matrix {
            storage: Arc::new(storage),
            layout: Layout::contiguous(nrows, ncols),
            dtype,
            device,
            owner: true,
        }
    }

    fn view_with_layout(&self, layout: Layout) -> Self {
        Matrix {
            storage: Arc::clone(&self.storage),
            layout,
            dtype: self.dtype,
            device: self.device.clone(),
            owner: false,
        }
    }

    fn sub_ref(&self, layout: Layout) -> MatRef<'_, B> {
        MatRef::new(&*self.storage, layout)
    }

    // Creation

    /// Allocate an uninitialized matrix.
    pub fn empty(nrows: usize, ncols: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        let len = checked_len(nrows, ncols, dtype, device.id())?;
        let storage = B::alloc(len, dtype, device)?;
        log::debug!(
            "allocated ({nrows}, {ncols}) {dtype} matrix on {}",
            device.name()
        );
        Ok(Self::from_storage(storage, nrows, ncols, device.clone()))
    }

    /// Allocate a matrix and zero it synchronously.
    pub fn zeros(nrows: usize, ncols: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        let m = Self::empty(nrows, ncols, dtype, device)?;
        m.fill(0.0)?;
        Ok(m)
    }

    /// Allocate an uninitialized matrix with this one's shape and dtype.
    pub fn empty_like(&self, device: Option<&B::Device>) -> Result<Self> {
        let device = device.unwrap_or(&self.device);
        Self::empty(self.nrows(), self.ncols(), self.dtype, device)
    }

    /// Upload a 2-d host array, optionally casting it to `dtype`.
    ///
    /// Lands on the current device when `device` is `None`.
    pub fn from_host(
        array: &HostArray,
        dtype: Option<DType>,
        device: Option<&B::Device>,
    ) -> Result<Self> {
        let device = match device {
            Some(device) => device.clone(),
            None => B::current_device()?,
        };
        let device = &device;
        let (nrows, ncols) = array.shape_2d()?;
        let data = array.to_col_major()?;
        let data = match dtype {
            Some(dt) if dt != data.dtype() => data.cast(dt),
            _ => data,
        };
        let storage = B::from_host(&data, device)?;
        log::debug!(
            "uploaded ({nrows}, {ncols}) {} matrix to {}",
            data.dtype(),
            device.name()
        );
        Ok(Self::from_storage(storage, nrows, ncols, device.clone()))
    }

    // Accessors

    pub fn nrows(&self) -> usize {
        self.layout.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.layout.ncols()
    }

    pub fn dims(&self) -> (usize, usize) {
        self.layout.dims()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn device_id(&self) -> usize {
        self.device.id()
    }

    pub fn nelems(&self) -> usize {
        self.layout.elem_count()
    }

    pub fn nbytes(&self) -> usize {
        self.nelems() * self.dtype.size_in_bytes()
    }

    /// Whether this handle allocated its buffer.
    pub fn is_owner(&self) -> bool {
        self.owner
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn storage(&self) -> &B::Storage {
        &self.storage
    }

    /// Whether both handles point into the same allocation.
    pub fn shares_storage(&self, other: &Matrix<B>) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// This matrix as a kernel operand.
    pub fn mat_ref(&self) -> MatRef<'_, B> {
        MatRef::new(&*self.storage, self.layout)
    }

    // Views (no data movement)

    /// A non-owning handle on the same elements.
    pub fn view(&self) -> Matrix<B> {
        self.clone()
    }

    /// Sub-matrix view.
    ///
    /// Each axis accepts `..`, `a..b`, `a..`, `..b` or a single index, and
    /// any of these with `.step(1)`. Row slices are strided views.
    pub fn slice(&self, rows: impl Into<SliceSpec>, cols: impl Into<SliceSpec>) -> Result<Self> {
        let rows = rows.into().resolve(self.nrows(), "row")?;
        let cols = cols.into().resolve(self.ncols(), "column")?;
        Ok(self.view_with_layout(self.layout.slice(rows, cols)))
    }

    /// Column `j` as an (nrows, 1) view.
    pub fn column(&self, j: usize) -> Result<Self> {
        self.slice(.., j)
    }

    /// Columns `range` as a view.
    pub fn columns(&self, range: Range<usize>) -> Result<Self> {
        self.slice(.., range)
    }

    /// Every column as its own view.
    pub fn to_list(&self) -> Vec<Self> {
        (0..self.ncols())
            .map(|j| self.view_with_layout(self.layout.slice(0..self.nrows(), j..j + 1)))
            .collect()
    }

    /// Same elements seen with a different shape. Contiguous matrices only.
    pub fn reshape(&self, nrows: usize, ncols: usize) -> Result<Self> {
        if !self.is_contiguous() {
            return Err(Error::UnsupportedSlice(
                "cannot reshape a strided view, copy it first".to_string(),
            ));
        }
        if nrows.checked_mul(ncols) != Some(self.nelems()) {
            return Err(Error::shape(
                "reshape",
                format!(
                    "cannot view ({}, {}) as ({nrows}, {ncols})",
                    self.nrows(),
                    self.ncols()
                ),
            ));
        }
        Ok(self.view_with_layout(self.layout.reshape(nrows, ncols)))
    }

    /// All elements as one column, in column-major order.
    pub fn ravel(&self) -> Result<Self> {
        self.reshape(self.nelems(), 1)
    }

    // Host interchange (synchronous)

    /// Download the elements into a row-major host array.
    pub fn to_host(&self) -> Result<HostArray> {
        let data = B::to_host(self.mat_ref())?;
        HostArray::from_col_major(self.nrows(), self.ncols(), data)
    }

    /// Overwrite every element with `value` through a host-staged copy.
    pub fn fill(&self, value: f64) -> Result<()> {
        B::fill_sync(self.mat_ref(), value)
    }

    pub fn set_element(&self, row: usize, col: usize, value: f64) -> Result<()> {
        self.check_index(row, col)?;
        B::set_element(&self.storage, self.layout.index(row, col), value)
    }

    pub fn get_element(&self, row: usize, col: usize) -> Result<f64> {
        self.check_index(row, col)?;
        B::get_element(&self.storage, self.layout.index(row, col))
    }

    // Validation helpers

    fn check_index(&self, row: usize, col: usize) -> Result<()> {
        if row >= self.nrows() || col >= self.ncols() {
            return Err(Error::IndexOutOfBounds {
                row,
                col,
                nrows: self.nrows(),
                ncols: self.ncols(),
            });
        }
        Ok(())
    }

    fn check_float(&self) -> Result<()> {
        if self.dtype != DType::F32 {
            return Err(Error::DTypeMismatch {
                expected: DType::F32,
                got: self.dtype,
            });
        }
        Ok(())
    }

    /// Device and dtype checks for an arithmetic op on `self` and `others`.
    fn check_arith(&self, ctx: &Context<B>, others: &[&Matrix<B>]) -> Result<()> {
        ctx.check_device(self.device_id())?;
        self.check_float()?;
        for m in others {
            ctx.check_device(m.device_id())?;
            m.check_float()?;
        }
        Ok(())
    }

    fn check_same_dims(&self, op: &'static str, other: &Matrix<B>) -> Result<()> {
        if self.dims() != other.dims() {
            return Err(Error::shape(
                op,
                format!("expected {:?}, got {:?}", self.dims(), other.dims()),
            ));
        }
        Ok(())
    }

    fn check_index_vector(&self, ctx: &Context<B>, len: usize) -> Result<()> {
        ctx.check_device(self.device_id())?;
        if self.dtype != DType::I32 {
            return Err(Error::DTypeMismatch {
                expected: DType::I32,
                got: self.dtype,
            });
        }
        if self.nrows().min(self.ncols()) > 1 || self.nelems() != len {
            return Err(Error::shape(
                "column indices",
                format!(
                    "expected a vector of {len} indices, got {:?}",
                    self.dims()
                ),
            ));
        }
        Ok(())
    }

    fn extent(&self, axis: Axis) -> usize {
        match axis {
            Axis::Rows => self.nrows(),
            Axis::Cols => self.ncols(),
        }
    }

    /// The band `range` along `axis`, spanning the whole other axis.
    fn band(&self, axis: Axis, range: Range<usize>) -> Layout {
        match axis {
            Axis::Rows => self.layout.slice(range, 0..self.ncols()),
            Axis::Cols => self.layout.slice(0..self.nrows(), range),
        }
    }

    // Data movement

    /// Upload a host array into this (already allocated) matrix.
    pub fn to_device(&self, ctx: &Context<B>, array: &HostArray) -> Result<()> {
        ctx.check_device(self.device_id())?;
        let dims = array.shape_2d()?;
        if dims != self.dims() {
            return Err(Error::shape(
                "to_device",
                format!("host array is {dims:?}, matrix is {:?}", self.dims()),
            ));
        }
        if array.dtype() != self.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.dtype,
                got: array.dtype(),
            });
        }
        let data = array.to_col_major()?;
        ctx.activate()?;
        B::upload(ctx.stream(), &data, self.mat_ref())
    }

    /// Stream-ordered fill.
    pub fn assign_scalar(&self, ctx: &Context<B>, value: f64) -> Result<()> {
        ctx.check_device(self.device_id())?;
        ctx.activate()?;
        B::fill(ctx.stream(), self.mat_ref(), value)
    }

    /// `dst = self`.
    pub fn copy_to(&self, ctx: &Context<B>, dst: &Matrix<B>) -> Result<()> {
        ctx.check_device(self.device_id())?;
        ctx.check_device(dst.device_id())?;
        if self.dtype != dst.dtype {
            return Err(Error::DTypeMismatch {
                expected: self.dtype,
                got: dst.dtype,
            });
        }
        self.check_same_dims("copy_to", dst)?;
        ctx.activate()?;
        B::copy(ctx.stream(), self.mat_ref(), dst.mat_ref())
    }

    fn assign_stack(
        &self,
        ctx: &Context<B>,
        op: &'static str,
        axis: Axis,
        parts: &[&Matrix<B>],
    ) -> Result<()> {
        ctx.check_device(self.device_id())?;
        let other = match axis {
            Axis::Rows => Axis::Cols,
            Axis::Cols => Axis::Rows,
        };
        let mut total = 0;
        for (k, p) in parts.iter().enumerate() {
            ctx.check_device(p.device_id())?;
            if p.dtype != self.dtype {
                return Err(Error::DTypeMismatch {
                    expected: self.dtype,
                    got: p.dtype,
                });
            }
            if p.extent(other) != self.extent(other) {
                return Err(Error::shape(
                    op,
                    format!(
                        "part {k} has shape {:?}, destination has shape {:?}",
                        p.dims(),
                        self.dims()
                    ),
                ));
            }
            total += p.extent(axis);
        }
        if total != self.extent(axis) {
            return Err(Error::shape(
                op,
                format!(
                    "parts cover {total} along {axis:?}, destination has {}",
                    self.extent(axis)
                ),
            ));
        }
        ctx.activate()?;
        let mut start = 0;
        for p in parts {
            let n = p.extent(axis);
            B::copy(
                ctx.stream(),
                p.mat_ref(),
                self.sub_ref(self.band(axis, start..start + n)),
            )?;
            start += n;
        }
        Ok(())
    }

    fn split(
        &self,
        ctx: &Context<B>,
        op: &'static str,
        axis: Axis,
        dsts: &[&Matrix<B>],
        ranges: Option<&[(usize, usize)]>,
    ) -> Result<()> {
        ctx.check_device(self.device_id())?;
        let other = match axis {
            Axis::Rows => Axis::Cols,
            Axis::Cols => Axis::Rows,
        };
        let bands: Vec<Range<usize>> = match ranges {
            Some(ranges) => {
                if ranges.len() != dsts.len() {
                    return Err(Error::shape(
                        op,
                        format!(
                            "{} ranges for {} destinations",
                            ranges.len(),
                            dsts.len()
                        ),
                    ));
                }
                ranges.iter().map(|&(a, b)| a..b).collect()
            }
            None => {
                let total: usize = dsts.iter().map(|d| d.extent(axis)).sum();
                if total != self.extent(axis) {
                    return Err(Error::shape(
                        op,
                        format!(
                            "destinations cover {total} along {axis:?}, source has {}",
                            self.extent(axis)
                        ),
                    ));
                }
                let mut start = 0;
                dsts.iter()
                    .map(|d| {
                        let r = start..start + d.extent(axis);
                        start = r.end;
                        r
                    })
                    .collect()
            }
        };
        for (k, (d, r)) in dsts.iter().zip(&bands).enumerate() {
            ctx.check_device(d.device_id())?;
            if d.dtype != self.dtype {
                return Err(Error::DTypeMismatch {
                    expected: self.dtype,
                    got: d.dtype,
                });
            }
            if r.start > r.end || r.end > self.extent(axis) {
                return Err(Error::shape(
                    op,
                    format!(
                        "range {}..{} is outside 0..{}",
                        r.start,
                        r.end,
                        self.extent(axis)
                    ),
                ));
            }
            if d.extent(axis) != r.len() || d.extent(other) != self.extent(other) {
                return Err(Error::shape(
                    op,
                    format!(
                        "destination {k} has shape {:?}, range {}..{} needs {:?}",
                        d.dims(),
                        r.start,
                        r.end,
                        self.layout_dims_for(axis, r.len())
                    ),
                ));
            }
        }
        ctx.activate()?;
        for (d, r) in dsts.iter().zip(bands) {
            B::copy(ctx.stream(), self.sub_ref(self.band(axis, r)), d.mat_ref())?;
        }
        Ok(())
    }

    fn layout_dims_for(&self, axis: Axis, len: usize) -> (usize, usize) {
        match axis {
            Axis::Rows => (len, self.ncols()),
            Axis::Cols => (self.nrows(), len),
        }
    }

    /// `self = [parts[0] | parts[1] | ...]`.
    pub fn assign_hstack(&self, ctx: &Context<B>, parts: &[&Matrix<B>]) -> Result<()> {
        self.assign_stack(ctx, "assign_hstack", Axis::Cols, parts)
    }

    /// `self = [parts[0]; parts[1]; ...]`.
    pub fn assign_vstack(&self, ctx: &Context<B>, parts: &[&Matrix<B>]) -> Result<()> {
        self.assign_stack(ctx, "assign_vstack", Axis::Rows, parts)
    }

    /// Copy consecutive column bands (or the given `(start, stop)` column
    /// ranges) of `self` into `dsts`.
    pub fn hsplit(
        &self,
        ctx: &Context<B>,
        dsts: &[&Matrix<B>],
        ranges: Option<&[(usize, usize)]>,
    ) -> Result<()> {
        self.split(ctx, "hsplit", Axis::Cols, dsts, ranges)
    }

    /// Row-band counterpart of [`Matrix::hsplit`].
    pub fn vsplit(
        &self,
        ctx: &Context<B>,
        dsts: &[&Matrix<B>],
        ranges: Option<&[(usize, usize)]>,
    ) -> Result<()> {
        self.split(ctx, "vsplit", Axis::Rows, dsts, ranges)
    }

    /// Broadcast `a` over `self`.
    ///
    /// `Axis::Rows` repeats a (1, ncols) row down every row; `Axis::Cols`
    /// repeats an (nrows, 1) column across every column.
    pub fn tile(&self, ctx: &Context<B>, axis: Axis, a: &Matrix<B>) -> Result<()> {
        self.check_arith(ctx, &[a])?;
        let expected = self.layout_dims_for(axis, 1);
        if a.dims() != expected {
            return Err(Error::shape(
                "tile",
                format!("expected {expected:?}, got {:?}", a.dims()),
            ));
        }
        ctx.activate()?;
        for k in 0..self.extent(axis) {
            B::copy(ctx.stream(), a.mat_ref(), self.sub_ref(self.band(axis, k..k + 1)))?;
        }
        Ok(())
    }

    // Level-1 arithmetic

    /// `out = alpha * self`, in place when `out` is `None`.
    pub fn scale(&self, ctx: &Context<B>, alpha: f32, out: Option<&Matrix<B>>) -> Result<()> {
        let out = out.unwrap_or(self);
        self.check_arith(ctx, &[out])?;
        self.check_same_dims("scale", out)?;
        ctx.activate()?;
        B::scale(ctx.stream(), alpha, self.mat_ref(), out.mat_ref())
    }

    /// `self += alpha * a`.
    pub fn add_scaled(&self, ctx: &Context<B>, alpha: f32, a: &Matrix<B>) -> Result<()> {
        self.check_arith(ctx, &[a])?;
        self.check_same_dims("add_scaled", a)?;
        ctx.activate()?;
        B::axpy(ctx.stream(), alpha, a.mat_ref(), self.mat_ref())
    }

    pub fn add(&self, ctx: &Context<B>, a: &Matrix<B>) -> Result<()> {
        self.add_scaled(ctx, 1.0, a)
    }

    pub fn sub(&self, ctx: &Context<B>, a: &Matrix<B>) -> Result<()> {
        self.add_scaled(ctx, -1.0, a)
    }

    fn batch_sum(
        &self,
        ctx: &Context<B>,
        op: &'static str,
        parts: &[&Matrix<B>],
        accumulate: bool,
    ) -> Result<()> {
        self.check_arith(ctx, parts)?;
        for p in parts {
            self.check_same_dims(op, p)?;
        }
        ctx.activate()?;
        let refs: Vec<MatRef<'_, B>> = parts.iter().map(|p| p.mat_ref()).collect();
        B::batch_sum(ctx.stream(), &refs, self.mat_ref(), accumulate)
    }

    /// `self += Σ parts`.
    pub fn add_sum(&self, ctx: &Context<B>, parts: &[&Matrix<B>]) -> Result<()> {
        self.batch_sum(ctx, "add_sum", parts, true)
    }

    /// `self = Σ parts` (zero when `parts` is empty).
    pub fn assign_sum(&self, ctx: &Context<B>, parts: &[&Matrix<B>]) -> Result<()> {
        self.batch_sum(ctx, "assign_sum", parts, false)
    }

    // Pointwise

    fn apply_activation(
        &self,
        ctx: &Context<B>,
        act: Activation,
        out: &Matrix<B>,
        derivative: Option<&Matrix<B>>,
    ) -> Result<()> {
        self.check_arith(ctx, &[out])?;
        self.check_same_dims(act.as_str(), out)?;
        if let Some(d) = derivative {
            self.check_arith(ctx, &[d])?;
            self.check_same_dims(act.as_str(), d)?;
        }
        ctx.activate()?;
        B::activation(
            ctx.stream(),
            act,
            self.mat_ref(),
            out.mat_ref(),
            derivative.map(|d| d.mat_ref()),
        )
    }

    /// `out = tanh(self)`, plus `derivative = 1 - out²` when given.
    pub fn tanh(
        &self,
        ctx: &Context<B>,
        out: &Matrix<B>,
        derivative: Option<&Matrix<B>>,
    ) -> Result<()> {
        self.apply_activation(ctx, Activation::Tanh, out, derivative)
    }

    /// `out = σ(self)`, plus `derivative = out (1 - out)` when given.
    pub fn sigmoid(
        &self,
        ctx: &Context<B>,
        out: &Matrix<B>,
        derivative: Option<&Matrix<B>>,
    ) -> Result<()> {
        self.apply_activation(ctx, Activation::Sigmoid, out, derivative)
    }

    /// `out = max(self, 0)`, plus the 0/1 step as `derivative` when given.
    pub fn relu(
        &self,
        ctx: &Context<B>,
        out: &Matrix<B>,
        derivative: Option<&Matrix<B>>,
    ) -> Result<()> {
        self.apply_activation(ctx, Activation::Relu, out, derivative)
    }

    /// tanh over the first quarter of `axis`, sigmoid over the rest.
    ///
    /// This is the LSTM gate activation: with the gates laid out z|i|f|o
    /// along `axis`, z gets tanh and i, f, o get sigmoid.
    pub fn tanh_sigmoid(
        &self,
        ctx: &Context<B>,
        axis: Axis,
        out: &Matrix<B>,
        derivative: Option<&Matrix<B>>,
    ) -> Result<()> {
        self.check_arith(ctx, &[out])?;
        self.check_same_dims("tanh_sigmoid", out)?;
        if let Some(d) = derivative {
            self.check_arith(ctx, &[d])?;
            self.check_same_dims("tanh_sigmoid", d)?;
        }
        if self.extent(axis) % 4 != 0 {
            return Err(Error::shape(
                "tanh_sigmoid",
                format!(
                    "{axis:?} extent {} is not divisible into four gates",
                    self.extent(axis)
                ),
            ));
        }
        ctx.activate()?;
        B::tanh_sigmoid(
            ctx.stream(),
            axis,
            self.mat_ref(),
            out.mat_ref(),
            derivative.map(|d| d.mat_ref()),
        )
    }

    /// Not provided by any backend.
    pub fn softmax(&self, _ctx: &Context<B>, _out: &Matrix<B>) -> Result<()> {
        Err(Error::Unimplemented("softmax"))
    }

    fn hprod(
        &self,
        ctx: &Context<B>,
        op: &'static str,
        factors: &[&Matrix<B>],
        alpha: Option<f32>,
    ) -> Result<()> {
        self.check_arith(ctx, factors)?;
        for f in factors {
            self.check_same_dims(op, f)?;
        }
        ctx.activate()?;
        let refs: Vec<MatRef<'_, B>> = factors.iter().map(|f| f.mat_ref()).collect();
        B::hprod(ctx.stream(), &refs, self.mat_ref(), alpha)
    }

    /// `self = a ⊙ b (⊙ c) + alpha * self`.
    pub fn add_hprod(
        &self,
        ctx: &Context<B>,
        a: &Matrix<B>,
        b: &Matrix<B>,
        c: Option<&Matrix<B>>,
        alpha: f32,
    ) -> Result<()> {
        let factors: Vec<&Matrix<B>> = [Some(a), Some(b), c].into_iter().flatten().collect();
        self.hprod(ctx, "add_hprod", &factors, Some(alpha))
    }

    /// `self = a ⊙ b (⊙ c)`.
    pub fn assign_hprod(
        &self,
        ctx: &Context<B>,
        a: &Matrix<B>,
        b: &Matrix<B>,
        c: Option<&Matrix<B>>,
    ) -> Result<()> {
        let factors: Vec<&Matrix<B>> = [Some(a), Some(b), c].into_iter().flatten().collect();
        self.hprod(ctx, "assign_hprod", &factors, None)
    }

    /// `self = Σ_k Π terms[k]` for 2 to 5 terms of 2 or 3 factors.
    pub fn assign_sum_hprod(&self, ctx: &Context<B>, terms: &[&[&Matrix<B>]]) -> Result<()> {
        if !(2..=5).contains(&terms.len()) {
            return Err(Error::shape(
                "assign_sum_hprod",
                format!("expected 2 to 5 terms, got {}", terms.len()),
            ));
        }
        for term in terms {
            if !(2..=3).contains(&term.len()) {
                return Err(Error::shape(
                    "assign_sum_hprod",
                    format!("expected 2 or 3 factors per term, got {}", term.len()),
                ));
            }
            self.check_arith(ctx, term)?;
            for f in term.iter() {
                self.check_same_dims("assign_sum_hprod", f)?;
            }
        }
        ctx.activate()?;
        let refs: Vec<Vec<MatRef<'_, B>>> = terms
            .iter()
            .map(|term| term.iter().map(|f| f.mat_ref()).collect())
            .collect();
        B::sum_hprod(ctx.stream(), &refs, self.mat_ref())
    }

    /// `self[:, 0] = Σ_j a[:, j] ⊙ b[:, j]`.
    pub fn assign_hprod_sum(&self, ctx: &Context<B>, a: &Matrix<B>, b: &Matrix<B>) -> Result<()> {
        self.check_arith(ctx, &[a, b])?;
        a.check_same_dims("assign_hprod_sum", b)?;
        if self.dims() != (a.nrows(), 1) {
            return Err(Error::shape(
                "assign_hprod_sum",
                format!(
                    "destination must be ({}, 1), got {:?}",
                    a.nrows(),
                    self.dims()
                ),
            ));
        }
        ctx.activate()?;
        B::hprod_sum(ctx.stream(), a.mat_ref(), b.mat_ref(), self.mat_ref())
    }

    /// Elementwise binary cross-entropy `-(p ln q + (1 - p) ln(1 - q))`.
    pub fn assign_cross_entropy(&self, ctx: &Context<B>, p: &Matrix<B>, q: &Matrix<B>) -> Result<()> {
        self.check_arith(ctx, &[p, q])?;
        self.check_same_dims("assign_cross_entropy", p)?;
        self.check_same_dims("assign_cross_entropy", q)?;
        ctx.activate()?;
        B::cross_entropy(ctx.stream(), p.mat_ref(), q.mat_ref(), self.mat_ref())
    }

    // Column gather / scatter

    /// `out[:, j] = self[:, indices[j]]`.
    ///
    /// With `reverse` the index vector is read back to front:
    /// `out[:, j] = self[:, indices[n - 1 - j]]`. Index values are not
    /// checked on the host.
    pub fn slice_columns(
        &self,
        ctx: &Context<B>,
        indices: &Matrix<B>,
        out: &Matrix<B>,
        reverse: bool,
    ) -> Result<()> {
        self.check_arith(ctx, &[out])?;
        indices.check_index_vector(ctx, out.ncols())?;
        if out.nrows() != self.nrows() {
            return Err(Error::shape(
                "slice_columns",
                format!("source has {} rows, output has {}", self.nrows(), out.nrows()),
            ));
        }
        ctx.activate()?;
        B::slice_columns(
            ctx.stream(),
            self.mat_ref(),
            indices.mat_ref(),
            out.mat_ref(),
            reverse,
        )
    }

    /// `self[:, indices[j]] += alpha * a[:, j]`.
    pub fn add_scaled_at_columns(
        &self,
        ctx: &Context<B>,
        indices: &Matrix<B>,
        alpha: f32,
        a: &Matrix<B>,
    ) -> Result<()> {
        self.check_arith(ctx, &[a])?;
        indices.check_index_vector(ctx, a.ncols())?;
        if a.nrows() != self.nrows() {
            return Err(Error::shape(
                "add_scaled_at_columns",
                format!("destination has {} rows, source has {}", self.nrows(), a.nrows()),
            ));
        }
        ctx.activate()?;
        B::add_scaled_at_columns(ctx.stream(), indices.mat_ref(), alpha, a.mat_ref(), self.mat_ref())
    }

    /// `self[:, indices[j]] += a[:, j]`.
    pub fn add_at_columns(&self, ctx: &Context<B>, indices: &Matrix<B>, a: &Matrix<B>) -> Result<()> {
        self.add_scaled_at_columns(ctx, indices, 1.0, a)
    }

    // Matrix products

    /// `self = op_a(a) · op_b(b)`.
    pub fn assign_dot(
        &self,
        ctx: &Context<B>,
        a: &Matrix<B>,
        b: &Matrix<B>,
        op_a: MatOp,
        op_b: MatOp,
    ) -> Result<()> {
        self.add_dot(ctx, a, b, op_a, op_b, 1.0, 0.0)
    }

    /// `self = alpha · op_a(a) · op_b(b) + beta · self`.
    ///
    /// Dispatches to GEMV when `self` is a single column and `op_b` is `N`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_dot(
        &self,
        ctx: &Context<B>,
        a: &Matrix<B>,
        b: &Matrix<B>,
        op_a: MatOp,
        op_b: MatOp,
        alpha: f32,
        beta: f32,
    ) -> Result<()> {
        self.check_arith(ctx, &[a, b])?;
        let (m, k) = op_a.apply(a.dims());
        let (k2, n) = op_b.apply(b.dims());
        if k != k2 || self.dims() != (m, n) {
            return Err(Error::shape(
                "dot",
                format!(
                    "op(a) is ({m}, {k}), op(b) is ({k2}, {n}), output is {:?}",
                    self.dims()
                ),
            ));
        }
        ctx.activate()?;
        if n == 1 && op_b == MatOp::N {
            B::gemv(
                ctx.stream(),
                op_a,
                alpha,
                a.mat_ref(),
                b.mat_ref(),
                beta,
                self.mat_ref(),
            )
        } else {
            B::gemm(
                ctx.stream(),
                op_a,
                op_b,
                alpha,
                a.mat_ref(),
                b.mat_ref(),
                beta,
                self.mat_ref(),
            )
        }
    }
}
