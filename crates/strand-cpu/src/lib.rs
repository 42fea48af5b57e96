//! # strand-cpu
//!
//! Host-resident backend for strand.
//!
//! Every kernel runs eagerly on the calling thread (GEMM fans out over
//! output columns with rayon), so all streams are trivially ordered and
//! `synchronize` never has anything to wait for. This is the backend the
//! test suites run on.
//!
//! Devices are virtual ordinals (`CpuDevice::new(1)`), which is enough to
//! exercise the device checks without hardware.

use std::cell::Cell;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use rayon::prelude::*;
use strand_core::backend::{
    Activation, Axis, Backend, BackendDevice, BackendStorage, BackendStream, MatOp, MatRef,
};
use strand_core::{DType, Error, HostData, Matrix, Result};

// Device and stream

/// A virtual host device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CpuDevice(usize);

impl CpuDevice {
    pub fn new(ordinal: usize) -> Self {
        CpuDevice(ordinal)
    }

    pub fn ordinal(&self) -> usize {
        self.0
    }
}

impl BackendDevice for CpuDevice {
    fn id(&self) -> usize {
        self.0
    }

    fn name(&self) -> String {
        format!("cpu:{}", self.0)
    }
}

thread_local! {
    static CURRENT_DEVICE: Cell<usize> = const { Cell::new(0) };
}

/// A host "stream": work is done by the time the call returns.
#[derive(Debug)]
pub struct CpuStream {
    device: CpuDevice,
}

impl BackendStream for CpuStream {
    type Device = CpuDevice;

    fn device(&self) -> &CpuDevice {
        &self.device
    }

    fn activate(&self) -> Result<()> {
        CURRENT_DEVICE.with(|c| c.set(self.device.0));
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

// Storage
//
// One lock per allocation. Kernels read every operand into a dense vector,
// compute, then write the destination back, and never hold two locks at
// once. That makes aliased operands (in-place ops, views of one buffer used
// as both input and output) safe without any special casing.

#[derive(Debug)]
enum CpuData {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

/// A host allocation.
#[derive(Debug)]
pub struct CpuStorage {
    device: CpuDevice,
    dtype: DType,
    len: usize,
    data: RwLock<CpuData>,
}

impl BackendStorage for CpuStorage {
    fn dtype(&self) -> DType {
        self.dtype
    }

    fn len(&self) -> usize {
        self.len
    }

    fn device_id(&self) -> usize {
        self.device.0
    }
}

impl CpuStorage {
    fn read(&self) -> Result<RwLockReadGuard<'_, CpuData>> {
        self.data
            .read()
            .map_err(|_| Error::backend("cpu storage lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, CpuData>> {
        self.data
            .write()
            .map_err(|_| Error::backend("cpu storage lock poisoned"))
    }
}

type Ref<'a> = MatRef<'a, CpuBackend>;

fn zeroed<T: Clone + Default>(len: usize, dtype: DType, device: &CpuDevice) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len).map_err(|e| Error::Allocation {
        bytes: len.saturating_mul(dtype.size_in_bytes()),
        device: device.0,
        reason: e.to_string(),
    })?;
    v.resize(len, T::default());
    Ok(v)
}

/// Dense column-major copy of a float operand.
fn gather(src: Ref<'_>) -> Result<Vec<f32>> {
    match &*src.storage.read()? {
        CpuData::F32(v) => Ok(src.layout.indices().map(|i| v[i]).collect()),
        CpuData::I32(_) => Err(Error::DTypeMismatch {
            expected: DType::F32,
            got: DType::I32,
        }),
    }
}

fn gather_indices(src: Ref<'_>) -> Result<Vec<i32>> {
    match &*src.storage.read()? {
        CpuData::I32(v) => Ok(src.layout.indices().map(|i| v[i]).collect()),
        CpuData::F32(_) => Err(Error::DTypeMismatch {
            expected: DType::I32,
            got: DType::F32,
        }),
    }
}

fn gather_any(src: Ref<'_>) -> Result<HostData> {
    Ok(match &*src.storage.read()? {
        CpuData::F32(v) => HostData::F32(src.layout.indices().map(|i| v[i]).collect()),
        CpuData::I32(v) => HostData::I32(src.layout.indices().map(|i| v[i]).collect()),
    })
}

/// Write dense column-major `values` into a float operand.
fn scatter(dst: Ref<'_>, values: &[f32]) -> Result<()> {
    match &mut *dst.storage.write()? {
        CpuData::F32(v) => {
            for (i, x) in dst.layout.indices().zip(values) {
                v[i] = *x;
            }
            Ok(())
        }
        CpuData::I32(_) => Err(Error::DTypeMismatch {
            expected: DType::F32,
            got: DType::I32,
        }),
    }
}

fn scatter_any(dst: Ref<'_>, values: &HostData) -> Result<()> {
    let values = values.cast(dst.storage.dtype);
    match (&mut *dst.storage.write()?, &values) {
        (CpuData::F32(v), HostData::F32(src)) => {
            for (i, x) in dst.layout.indices().zip(src) {
                v[i] = *x;
            }
        }
        (CpuData::I32(v), HostData::I32(src)) => {
            for (i, x) in dst.layout.indices().zip(src) {
                v[i] = *x;
            }
        }
        _ => unreachable!("values were cast to the destination dtype"),
    }
    Ok(())
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Forward value and derivative of `act` at `x`.
fn activate(act: Activation, x: f32) -> (f32, f32) {
    match act {
        Activation::Tanh => {
            let y = x.tanh();
            (y, 1.0 - y * y)
        }
        Activation::Sigmoid => {
            let y = sigmoid(x);
            (y, y * (1.0 - y))
        }
        Activation::Relu => {
            if x > 0.0 {
                (x, 1.0)
            } else {
                (0.0, 0.0)
            }
        }
    }
}

fn elementwise(
    act: impl Fn(usize) -> Activation,
    src: Ref<'_>,
    dst: Ref<'_>,
    derivative: Option<Ref<'_>>,
) -> Result<()> {
    let x = gather(src)?;
    let (y, dy): (Vec<f32>, Vec<f32>) = x
        .iter()
        .enumerate()
        .map(|(k, &v)| activate(act(k), v))
        .unzip();
    scatter(dst, &y)?;
    if let Some(d) = derivative {
        scatter(d, &dy)?;
    }
    Ok(())
}

fn product(factors: &[Ref<'_>], len: usize) -> Result<Vec<f32>> {
    let mut acc = vec![1.0f32; len];
    for f in factors {
        for (a, x) in acc.iter_mut().zip(gather(*f)?) {
            *a *= x;
        }
    }
    Ok(acc)
}

/// Column-major GEMM on dense operands, parallel over output columns.
#[allow(clippy::too_many_arguments)]
fn gemm_dense(
    op_a: MatOp,
    op_b: MatOp,
    alpha: f32,
    a: &[f32],
    a_rows: usize,
    b: &[f32],
    b_rows: usize,
    beta: f32,
    c: &mut [f32],
    m: usize,
    k: usize,
) {
    let a_at = |i: usize, l: usize| match op_a {
        MatOp::N => a[l * a_rows + i],
        MatOp::T => a[i * a_rows + l],
    };
    let b_at = |l: usize, j: usize| match op_b {
        MatOp::N => b[j * b_rows + l],
        MatOp::T => b[l * b_rows + j],
    };
    if m == 0 {
        return;
    }
    c.par_chunks_mut(m).enumerate().for_each(|(j, col)| {
        for (i, out) in col.iter_mut().enumerate() {
            let mut acc = 0.0f32;
            for l in 0..k {
                acc += a_at(i, l) * b_at(l, j);
            }
            *out = if beta == 0.0 {
                alpha * acc
            } else {
                alpha * acc + beta * *out
            };
        }
    });
}

// Backend

/// The host backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

/// Convenience alias for a host-resident matrix.
pub type CpuMatrix = Matrix<CpuBackend>;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Stream = CpuStream;
    type Storage = CpuStorage;

    fn current_device() -> Result<CpuDevice> {
        Ok(CpuDevice(CURRENT_DEVICE.with(|c| c.get())))
    }

    fn create_stream(device: &CpuDevice) -> Result<CpuStream> {
        Ok(CpuStream { device: *device })
    }

    fn alloc(len: usize, dtype: DType, device: &CpuDevice) -> Result<CpuStorage> {
        let data = match dtype {
            DType::F32 => CpuData::F32(zeroed(len, dtype, device)?),
            DType::I32 => CpuData::I32(zeroed(len, dtype, device)?),
        };
        Ok(CpuStorage {
            device: *device,
            dtype,
            len,
            data: RwLock::new(data),
        })
    }

    fn from_host(data: &HostData, device: &CpuDevice) -> Result<CpuStorage> {
        let cpu = match data {
            HostData::F32(v) => CpuData::F32(v.clone()),
            HostData::I32(v) => CpuData::I32(v.clone()),
        };
        Ok(CpuStorage {
            device: *device,
            dtype: data.dtype(),
            len: data.len(),
            data: RwLock::new(cpu),
        })
    }

    fn to_host(src: Ref<'_>) -> Result<HostData> {
        gather_any(src)
    }

    fn fill_sync(dst: Ref<'_>, value: f64) -> Result<()> {
        let values = HostData::full(dst.layout.elem_count(), value, dst.storage.dtype);
        scatter_any(dst, &values)
    }

    fn set_element(storage: &CpuStorage, index: usize, value: f64) -> Result<()> {
        let out_of_range = || Error::backend(format!("flat index {index} outside allocation"));
        match &mut *storage.write()? {
            CpuData::F32(v) => *v.get_mut(index).ok_or_else(out_of_range)? = value as f32,
            CpuData::I32(v) => *v.get_mut(index).ok_or_else(out_of_range)? = value as i32,
        }
        Ok(())
    }

    fn get_element(storage: &CpuStorage, index: usize) -> Result<f64> {
        let out_of_range = || Error::backend(format!("flat index {index} outside allocation"));
        Ok(match &*storage.read()? {
            CpuData::F32(v) => *v.get(index).ok_or_else(out_of_range)? as f64,
            CpuData::I32(v) => *v.get(index).ok_or_else(out_of_range)? as f64,
        })
    }

    fn upload(_stream: &CpuStream, data: &HostData, dst: Ref<'_>) -> Result<()> {
        scatter_any(dst, data)
    }

    fn fill(_stream: &CpuStream, dst: Ref<'_>, value: f64) -> Result<()> {
        Self::fill_sync(dst, value)
    }

    fn copy(_stream: &CpuStream, src: Ref<'_>, dst: Ref<'_>) -> Result<()> {
        let values = gather_any(src)?;
        scatter_any(dst, &values)
    }

    fn scale(_stream: &CpuStream, alpha: f32, src: Ref<'_>, dst: Ref<'_>) -> Result<()> {
        let x: Vec<f32> = gather(src)?.into_iter().map(|v| alpha * v).collect();
        scatter(dst, &x)
    }

    fn axpy(_stream: &CpuStream, alpha: f32, x: Ref<'_>, y: Ref<'_>) -> Result<()> {
        let xs = gather(x)?;
        let mut ys = gather(y)?;
        for (yv, xv) in ys.iter_mut().zip(xs) {
            *yv += alpha * xv;
        }
        scatter(y, &ys)
    }

    fn batch_sum(
        _stream: &CpuStream,
        parts: &[Ref<'_>],
        dst: Ref<'_>,
        accumulate: bool,
    ) -> Result<()> {
        let mut acc = if accumulate {
            gather(dst)?
        } else {
            vec![0.0; dst.layout.elem_count()]
        };
        for p in parts {
            for (a, x) in acc.iter_mut().zip(gather(*p)?) {
                *a += x;
            }
        }
        scatter(dst, &acc)
    }

    fn activation(
        _stream: &CpuStream,
        act: Activation,
        src: Ref<'_>,
        dst: Ref<'_>,
        derivative: Option<Ref<'_>>,
    ) -> Result<()> {
        elementwise(|_| act, src, dst, derivative)
    }

    fn tanh_sigmoid(
        _stream: &CpuStream,
        axis: Axis,
        src: Ref<'_>,
        dst: Ref<'_>,
        derivative: Option<Ref<'_>>,
    ) -> Result<()> {
        let nrows = src.layout.nrows().max(1);
        let (quarter, along_rows) = match axis {
            Axis::Rows => (src.layout.nrows() / 4, true),
            Axis::Cols => (src.layout.ncols() / 4, false),
        };
        let pick = |k: usize| {
            let pos = if along_rows { k % nrows } else { k / nrows };
            if pos < quarter {
                Activation::Tanh
            } else {
                Activation::Sigmoid
            }
        };
        elementwise(pick, src, dst, derivative)
    }

    fn hprod(
        _stream: &CpuStream,
        factors: &[Ref<'_>],
        dst: Ref<'_>,
        alpha: Option<f32>,
    ) -> Result<()> {
        let mut out = product(factors, dst.layout.elem_count())?;
        if let Some(alpha) = alpha {
            for (o, d) in out.iter_mut().zip(gather(dst)?) {
                *o += alpha * d;
            }
        }
        scatter(dst, &out)
    }

    fn sum_hprod(_stream: &CpuStream, terms: &[Vec<Ref<'_>>], dst: Ref<'_>) -> Result<()> {
        let len = dst.layout.elem_count();
        let mut out = vec![0.0f32; len];
        for term in terms {
            for (o, p) in out.iter_mut().zip(product(term, len)?) {
                *o += p;
            }
        }
        scatter(dst, &out)
    }

    fn hprod_sum(_stream: &CpuStream, a: Ref<'_>, b: Ref<'_>, dst: Ref<'_>) -> Result<()> {
        let nrows = a.layout.nrows();
        let (av, bv) = (gather(a)?, gather(b)?);
        let mut out = vec![0.0f32; nrows];
        for (k, (x, y)) in av.iter().zip(&bv).enumerate() {
            out[k % nrows] += x * y;
        }
        scatter(dst, &out)
    }

    fn cross_entropy(_stream: &CpuStream, p: Ref<'_>, q: Ref<'_>, dst: Ref<'_>) -> Result<()> {
        let out: Vec<f32> = gather(p)?
            .into_iter()
            .zip(gather(q)?)
            .map(|(p, q)| -(p * q.ln() + (1.0 - p) * (1.0 - q).ln()))
            .collect();
        scatter(dst, &out)
    }

    fn slice_columns(
        _stream: &CpuStream,
        src: Ref<'_>,
        indices: Ref<'_>,
        dst: Ref<'_>,
        reverse: bool,
    ) -> Result<()> {
        let idx = gather_indices(indices)?;
        let (nrows, ncols) = src.layout.dims();
        let values = gather(src)?;
        let n = idx.len();
        let mut out = Vec::with_capacity(nrows * n);
        for j in 0..n {
            let col = idx[if reverse { n - 1 - j } else { j }];
            let col = usize::try_from(col)
                .ok()
                .filter(|&c| c < ncols)
                .ok_or(Error::IndexOutOfBounds {
                    row: 0,
                    col: col.max(0) as usize,
                    nrows,
                    ncols,
                })?;
            out.extend_from_slice(&values[col * nrows..(col + 1) * nrows]);
        }
        scatter(dst, &out)
    }

    fn add_scaled_at_columns(
        _stream: &CpuStream,
        indices: Ref<'_>,
        alpha: f32,
        src: Ref<'_>,
        dst: Ref<'_>,
    ) -> Result<()> {
        let idx = gather_indices(indices)?;
        let (nrows, ncols) = dst.layout.dims();
        let values = gather(src)?;
        let mut out = gather(dst)?;
        for (j, &col) in idx.iter().enumerate() {
            let col = usize::try_from(col)
                .ok()
                .filter(|&c| c < ncols)
                .ok_or(Error::IndexOutOfBounds {
                    row: 0,
                    col: col.max(0) as usize,
                    nrows,
                    ncols,
                })?;
            for r in 0..nrows {
                out[col * nrows + r] += alpha * values[j * nrows + r];
            }
        }
        scatter(dst, &out)
    }

    fn gemm(
        _stream: &CpuStream,
        op_a: MatOp,
        op_b: MatOp,
        alpha: f32,
        a: Ref<'_>,
        b: Ref<'_>,
        beta: f32,
        c: Ref<'_>,
    ) -> Result<()> {
        let (m, k) = op_a.apply(a.layout.dims());
        let av = gather(a)?;
        let bv = gather(b)?;
        let mut cv = if beta == 0.0 {
            vec![0.0; c.layout.elem_count()]
        } else {
            gather(c)?
        };
        gemm_dense(
            op_a,
            op_b,
            alpha,
            &av,
            a.layout.nrows(),
            &bv,
            b.layout.nrows(),
            beta,
            &mut cv,
            m,
            k,
        );
        scatter(c, &cv)
    }

    fn gemv(
        stream: &CpuStream,
        op_a: MatOp,
        alpha: f32,
        a: Ref<'_>,
        x: Ref<'_>,
        beta: f32,
        y: Ref<'_>,
    ) -> Result<()> {
        Self::gemm(stream, op_a, MatOp::N, alpha, a, x, beta, y)
    }
}
