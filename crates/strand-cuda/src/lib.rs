// CUDA Backend: GPU compute backend using cudarc
//
// This crate implements the strand Backend trait on NVIDIA GPUs: custom
// kernels compiled at device creation via NVRTC for everything pointwise,
// cuBLAS for GEMM and GEMV.
//
// ARCHITECTURE:
// - CudaDevice wraps cudarc's device handle, the loaded kernel module and the
//   device's scratch buffer
// - CudaStream is a non-blocking stream forked from the device, plus a cuBLAS
//   handle bound to it; one per Context
// - CudaStorage is an enum over CudaSlice<T> for each supported dtype
// - Kernels receive raw device addresses already advanced to the view's
//   offset, together with the view's leading dimension, so strided views
//   never need a contiguous copy
// - Host transfers go column by column (each column of a view is contiguous)
//
// The whole crate is behind the `cuda` feature so the workspace builds on
// machines without a CUDA toolkit.
//
// USAGE:
//   let device = CudaDevice::new(0)?;  // GPU ordinal 0
//   let ctx = Context::<CudaBackend>::new(Some(&device))?;
//   let m = Matrix::<CudaBackend>::empty(2, 3, DType::F32, &device)?;

#![cfg(feature = "cuda")]

mod kernels;
pub mod scratch;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use cudarc::cublas::sys::cublasOperation_t;
use cudarc::cublas::CudaBlas;
use cudarc::driver::{
    result, CudaFunction, CudaSlice, DevicePtr, DeviceRepr, DeviceSlice, LaunchAsync, LaunchConfig,
};
use cudarc::nvrtc::{compile_ptx_with_opts, CompileOptions};
use scratch::{Scratch, ScratchStats};

use strand_core::backend::{
    Activation, Axis, Backend, BackendDevice, BackendStorage, BackendStream, MatOp, MatRef,
};
use strand_core::{DType, Error, HostData, Layout, Matrix, Result};

// CudaDevice: cudarc device + compiled kernels + scratch

/// A CUDA device handle. Clonable (uses Arc internally).
pub struct CudaDevice {
    dev: Arc<cudarc::driver::CudaDevice>,
    scratch: Arc<Scratch>,
    ordinal: usize,
}

impl CudaDevice {
    /// Handle to GPU `ordinal`.
    ///
    /// The first call per ordinal opens the device and compiles the strand
    /// kernels; later calls return a handle to the same device, sharing its
    /// kernels and scratch buffer.
    pub fn new(ordinal: usize) -> Result<Self> {
        let mut opened = OPENED
            .get_or_init(|| Mutex::new(HashMap::new()))
            .lock()
            .map_err(|_| Error::backend("device registry lock poisoned"))?;
        if let Some(device) = opened.get(&ordinal) {
            return Ok(device.clone());
        }
        let device = Self::open(ordinal)?;
        opened.insert(ordinal, device.clone());
        Ok(device)
    }

    fn open(ordinal: usize) -> Result<Self> {
        let dev = cudarc::driver::CudaDevice::new(ordinal)
            .map_err(|e| Error::backend(format!("CUDA device creation failed: {e}")))?;

        // Target the device's own SASS (sm_XX) rather than PTX to avoid
        // toolkit/driver PTX version mismatches.
        let major = dev
            .attribute(cudarc::driver::sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .unwrap_or(8);
        let minor = dev
            .attribute(cudarc::driver::sys::CUdevice_attribute_enum::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .unwrap_or(0);
        let arch_str: &'static str = Box::leak(format!("sm_{major}{minor}").into_boxed_str());
        let opts = CompileOptions {
            arch: Some(arch_str),
            ..Default::default()
        };
        let ptx = compile_ptx_with_opts(kernels::KERNEL_SOURCE, opts)
            .map_err(|e| Error::backend(format!("NVRTC compilation failed: {e}")))?;
        dev.load_ptx(ptx, kernels::MODULE_NAME, kernels::KERNEL_NAMES)
            .map_err(|e| Error::backend(format!("PTX load failed: {e}")))?;
        log::debug!("opened cuda:{ordinal} ({arch_str})");

        Ok(CudaDevice {
            dev,
            scratch: Arc::new(Scratch::new()),
            ordinal,
        })
    }

    /// Get the underlying cudarc device handle.
    pub fn device(&self) -> &Arc<cudarc::driver::CudaDevice> {
        &self.dev
    }

    pub fn scratch_stats(&self) -> ScratchStats {
        self.scratch.stats()
    }

    /// Whether both handles use the same scratch buffer.
    pub fn shares_scratch(&self, other: &CudaDevice) -> bool {
        Arc::ptr_eq(&self.scratch, &other.scratch)
    }

    fn get_func(&self, name: &str) -> Result<CudaFunction> {
        self.dev
            .get_func(kernels::MODULE_NAME, name)
            .ok_or_else(|| Error::backend(format!("CUDA kernel '{name}' not found")))
    }

    fn bind(&self) -> Result<()> {
        self.dev.bind_to_thread().map_err(Error::backend)
    }
}

impl Clone for CudaDevice {
    fn clone(&self) -> Self {
        CudaDevice {
            dev: self.dev.clone(),
            scratch: self.scratch.clone(),
            ordinal: self.ordinal,
        }
    }
}

impl PartialEq for CudaDevice {
    fn eq(&self, other: &Self) -> bool {
        self.ordinal == other.ordinal
    }
}

impl fmt::Debug for CudaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CudaDevice(cuda:{})", self.ordinal)
    }
}

// Safety: cudarc's device is thread-safe (CUDA driver API is thread-safe)
unsafe impl Send for CudaDevice {}
unsafe impl Sync for CudaDevice {}

impl BackendDevice for CudaDevice {
    fn id(&self) -> usize {
        self.ordinal
    }

    fn name(&self) -> String {
        format!("cuda:{}", self.ordinal)
    }
}

// every device opened in this process, by ordinal
static OPENED: OnceLock<Mutex<HashMap<usize, CudaDevice>>> = OnceLock::new();

thread_local! {
    static CURRENT_DEVICE: RefCell<Option<CudaDevice>> = const { RefCell::new(None) };
}

// CudaStream: non-blocking stream + cuBLAS handle bound to it

/// An ordered queue of GPU work with its own cuBLAS handle.
pub struct CudaStream {
    device: CudaDevice,
    stream: cudarc::driver::CudaStream,
    blas: CudaBlas,
}

unsafe impl Send for CudaStream {}
unsafe impl Sync for CudaStream {}

impl fmt::Debug for CudaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CudaStream({})", self.device.name())
    }
}

impl BackendStream for CudaStream {
    type Device = CudaDevice;

    fn device(&self) -> &CudaDevice {
        &self.device
    }

    fn activate(&self) -> Result<()> {
        self.device.bind()?;
        CURRENT_DEVICE.with(|c| *c.borrow_mut() = Some(self.device.clone()));
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        unsafe { result::stream::synchronize(self.stream.stream) }
            .map_err(|e| Error::backend(format!("stream synchronize: {e}")))
    }
}

impl CudaStream {
    /// Launch kernel `name` with one thread per element of an `n`-element grid.
    fn launch<P>(&self, name: &str, n: usize, params: P) -> Result<()>
    where
        CudaFunction: LaunchAsync<P>,
    {
        if n == 0 {
            return Ok(());
        }
        log::trace!("launch {name} over {n} elements on {}", self.device.name());
        let func = self.device.get_func(name)?;
        unsafe { func.launch_on_stream(&self.stream, launch_cfg(n), params) }
            .map_err(|e| Error::backend(format!("launch {name}: {e}")))
    }

    /// Stage an argument table and launch without waiting.
    ///
    /// The scratch buffer stays reserved for this launch: the next table
    /// upload, on any stream, is ordered after it on the GPU.
    fn launch_with_table<P>(
        &self,
        name: &str,
        n: usize,
        table: &[u64],
        params: impl FnOnce(u64) -> P,
    ) -> Result<()>
    where
        CudaFunction: LaunchAsync<P>,
    {
        let lease = self
            .device
            .scratch
            .stage(&self.device.dev, &self.stream, table)?;
        self.launch(name, n, params(lease.ptr()))?;
        lease.retire(&self.stream)
    }
}

// CudaStorage: Device memory for each supported dtype

/// GPU-side storage. Each variant wraps a cudarc CudaSlice for its dtype.
pub enum CudaStorage {
    F32(CudaSlice<f32>),
    I32(CudaSlice<i32>),
}

impl fmt::Debug for CudaStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CudaStorage::F32(s) => write!(f, "CudaStorage::F32(len={})", s.len()),
            CudaStorage::I32(s) => write!(f, "CudaStorage::I32(len={})", s.len()),
        }
    }
}

unsafe impl Send for CudaStorage {}
unsafe impl Sync for CudaStorage {}

impl BackendStorage for CudaStorage {
    fn dtype(&self) -> DType {
        match self {
            CudaStorage::F32(_) => DType::F32,
            CudaStorage::I32(_) => DType::I32,
        }
    }

    fn len(&self) -> usize {
        match self {
            CudaStorage::F32(s) => s.len(),
            CudaStorage::I32(s) => s.len(),
        }
    }

    fn device_id(&self) -> usize {
        self.raw_device().ordinal()
    }
}

impl CudaStorage {
    fn raw_device(&self) -> Arc<cudarc::driver::CudaDevice> {
        match self {
            CudaStorage::F32(s) => s.device(),
            CudaStorage::I32(s) => s.device(),
        }
    }

    fn base_ptr(&self) -> u64 {
        match self {
            CudaStorage::F32(s) => *s.device_ptr(),
            CudaStorage::I32(s) => *s.device_ptr(),
        }
    }
}

// Helpers

type Ref<'a> = MatRef<'a, CudaBackend>;

/// Both supported dtypes are 4 bytes wide.
const ELEM_BYTES: u64 = 4;

/// Standard CUDA launch configuration for N elements.
fn launch_cfg(n: usize) -> LaunchConfig {
    const BLOCK: u32 = 256;
    let grid = (n as u32).div_ceil(BLOCK);
    LaunchConfig {
        block_dim: (BLOCK, 1, 1),
        grid_dim: (grid.max(1), 1, 1),
        shared_mem_bytes: 0,
    }
}

/// Device address of element (row, col) of an operand.
fn addr_at(m: Ref<'_>, row: usize, col: usize) -> u64 {
    m.storage.base_ptr() + m.layout.index(row, col) as u64 * ELEM_BYTES
}

/// Device address of an operand's element (0, 0).
fn addr(m: Ref<'_>) -> u64 {
    m.storage.base_ptr() + m.layout.offset() as u64 * ELEM_BYTES
}

fn opt_addr(m: Option<Ref<'_>>) -> (u64, i32) {
    m.map_or((0, 1), |m| (addr(m), ld(m)))
}

fn ld(m: Ref<'_>) -> i32 {
    m.layout.ld() as i32
}

fn dims(m: Ref<'_>) -> (i32, i32) {
    (m.layout.nrows() as i32, m.layout.ncols() as i32)
}

/// Distance between consecutive elements of a row or column vector.
fn vector_stride(layout: &Layout) -> i32 {
    if layout.nrows() == 1 {
        layout.ld() as i32
    } else {
        1
    }
}

fn cu_op(op: MatOp) -> cublasOperation_t {
    match op {
        MatOp::N => cublasOperation_t::CUBLAS_OP_N,
        MatOp::T => cublasOperation_t::CUBLAS_OP_T,
    }
}

fn download_columns<T: DeviceRepr + Default + Clone>(src: Ref<'_>) -> Result<Vec<T>> {
    let (nrows, ncols) = src.layout.dims();
    let mut out = vec![T::default(); nrows * ncols];
    if nrows == 0 {
        return Ok(out);
    }
    for (c, column) in out.chunks_mut(nrows).enumerate() {
        unsafe { result::memcpy_dtoh_sync(column, addr_at(src, 0, c)) }
            .map_err(|e| Error::backend(format!("dtoh: {e}")))?;
    }
    Ok(out)
}

fn upload_columns_sync<T: DeviceRepr>(dst: Ref<'_>, values: &[T]) -> Result<()> {
    let nrows = dst.layout.nrows();
    if nrows == 0 {
        return Ok(());
    }
    for (c, column) in values.chunks(nrows).enumerate() {
        unsafe { result::memcpy_htod_sync(addr_at(dst, 0, c), column) }
            .map_err(|e| Error::backend(format!("htod: {e}")))?;
    }
    Ok(())
}

fn upload_columns_async<T: DeviceRepr>(
    stream: &CudaStream,
    dst: Ref<'_>,
    values: &[T],
) -> Result<()> {
    let nrows = dst.layout.nrows();
    if nrows == 0 {
        return Ok(());
    }
    for (c, column) in values.chunks(nrows).enumerate() {
        unsafe { result::memcpy_htod_async(addr_at(dst, 0, c), column, stream.stream.stream) }
            .map_err(|e| Error::backend(format!("htod: {e}")))?;
    }
    Ok(())
}

fn activation_kind(act: Activation) -> i32 {
    match act {
        Activation::Tanh => 0,
        Activation::Sigmoid => 1,
        Activation::Relu => 2,
    }
}

/// Operands of `sum_hprod_f32`, passed to the kernel by value.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct HprodTerms {
    ptr: [[u64; 3]; HprodTerms::MAX_TERMS],
    ld: [[i32; 3]; HprodTerms::MAX_TERMS],
    nfactors: [i32; HprodTerms::MAX_TERMS],
}

// Safety: plain #[repr(C)] data matching the kernel's struct layout
unsafe impl DeviceRepr for HprodTerms {}

impl HprodTerms {
    const MAX_TERMS: usize = 5;

    fn pack(terms: &[Vec<Ref<'_>>]) -> Result<Self> {
        if terms.len() > Self::MAX_TERMS || terms.iter().any(|t| t.len() > 3) {
            return Err(Error::msg(format!(
                "sum_hprod takes at most {} terms of 3 factors",
                Self::MAX_TERMS
            )));
        }
        let mut packed = HprodTerms::default();
        for (t, term) in terms.iter().enumerate() {
            packed.nfactors[t] = term.len() as i32;
            for (f, factor) in term.iter().enumerate() {
                packed.ptr[t][f] = addr(*factor);
                packed.ld[t][f] = ld(*factor);
            }
        }
        Ok(packed)
    }
}

// CudaBackend: The Backend trait implementation

/// The CUDA GPU backend. This is a zero-sized marker type.
#[derive(Clone, Debug)]
pub struct CudaBackend;

/// Convenience alias for a GPU-resident matrix.
pub type CudaMatrix = Matrix<CudaBackend>;

impl Backend for CudaBackend {
    type Device = CudaDevice;
    type Stream = CudaStream;
    type Storage = CudaStorage;

    // ---- Devices and streams ----

    fn current_device() -> Result<CudaDevice> {
        match CURRENT_DEVICE.with(|c| c.borrow().clone()) {
            Some(device) => Ok(device),
            None => CudaDevice::new(0),
        }
    }

    fn create_stream(device: &CudaDevice) -> Result<CudaStream> {
        let stream = device
            .dev
            .fork_default_stream()
            .map_err(|e| Error::backend(format!("stream creation failed: {e}")))?;
        let blas = CudaBlas::new(device.dev.clone())
            .map_err(|e| Error::backend(format!("cuBLAS init failed: {e}")))?;
        unsafe { blas.set_stream(Some(&stream)) }
            .map_err(|e| Error::backend(format!("cuBLAS set_stream: {e}")))?;
        Ok(CudaStream {
            device: device.clone(),
            stream,
            blas,
        })
    }

    // ---- Allocation and host transfer ----

    fn alloc(len: usize, dtype: DType, device: &CudaDevice) -> Result<CudaStorage> {
        let oom = |e: cudarc::driver::DriverError| Error::Allocation {
            bytes: len.saturating_mul(dtype.size_in_bytes()),
            device: device.ordinal,
            reason: e.to_string(),
        };
        Ok(match dtype {
            DType::F32 => CudaStorage::F32(unsafe { device.dev.alloc::<f32>(len) }.map_err(oom)?),
            DType::I32 => CudaStorage::I32(unsafe { device.dev.alloc::<i32>(len) }.map_err(oom)?),
        })
    }

    fn from_host(data: &HostData, device: &CudaDevice) -> Result<CudaStorage> {
        let oom = |e: cudarc::driver::DriverError| Error::Allocation {
            bytes: data.len() * data.dtype().size_in_bytes(),
            device: device.ordinal,
            reason: e.to_string(),
        };
        Ok(match data {
            HostData::F32(v) => CudaStorage::F32(device.dev.htod_sync_copy(v).map_err(oom)?),
            HostData::I32(v) => CudaStorage::I32(device.dev.htod_sync_copy(v).map_err(oom)?),
        })
    }

    fn to_host(src: Ref<'_>) -> Result<HostData> {
        src.storage
            .raw_device()
            .bind_to_thread()
            .map_err(Error::backend)?;
        Ok(match src.storage {
            CudaStorage::F32(_) => HostData::F32(download_columns(src)?),
            CudaStorage::I32(_) => HostData::I32(download_columns(src)?),
        })
    }

    fn fill_sync(dst: Ref<'_>, value: f64) -> Result<()> {
        dst.storage
            .raw_device()
            .bind_to_thread()
            .map_err(Error::backend)?;
        match HostData::full(dst.layout.elem_count(), value, dst.storage.dtype()) {
            HostData::F32(v) => upload_columns_sync(dst, &v),
            HostData::I32(v) => upload_columns_sync(dst, &v),
        }
    }

    fn set_element(storage: &CudaStorage, index: usize, value: f64) -> Result<()> {
        storage.raw_device().bind_to_thread().map_err(Error::backend)?;
        let ptr = storage.base_ptr() + index as u64 * ELEM_BYTES;
        match storage {
            CudaStorage::F32(_) => unsafe { result::memcpy_htod_sync(ptr, &[value as f32]) },
            CudaStorage::I32(_) => unsafe { result::memcpy_htod_sync(ptr, &[value as i32]) },
        }
        .map_err(|e| Error::backend(format!("set_element: {e}")))
    }

    fn get_element(storage: &CudaStorage, index: usize) -> Result<f64> {
        storage.raw_device().bind_to_thread().map_err(Error::backend)?;
        let ptr = storage.base_ptr() + index as u64 * ELEM_BYTES;
        let err = |e: cudarc::driver::DriverError| Error::backend(format!("get_element: {e}"));
        Ok(match storage {
            CudaStorage::F32(_) => {
                let mut v = [0f32];
                unsafe { result::memcpy_dtoh_sync(&mut v, ptr) }.map_err(err)?;
                v[0] as f64
            }
            CudaStorage::I32(_) => {
                let mut v = [0i32];
                unsafe { result::memcpy_dtoh_sync(&mut v, ptr) }.map_err(err)?;
                v[0] as f64
            }
        })
    }

    // ---- Data movement ----

    /// Host memory is pageable, so the upload waits for its copies before
    /// returning the borrowed data.
    fn upload(stream: &CudaStream, data: &HostData, dst: Ref<'_>) -> Result<()> {
        match data.cast(dst.storage.dtype()) {
            HostData::F32(v) => upload_columns_async(stream, dst, &v)?,
            HostData::I32(v) => upload_columns_async(stream, dst, &v)?,
        }
        stream.synchronize()
    }

    fn fill(stream: &CudaStream, dst: Ref<'_>, value: f64) -> Result<()> {
        let (nrows, ncols) = dims(dst);
        let n = dst.layout.elem_count();
        match dst.storage {
            CudaStorage::F32(_) => stream.launch(
                "fill_f32",
                n,
                (addr(dst), ld(dst), nrows, ncols, value as f32),
            ),
            CudaStorage::I32(_) => stream.launch(
                "fill_i32",
                n,
                (addr(dst), ld(dst), nrows, ncols, value as i32),
            ),
        }
    }

    fn copy(stream: &CudaStream, src: Ref<'_>, dst: Ref<'_>) -> Result<()> {
        let (nrows, ncols) = dims(dst);
        let name = match dst.storage {
            CudaStorage::F32(_) => "copy_f32",
            CudaStorage::I32(_) => "copy_i32",
        };
        stream.launch(
            name,
            dst.layout.elem_count(),
            (addr(src), ld(src), addr(dst), ld(dst), nrows, ncols),
        )
    }

    // ---- Level-1 arithmetic ----

    fn scale(stream: &CudaStream, alpha: f32, src: Ref<'_>, dst: Ref<'_>) -> Result<()> {
        let (nrows, ncols) = dims(dst);
        stream.launch(
            "scale_f32",
            dst.layout.elem_count(),
            (alpha, addr(src), ld(src), addr(dst), ld(dst), nrows, ncols),
        )
    }

    fn axpy(stream: &CudaStream, alpha: f32, x: Ref<'_>, y: Ref<'_>) -> Result<()> {
        let (nrows, ncols) = dims(y);
        stream.launch(
            "axpy_f32",
            y.layout.elem_count(),
            (alpha, addr(x), ld(x), addr(y), ld(y), nrows, ncols),
        )
    }

    fn batch_sum(
        stream: &CudaStream,
        parts: &[Ref<'_>],
        dst: Ref<'_>,
        accumulate: bool,
    ) -> Result<()> {
        if parts.is_empty() {
            return if accumulate {
                Ok(())
            } else {
                Self::fill(stream, dst, 0.0)
            };
        }
        let table: Vec<u64> = parts
            .iter()
            .map(|p| addr(*p))
            .chain(parts.iter().map(|p| p.layout.ld() as u64))
            .collect();
        let (nrows, ncols) = dims(dst);
        let count = parts.len() as i32;
        stream.launch_with_table("batch_sum_f32", dst.layout.elem_count(), &table, |t| {
            (
                t,
                count,
                addr(dst),
                ld(dst),
                nrows,
                ncols,
                accumulate as i32,
            )
        })
    }

    // ---- Pointwise kernels ----

    fn activation(
        stream: &CudaStream,
        act: Activation,
        src: Ref<'_>,
        dst: Ref<'_>,
        derivative: Option<Ref<'_>>,
    ) -> Result<()> {
        let (nrows, ncols) = dims(dst);
        let (d_ptr, d_ld) = opt_addr(derivative);
        stream.launch(
            "activation_f32",
            dst.layout.elem_count(),
            (
                activation_kind(act),
                addr(src),
                ld(src),
                addr(dst),
                ld(dst),
                d_ptr,
                d_ld,
                nrows,
                ncols,
            ),
        )
    }

    fn tanh_sigmoid(
        stream: &CudaStream,
        axis: Axis,
        src: Ref<'_>,
        dst: Ref<'_>,
        derivative: Option<Ref<'_>>,
    ) -> Result<()> {
        let (nrows, ncols) = dims(dst);
        let (d_ptr, d_ld) = opt_addr(derivative);
        stream.launch(
            "tanh_sigmoid_f32",
            dst.layout.elem_count(),
            (
                (axis == Axis::Rows) as i32,
                addr(src),
                ld(src),
                addr(dst),
                ld(dst),
                d_ptr,
                d_ld,
                nrows,
                ncols,
            ),
        )
    }

    fn hprod(
        stream: &CudaStream,
        factors: &[Ref<'_>],
        dst: Ref<'_>,
        alpha: Option<f32>,
    ) -> Result<()> {
        let [a, b, rest @ ..] = factors else {
            return Err(Error::backend("hprod needs at least two factors"));
        };
        let (c_ptr, c_ld) = opt_addr(rest.first().copied());
        let (nrows, ncols) = dims(dst);
        stream.launch(
            "hprod_f32",
            dst.layout.elem_count(),
            (
                addr(*a),
                ld(*a),
                addr(*b),
                ld(*b),
                c_ptr,
                c_ld,
                addr(dst),
                ld(dst),
                nrows,
                ncols,
                alpha.unwrap_or(0.0),
                alpha.is_some() as i32,
            ),
        )
    }

    fn sum_hprod(stream: &CudaStream, terms: &[Vec<Ref<'_>>], dst: Ref<'_>) -> Result<()> {
        let packed = HprodTerms::pack(terms)?;
        let (nrows, ncols) = dims(dst);
        let nterms = terms.len() as i32;
        stream.launch(
            "sum_hprod_f32",
            dst.layout.elem_count(),
            (packed, nterms, addr(dst), ld(dst), nrows, ncols),
        )
    }

    fn hprod_sum(stream: &CudaStream, a: Ref<'_>, b: Ref<'_>, dst: Ref<'_>) -> Result<()> {
        let (nrows, ncols) = dims(a);
        stream.launch(
            "hprod_sum_f32",
            a.layout.nrows(),
            (addr(a), ld(a), addr(b), ld(b), addr(dst), nrows, ncols),
        )
    }

    fn cross_entropy(stream: &CudaStream, p: Ref<'_>, q: Ref<'_>, dst: Ref<'_>) -> Result<()> {
        let (nrows, ncols) = dims(dst);
        stream.launch(
            "cross_entropy_f32",
            dst.layout.elem_count(),
            (addr(p), ld(p), addr(q), ld(q), addr(dst), ld(dst), nrows, ncols),
        )
    }

    // ---- Column gather / scatter ----

    fn slice_columns(
        stream: &CudaStream,
        src: Ref<'_>,
        indices: Ref<'_>,
        dst: Ref<'_>,
        reverse: bool,
    ) -> Result<()> {
        let (nrows, ncols) = dims(dst);
        stream.launch(
            "slice_columns_f32",
            dst.layout.elem_count(),
            (
                addr(src),
                ld(src),
                addr(indices),
                vector_stride(&indices.layout),
                addr(dst),
                ld(dst),
                nrows,
                ncols,
                reverse as i32,
            ),
        )
    }

    fn add_scaled_at_columns(
        stream: &CudaStream,
        indices: Ref<'_>,
        alpha: f32,
        src: Ref<'_>,
        dst: Ref<'_>,
    ) -> Result<()> {
        let (nrows, ncols) = dims(src);
        stream.launch(
            "add_scaled_at_columns_f32",
            src.layout.elem_count(),
            (
                addr(indices),
                vector_stride(&indices.layout),
                alpha,
                addr(src),
                ld(src),
                addr(dst),
                ld(dst),
                nrows,
                ncols,
            ),
        )
    }

    // ---- BLAS ----

    fn gemm(
        stream: &CudaStream,
        op_a: MatOp,
        op_b: MatOp,
        alpha: f32,
        a: Ref<'_>,
        b: Ref<'_>,
        beta: f32,
        c: Ref<'_>,
    ) -> Result<()> {
        let (m, k) = op_a.apply(a.layout.dims());
        let n = c.layout.ncols();
        if m == 0 || n == 0 {
            return Ok(());
        }
        log::trace!("sgemm ({m}x{k}) * ({k}x{n}) on {}", stream.device.name());
        unsafe {
            cudarc::cublas::result::sgemm(
                *stream.blas.handle(),
                cu_op(op_a),
                cu_op(op_b),
                m as i32,
                n as i32,
                k as i32,
                (&alpha) as *const f32,
                addr(a) as *const f32,
                ld(a),
                addr(b) as *const f32,
                ld(b),
                (&beta) as *const f32,
                addr(c) as *mut f32,
                ld(c),
            )
        }
        .map_err(|e| Error::backend(format!("cuBLAS sgemm: {e}")))
    }

    fn gemv(
        stream: &CudaStream,
        op_a: MatOp,
        alpha: f32,
        a: Ref<'_>,
        x: Ref<'_>,
        beta: f32,
        y: Ref<'_>,
    ) -> Result<()> {
        let (rows, cols) = a.layout.dims();
        if y.layout.nrows() == 0 {
            return Ok(());
        }
        log::trace!("sgemv ({rows}x{cols}) on {}", stream.device.name());
        unsafe {
            cudarc::cublas::result::sgemv(
                *stream.blas.handle(),
                cu_op(op_a),
                rows as i32,
                cols as i32,
                (&alpha) as *const f32,
                addr(a) as *const f32,
                ld(a),
                addr(x) as *const f32,
                vector_stride(&x.layout),
                (&beta) as *const f32,
                addr(y) as *mut f32,
                vector_stride(&y.layout),
            )
        }
        .map_err(|e| Error::backend(format!("cuBLAS sgemv: {e}")))
    }
}
