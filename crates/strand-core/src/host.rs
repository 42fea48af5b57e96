// HostArray: Minimal host-side array for moving data on and off a device
//
// Host data is row-major (C order), the way literals are written in tests and
// the way most callers produce it. Matrices are column-major, so the
// conversion happens once at the boundary: `to_col_major` before upload,
// `from_col_major` after download.
//
// HostArray deliberately carries an arbitrary number of dimensions: it is the
// caller's data before validation, and `Matrix::from_host` rejects anything
// that is not exactly 2-d.

use crate::dtype::{DType, WithDType};
use crate::error::{Error, Result};

/// Flat host buffer, one variant per dtype.
#[derive(Debug, Clone, PartialEq)]
pub enum HostData {
    F32(Vec<f32>),
    I32(Vec<i32>),
}

impl HostData {
    pub fn dtype(&self) -> DType {
        match self {
            HostData::F32(_) => DType::F32,
            HostData::I32(_) => DType::I32,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            HostData::F32(v) => v.len(),
            HostData::I32(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Buffer of `len` copies of `value` converted to `dtype`.
    pub fn full(len: usize, value: f64, dtype: DType) -> Self {
        match dtype {
            DType::F32 => HostData::F32(vec![value as f32; len]),
            DType::I32 => HostData::I32(vec![value as i32; len]),
        }
    }

    /// Convert every element to `dtype`.
    pub fn cast(&self, dtype: DType) -> HostData {
        match (self, dtype) {
            (HostData::F32(v), DType::F32) => HostData::F32(v.clone()),
            (HostData::I32(v), DType::I32) => HostData::I32(v.clone()),
            (HostData::F32(v), DType::I32) => HostData::I32(v.iter().map(|&x| x as i32).collect()),
            (HostData::I32(v), DType::F32) => HostData::F32(v.iter().map(|&x| x as f32).collect()),
        }
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            HostData::F32(v) => v.iter().map(|&x| x as f64).collect(),
            HostData::I32(v) => v.iter().map(|&x| x as f64).collect(),
        }
    }

    fn get_f64(&self, i: usize) -> f64 {
        match self {
            HostData::F32(v) => v[i] as f64,
            HostData::I32(v) => v[i] as f64,
        }
    }

    fn permuted(&self, order: impl Iterator<Item = usize>) -> HostData {
        match self {
            HostData::F32(v) => HostData::F32(order.map(|i| v[i]).collect()),
            HostData::I32(v) => HostData::I32(order.map(|i| v[i]).collect()),
        }
    }
}

/// Element types that can be wrapped into [`HostData`].
pub trait HostElement: WithDType {
    fn wrap(data: Vec<Self>) -> HostData;
}

impl HostElement for f32 {
    fn wrap(data: Vec<Self>) -> HostData {
        HostData::F32(data)
    }
}

impl HostElement for i32 {
    fn wrap(data: Vec<Self>) -> HostData {
        HostData::I32(data)
    }
}

/// An N-dimensional row-major host array.
#[derive(Debug, Clone, PartialEq)]
pub struct HostArray {
    dims: Vec<usize>,
    data: HostData,
}

/// Element count of an `(nrows, ncols)` buffer of `dtype`.
///
/// Fails with `Error::Allocation` when the byte size does not fit the
/// address space.
pub(crate) fn checked_len(
    nrows: usize,
    ncols: usize,
    dtype: DType,
    device: usize,
) -> Result<usize> {
    nrows
        .checked_mul(ncols)
        .filter(|len| {
            len.checked_mul(dtype.size_in_bytes())
                .is_some_and(|bytes| bytes <= isize::MAX as usize)
        })
        .ok_or_else(|| Error::Allocation {
            bytes: usize::MAX,
            device,
            reason: format!("({nrows}, {ncols}) {dtype} buffer overflows the address space"),
        })
}

impl HostArray {
    /// Build from dims and flat row-major data.
    pub fn new<T: HostElement>(dims: impl Into<Vec<usize>>, data: Vec<T>) -> Result<Self> {
        Self::from_data(dims, T::wrap(data))
    }

    /// Build from dims and an already-wrapped buffer.
    pub fn from_data(dims: impl Into<Vec<usize>>, data: HostData) -> Result<Self> {
        let dims = dims.into();
        let expected = dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d));
        if expected != Some(data.len()) {
            return Err(Error::msg(format!(
                "dims {:?} do not match {} elements",
                dims,
                data.len()
            )));
        }
        Ok(HostArray { dims, data })
    }

    /// Build a 2-d array from equally long rows.
    pub fn from_rows<T: HostElement>(rows: &[Vec<T>]) -> Result<Self> {
        let ncols = rows.first().map_or(0, |r| r.len());
        if rows.iter().any(|r| r.len() != ncols) {
            return Err(Error::msg("ragged rows: every row must have the same length"));
        }
        let data: Vec<T> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Self::new(vec![rows.len(), ncols], data)
    }

    /// 2-d array with every element set to `value`.
    pub fn full(nrows: usize, ncols: usize, value: f64, dtype: DType) -> Result<Self> {
        let len = checked_len(nrows, ncols, dtype, 0)?;
        Ok(HostArray {
            dims: vec![nrows, ncols],
            data: HostData::full(len, value, dtype),
        })
    }

    /// Rebuild a 2-d array from column-major device data.
    pub fn from_col_major(nrows: usize, ncols: usize, data: HostData) -> Result<Self> {
        if nrows.checked_mul(ncols) != Some(data.len()) {
            return Err(Error::msg(format!(
                "column-major buffer of {} elements cannot hold ({nrows}, {ncols})",
                data.len()
            )));
        }
        let order = (0..nrows).flat_map(|r| (0..ncols).map(move |c| c * nrows + r));
        Ok(HostArray {
            dims: vec![nrows, ncols],
            data: data.permuted(order),
        })
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn data(&self) -> &HostData {
        &self.data
    }

    /// Same values, different element type.
    pub fn cast(&self, dtype: DType) -> HostArray {
        HostArray {
            dims: self.dims.clone(),
            data: self.data.cast(dtype),
        }
    }

    /// (nrows, ncols) of a 2-d array, `Error::Shape` otherwise.
    pub fn shape_2d(&self) -> Result<(usize, usize)> {
        match self.dims.as_slice() {
            [r, c] => Ok((*r, *c)),
            other => Err(Error::Shape { ndim: other.len() }),
        }
    }

    /// Column-major copy of a 2-d array's data (ready for upload).
    pub fn to_col_major(&self) -> Result<HostData> {
        let (nrows, ncols) = self.shape_2d()?;
        let order = (0..ncols).flat_map(|c| (0..nrows).map(move |r| r * ncols + c));
        Ok(self.data.permuted(order))
    }

    /// Element (row, col) of a 2-d array as f64.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        let (nrows, ncols) = self.shape_2d().ok()?;
        if row >= nrows || col >= ncols {
            return None;
        }
        Some(self.data.get_f64(row * ncols + col))
    }

    /// All elements in row-major order as f64.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.data.to_f64_vec()
    }
}
