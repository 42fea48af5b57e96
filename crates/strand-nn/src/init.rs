// nn::init: Parameter initializers
//
// An initializer has a fixed (nrows, ncols) and hands out a fresh host array
// of that shape on every call. Blocks that need several matrices of the
// same kind call it repeatedly: LstmRnn samples its W initializer four times,
// once per gate.
//
// Shapes are known before anything is sampled, so a block can validate them
// before it allocates device memory.
//
// AVAILABLE INITIALIZERS:
//
//   Constant::new(r, c, val)            all elements = val
//   Fixed::new(array)                   the same array on every call
//   Uniform::new(r, c, low, high, seed) U(low, high) from a seeded StdRng
//   Scaled::glorot(r, c, seed)          U(-k, k), k = sqrt(6 / (r + c))

use rand::distributions::{Distribution, Uniform as UniformDist};
use rand::rngs::StdRng;
use rand::SeedableRng;

use strand_core::{DType, Error, HostArray, Result};

/// Source of initial parameter values.
pub trait Initializer {
    /// Shape of every sampled array.
    fn dims(&self) -> (usize, usize);

    /// Produce the next array.
    fn sample(&mut self) -> Result<HostArray>;
}

/// Every element set to one value.
#[derive(Debug, Clone)]
pub struct Constant {
    nrows: usize,
    ncols: usize,
    value: f64,
}

impl Constant {
    pub fn new(nrows: usize, ncols: usize, value: f64) -> Self {
        Constant { nrows, ncols, value }
    }
}

impl Initializer for Constant {
    fn dims(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    fn sample(&mut self) -> Result<HostArray> {
        HostArray::full(self.nrows, self.ncols, self.value, DType::F32)
    }
}

/// A copy of one given array on every call.
#[derive(Debug, Clone)]
pub struct Fixed {
    array: HostArray,
    dims: (usize, usize),
}

impl Fixed {
    pub fn new(array: HostArray) -> Result<Self> {
        let dims = array.shape_2d()?;
        Ok(Fixed { array, dims })
    }
}

impl Initializer for Fixed {
    fn dims(&self) -> (usize, usize) {
        self.dims
    }

    fn sample(&mut self) -> Result<HostArray> {
        Ok(self.array.clone())
    }
}

/// Independent draws from U(low, high).
#[derive(Debug, Clone)]
pub struct Uniform {
    nrows: usize,
    ncols: usize,
    dist: UniformDist<f32>,
    rng: StdRng,
}

impl Uniform {
    pub fn new(nrows: usize, ncols: usize, low: f64, high: f64, seed: u64) -> Result<Self> {
        if low.is_nan() || high.is_nan() || low > high {
            return Err(Error::msg(format!(
                "uniform initializer needs low <= high, got [{low}, {high}]"
            )));
        }
        Ok(Uniform {
            nrows,
            ncols,
            dist: UniformDist::new_inclusive(low as f32, high as f32),
            rng: StdRng::seed_from_u64(seed),
        })
    }
}

impl Initializer for Uniform {
    fn dims(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    fn sample(&mut self) -> Result<HostArray> {
        let data: Vec<f32> = (0..self.nrows * self.ncols)
            .map(|_| self.dist.sample(&mut self.rng))
            .collect();
        HostArray::new(vec![self.nrows, self.ncols], data)
    }
}

/// Uniform draws scaled by the fan-in and fan-out of the matrix.
///
/// Rows are the input dimension and columns the output dimension, matching
/// the `x · W` orientation used by the blocks.
#[derive(Debug, Clone)]
pub struct Scaled {
    inner: Uniform,
    bound: f64,
}

impl Scaled {
    /// Glorot (Xavier) uniform: U(-k, k) with k = sqrt(6 / (fan_in + fan_out)).
    pub fn glorot(nrows: usize, ncols: usize, seed: u64) -> Result<Self> {
        Self::with_gain(nrows, ncols, 1.0, seed)
    }

    /// Glorot uniform multiplied by `gain`.
    pub fn with_gain(nrows: usize, ncols: usize, gain: f64, seed: u64) -> Result<Self> {
        let fans = (nrows + ncols).max(1) as f64;
        let bound = gain * (6.0 / fans).sqrt();
        Ok(Scaled {
            inner: Uniform::new(nrows, ncols, -bound, bound, seed)?,
            bound,
        })
    }

    /// The half-width of the sampling interval.
    pub fn bound(&self) -> f64 {
        self.bound
    }
}

impl Initializer for Scaled {
    fn dims(&self) -> (usize, usize) {
        self.inner.dims()
    }

    fn sample(&mut self) -> Result<HostArray> {
        self.inner.sample()
    }
}
