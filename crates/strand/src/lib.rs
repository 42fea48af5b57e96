//! # strand
//!
//! Device-resident matrices, gradient connectors and recurrent blocks.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use strand::prelude::*;
//!
//! let dev = CpuDevice::new(0);
//! let ctx = Context::<CpuBackend>::new(Some(&dev)).unwrap();
//! let a = CpuMatrix::from_host(
//!     &HostArray::from_rows(&[vec![1.0f32, 2.0], vec![3.0, 4.0]]).unwrap(),
//!     None,
//!     Some(&dev),
//! )
//! .unwrap();
//! let c = CpuMatrix::empty(2, 2, DType::F32, &dev).unwrap();
//! c.assign_dot(&ctx, &a, &a, MatOp::N, MatOp::T).unwrap();
//! ctx.synchronize().unwrap();
//! assert_eq!(c.get_element(0, 1).unwrap(), 11.0);
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `strand-core` | Matrix, Layout, DType, Context, Connector, Backend trait |
//! | `strand-cpu` | Host backend with rayon GEMM |
//! | `strand-cuda` | CUDA GPU backend (feature-gated) |
//! | `strand-nn` | Block trait, DotBlock, LstmCell / LstmRnn, initializers |

/// Re-export core types.
pub use strand_core::{
    backend::{Activation, Axis, Backend, BackendDevice, BackendStorage, BackendStream, MatOp},
    bail, Connector, Context, DType, Error, GradSink, HostArray, HostData, Layout, Matrix, Result,
    SliceSpec, WithDType,
};

/// Re-export the host backend.
pub use strand_cpu::{CpuBackend, CpuDevice, CpuMatrix, CpuStorage, CpuStream};

/// Re-export CUDA backend (requires `cuda` feature + NVIDIA CUDA Toolkit).
#[cfg(feature = "cuda")]
pub use strand_cuda::{CudaBackend, CudaDevice, CudaMatrix, CudaStorage, CudaStream};

/// Re-export blocks and initializers.
pub mod nn {
    pub use strand_nn::*;
}

/// Block construction settings.
pub mod config {
    pub use strand_nn::config::BlockConfig;
}

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::config::BlockConfig;
    pub use crate::nn::{
        Block, Constant, DotBlock, Fixed, Initializer, LstmCell, LstmRnn, Scaled, Uniform,
    };
    pub use crate::{
        Axis, Backend, BackendDevice, Connector, Context, CpuBackend, CpuDevice, CpuMatrix, DType,
        Error, GradSink, HostArray, MatOp, Matrix, Result, SliceSpec,
    };
}
