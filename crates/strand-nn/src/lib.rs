//! # strand-nn
//!
//! Differentiable blocks for strand.
//!
//! Provides blocks following the [`Block`] trait pattern:
//!
//! 1. **Block trait**: every block implements `fprop()` / `bprop()`
//! 2. **DotBlock**: affine transform: `output = x·W + b`
//! 3. **LstmCell / LstmRnn**: LSTM unrolled over a maximum sequence length
//! 4. **Initializers**: constant, fixed, uniform and Glorot-scaled weights
//! 5. **BlockConfig**: device, learning flag and dtype for construction
//!
//! Blocks are generic over `Backend` (like `Matrix<B>`), so the same
//! definition runs on the host backend or on CUDA.

pub mod block;
pub mod config;
pub mod dot;
pub mod init;
pub mod lstm;

pub use block::Block;
pub use config::BlockConfig;
pub use dot::DotBlock;
pub use init::{Constant, Fixed, Initializer, Scaled, Uniform};
pub use lstm::{LstmCell, LstmRnn, PrevState};
