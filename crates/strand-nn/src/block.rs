// Block trait: The interface every differentiable block implements
//
// A block is wired once, at construction: it registers itself as a consumer
// of its input connectors and creates connectors for its outputs. After that
// training alternates two calls:
//
//   fprop()  read the inputs, write the outputs, mark the outputs ready
//   bprop()  read the output gradients, write into the input gradient sinks
//
// Both take `&mut self` because blocks keep per-traversal state (the LSTM
// remembers how many timesteps the last forward pass ran).
//
// GENERIC OVER BACKEND:
//
// Blocks are generic over B: Backend and touch device memory only through
// Matrix operations, so the same block runs on the host and the CUDA backend.

use strand_core::{Backend, Matrix, Result};

/// The contract shared by all blocks.
pub trait Block<B: Backend> {
    /// Forward pass over the block's inputs.
    fn fprop(&mut self) -> Result<()>;

    /// Backward pass. A no-op for blocks that are not learning.
    fn bprop(&mut self) -> Result<()>;

    /// The matrices an optimizer would update.
    fn params(&self) -> Vec<Matrix<B>>;

    /// Gradients for `params()`, in the same order. Empty when not learning.
    fn grads(&self) -> Vec<Matrix<B>>;

    /// Whether `bprop` computes anything.
    fn is_learning(&self) -> bool;

    /// Total number of scalar parameters in this block.
    fn num_parameters(&self) -> usize {
        self.params().iter().map(|p| p.nelems()).sum()
    }
}
