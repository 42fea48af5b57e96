// BlockConfig: Construction-time settings shared by every block
//
// The configuration surface is small: which device to run on (the current
// device when unset), whether the block computes gradients, and the element
// type of the parameters it allocates.
//
//   let config = BlockConfig::<CpuBackend>::default()
//       .with_device(CpuDevice::new(0))
//       .with_learning(false);

use strand_core::{Backend, Context, DType, Result};

/// Settings for block construction.
pub struct BlockConfig<B: Backend> {
    pub device: Option<B::Device>,
    pub learning: bool,
    pub dtype: DType,
}

impl<B: Backend> Default for BlockConfig<B> {
    fn default() -> Self {
        BlockConfig {
            device: None,
            learning: true,
            dtype: DType::F32,
        }
    }
}

impl<B: Backend> Clone for BlockConfig<B> {
    fn clone(&self) -> Self {
        BlockConfig {
            device: self.device.clone(),
            learning: self.learning,
            dtype: self.dtype,
        }
    }
}

impl<B: Backend> std::fmt::Debug for BlockConfig<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockConfig")
            .field("device", &self.device)
            .field("learning", &self.learning)
            .field("dtype", &self.dtype)
            .finish()
    }
}

impl<B: Backend> BlockConfig<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(mut self, device: B::Device) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_learning(mut self, learning: bool) -> Self {
        self.learning = learning;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    /// A fresh context on the configured device.
    pub fn context(&self) -> Result<Context<B>> {
        Context::new(self.device.as_ref())
    }
}
