use std::fmt;
use std::sync::Arc;

use crate::backend::{Backend, BackendDevice, BackendStream};
use crate::error::{Error, Result};

// Context: A device, one stream on it, and the handles the kernels need
//
// Every stream-ordered matrix operation takes a context as its first
// argument. Work enqueued on the same context executes in call order; work on
// two different contexts is unordered until one of them is synchronized.
// Blocks typically hold two: one for the forward pass and one for backward.
//
// Contexts are reference counted: cloning one hands out another handle to
// the same stream.

/// Execution context: device + stream + BLAS/kernel handle.
pub struct Context<B: Backend> {
    stream: Arc<B::Stream>,
}

impl<B: Backend> Context<B> {
    /// Create a context on `device`, or on the current device when `None`.
    pub fn new(device: Option<&B::Device>) -> Result<Self> {
        let device = match device {
            Some(d) => d.clone(),
            None => B::current_device()?,
        };
        let stream = B::create_stream(&device)?;
        log::debug!("created context on {}", device.name());
        Ok(Context {
            stream: Arc::new(stream),
        })
    }

    pub fn device(&self) -> &B::Device {
        self.stream.device()
    }

    pub fn device_id(&self) -> usize {
        self.device().id()
    }

    /// The underlying stream, for backends and kernels.
    pub fn stream(&self) -> &B::Stream {
        &self.stream
    }

    /// Make this context's device current. Idempotent.
    pub fn activate(&self) -> Result<()> {
        self.stream.activate()
    }

    /// Wait for all work enqueued on this context.
    pub fn synchronize(&self) -> Result<()> {
        self.stream.synchronize()
    }

    /// Whether two handles refer to the same stream.
    pub fn same_stream(&self, other: &Context<B>) -> bool {
        Arc::ptr_eq(&self.stream, &other.stream)
    }

    pub(crate) fn check_device(&self, got: usize) -> Result<()> {
        let expected = self.device_id();
        if expected != got {
            return Err(Error::DeviceMismatch { expected, got });
        }
        Ok(())
    }
}

impl<B: Backend> Clone for Context<B> {
    fn clone(&self) -> Self {
        Context {
            stream: Arc::clone(&self.stream),
        }
    }
}

impl<B: Backend> fmt::Debug for Context<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Context({})", self.device().name())
    }
}
