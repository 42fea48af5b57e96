use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::{Backend, BackendDevice};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::matrix::Matrix;

// Connector: The edge between a producing block and its consumers
//
// A connector wraps one forward value. Consumers call `register_usage` once,
// at construction time, and get back a view of the value plus, if they want
// to send a gradient back, a `GradSink`: a private gradient buffer on the
// backward device.
//
// The fan-out is fixed after construction, so the protocol is just counters:
//
//   forward   producer writes the value, calls `fprop()`
//             (marks it ready and clears every sink's reported flag)
//   backward  each consumer writes its sink's matrix, calls `report()`
//             producer calls `backward_matrix(ctx)`, which sums the
//             reported sinks into the accumulator and returns it
//
// Because every contributor owns its buffer, two consumers never overwrite
// each other, and because `fprop()` clears the flags, a sink written during
// an earlier traversal is not counted again. A consumer that did not run
// during this traversal (a cell past the current sequence length) simply
// does not report.
//
// The accumulator is allocated at the first backward registration; a
// connector nobody sends gradients to never allocates one.

struct Contributor<B: Backend> {
    buffer: Matrix<B>,
    reported: bool,
}

struct ConnectorState<B: Backend> {
    ready: bool,
    usages: usize,
    contributors: Vec<Contributor<B>>,
    accumulator: Option<Matrix<B>>,
}

fn lock<B: Backend>(state: &Mutex<ConnectorState<B>>) -> Result<MutexGuard<'_, ConnectorState<B>>> {
    state
        .lock()
        .map_err(|_| Error::msg("connector state lock poisoned"))
}

/// A forward value with registered consumers and their gradients.
pub struct Connector<B: Backend> {
    value: Matrix<B>,
    bwd_device: Option<B::Device>,
    state: Arc<Mutex<ConnectorState<B>>>,
}

impl<B: Backend> Clone for Connector<B> {
    fn clone(&self) -> Self {
        Connector {
            value: self.value.view(),
            bwd_device: self.bwd_device.clone(),
            state: Arc::clone(&self.state),
        }
    }
}

impl<B: Backend> fmt::Debug for Connector<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Connector(value={:?}, bpropagable={}, usages={}, contributors={})",
            self.value,
            self.is_bpropagable(),
            self.usage_count(),
            self.grad_contrib_count(),
        )
    }
}

impl<B: Backend> Connector<B> {
    /// Wrap `value`. Gradients can flow back iff `bwd_device` is given.
    pub fn new(value: Matrix<B>, bwd_device: Option<&B::Device>) -> Self {
        Connector {
            value,
            bwd_device: bwd_device.cloned(),
            state: Arc::new(Mutex::new(ConnectorState {
                ready: false,
                usages: 0,
                contributors: Vec::new(),
                accumulator: None,
            })),
        }
    }

    /// The forward value.
    pub fn value(&self) -> &Matrix<B> {
        &self.value
    }

    pub fn bwd_device(&self) -> Option<&B::Device> {
        self.bwd_device.as_ref()
    }

    pub fn is_bpropagable(&self) -> bool {
        self.bwd_device.is_some()
    }

    /// Register one consumer.
    ///
    /// Returns a view of the value and, when both the consumer and this
    /// connector have a backward device, a sink for the consumer's gradient.
    pub fn register_usage(
        &self,
        fwd_device: &B::Device,
        bwd_device: Option<&B::Device>,
    ) -> Result<(Matrix<B>, Option<GradSink<B>>)> {
        if fwd_device.id() != self.value.device_id() {
            return Err(Error::DeviceMismatch {
                expected: self.value.device_id(),
                got: fwd_device.id(),
            });
        }
        let mut state = lock(&self.state)?;
        state.usages += 1;

        let sink = match (bwd_device, &self.bwd_device) {
            (Some(theirs), Some(ours)) => {
                if theirs.id() != ours.id() {
                    return Err(Error::DeviceMismatch {
                        expected: ours.id(),
                        got: theirs.id(),
                    });
                }
                let (nrows, ncols) = self.value.dims();
                let dtype = self.value.dtype();
                if state.accumulator.is_none() {
                    state.accumulator = Some(Matrix::zeros(nrows, ncols, dtype, ours)?);
                }
                let buffer = Matrix::zeros(nrows, ncols, dtype, ours)?;
                let slot = state.contributors.len();
                state.contributors.push(Contributor {
                    buffer: buffer.view(),
                    reported: false,
                });
                Some(GradSink {
                    buffer,
                    slot,
                    state: Arc::clone(&self.state),
                })
            }
            _ => None,
        };
        Ok((self.value.view(), sink))
    }

    /// Producer side of the forward pass: the value is ready.
    ///
    /// Starts a new traversal, so every sink must report again.
    pub fn fprop(&self) -> Result<()> {
        let mut state = lock(&self.state)?;
        state.ready = true;
        for c in state.contributors.iter_mut() {
            c.reported = false;
        }
        Ok(())
    }

    /// Whether `fprop` has been called at least once.
    pub fn is_ready(&self) -> bool {
        lock(&self.state).map(|s| s.ready).unwrap_or(false)
    }

    /// Number of registered forward consumers.
    pub fn usage_count(&self) -> usize {
        lock(&self.state).map(|s| s.usages).unwrap_or(0)
    }

    /// Number of registered gradient contributors.
    pub fn grad_contrib_count(&self) -> usize {
        lock(&self.state)
            .map(|s| s.contributors.len())
            .unwrap_or(0)
    }

    /// Whether every contributor has reported since the last `fprop`.
    pub fn backward_ready(&self) -> bool {
        lock(&self.state)
            .map(|s| !s.contributors.is_empty() && s.contributors.iter().all(|c| c.reported))
            .unwrap_or(false)
    }

    /// The summed gradient w.r.t. the value, or `None` without contributors.
    ///
    /// Enqueues the reduction on `ctx`. Sinks that did not report since the
    /// last `fprop` are left out; if none reported the result is zero.
    pub fn backward_matrix(&self, ctx: &Context<B>) -> Result<Option<Matrix<B>>> {
        let (accumulator, reported, total) = {
            let state = lock(&self.state)?;
            if state.contributors.is_empty() {
                return Ok(None);
            }
            let accumulator = state
                .accumulator
                .as_ref()
                .map(|m| m.view())
                .ok_or_else(|| Error::msg("connector has contributors but no accumulator"))?;
            let reported: Vec<Matrix<B>> = state
                .contributors
                .iter()
                .filter(|c| c.reported)
                .map(|c| c.buffer.view())
                .collect();
            (accumulator, reported, state.contributors.len())
        };

        if reported.len() < total {
            log::warn!(
                "reading backward of {:?} with {} of {} contributors reported",
                self.value,
                reported.len(),
                total
            );
        }
        match reported.as_slice() {
            [] => accumulator.assign_scalar(ctx, 0.0)?,
            [single] => single.copy_to(ctx, &accumulator)?,
            many => {
                let parts: Vec<&Matrix<B>> = many.iter().collect();
                accumulator.assign_sum(ctx, &parts)?;
            }
        }
        Ok(Some(accumulator))
    }
}

/// A contributor's private gradient buffer.
///
/// Write the gradient into `matrix()` with any assign/add operation, then
/// call `report()`.
pub struct GradSink<B: Backend> {
    buffer: Matrix<B>,
    slot: usize,
    state: Arc<Mutex<ConnectorState<B>>>,
}

impl<B: Backend> fmt::Debug for GradSink<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GradSink(slot={}, buffer={:?})", self.slot, self.buffer)
    }
}

impl<B: Backend> GradSink<B> {
    /// The buffer to write this contributor's gradient into.
    pub fn matrix(&self) -> &Matrix<B> {
        &self.buffer
    }

    /// Mark this contributor's gradient as written for the current traversal.
    pub fn report(&self) -> Result<()> {
        let mut state = lock(&self.state)?;
        if let Some(c) = state.contributors.get_mut(self.slot) {
            c.reported = true;
        }
        Ok(())
    }
}
