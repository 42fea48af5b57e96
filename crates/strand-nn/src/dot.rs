// DotBlock: Affine transform: output = x · W + b
//
// The block consumes three connectors (x, W and an optional bias b) and
// produces one. Each input is registered for a gradient only if its
// connector is bpropagable, and the block is learning iff at least one input
// is. The output connector is bpropagable exactly when the block is learning.
//
// SHAPES:
//
//   x:      [batch, in]
//   W:      [in, out]
//   b:      [1, out]     broadcast over the batch through a ones column
//   output: [batch, out]
//
// BACKWARD:
//
//   dL/dW = x^T · dL/doutput
//   dL/db = 1^T · dL/doutput
//   dL/dx = dL/doutput · W^T
//
// Forward work runs on one context and backward work on another; `bprop`
// waits for the forward context before reading the saved inputs.

use strand_core::{
    Backend, BackendDevice, Connector, Context, Error, GradSink, MatOp, Matrix, Result,
};

use crate::block::Block;

/// A registered input: the forward view plus the gradient sink, if any.
struct Input<B: Backend> {
    value: Matrix<B>,
    grad: Option<GradSink<B>>,
}

impl<B: Backend> Input<B> {
    fn register(connector: &Connector<B>, device: &B::Device) -> Result<Self> {
        let bwd = connector.is_bpropagable().then_some(device);
        let (value, grad) = connector.register_usage(device, bwd)?;
        Ok(Input { value, grad })
    }
}

/// `output = x · W + b` with gradients for every bpropagable input.
pub struct DotBlock<B: Backend> {
    f_ctx: Context<B>,
    b_ctx: Option<Context<B>>,
    w: Input<B>,
    b: Option<Input<B>>,
    x: Input<B>,
    ones: Option<Matrix<B>>,
    output: Connector<B>,
    learning: bool,
}

impl<B: Backend> DotBlock<B> {
    /// Wire a block onto `device` (the current device when `None`).
    pub fn new(
        w: &Connector<B>,
        b: Option<&Connector<B>>,
        x: &Connector<B>,
        device: Option<&B::Device>,
    ) -> Result<Self> {
        let (batch, in_dim) = x.value().dims();
        let (w_rows, out_dim) = w.value().dims();
        if w_rows != in_dim {
            return Err(Error::InvalidShape(format!(
                "W has {w_rows} rows but x has {in_dim} columns"
            )));
        }
        if let Some(b) = b {
            if b.value().dims() != (1, out_dim) {
                return Err(Error::InvalidShape(format!(
                    "bias must be (1, {out_dim}), got {:?}",
                    b.value().dims()
                )));
            }
        }

        let f_ctx = Context::<B>::new(device)?;
        let device = f_ctx.device().clone();

        let w = Input::register(w, &device)?;
        let b = b.map(|b| Input::register(b, &device)).transpose()?;
        let x = Input::register(x, &device)?;

        let ones = match &b {
            Some(_) => {
                let ones = Matrix::empty(batch, 1, w.value.dtype(), &device)?;
                ones.fill(1.0)?;
                Some(ones)
            }
            None => None,
        };

        let learning = w.grad.is_some()
            || x.grad.is_some()
            || b.as_ref().is_some_and(|b| b.grad.is_some());
        let output = Matrix::empty(batch, out_dim, w.value.dtype(), &device)?;
        let (output, b_ctx) = if learning {
            (
                Connector::new(output, Some(&device)),
                Some(Context::new(Some(&device))?),
            )
        } else {
            (Connector::new(output, None), None)
        };

        log::debug!(
            "built DotBlock ({batch}, {in_dim}) x ({in_dim}, {out_dim}) on {}, learning={learning}",
            device.name()
        );
        Ok(DotBlock {
            f_ctx,
            b_ctx,
            w,
            b,
            x,
            ones,
            output,
            learning,
        })
    }

    /// The block's output connector.
    pub fn output(&self) -> &Connector<B> {
        &self.output
    }

    pub fn context(&self) -> &Context<B> {
        &self.f_ctx
    }

    /// Gradient w.r.t. W, when W is bpropagable.
    pub fn dl_dw(&self) -> Option<&Matrix<B>> {
        self.w.grad.as_ref().map(|g| g.matrix())
    }

    /// Gradient w.r.t. the bias, when there is a bpropagable bias.
    pub fn dl_db(&self) -> Option<&Matrix<B>> {
        self.b.as_ref().and_then(|b| b.grad.as_ref()).map(|g| g.matrix())
    }

    /// Gradient w.r.t. x, when x is bpropagable.
    pub fn dl_dx(&self) -> Option<&Matrix<B>> {
        self.x.grad.as_ref().map(|g| g.matrix())
    }
}

impl<B: Backend> Block<B> for DotBlock<B> {
    fn fprop(&mut self) -> Result<()> {
        let ctx = &self.f_ctx;
        let out = self.output.value();
        out.assign_dot(ctx, &self.x.value, &self.w.value, MatOp::N, MatOp::N)?;
        if let (Some(b), Some(ones)) = (&self.b, &self.ones) {
            out.add_dot(ctx, ones, &b.value, MatOp::N, MatOp::N, 1.0, 1.0)?;
        }
        self.output.fprop()
    }

    fn bprop(&mut self) -> Result<()> {
        let Some(ctx) = &self.b_ctx else {
            return Ok(());
        };
        self.f_ctx.synchronize()?;
        let Some(dl_doutput) = self.output.backward_matrix(ctx)? else {
            log::debug!("DotBlock output has no gradient contributors, nothing to propagate");
            return Ok(());
        };

        if let Some(sink) = &self.w.grad {
            sink.matrix()
                .assign_dot(ctx, &self.x.value, &dl_doutput, MatOp::T, MatOp::N)?;
            sink.report()?;
        }
        if let (Some(sink), Some(ones)) = (self.b.as_ref().and_then(|b| b.grad.as_ref()), &self.ones)
        {
            sink.matrix()
                .assign_dot(ctx, ones, &dl_doutput, MatOp::T, MatOp::N)?;
            sink.report()?;
        }
        if let Some(sink) = &self.x.grad {
            sink.matrix()
                .assign_dot(ctx, &dl_doutput, &self.w.value, MatOp::N, MatOp::T)?;
            sink.report()?;
        }
        Ok(())
    }

    fn params(&self) -> Vec<Matrix<B>> {
        let mut params = vec![self.w.value.view()];
        if let Some(b) = &self.b {
            params.push(b.value.view());
        }
        params
    }

    fn grads(&self) -> Vec<Matrix<B>> {
        self.dl_dw()
            .into_iter()
            .chain(self.dl_db())
            .map(|g| g.view())
            .collect()
    }

    fn is_learning(&self) -> bool {
        self.learning
    }
}
