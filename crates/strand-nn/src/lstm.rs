// LSTM: Long Short-Term Memory over an unrolled sequence
//
// LstmRnn owns the stacked weights and one LstmCell per timestep. The cells
// are created once, at construction, for the maximum sequence length T and
// are reused by every forward/backward pass; a pass may run any prefix of
// them.
//
// SHAPES (row-batch convention, H = hidden dim):
//
//   x_t:       [batch, in]
//   W:         [in, 4H]   = [Wz | Wi | Wf | Wo]
//   R:         [H, 4H]    = [Rz | Ri | Rf | Ro]
//   pre_zifo:  [batch, 4H], gates are column quarters in order z, i, f, o
//   c_t, h_t:  [batch, H]
//
// FORWARD (cell t):
//
//   pre_zifo = x_t · W + h_{t-1} · R
//   z, i, f, o = tanh(pre_z), σ(pre_i), σ(pre_f), σ(pre_o)
//   c_t = i ⊙ z + f ⊙ c_{t-1}
//   h_t = o ⊙ tanh(c_t)
//
// BACKWARD (cell t, run in reverse time order):
//
//   dL/dc_t  = dL/dh_t ⊙ o ⊙ tanh'(c_t)   (+ the carry from t+1 unless last)
//   dL/dpre  from the four gate rules
//   dL_dW_t  = x_t^T · dL/dpre
//   dL_dR_t  = h_{t-1}^T · dL/dpre        (zero at t = 0)
//   dL/dx_t  = dL/dpre · W^T               (if x_t is bpropagable)
//   dL/dc_{t-1} = f ⊙ dL/dc_t, dL/dh_{t-1} = dL/dpre · R^T   (t > 0)
//
// The carry reaches cell t through the gradient sinks that cell t+1
// registered on cell t's `c` and `h` connectors, so strict reverse order is
// what makes each cell see its successor's contribution.
//
// Every gate, derivative and gradient quarter is a column view into one
// [batch, 4H] buffer. Writing a quarter writes the buffer, and the matrix
// products read all four gates at once.

use strand_core::{
    Axis, Backend, BackendDevice, Connector, Context, DType, Error, GradSink, HostArray, MatOp,
    Matrix, Result,
};

use crate::block::Block;
use crate::config::BlockConfig;
use crate::init::Initializer;

/// The four column quarters of a [batch, 4H] gate buffer.
struct Gates<B: Backend> {
    all: Matrix<B>,
    z: Matrix<B>,
    i: Matrix<B>,
    f: Matrix<B>,
    o: Matrix<B>,
}

impl<B: Backend> Gates<B> {
    fn new(batch: usize, hidden: usize, dtype: DType, device: &B::Device) -> Result<Self> {
        let all = Matrix::empty(batch, 4 * hidden, dtype, device)?;
        let quarter = |k: usize| all.columns(k * hidden..(k + 1) * hidden);
        Ok(Gates {
            z: quarter(0)?,
            i: quarter(1)?,
            f: quarter(2)?,
            o: quarter(3)?,
            all,
        })
    }
}

/// The state a cell reads as `c_{t-1}` and `h_{t-1}`.
pub enum PrevState<'a, B: Backend> {
    /// Plain matrices, used by the first timestep.
    Initial { c: &'a Matrix<B>, h: &'a Matrix<B> },
    /// The previous cell's output connectors.
    Cell {
        c: &'a Connector<B>,
        h: &'a Connector<B>,
    },
}

/// Buffers that exist only when the cell is learning.
struct CellGrads<B: Backend> {
    dzifo_dpre_zifo: Gates<B>,
    dtanh_c_dc: Matrix<B>,
    dl_dpre_zifo: Gates<B>,
    dl_dw: Matrix<B>,
    dl_dr: Matrix<B>,
    dl_dx: Option<GradSink<B>>,
    dl_dprev_c: Option<GradSink<B>>,
    dl_dprev_h: Option<GradSink<B>>,
    // stand-ins when nobody sends a gradient into c or h
    own_dl_dc: Matrix<B>,
    zero_dl_dh: Matrix<B>,
}

/// One timestep of an unrolled LSTM.
///
/// Cells borrow the shared W and R from their [`LstmRnn`] on every call
/// instead of holding them.
pub struct LstmCell<B: Backend> {
    ctx: Context<B>,
    x: Matrix<B>,
    prev_c: Matrix<B>,
    prev_h: Matrix<B>,
    pre_zifo: Matrix<B>,
    zifo: Gates<B>,
    c: Connector<B>,
    tanh_c: Matrix<B>,
    h: Connector<B>,
    grads: Option<CellGrads<B>>,
}

/// Check that `w` and `r` are both [H, 4H].
///
/// The input width must equal the hidden width: W and R share a row count.
fn check_weights(w: (usize, usize), r: (usize, usize)) -> Result<usize> {
    let hidden = r.0;
    if w.0 != r.0 {
        return Err(Error::InvalidShape(format!(
            "W has {} rows but R has {}",
            w.0, r.0
        )));
    }
    if w.1 != r.1 {
        return Err(Error::InvalidShape(format!(
            "W has {} columns but R has {}",
            w.1, r.1
        )));
    }
    if r.1 != 4 * hidden {
        return Err(Error::InvalidShape(format!(
            "R must be (H, 4H), got {r:?}"
        )));
    }
    Ok(hidden)
}

impl<B: Backend> LstmCell<B> {
    /// Allocate the cell's buffers and register it with its inputs.
    pub fn new(
        w: &Matrix<B>,
        r: &Matrix<B>,
        x: &Connector<B>,
        prev: PrevState<'_, B>,
        ctx: &Context<B>,
        learning: bool,
    ) -> Result<Self> {
        let hidden = check_weights(w.dims(), r.dims())?;
        let (batch, in_dim) = x.value().dims();
        if in_dim != w.nrows() {
            return Err(Error::InvalidShape(format!(
                "x_t has {in_dim} columns but W has {} rows",
                w.nrows()
            )));
        }

        let device = ctx.device().clone();
        let dtype = w.dtype();
        let bwd = learning.then_some(&device);

        let (x, dl_dx) = x.register_usage(&device, bwd)?;
        let (prev_c, prev_h, dl_dprev_c, dl_dprev_h) = match prev {
            PrevState::Initial { c, h } => (c.view(), h.view(), None, None),
            PrevState::Cell { c, h } => {
                let (c, dc) = c.register_usage(&device, bwd)?;
                let (h, dh) = h.register_usage(&device, bwd)?;
                (c, h, dc, dh)
            }
        };
        for (name, m) in [("c_{t-1}", &prev_c), ("h_{t-1}", &prev_h)] {
            if m.dims() != (batch, hidden) {
                return Err(Error::InvalidShape(format!(
                    "{name} must be ({batch}, {hidden}), got {:?}",
                    m.dims()
                )));
            }
        }

        let pre_zifo = Matrix::empty(batch, 4 * hidden, dtype, &device)?;
        let zifo = Gates::new(batch, hidden, dtype, &device)?;
        let c = Matrix::empty(batch, hidden, dtype, &device)?;
        let tanh_c = Matrix::empty(batch, hidden, dtype, &device)?;
        let h = Matrix::empty(batch, hidden, dtype, &device)?;

        let grads = if learning {
            Some(CellGrads {
                dzifo_dpre_zifo: Gates::new(batch, hidden, dtype, &device)?,
                dtanh_c_dc: Matrix::empty(batch, hidden, dtype, &device)?,
                dl_dpre_zifo: Gates::new(batch, hidden, dtype, &device)?,
                dl_dw: w.empty_like(Some(&device))?,
                dl_dr: r.empty_like(Some(&device))?,
                dl_dx,
                dl_dprev_c,
                dl_dprev_h,
                own_dl_dc: Matrix::empty(batch, hidden, dtype, &device)?,
                zero_dl_dh: Matrix::zeros(batch, hidden, dtype, &device)?,
            })
        } else {
            None
        };

        Ok(LstmCell {
            ctx: ctx.clone(),
            x,
            prev_c,
            prev_h,
            pre_zifo,
            zifo,
            c: Connector::new(c, bwd),
            tanh_c,
            h: Connector::new(h, bwd),
            grads,
        })
    }

    /// Cell state `c_t`.
    pub fn c(&self) -> &Connector<B> {
        &self.c
    }

    /// Hidden state `h_t`.
    pub fn h(&self) -> &Connector<B> {
        &self.h
    }

    /// Post-activation gates, [batch, 4H] in order z, i, f, o.
    pub fn zifo(&self) -> &Matrix<B> {
        &self.zifo.all
    }

    pub fn is_learning(&self) -> bool {
        self.grads.is_some()
    }

    /// This timestep's contribution to dL/dW.
    pub fn dl_dw(&self) -> Option<&Matrix<B>> {
        self.grads.as_ref().map(|g| &g.dl_dw)
    }

    /// This timestep's contribution to dL/dR.
    pub fn dl_dr(&self) -> Option<&Matrix<B>> {
        self.grads.as_ref().map(|g| &g.dl_dr)
    }

    /// Gradient w.r.t. the gate pre-activations, [batch, 4H].
    pub fn dl_dpre_zifo(&self) -> Option<&Matrix<B>> {
        self.grads.as_ref().map(|g| &g.dl_dpre_zifo.all)
    }

    pub fn fprop(&self, w: &Matrix<B>, r: &Matrix<B>) -> Result<()> {
        let ctx = &self.ctx;
        let g = &self.zifo;

        self.pre_zifo
            .assign_dot(ctx, &self.x, w, MatOp::N, MatOp::N)?;
        self.pre_zifo
            .add_dot(ctx, &self.prev_h, r, MatOp::N, MatOp::N, 1.0, 1.0)?;
        self.pre_zifo.tanh_sigmoid(
            ctx,
            Axis::Cols,
            &g.all,
            self.grads.as_ref().map(|d| &d.dzifo_dpre_zifo.all),
        )?;

        let c = self.c.value();
        c.assign_sum_hprod(ctx, &[&[&g.i, &g.z], &[&g.f, &self.prev_c]])?;
        c.tanh(ctx, &self.tanh_c, self.grads.as_ref().map(|d| &d.dtanh_c_dc))?;
        self.h
            .value()
            .assign_hprod(ctx, &g.o, &self.tanh_c, None)?;

        self.c.fprop()?;
        self.h.fprop()
    }

    /// Backward step. `is_first`/`is_last` mark the ends of the sequence that
    /// ran in the last forward pass.
    pub fn bprop(&self, w: &Matrix<B>, r: &Matrix<B>, is_first: bool, is_last: bool) -> Result<()> {
        let Some(d) = &self.grads else {
            return Ok(());
        };
        let ctx = &self.ctx;
        let g = &self.zifo;

        let dl_dh = self
            .h
            .backward_matrix(ctx)?
            .unwrap_or_else(|| d.zero_dl_dh.view());

        // dL/dc[t] (+)= dL/dh[t] ⊙ o[t] ⊙ tanh'(c[t])
        let dl_dc = match self.c.backward_matrix(ctx)? {
            Some(carry) if !is_last => {
                carry.add_hprod(ctx, &dl_dh, &g.o, Some(&d.dtanh_c_dc), 1.0)?;
                carry
            }
            Some(acc) => {
                acc.assign_hprod(ctx, &dl_dh, &g.o, Some(&d.dtanh_c_dc))?;
                acc
            }
            None => {
                d.own_dl_dc
                    .assign_hprod(ctx, &dl_dh, &g.o, Some(&d.dtanh_c_dc))?;
                d.own_dl_dc.view()
            }
        };

        let dg = &d.dl_dpre_zifo;
        let deriv = &d.dzifo_dpre_zifo;
        dg.o.assign_hprod(ctx, &dl_dh, &self.tanh_c, Some(&deriv.o))?;
        dg.f.assign_hprod(ctx, &dl_dc, &self.prev_c, Some(&deriv.f))?;
        dg.i.assign_hprod(ctx, &dl_dc, &g.z, Some(&deriv.i))?;
        dg.z.assign_hprod(ctx, &dl_dc, &g.i, Some(&deriv.z))?;

        d.dl_dw
            .assign_dot(ctx, &self.x, &dg.all, MatOp::T, MatOp::N)?;
        if is_first {
            d.dl_dr.assign_scalar(ctx, 0.0)?;
        } else {
            d.dl_dr
                .assign_dot(ctx, &self.prev_h, &dg.all, MatOp::T, MatOp::N)?;
        }

        if let Some(sink) = &d.dl_dx {
            sink.matrix()
                .assign_dot(ctx, &dg.all, w, MatOp::N, MatOp::T)?;
            sink.report()?;
        }

        if let (Some(sink_c), Some(sink_h)) = (&d.dl_dprev_c, &d.dl_dprev_h) {
            sink_c.matrix().assign_hprod(ctx, &g.f, &dl_dc, None)?;
            sink_h
                .matrix()
                .assign_dot(ctx, &dg.all, r, MatOp::N, MatOp::T)?;
            sink_c.report()?;
            sink_h.report()?;
        }
        Ok(())
    }
}

/// An LSTM unrolled over a fixed maximum sequence length.
pub struct LstmRnn<B: Backend> {
    ctx: Context<B>,
    w: Matrix<B>,
    r: Matrix<B>,
    dl_dw: Option<Matrix<B>>,
    dl_dr: Option<Matrix<B>>,
    // zero c_{-1} / h_{-1}, kept alive for cell 0
    _init_state: Matrix<B>,
    cells: Vec<LstmCell<B>>,
    seq_len: usize,
}

impl<B: Backend> LstmRnn<B> {
    /// Build the stacked weights and unroll one cell per input.
    ///
    /// `w_init` and `r_init` must both produce square [H, H] matrices, so the
    /// inputs are H wide as well. Each is sampled four times, once per gate in
    /// order z, i, f, o.
    pub fn new(
        w_init: &mut dyn Initializer,
        r_init: &mut dyn Initializer,
        inputs: &[Connector<B>],
        config: &BlockConfig<B>,
    ) -> Result<Self> {
        let (in_dim, hidden) = w_init.dims();
        let r_dims = r_init.dims();
        if in_dim != r_dims.0 {
            return Err(Error::InvalidShape(format!(
                "W has {in_dim} rows but R has {}",
                r_dims.0
            )));
        }
        if r_dims.0 != r_dims.1 {
            return Err(Error::InvalidShape(format!(
                "R must be a square matrix, got {r_dims:?}"
            )));
        }
        if r_dims.0 != hidden {
            return Err(Error::InvalidShape(format!(
                "W gates are ({in_dim}, {hidden}) but R gates are {r_dims:?}"
            )));
        }
        let Some(first) = inputs.first() else {
            return Err(Error::InvalidShape(
                "an LSTM needs at least one input timestep".into(),
            ));
        };
        let batch = first.value().nrows();
        for (t, x) in inputs.iter().enumerate() {
            if x.value().dims() != (batch, in_dim) {
                return Err(Error::InvalidShape(format!(
                    "input {t} must be ({batch}, {in_dim}), got {:?}",
                    x.value().dims()
                )));
            }
        }

        let ctx = config.context()?;
        let device = ctx.device().clone();
        let dtype = config.dtype;

        let w = Self::stack_gates(&ctx, w_init, dtype, &device)?;
        let r = Self::stack_gates(&ctx, r_init, dtype, &device)?;
        let (dl_dw, dl_dr) = if config.learning {
            (
                Some(w.empty_like(None)?),
                Some(r.empty_like(None)?),
            )
        } else {
            (None, None)
        };

        let init_state = Matrix::zeros(batch, hidden, dtype, &device)?;
        let mut cells: Vec<LstmCell<B>> = Vec::with_capacity(inputs.len());
        for x in inputs {
            let prev = match cells.last() {
                None => PrevState::Initial {
                    c: &init_state,
                    h: &init_state,
                },
                Some(cell) => PrevState::Cell {
                    c: &cell.c,
                    h: &cell.h,
                },
            };
            let cell = LstmCell::new(&w, &r, x, prev, &ctx, config.learning)?;
            cells.push(cell);
        }

        log::debug!(
            "unrolled LstmRnn over {} steps: batch={batch}, in={in_dim}, hidden={hidden}, learning={} on {}",
            cells.len(),
            config.learning,
            device.name()
        );
        Ok(LstmRnn {
            ctx,
            w,
            r,
            dl_dw,
            dl_dr,
            _init_state: init_state,
            cells,
            seq_len: 0,
        })
    }

    /// Sample four gate matrices and stack them as [z | i | f | o].
    fn stack_gates(
        ctx: &Context<B>,
        init: &mut dyn Initializer,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Matrix<B>> {
        let (nrows, ncols) = init.dims();
        let gates = (0..4)
            .map(|_| {
                let array: HostArray = init.sample()?;
                Matrix::from_host(&array, Some(dtype), Some(device))
            })
            .collect::<Result<Vec<_>>>()?;
        let stacked = Matrix::empty(nrows, 4 * ncols, dtype, device)?;
        let parts: Vec<&Matrix<B>> = gates.iter().collect();
        stacked.assign_hstack(ctx, &parts)?;
        // the per-gate matrices are dropped on return
        ctx.synchronize()?;
        Ok(stacked)
    }

    /// Run the first `seq_len` cells in time order.
    pub fn fprop(&mut self, seq_len: usize) -> Result<()> {
        let max = self.cells.len();
        if seq_len > max {
            return Err(Error::SequenceTooLong { len: seq_len, max });
        }
        for cell in &self.cells[..seq_len] {
            cell.fprop(&self.w, &self.r)?;
        }
        self.seq_len = seq_len;
        Ok(())
    }

    /// Run the cells of the last forward pass in reverse, then reduce their
    /// parameter gradients.
    pub fn bprop(&mut self) -> Result<()> {
        let (Some(dl_dw), Some(dl_dr)) = (&self.dl_dw, &self.dl_dr) else {
            return Ok(());
        };
        let n = self.seq_len;
        for k in (0..n).rev() {
            self.cells[k].bprop(&self.w, &self.r, k == 0, k + 1 == n)?;
        }

        let ran = &self.cells[..n];
        let dws: Vec<&Matrix<B>> = ran.iter().filter_map(|c| c.dl_dw()).collect();
        let drs: Vec<&Matrix<B>> = ran.iter().filter_map(|c| c.dl_dr()).collect();
        dl_dw.assign_sum(&self.ctx, &dws)?;
        dl_dr.assign_sum(&self.ctx, &drs)
    }

    /// Stacked input weights [in, 4H].
    pub fn w(&self) -> &Matrix<B> {
        &self.w
    }

    /// Stacked recurrent weights [H, 4H].
    pub fn r(&self) -> &Matrix<B> {
        &self.r
    }

    pub fn dl_dw(&self) -> Option<&Matrix<B>> {
        self.dl_dw.as_ref()
    }

    pub fn dl_dr(&self) -> Option<&Matrix<B>> {
        self.dl_dr.as_ref()
    }

    /// Hidden state connector of timestep `t`.
    pub fn h(&self, t: usize) -> Option<&Connector<B>> {
        self.cells.get(t).map(|c| c.h())
    }

    /// Cell state connector of timestep `t`.
    pub fn c(&self, t: usize) -> Option<&Connector<B>> {
        self.cells.get(t).map(|c| c.c())
    }

    pub fn cells(&self) -> &[LstmCell<B>] {
        &self.cells
    }

    /// Number of unrolled timesteps.
    pub fn max_seq_len(&self) -> usize {
        self.cells.len()
    }

    /// Number of timesteps the last forward pass ran.
    pub fn seq_len(&self) -> usize {
        self.seq_len
    }

    pub fn context(&self) -> &Context<B> {
        &self.ctx
    }

    pub fn hidden_dim(&self) -> usize {
        self.r.nrows()
    }
}

impl<B: Backend> Block<B> for LstmRnn<B> {
    /// Runs every unrolled timestep.
    fn fprop(&mut self) -> Result<()> {
        let n = self.cells.len();
        LstmRnn::fprop(self, n)
    }

    fn bprop(&mut self) -> Result<()> {
        LstmRnn::bprop(self)
    }

    fn params(&self) -> Vec<Matrix<B>> {
        vec![self.w.view(), self.r.view()]
    }

    fn grads(&self) -> Vec<Matrix<B>> {
        self.dl_dw
            .iter()
            .chain(self.dl_dr.iter())
            .map(|g| g.view())
            .collect()
    }

    fn is_learning(&self) -> bool {
        self.dl_dw.is_some()
    }
}
