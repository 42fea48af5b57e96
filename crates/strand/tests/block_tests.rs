// Integration tests for DotBlock and the LSTM blocks on the host backend
//
// Gradients are fed in the way a downstream block would: register a usage
// with a backward device on the output connector, write the gradient into
// the sink after the forward pass, report it, then run bprop.

use strand::prelude::*;

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn assert_vec_approx(got: &[f64], expected: &[f64], tol: f64) {
    assert_eq!(
        got.len(),
        expected.len(),
        "length mismatch: {} vs {}",
        got.len(),
        expected.len()
    );
    for (i, (g, e)) in got.iter().zip(expected.iter()).enumerate() {
        assert!(
            approx_eq(*g, *e, tol),
            "index {}: got {} expected {} (tol {})",
            i,
            g,
            e,
            tol
        );
    }
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

fn setup() -> (CpuDevice, Context<CpuBackend>) {
    let dev = CpuDevice::new(0);
    let ctx = Context::new(Some(&dev)).unwrap();
    (dev, ctx)
}

fn connector(rows: &[Vec<f32>], dev: &CpuDevice, bpropagable: bool) -> Connector<CpuBackend> {
    let m = CpuMatrix::from_host(&HostArray::from_rows(rows).unwrap(), None, Some(dev)).unwrap();
    Connector::new(m, bpropagable.then_some(dev))
}

fn read(m: &CpuMatrix, ctx: &Context<CpuBackend>) -> Vec<f64> {
    ctx.synchronize().unwrap();
    m.to_host().unwrap().to_f64_vec()
}

/// Register as an external gradient contributor on `conn`.
fn external_sink(conn: &Connector<CpuBackend>, dev: &CpuDevice) -> GradSink<CpuBackend> {
    conn.register_usage(dev, Some(dev)).unwrap().1.unwrap()
}

fn send(sink: &GradSink<CpuBackend>, ctx: &Context<CpuBackend>, rows: &[Vec<f32>]) {
    sink.matrix()
        .to_device(ctx, &HostArray::from_rows(rows).unwrap())
        .unwrap();
    sink.report().unwrap();
}

// DotBlock

#[test]
fn test_dot_block_not_learning() -> strand::Result<()> {
    let dev = CpuDevice::new(0);
    let w = connector(&[vec![1.0, 2.0], vec![3.0, 4.0]], &dev, false);
    let x = connector(&[vec![1.0, 1.0]], &dev, false);
    let mut block = DotBlock::new(&w, None, &x, Some(&dev))?;
    assert!(!block.is_learning());
    assert!(block.grads().is_empty());

    block.fprop()?;
    block.context().synchronize()?;
    assert_eq!(block.output().value().to_host()?.to_f64_vec(), vec![4.0, 6.0]);

    // nothing to propagate and nothing allocated for it
    block.bprop()?;
    assert_eq!(block.output().grad_contrib_count(), 0);
    assert!(block.output().backward_matrix(block.context())?.is_none());
    assert_eq!(w.grad_contrib_count(), 0);
    Ok(())
}

#[test]
fn test_dot_block_gradients() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let w = connector(&[vec![1.0, 0.0, 1.0], vec![0.0, 1.0, 1.0]], &dev, true);
    let b = connector(&[vec![0.5, 0.5, 0.5]], &dev, true);
    let x = connector(&[vec![1.0, 2.0], vec![3.0, 4.0]], &dev, true);
    let mut block = DotBlock::new(&w, Some(&b), &x, Some(&dev))?;
    assert!(block.is_learning());
    assert_eq!(block.params().len(), 2);
    assert_eq!(block.grads().len(), 2);

    let sink = external_sink(block.output(), &dev);
    block.fprop()?;
    assert_eq!(
        read(block.output().value(), block.context()),
        vec![1.5, 2.5, 3.5, 3.5, 4.5, 7.5]
    );

    send(&sink, &ctx, &[vec![1.0, 0.0, 1.0], vec![0.0, 1.0, -1.0]]);
    block.bprop()?;

    let dw = w.backward_matrix(&ctx)?.unwrap();
    assert_vec_approx(&read(&dw, &ctx), &[1.0, 3.0, -2.0, 2.0, 4.0, -2.0], 1e-6);
    let db = b.backward_matrix(&ctx)?.unwrap();
    assert_vec_approx(&read(&db, &ctx), &[1.0, 1.0, 0.0], 1e-6);
    let dx = x.backward_matrix(&ctx)?.unwrap();
    assert_vec_approx(&read(&dx, &ctx), &[2.0, 1.0, -1.0, 0.0], 1e-6);
    Ok(())
}

#[test]
fn test_dot_block_partial_learning() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let w = connector(&[vec![2.0], vec![3.0]], &dev, false);
    let x = connector(&[vec![1.0, 1.0]], &dev, true);
    let mut block = DotBlock::new(&w, None, &x, None)?;
    assert!(block.is_learning());
    assert!(block.dl_dw().is_none());
    assert!(block.grads().is_empty());

    let sink = external_sink(block.output(), &dev);
    block.fprop()?;
    send(&sink, &ctx, &[vec![2.0]]);
    block.bprop()?;
    let dx = x.backward_matrix(&ctx)?.unwrap();
    assert_eq!(read(&dx, &ctx), vec![4.0, 6.0]);
    Ok(())
}

// LSTM construction

#[test]
fn test_lstm_rejects_non_square_r() {
    let dev = CpuDevice::new(0);
    let xs = vec![connector(&[vec![1.0, 2.0]], &dev, false)];
    let err = LstmRnn::new(
        &mut Constant::new(2, 2, 0.0),
        &mut Constant::new(2, 3, 0.0),
        &xs,
        &BlockConfig::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, Error::InvalidShape(_)));
    // nothing was registered on the inputs
    assert_eq!(xs[0].usage_count(), 0);
}

#[test]
fn test_lstm_rejects_row_count_mismatch() {
    let dev = CpuDevice::new(0);
    let xs = vec![connector(&[vec![1.0, 2.0]], &dev, false)];
    // gate widths agree (H = 1), only the row counts differ
    let err = LstmRnn::new(
        &mut Constant::new(2, 1, 0.1),
        &mut Constant::new(1, 1, 0.1),
        &xs,
        &BlockConfig::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, Error::InvalidShape(_)));
    assert_eq!(xs[0].usage_count(), 0);
}

#[test]
fn test_lstm_rejects_hidden_dim_mismatch() {
    let dev = CpuDevice::new(0);
    let xs = vec![connector(&[vec![1.0, 2.0, 3.0]], &dev, false)];
    // same row count and square R, but W gates are 2 wide
    let err = LstmRnn::new(
        &mut Constant::new(3, 2, 0.0),
        &mut Constant::new(3, 3, 0.0),
        &xs,
        &BlockConfig::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, Error::InvalidShape(_)));
    assert_eq!(xs[0].usage_count(), 0);
}

#[test]
fn test_lstm_rejects_input_width() {
    let dev = CpuDevice::new(0);
    let xs = vec![connector(&[vec![1.0, 2.0, 3.0]], &dev, false)];
    let err = LstmRnn::new(
        &mut Constant::new(2, 2, 0.0),
        &mut Constant::new(2, 2, 0.0),
        &xs,
        &BlockConfig::default(),
    )
    .err()
    .unwrap();
    assert!(matches!(err, Error::InvalidShape(_)));
}

#[test]
fn test_lstm_cell_rejects_bad_weights() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let w = CpuMatrix::zeros(1, 8, DType::F32, &dev)?;
    let r = CpuMatrix::zeros(2, 4, DType::F32, &dev)?;
    let zero = CpuMatrix::zeros(1, 2, DType::F32, &dev)?;
    let x = connector(&[vec![1.0]], &dev, false);
    let cell = LstmCell::new(
        &w,
        &r,
        &x,
        strand::nn::PrevState::Initial { c: &zero, h: &zero },
        &ctx,
        false,
    );
    assert!(matches!(cell, Err(Error::InvalidShape(_))));
    Ok(())
}

// LSTM forward

fn unit_inputs(t: usize, dev: &CpuDevice, bpropagable: bool) -> Vec<Connector<CpuBackend>> {
    (0..t).map(|_| connector(&[vec![1.0]], dev, bpropagable)).collect()
}

#[test]
fn test_lstm_hand_trace() -> strand::Result<()> {
    let dev = CpuDevice::new(0);
    let xs = unit_inputs(3, &dev, false);
    let mut rnn = LstmRnn::new(
        &mut Constant::new(1, 1, 1.0),
        &mut Constant::new(1, 1, 0.0),
        &xs,
        &BlockConfig::default().with_learning(false),
    )?;
    rnn.fprop(3)?;
    rnn.context().synchronize()?;

    // x = 1 and R = 0, so every gate sees pre-activation 1 at every step
    let z = 1f64.tanh();
    let s = sigmoid(1.0);
    let mut c_prev = 0.0;
    for t in 0..3 {
        let c = s * z + s * c_prev;
        let h = s * c.tanh();
        let got_c = rnn.c(t).unwrap().value().get_element(0, 0)?;
        let got_h = rnn.h(t).unwrap().value().get_element(0, 0)?;
        assert!(approx_eq(got_c, c, 1e-5), "c[{t}]: {got_c} vs {c}");
        assert!(approx_eq(got_h, h, 1e-5), "h[{t}]: {got_h} vs {h}");
        c_prev = c;
    }
    let zifo = rnn.cells()[2].zifo().to_host()?.to_f64_vec();
    assert_vec_approx(&zifo, &[z, s, s, s], 1e-6);
    Ok(())
}

#[test]
fn test_lstm_sequence_too_long() {
    let dev = CpuDevice::new(0);
    let xs = unit_inputs(3, &dev, false);
    let mut rnn = LstmRnn::new(
        &mut Constant::new(1, 1, 1.0),
        &mut Constant::new(1, 1, 0.0),
        &xs,
        &BlockConfig::default(),
    )
    .unwrap();
    assert!(matches!(
        rnn.fprop(4),
        Err(Error::SequenceTooLong { len: 4, max: 3 })
    ));
    assert_eq!(rnn.seq_len(), 0);
}

#[test]
fn test_lstm_partial_sequence_leaves_later_cells() -> strand::Result<()> {
    let dev = CpuDevice::new(0);
    let xs = unit_inputs(4, &dev, false);
    let mut rnn = LstmRnn::new(
        &mut Constant::new(1, 1, 1.0),
        &mut Constant::new(1, 1, 0.5),
        &xs,
        &BlockConfig::default().with_learning(false),
    )?;
    for t in 0..4 {
        rnn.h(t).unwrap().value().fill(42.0)?;
        rnn.c(t).unwrap().value().fill(42.0)?;
    }
    rnn.fprop(2)?;
    rnn.context().synchronize()?;
    assert_eq!(rnn.seq_len(), 2);

    for t in 0..2 {
        assert_ne!(rnn.h(t).unwrap().value().get_element(0, 0)?, 42.0);
        assert!(rnn.h(t).unwrap().is_ready());
    }
    for t in 2..4 {
        assert_eq!(rnn.h(t).unwrap().value().get_element(0, 0)?, 42.0);
        assert_eq!(rnn.c(t).unwrap().value().get_element(0, 0)?, 42.0);
        assert!(!rnn.h(t).unwrap().is_ready());
    }
    Ok(())
}

// LSTM backward

#[test]
fn test_lstm_single_step_backward() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let xs = unit_inputs(1, &dev, true);
    let mut rnn = LstmRnn::new(
        &mut Constant::new(1, 1, 1.0),
        &mut Constant::new(1, 1, 0.5),
        &xs,
        &BlockConfig::default().with_device(dev),
    )?;
    let dh = external_sink(rnn.h(0).unwrap(), &dev);
    let dc = external_sink(rnn.c(0).unwrap(), &dev);

    rnn.fprop(1)?;
    send(&dh, &ctx, &[vec![1.0]]);
    // the only step is also the last: dL/dc is assigned, this is dropped
    send(&dc, &ctx, &[vec![100.0]]);
    rnn.bprop()?;
    rnn.context().synchronize()?;

    let z = 1f64.tanh();
    let s = sigmoid(1.0);
    let c = s * z;
    let tc = c.tanh();
    let dl_dc = s * (1.0 - tc * tc);
    let dpre_z = dl_dc * s * (1.0 - z * z);
    let dpre_i = dl_dc * z * s * (1.0 - s);
    let dpre_o = tc * s * (1.0 - s);

    let dpre = rnn.cells()[0].dl_dpre_zifo().unwrap().to_host()?.to_f64_vec();
    assert_vec_approx(&dpre, &[dpre_z, dpre_i, 0.0, dpre_o], 1e-6);

    // x = 1, so dL/dW is dL/dpre itself
    let dw = rnn.dl_dw().unwrap().to_host()?.to_f64_vec();
    assert_vec_approx(&dw, &[dpre_z, dpre_i, 0.0, dpre_o], 1e-6);
    let dr = rnn.dl_dr().unwrap().to_host()?.to_f64_vec();
    assert_eq!(dr, vec![0.0; 4]);

    let dx = xs[0].backward_matrix(&ctx)?.unwrap();
    assert_vec_approx(&read(&dx, &ctx), &[dpre_z + dpre_i + dpre_o], 1e-6);
    Ok(())
}

fn uniform_rnn(
    xs: &[Connector<CpuBackend>],
    in_dim: usize,
    hidden: usize,
) -> LstmRnn<CpuBackend> {
    LstmRnn::new(
        &mut Uniform::new(in_dim, hidden, -0.8, 0.8, 11).unwrap(),
        &mut Uniform::new(hidden, hidden, -0.8, 0.8, 12).unwrap(),
        xs,
        &BlockConfig::default(),
    )
    .unwrap()
}

fn sequence(t: usize, dev: &CpuDevice) -> Vec<Connector<CpuBackend>> {
    (0..t)
        .map(|k| {
            let k = k as f32;
            connector(
                &[vec![0.5 - 0.2 * k, 0.3 + 0.1 * k], vec![-0.4 + 0.3 * k, 0.9]],
                dev,
                true,
            )
        })
        .collect()
}

const UPSTREAM: [[f32; 2]; 2] = [[1.0, -0.5], [0.25, 2.0]];

fn upstream() -> Vec<Vec<f32>> {
    UPSTREAM.iter().map(|r| r.to_vec()).collect()
}

/// L = Σ g ⊙ h_last for the fixed upstream gradient g.
fn loss(rnn: &mut LstmRnn<CpuBackend>) -> f64 {
    let n = rnn.max_seq_len();
    rnn.fprop(n).unwrap();
    rnn.context().synchronize().unwrap();
    let h = rnn.h(n - 1).unwrap().value().to_host().unwrap();
    let mut total = 0.0;
    for (r, row) in UPSTREAM.iter().enumerate() {
        for (c, g) in row.iter().enumerate() {
            total += *g as f64 * h.get(r, c).unwrap();
        }
    }
    total
}

fn numeric_grad(
    rnn: &mut LstmRnn<CpuBackend>,
    target: &CpuMatrix,
    row: usize,
    col: usize,
) -> f64 {
    let eps = 1e-2;
    let orig = target.get_element(row, col).unwrap();
    target.set_element(row, col, orig + eps).unwrap();
    let up = loss(rnn);
    target.set_element(row, col, orig - eps).unwrap();
    let down = loss(rnn);
    target.set_element(row, col, orig).unwrap();
    (up - down) / (2.0 * eps)
}

#[test]
fn test_lstm_gradients_match_finite_differences() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let xs = sequence(3, &dev);
    let mut rnn = uniform_rnn(&xs, 2, 2);
    let dh = external_sink(rnn.h(2).unwrap(), &dev);

    rnn.fprop(3)?;
    send(&dh, &ctx, &upstream());
    rnn.bprop()?;
    rnn.context().synchronize()?;
    let dw = rnn.dl_dw().unwrap().to_host()?;
    let dr = rnn.dl_dr().unwrap().to_host()?;
    let dx0 = xs[0].backward_matrix(&ctx)?.unwrap().to_host()?;

    let w = rnn.w().view();
    let r = rnn.r().view();
    for row in 0..2 {
        for col in 0..8 {
            let num = numeric_grad(&mut rnn, &w, row, col);
            let ana = dw.get(row, col).unwrap();
            assert!(approx_eq(num, ana, 2e-3), "dW[{row},{col}]: {num} vs {ana}");

            let num = numeric_grad(&mut rnn, &r, row, col);
            let ana = dr.get(row, col).unwrap();
            assert!(approx_eq(num, ana, 2e-3), "dR[{row},{col}]: {num} vs {ana}");
        }
    }

    let x0 = xs[0].value().view();
    for row in 0..2 {
        for col in 0..2 {
            let num = numeric_grad(&mut rnn, &x0, row, col);
            let ana = dx0.get(row, col).unwrap();
            assert!(approx_eq(num, ana, 2e-3), "dx0[{row},{col}]: {num} vs {ana}");
        }
    }
    Ok(())
}

#[test]
fn test_lstm_partial_backward_matches_shorter_unroll() -> strand::Result<()> {
    let (dev, ctx) = setup();

    let long_xs = sequence(3, &dev);
    let mut long = uniform_rnn(&long_xs, 2, 2);
    let long_dh = external_sink(long.h(1).unwrap(), &dev);

    let short_xs = sequence(2, &dev);
    let mut short = uniform_rnn(&short_xs, 2, 2);
    let short_dh = external_sink(short.h(1).unwrap(), &dev);

    // run the full length once so the third cell holds stale gradients
    long.fprop(3)?;
    long.bprop()?;

    long.fprop(2)?;
    send(&long_dh, &ctx, &upstream());
    long.bprop()?;

    short.fprop(2)?;
    send(&short_dh, &ctx, &upstream());
    short.bprop()?;

    long.context().synchronize()?;
    short.context().synchronize()?;
    assert_vec_approx(
        &long.dl_dw().unwrap().to_host()?.to_f64_vec(),
        &short.dl_dw().unwrap().to_host()?.to_f64_vec(),
        1e-6,
    );
    assert_vec_approx(
        &long.dl_dr().unwrap().to_host()?.to_f64_vec(),
        &short.dl_dr().unwrap().to_host()?.to_f64_vec(),
        1e-6,
    );
    Ok(())
}

#[test]
fn test_lstm_block_trait() -> strand::Result<()> {
    let dev = CpuDevice::new(0);
    let xs = sequence(2, &dev);
    let mut rnn = uniform_rnn(&xs, 2, 2);
    let block: &mut dyn Block<CpuBackend> = &mut rnn;
    assert!(block.is_learning());
    assert_eq!(block.params().len(), 2);
    assert_eq!(block.grads().len(), 2);
    assert_eq!(block.num_parameters(), 2 * 8 + 2 * 8);
    block.fprop()?;
    block.bprop()?;
    assert_eq!(rnn.seq_len(), 2);
    Ok(())
}
