// Integration tests for strand-core matrices on the host backend
//
// Host reads (`to_host`, `get_element`) are synchronous, so every test
// synchronizes its context before looking at results, the same as device
// code has to.

use proptest::prelude::*;
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

fn setup() -> (CpuDevice, Context<CpuBackend>) {
    let dev = CpuDevice::new(0);
    let ctx = Context::new(Some(&dev)).unwrap();
    (dev, ctx)
}

fn mat(rows: &[Vec<f32>], dev: &CpuDevice) -> CpuMatrix {
    CpuMatrix::from_host(&HostArray::from_rows(rows).unwrap(), None, Some(dev)).unwrap()
}

fn read(m: &CpuMatrix, ctx: &Context<CpuBackend>) -> Vec<f64> {
    ctx.synchronize().unwrap();
    m.to_host().unwrap().to_f64_vec()
}

// Creation and host interchange

#[test]
fn test_from_host_roundtrip() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let m = mat(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]], &dev);
    assert_eq!(m.dims(), (2, 3));
    assert_eq!(m.dtype(), DType::F32);
    assert!(m.is_owner());
    assert!(m.is_contiguous());
    assert_eq!(m.nbytes(), 24);
    assert_eq!(read(&m, &ctx), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    assert_eq!(m.get_element(1, 0)?, 4.0);
    Ok(())
}

#[test]
fn test_from_host_casts_dtype() -> strand::Result<()> {
    let dev = CpuDevice::new(0);
    let array = HostArray::from_rows(&[vec![1.7f32, -2.2]])?;
    let m = CpuMatrix::from_host(&array, Some(DType::I32), Some(&dev))?;
    assert_eq!(m.dtype(), DType::I32);
    assert_eq!(m.to_host()?.to_f64_vec(), vec![1.0, -2.0]);
    Ok(())
}

#[test]
fn test_from_host_defaults_to_current_device() -> strand::Result<()> {
    let array = HostArray::from_rows(&[vec![1.0f32, 2.0]])?;
    let ctx = Context::<CpuBackend>::new(Some(&CpuDevice::new(3)))?;
    ctx.activate()?;
    let m = CpuMatrix::from_host(&array, None, None)?;
    assert_eq!(m.device_id(), 3);
    assert_eq!(m.to_host()?.to_f64_vec(), vec![1.0, 2.0]);
    Ok(())
}

#[test]
fn test_from_host_rejects_3d() {
    let dev = CpuDevice::new(0);
    let array = HostArray::new(vec![1, 2, 2], vec![0f32; 4]).unwrap();
    let err = CpuMatrix::from_host(&array, None, Some(&dev)).unwrap_err();
    assert!(matches!(err, Error::Shape { ndim: 3 }));
}

#[test]
fn test_empty_like_and_zeros() -> strand::Result<()> {
    let dev = CpuDevice::new(0);
    let m = CpuMatrix::zeros(3, 2, DType::F32, &dev)?;
    assert_eq!(m.to_host()?.to_f64_vec(), vec![0.0; 6]);
    let other = CpuDevice::new(1);
    let like = m.empty_like(Some(&other))?;
    assert_eq!(like.dims(), (3, 2));
    assert_eq!(like.device_id(), 1);
    assert!(like.is_owner());
    Ok(())
}

#[test]
fn test_oversized_allocation_is_an_error() {
    let dev = CpuDevice::new(0);
    assert!(matches!(
        CpuMatrix::empty(usize::MAX, 2, DType::F32, &dev),
        Err(Error::Allocation { .. })
    ));
    assert!(matches!(
        CpuMatrix::zeros(usize::MAX / 2, 3, DType::I32, &dev),
        Err(Error::Allocation { .. })
    ));
    // fits in usize as an element count but not as a byte count
    assert!(matches!(
        CpuMatrix::empty(usize::MAX / 4, 2, DType::F32, &dev),
        Err(Error::Allocation { .. })
    ));
    let m = CpuMatrix::zeros(2, 2, DType::F32, &dev).unwrap();
    assert!(m.reshape(usize::MAX, 2).is_err());
}

#[test]
fn test_set_get_element_bounds() -> strand::Result<()> {
    let dev = CpuDevice::new(0);
    let m = CpuMatrix::zeros(2, 2, DType::F32, &dev)?;
    m.set_element(1, 1, 9.5)?;
    assert_eq!(m.get_element(1, 1)?, 9.5);
    assert!(matches!(
        m.get_element(2, 0),
        Err(Error::IndexOutOfBounds { row: 2, col: 0, .. })
    ));
    assert!(m.set_element(0, 5, 1.0).is_err());
    Ok(())
}

#[test]
fn test_to_device_checks() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let m = CpuMatrix::zeros(2, 2, DType::F32, &dev)?;
    m.to_device(&ctx, &HostArray::from_rows(&[vec![1f32, 2.0], vec![3.0, 4.0]])?)?;
    assert_eq!(read(&m, &ctx), vec![1.0, 2.0, 3.0, 4.0]);

    let wrong_shape = HostArray::from_rows(&[vec![1f32, 2.0, 3.0]])?;
    assert!(matches!(
        m.to_device(&ctx, &wrong_shape),
        Err(Error::ShapeMismatch { .. })
    ));
    let wrong_dtype = HostArray::from_rows(&[vec![1i32, 2], vec![3, 4]])?;
    assert!(matches!(
        m.to_device(&ctx, &wrong_dtype),
        Err(Error::DTypeMismatch { .. })
    ));
    Ok(())
}

// Views and slicing

#[test]
fn test_column_view_aliases_parent() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let m = mat(&[vec![1.0, 2.0], vec![3.0, 4.0]], &dev);
    let col = m.column(1)?;
    assert!(!col.is_owner());
    assert!(col.is_contiguous());
    assert!(col.shares_storage(&m));

    // view -> parent
    col.assign_scalar(&ctx, 0.0)?;
    assert_eq!(read(&m, &ctx), vec![1.0, 0.0, 3.0, 0.0]);

    // parent -> view
    m.set_element(1, 1, 7.0)?;
    assert_eq!(read(&col, &ctx), vec![0.0, 7.0]);
    Ok(())
}

#[test]
fn test_row_slice_is_strided_view() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let m = mat(&[vec![1.0, 2.0], vec![3.0, 4.0], vec![5.0, 6.0]], &dev);
    let rows = m.slice(1..3, ..)?;
    assert_eq!(rows.dims(), (2, 2));
    assert!(!rows.is_contiguous());
    assert_eq!(rows.layout().ld(), 3);
    assert_eq!(read(&rows, &ctx), vec![3.0, 4.0, 5.0, 6.0]);

    rows.scale(&ctx, 10.0, None)?;
    assert_eq!(read(&m, &ctx), vec![1.0, 2.0, 30.0, 40.0, 50.0, 60.0]);
    Ok(())
}

#[test]
fn test_non_unit_step_rejected() {
    let dev = CpuDevice::new(0);
    let m = CpuMatrix::zeros(4, 4, DType::F32, &dev).unwrap();
    let err = m.slice(SliceSpec::full().step(2), ..).unwrap_err();
    assert!(matches!(err, Error::UnsupportedSlice(_)));
    assert!(m.slice(.., SliceSpec::from(1..3).step(-1)).is_err());
    // unit steps are fine
    assert!(m.slice(SliceSpec::full().step(1), 0..2).is_ok());
}

#[test]
fn test_slice_out_of_range() {
    let dev = CpuDevice::new(0);
    let m = CpuMatrix::zeros(2, 2, DType::F32, &dev).unwrap();
    assert!(matches!(m.slice(0..3, ..), Err(Error::UnsupportedSlice(_))));
}

#[test]
fn test_index_past_any_axis() {
    let dev = CpuDevice::new(0);
    let m = CpuMatrix::zeros(2, 2, DType::F32, &dev).unwrap();
    assert!(matches!(
        m.slice(usize::MAX, ..),
        Err(Error::UnsupportedSlice(_))
    ));
    assert!(matches!(
        m.slice(.., usize::MAX),
        Err(Error::UnsupportedSlice(_))
    ));
}

#[test]
fn test_reshape_and_ravel() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let m = mat(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]], &dev);
    let r = m.reshape(3, 2)?;
    // column-major storage: 1 4 2 5 3 6
    assert_eq!(read(&r, &ctx), vec![1.0, 5.0, 4.0, 3.0, 2.0, 6.0]);
    assert_eq!(m.ravel()?.dims(), (6, 1));
    assert!(matches!(m.reshape(4, 2), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(
        m.slice(0..1, ..)?.reshape(3, 1),
        Err(Error::UnsupportedSlice(_))
    ));
    Ok(())
}

#[test]
fn test_to_list() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let m = mat(&[vec![1.0, 2.0], vec![3.0, 4.0]], &dev);
    let cols = m.to_list();
    assert_eq!(cols.len(), 2);
    assert_eq!(read(&cols[0], &ctx), vec![1.0, 3.0]);
    assert_eq!(read(&cols[1], &ctx), vec![2.0, 4.0]);
    Ok(())
}

// Stacking, splitting and tiling

#[test]
fn test_hstack_vstack() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let a = mat(&[vec![1.0], vec![2.0]], &dev);
    let b = mat(&[vec![3.0, 4.0], vec![5.0, 6.0]], &dev);
    let h = CpuMatrix::empty(2, 3, DType::F32, &dev)?;
    h.assign_hstack(&ctx, &[&a, &b])?;
    assert_eq!(read(&h, &ctx), vec![1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);

    let c = mat(&[vec![7.0, 8.0]], &dev);
    let v = CpuMatrix::empty(3, 2, DType::F32, &dev)?;
    v.assign_vstack(&ctx, &[&b, &c])?;
    assert_eq!(read(&v, &ctx), vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);

    let bad = CpuMatrix::empty(2, 4, DType::F32, &dev)?;
    assert!(matches!(
        bad.assign_hstack(&ctx, &[&a, &b]),
        Err(Error::ShapeMismatch { .. })
    ));
    assert!(matches!(
        v.assign_vstack(&ctx, &[&a, &c]),
        Err(Error::ShapeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn test_split_with_ranges() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let m = mat(&[vec![1.0, 2.0, 3.0, 4.0], vec![5.0, 6.0, 7.0, 8.0]], &dev);
    let left = CpuMatrix::empty(2, 1, DType::F32, &dev)?;
    let right = CpuMatrix::empty(2, 2, DType::F32, &dev)?;
    m.hsplit(&ctx, &[&left, &right], Some(&[(0, 1), (2, 4)]))?;
    assert_eq!(read(&left, &ctx), vec![1.0, 5.0]);
    assert_eq!(read(&right, &ctx), vec![3.0, 4.0, 7.0, 8.0]);

    let top = CpuMatrix::empty(1, 4, DType::F32, &dev)?;
    let bottom = CpuMatrix::empty(1, 4, DType::F32, &dev)?;
    m.vsplit(&ctx, &[&top, &bottom], None)?;
    assert_eq!(read(&bottom, &ctx), vec![5.0, 6.0, 7.0, 8.0]);

    assert!(m
        .hsplit(&ctx, &[&left, &right], Some(&[(0, 1), (3, 5)]))
        .is_err());
    Ok(())
}

#[test]
fn test_tile() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let row = mat(&[vec![1.0, 2.0]], &dev);
    let out = CpuMatrix::empty(3, 2, DType::F32, &dev)?;
    out.tile(&ctx, Axis::Rows, &row)?;
    assert_eq!(read(&out, &ctx), vec![1.0, 2.0, 1.0, 2.0, 1.0, 2.0]);

    let col = mat(&[vec![1.0], vec![2.0], vec![3.0]], &dev);
    out.tile(&ctx, Axis::Cols, &col)?;
    assert_eq!(read(&out, &ctx), vec![1.0, 1.0, 2.0, 2.0, 3.0, 3.0]);

    assert!(out.tile(&ctx, Axis::Cols, &row).is_err());
    Ok(())
}

// Arithmetic

#[test]
fn test_scale_add_sub() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let a = mat(&[vec![1.0, 2.0]], &dev);
    let b = mat(&[vec![10.0, 20.0]], &dev);
    let out = CpuMatrix::empty(1, 2, DType::F32, &dev)?;
    a.scale(&ctx, 3.0, Some(&out))?;
    assert_eq!(read(&out, &ctx), vec![3.0, 6.0]);
    out.add(&ctx, &b)?;
    assert_eq!(read(&out, &ctx), vec![13.0, 26.0]);
    out.sub(&ctx, &a)?;
    assert_eq!(read(&out, &ctx), vec![12.0, 24.0]);
    out.add_scaled(&ctx, -0.5, &b)?;
    assert_eq!(read(&out, &ctx), vec![7.0, 14.0]);
    Ok(())
}

#[test]
fn test_sums() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let a = mat(&[vec![1.0, 2.0]], &dev);
    let b = mat(&[vec![3.0, 4.0]], &dev);
    let out = mat(&[vec![100.0, 100.0]], &dev);
    out.add_sum(&ctx, &[&a, &b])?;
    assert_eq!(read(&out, &ctx), vec![104.0, 106.0]);
    out.assign_sum(&ctx, &[&a, &b, &a])?;
    assert_eq!(read(&out, &ctx), vec![5.0, 8.0]);
    out.assign_sum(&ctx, &[])?;
    assert_eq!(read(&out, &ctx), vec![0.0, 0.0]);
    Ok(())
}

#[test]
fn test_int_matrix_rejected_by_arithmetic() {
    let (dev, ctx) = setup();
    let m = CpuMatrix::zeros(1, 2, DType::I32, &dev).unwrap();
    assert!(matches!(
        m.scale(&ctx, 2.0, None),
        Err(Error::DTypeMismatch { .. })
    ));
}

#[test]
fn test_device_mismatch() {
    let (_, ctx) = setup();
    let other = CpuDevice::new(1);
    let m = CpuMatrix::zeros(2, 2, DType::F32, &other).unwrap();
    assert!(matches!(
        m.scale(&ctx, 2.0, None),
        Err(Error::DeviceMismatch {
            expected: 0,
            got: 1
        })
    ));
}

// Pointwise

#[test]
fn test_activations_with_derivative() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let x = mat(&[vec![-1.0, 0.0, 2.0]], &dev);
    let y = CpuMatrix::empty(1, 3, DType::F32, &dev)?;
    let d = CpuMatrix::empty(1, 3, DType::F32, &dev)?;

    x.tanh(&ctx, &y, Some(&d))?;
    let t: Vec<f64> = [-1.0f64, 0.0, 2.0].iter().map(|v| v.tanh()).collect();
    assert_vec_approx(&read(&y, &ctx), &t, 1e-6);
    let dt: Vec<f64> = t.iter().map(|v| 1.0 - v * v).collect();
    assert_vec_approx(&read(&d, &ctx), &dt, 1e-6);

    x.sigmoid(&ctx, &y, Some(&d))?;
    let s: Vec<f64> = [-1.0f64, 0.0, 2.0]
        .iter()
        .map(|v| 1.0 / (1.0 + (-v).exp()))
        .collect();
    assert_vec_approx(&read(&y, &ctx), &s, 1e-6);
    let ds: Vec<f64> = s.iter().map(|v| v * (1.0 - v)).collect();
    assert_vec_approx(&read(&d, &ctx), &ds, 1e-6);

    x.relu(&ctx, &y, Some(&d))?;
    assert_eq!(read(&y, &ctx), vec![0.0, 0.0, 2.0]);
    assert_eq!(read(&d, &ctx), vec![0.0, 0.0, 1.0]);
    Ok(())
}

#[test]
fn test_tanh_sigmoid_rows_and_bad_extent() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let x = CpuMatrix::zeros(4, 1, DType::F32, &dev)?;
    let y = CpuMatrix::empty(4, 1, DType::F32, &dev)?;
    x.tanh_sigmoid(&ctx, Axis::Rows, &y, None)?;
    assert_vec_approx(&read(&y, &ctx), &[0.0, 0.5, 0.5, 0.5], 1e-6);

    let odd = CpuMatrix::zeros(1, 6, DType::F32, &dev)?;
    assert!(matches!(
        odd.tanh_sigmoid(&ctx, Axis::Cols, &odd, None),
        Err(Error::ShapeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn test_softmax_unimplemented() {
    let (dev, ctx) = setup();
    let x = CpuMatrix::zeros(2, 2, DType::F32, &dev).unwrap();
    assert!(matches!(
        x.softmax(&ctx, &x),
        Err(Error::Unimplemented("softmax"))
    ));
}

#[test]
fn test_hadamard_family() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let a = mat(&[vec![1.0, 2.0]], &dev);
    let b = mat(&[vec![3.0, 4.0]], &dev);
    let c = mat(&[vec![5.0, 6.0]], &dev);
    let out = mat(&[vec![1.0, 1.0]], &dev);

    out.add_hprod(&ctx, &a, &b, None, 2.0)?;
    assert_eq!(read(&out, &ctx), vec![5.0, 10.0]);
    out.assign_hprod(&ctx, &a, &b, Some(&c))?;
    assert_eq!(read(&out, &ctx), vec![15.0, 48.0]);

    out.assign_sum_hprod(&ctx, &[&[&a, &b], &[&a, &b, &c], &[&c, &c]])?;
    assert_eq!(read(&out, &ctx), vec![43.0, 92.0]);

    assert!(matches!(
        out.assign_sum_hprod(&ctx, &[&[&a, &b]]),
        Err(Error::ShapeMismatch { .. })
    ));
    assert!(matches!(
        out.assign_sum_hprod(&ctx, &[&[&a], &[&b, &c]]),
        Err(Error::ShapeMismatch { .. })
    ));
    Ok(())
}

#[test]
fn test_hprod_sum_rows() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let a = mat(&[vec![1.0, 2.0], vec![3.0, 4.0]], &dev);
    let b = mat(&[vec![5.0, 6.0], vec![7.0, 8.0]], &dev);
    let out = CpuMatrix::empty(2, 1, DType::F32, &dev)?;
    out.assign_hprod_sum(&ctx, &a, &b)?;
    assert_eq!(read(&out, &ctx), vec![17.0, 53.0]);

    let wrong = CpuMatrix::empty(1, 2, DType::F32, &dev)?;
    assert!(wrong.assign_hprod_sum(&ctx, &a, &b).is_err());
    Ok(())
}

#[test]
fn test_cross_entropy() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let p = mat(&[vec![0.5, 1.0]], &dev);
    let q = mat(&[vec![0.5, 0.25]], &dev);
    let out = CpuMatrix::empty(1, 2, DType::F32, &dev)?;
    out.assign_cross_entropy(&ctx, &p, &q)?;
    assert_vec_approx(
        &read(&out, &ctx),
        &[std::f64::consts::LN_2, -(0.25f64.ln())],
        1e-5,
    );
    Ok(())
}

// Column gather / scatter

#[test]
fn test_slice_columns_and_scatter() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let src = mat(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]], &dev);
    let idx = CpuMatrix::from_host(&HostArray::from_rows(&[vec![2i32, 0, 2]])?, None, Some(&dev))?;
    let out = CpuMatrix::empty(2, 3, DType::F32, &dev)?;

    src.slice_columns(&ctx, &idx, &out, false)?;
    assert_eq!(read(&out, &ctx), vec![3.0, 1.0, 3.0, 6.0, 4.0, 6.0]);

    let acc = CpuMatrix::zeros(2, 3, DType::F32, &dev)?;
    acc.add_scaled_at_columns(&ctx, &idx, 0.5, &out)?;
    // column 2 receives two contributions
    assert_eq!(read(&acc, &ctx), vec![0.5, 0.0, 3.0, 2.0, 0.0, 6.0]);

    let float_idx = CpuMatrix::zeros(1, 3, DType::F32, &dev)?;
    assert!(matches!(
        src.slice_columns(&ctx, &float_idx, &out, false),
        Err(Error::DTypeMismatch { .. })
    ));
    Ok(())
}

// Matrix products

#[test]
fn test_dot_and_transposes() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let a = mat(&[vec![1.0, 2.0], vec![3.0, 4.0]], &dev);
    let b = mat(&[vec![5.0, 6.0], vec![7.0, 8.0]], &dev);
    let c = CpuMatrix::empty(2, 2, DType::F32, &dev)?;
    c.assign_dot(&ctx, &a, &b, MatOp::N, MatOp::N)?;
    assert_eq!(read(&c, &ctx), vec![19.0, 22.0, 43.0, 50.0]);

    c.assign_dot(&ctx, &b, &a, MatOp::T, MatOp::T)?;
    assert_eq!(read(&c, &ctx), vec![19.0, 43.0, 22.0, 50.0]);

    c.add_dot(&ctx, &a, &b, MatOp::N, MatOp::N, 1.0, -1.0)?;
    assert_eq!(read(&c, &ctx), vec![0.0, -21.0, 21.0, 0.0]);
    Ok(())
}

#[test]
fn test_dot_matrix_vector() -> strand::Result<()> {
    let (dev, ctx) = setup();
    let a = mat(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]], &dev);
    let x = mat(&[vec![1.0], vec![0.0], vec![-1.0]], &dev);
    let y = CpuMatrix::empty(2, 1, DType::F32, &dev)?;
    y.assign_dot(&ctx, &a, &x, MatOp::N, MatOp::N)?;
    assert_eq!(read(&y, &ctx), vec![-2.0, -2.0]);
    Ok(())
}

#[test]
fn test_dot_shape_mismatch() {
    let (dev, ctx) = setup();
    let a = CpuMatrix::zeros(2, 3, DType::F32, &dev).unwrap();
    let c = CpuMatrix::zeros(2, 2, DType::F32, &dev).unwrap();
    assert!(matches!(
        c.assign_dot(&ctx, &a, &a, MatOp::N, MatOp::N),
        Err(Error::ShapeMismatch { .. })
    ));
    // a · a^T is fine
    assert!(c.assign_dot(&ctx, &a, &a, MatOp::N, MatOp::T).is_ok());
}

// Properties

fn values(n: usize, seed: u32) -> Vec<f32> {
    (0..n)
        .map(|i| ((i as u32).wrapping_mul(31).wrapping_add(seed) % 97) as f32 - 48.0)
        .collect()
}

proptest! {
    #[test]
    fn prop_hstack_hsplit_roundtrip(
        nrows in 1usize..5,
        widths in prop::collection::vec(1usize..4, 1..5),
        seed in 0u32..1000,
    ) {
        let (dev, ctx) = setup();
        let parts: Vec<CpuMatrix> = widths
            .iter()
            .enumerate()
            .map(|(k, &w)| {
                let data = values(nrows * w, seed + k as u32);
                let array = HostArray::new(vec![nrows, w], data).unwrap();
                CpuMatrix::from_host(&array, None, Some(&dev)).unwrap()
            })
            .collect();
        let total: usize = widths.iter().sum();
        let stacked = CpuMatrix::empty(nrows, total, DType::F32, &dev).unwrap();
        let refs: Vec<&CpuMatrix> = parts.iter().collect();
        stacked.assign_hstack(&ctx, &refs).unwrap();

        let outs: Vec<CpuMatrix> = widths
            .iter()
            .map(|&w| CpuMatrix::empty(nrows, w, DType::F32, &dev).unwrap())
            .collect();
        let out_refs: Vec<&CpuMatrix> = outs.iter().collect();
        stacked.hsplit(&ctx, &out_refs, None).unwrap();
        ctx.synchronize().unwrap();

        for (p, o) in parts.iter().zip(&outs) {
            prop_assert_eq!(p.to_host().unwrap(), o.to_host().unwrap());
        }
    }

    #[test]
    fn prop_transpose_of_product(
        m in 1usize..5,
        k in 1usize..5,
        n in 1usize..5,
        seed in 0u32..1000,
    ) {
        let (dev, ctx) = setup();
        let a = CpuMatrix::from_host(
            &HostArray::new(vec![m, k], values(m * k, seed)).unwrap(), None, Some(&dev),
        ).unwrap();
        let b = CpuMatrix::from_host(
            &HostArray::new(vec![k, n], values(k * n, seed + 7)).unwrap(), None, Some(&dev),
        ).unwrap();
        let ab = CpuMatrix::empty(m, n, DType::F32, &dev).unwrap();
        ab.assign_dot(&ctx, &a, &b, MatOp::N, MatOp::N).unwrap();
        let bt_at = CpuMatrix::empty(n, m, DType::F32, &dev).unwrap();
        bt_at.assign_dot(&ctx, &b, &a, MatOp::T, MatOp::T).unwrap();
        ctx.synchronize().unwrap();

        let ab = ab.to_host().unwrap();
        let bt_at = bt_at.to_host().unwrap();
        for r in 0..m {
            for c in 0..n {
                let x = ab.get(r, c).unwrap();
                let y = bt_at.get(c, r).unwrap();
                prop_assert!((x - y).abs() <= 1e-3 * (1.0 + x.abs()));
            }
        }
    }
}
