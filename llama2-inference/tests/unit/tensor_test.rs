use super::*;

fn pseudo_random(len: usize, seed: u32) -> Vec<f32> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
        })
        .collect()
}

#[test]
fn test_matmul_known_values() {
    // W = [[1, 2, 3], [4, 5, 6]]
    let w = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
    let x = vec![1.0, 0.5, -1.0];
    let mut out = vec![0.0; 2];

    for kernel in [MatmulKernel::Scalar, MatmulKernel::Lanes] {
        matmul(&mut out, &x, &w, kernel);
        assert_eq!(out, vec![-1.0, 0.5], "kernel {kernel:?}");
    }
}

#[test]
fn test_lanes_matches_scalar() {
    // 70 columns: two full blocks plus a 6 element tail
    let (rows, cols) = (13, 70);
    let w = pseudo_random(rows * cols, 7);
    let x = pseudo_random(cols, 11);

    let mut scalar = vec![0.0; rows];
    let mut lanes = vec![0.0; rows];
    matmul(&mut scalar, &x, &w, MatmulKernel::Scalar);
    matmul(&mut lanes, &x, &w, MatmulKernel::Lanes);

    for (row, (s, l)) in scalar.iter().zip(&lanes).enumerate() {
        assert!((s - l).abs() < 1e-4, "row {row}: scalar {s} vs lanes {l}");
    }
}

#[test]
fn test_dot_lanes_short_input() {
    let a = [1.0, 2.0, 3.0];
    let b = [4.0, 5.0, 6.0];
    assert_eq!(MatmulKernel::Lanes.dot(&a, &b), 32.0);
    assert_eq!(MatmulKernel::Lanes.dot(&[], &[]), 0.0);
}

#[test]
#[should_panic(expected = "Weight matrix too small")]
fn test_matmul_rejects_short_weights() {
    let mut out = vec![0.0; 3];
    matmul(&mut out, &[1.0, 1.0], &[1.0; 4], MatmulKernel::Scalar);
}

#[test]
fn test_kernel_from_str() {
    assert_eq!("scalar".parse::<MatmulKernel>(), Ok(MatmulKernel::Scalar));
    assert_eq!("Lanes".parse::<MatmulKernel>(), Ok(MatmulKernel::Lanes));
    assert_eq!("simd".parse::<MatmulKernel>(), Ok(MatmulKernel::Lanes));
    assert!("avx512".parse::<MatmulKernel>().is_err());
    assert_eq!(MatmulKernel::default(), MatmulKernel::Lanes);
}

#[test]
fn test_tensor_view_parts() {
    let view = TensorView::new(10, 12);
    assert_eq!(view.range(), 10..22);
    assert_eq!(view.part(0, 3), TensorView::new(10, 4));
    assert_eq!(view.part(2, 3), TensorView::new(18, 4));

    let arena: Vec<f32> = (0..32).map(|i| i as f32).collect();
    assert_eq!(arena.tensor(view.part(1, 3)), &[14.0, 15.0, 16.0, 17.0]);
}
