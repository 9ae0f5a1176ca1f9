#[cfg(test)]
#[path = "../tests/unit/tensor_test.rs"]
mod tensor_test;

use rayon::prelude::*;
use std::ops::Range;
use std::str::FromStr;

/// Number of f32 lanes per partial accumulator in the lane-wise kernel.
const LANES: usize = 8;

/// Number of independent partial accumulators in the lane-wise kernel.
const ACCUMULATORS: usize = 4;

/// A tensor expressed as an element offset and length into a float arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorView {
    pub offset: usize,
    pub len: usize,
}

impl TensorView {
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    /// Returns the `index`-th of `count` equally sized consecutive sub-views.
    pub fn part(&self, index: usize, count: usize) -> TensorView {
        let size = self.len / count;
        TensorView::new(self.offset + index * size, size)
    }
}

/// Resolves tensor views into float slices.
pub trait TensorSource: Sync {
    fn tensor(&self, view: TensorView) -> &[f32];
}

impl TensorSource for Vec<f32> {
    fn tensor(&self, view: TensorView) -> &[f32] {
        &self[view.range()]
    }
}

/// Inner-product strategy used by [`matmul`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatmulKernel {
    /// Plain sequential reduction.
    Scalar,
    /// Several fixed-width partial accumulators reduced horizontally at the end,
    /// laid out so the compiler can map them onto SIMD registers.
    #[default]
    Lanes,
}

impl MatmulKernel {
    #[inline]
    pub fn dot(self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            MatmulKernel::Scalar => dot_scalar(a, b),
            MatmulKernel::Lanes => dot_lanes(a, b),
        }
    }
}

impl FromStr for MatmulKernel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scalar" => Ok(MatmulKernel::Scalar),
            "lanes" | "simd" => Ok(MatmulKernel::Lanes),
            other => Err(format!("unknown matmul kernel: {other} (expected scalar|lanes)")),
        }
    }
}

/// Matrix-vector product `xout = W @ x` for a row-major `W` of shape `[xout.len()][x.len()]`.
///
/// Rows are independent, so each output element is computed by its own rayon task.
pub fn matmul(xout: &mut [f32], x: &[f32], w: &[f32], kernel: MatmulKernel) {
    let n = x.len();
    assert!(
        w.len() >= xout.len() * n,
        "Weight matrix too small: {} < {} x {}",
        w.len(),
        xout.len(),
        n
    );

    xout.par_iter_mut().enumerate().for_each(|(row_idx, out_val)| {
        let row = &w[row_idx * n..(row_idx + 1) * n];
        *out_val = kernel.dot(row, x);
    });
}

#[inline]
fn dot_scalar(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(&a, &b)| a * b).sum()
}

#[inline]
fn dot_lanes(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    const BLOCK: usize = LANES * ACCUMULATORS;

    let a_blocks = a.chunks_exact(BLOCK);
    let b_blocks = b.chunks_exact(BLOCK);
    let a_tail = a_blocks.remainder();
    let b_tail = b_blocks.remainder();

    let mut acc = [[0.0f32; LANES]; ACCUMULATORS];
    for (a_block, b_block) in a_blocks.zip(b_blocks) {
        for (k, lanes) in acc.iter_mut().enumerate() {
            let a_lane = &a_block[k * LANES..(k + 1) * LANES];
            let b_lane = &b_block[k * LANES..(k + 1) * LANES];
            for l in 0..LANES {
                lanes[l] += a_lane[l] * b_lane[l];
            }
        }
    }

    let mut lanes = [0.0f32; LANES];
    for partial in &acc {
        for l in 0..LANES {
            lanes[l] += partial[l];
        }
    }

    lanes.iter().sum::<f32>() + dot_scalar(a_tail, b_tail)
}
