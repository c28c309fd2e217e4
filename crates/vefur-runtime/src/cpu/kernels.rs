//! ndarray implementations of the operator kernels.
//!
//! These are the execution path for `Device::Cpu` and the reference the GPU
//! kernels are validated against.

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;

/// Tanh-approximation GELU, matching the GPU kernel.
pub fn gelu(x: f32) -> f32 {
    const SQRT_2_OVER_PI: f32 = 0.797_884_56;
    0.5 * x * (1.0 + (SQRT_2_OVER_PI * (x + 0.044715 * x * x * x)).tanh())
}

pub fn softmax_1d_inplace(row: &mut [f32]) {
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in row.iter_mut() {
        *v /= sum;
    }
}

pub fn log_softmax_1d(logits: &Array1<f32>) -> Array1<f32> {
    let max_val = logits.fold(f32::NEG_INFINITY, |acc, &x| acc.max(x));
    let scaled = logits - max_val;
    let exp_sum = scaled.mapv(f32::exp).sum();
    scaled - exp_sum.ln()
}

/// `x [m, k] @ w [n, k]^T (+ bias) -> [m, n]`, rows in parallel.
///
/// Weights use the `[out, in]` convention throughout the runtime.
pub fn matmul_bt(
    x: ArrayView2<f32>,
    w: ArrayView2<f32>,
    bias: Option<&[f32]>,
    activate: bool,
) -> Array2<f32> {
    let (m, k) = x.dim();
    let (n, wk) = w.dim();
    assert_eq!(k, wk, "inner dimensions must match: {} vs {}", k, wk);
    if let Some(b) = bias {
        assert_eq!(b.len(), n, "bias length must match output features");
    }

    let mut out = Array2::<f32>::zeros((m, n));
    out.axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(i, mut row)| {
            let xi = x.row(i);
            for j in 0..n {
                let mut acc = xi.dot(&w.row(j));
                if let Some(b) = bias {
                    acc += b[j];
                }
                row[j] = if activate { gelu(acc) } else { acc };
            }
        });
    out
}

/// LayerNorm over the last axis of `[m, h]`.
pub fn layer_norm(x: ArrayView2<f32>, gamma: &[f32], beta: &[f32], eps: f32) -> Array2<f32> {
    let (m, h) = x.dim();
    assert_eq!(gamma.len(), h);
    assert_eq!(beta.len(), h);

    let mut out = Array2::<f32>::zeros((m, h));
    for i in 0..m {
        let row = x.row(i);
        let mean = row.sum() / h as f32;
        let var = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / h as f32;
        let inv = 1.0 / (var + eps).sqrt();
        for j in 0..h {
            out[[i, j]] = (row[j] - mean) * inv * gamma[j] + beta[j];
        }
    }
    out
}

/// RMSNorm over the last axis of `[m, h]`: no centering, no bias.
pub fn rms_norm(x: ArrayView2<f32>, gamma: &[f32], eps: f32) -> Array2<f32> {
    let (m, h) = x.dim();
    assert_eq!(gamma.len(), h);

    let mut out = Array2::<f32>::zeros((m, h));
    for i in 0..m {
        let row = x.row(i);
        let mean_sq = row.iter().map(|&v| v * v).sum::<f32>() / h as f32;
        let inv = 1.0 / (mean_sq + eps).sqrt();
        for j in 0..h {
            out[[i, j]] = row[j] * inv * gamma[j];
        }
    }
    out
}
