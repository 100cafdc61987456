//! Dense vector and matrix kernels.
//!
//! Row-parallel G·x and column-parallel Gᵀ·y via rayon, plus power iteration for the
//! dominant eigenvalue of a symmetric positive semi-definite operator.

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

/// Rows per rayon task in A · x.
const ROW_CHUNK: usize = 16;
/// Columns per rayon task in Aᵀ · y.
const COL_CHUNK: usize = 64;

#[inline]
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[inline]
pub fn norm2(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// y += alpha * x
#[inline]
pub fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    debug_assert_eq!(x.len(), y.len());
    for (yi, &xi) in y.iter_mut().zip(x.iter()) {
        *yi += alpha * xi;
    }
}

/// A · x for a dense row-major matrix.
pub fn matvec(a: &Array2<f64>, x: &[f64]) -> Vec<f64> {
    let (m, n) = a.dim();
    debug_assert_eq!(n, x.len());
    match a.as_slice() {
        Some(data) if n > 0 => {
            let mut out = vec![0.0; m];
            out.par_chunks_mut(ROW_CHUNK)
                .zip(data.par_chunks(n * ROW_CHUNK))
                .for_each(|(out_chunk, rows)| {
                    for (o, row) in out_chunk.iter_mut().zip(rows.chunks(n)) {
                        *o = dot(row, x);
                    }
                });
            out
        }
        _ => (0..m)
            .map(|i| a.row(i).iter().zip(x.iter()).map(|(g, v)| g * v).sum())
            .collect(),
    }
}

/// Aᵀ · y for a dense row-major matrix, without forming the transpose.
///
/// Parallel over column blocks; each output entry is accumulated over rows
/// in order, so the result is bitwise independent of the thread count.
pub fn matvec_transpose(a: &Array2<f64>, y: &[f64]) -> Vec<f64> {
    let (m, n) = a.dim();
    debug_assert_eq!(m, y.len());
    let mut out = vec![0.0; n];
    match a.as_slice() {
        Some(data) if n > 0 => {
            out.par_chunks_mut(COL_CHUNK)
                .enumerate()
                .for_each(|(c, out_chunk)| {
                    let start = c * COL_CHUNK;
                    let end = start + out_chunk.len();
                    for (row, &yi) in data.chunks(n).zip(y.iter()) {
                        axpy(yi, &row[start..end], out_chunk);
                    }
                });
        }
        _ => {
            for (i, &yi) in y.iter().enumerate() {
                for (o, g) in out.iter_mut().zip(a.row(i).iter()) {
                    *o += yi * g;
                }
            }
        }
    }
    out
}

/// Σ_i A[i, j]² for every column j.
pub fn column_sq_norms(a: &Array2<f64>) -> Vec<f64> {
    let mut out = vec![0.0; a.ncols()];
    for row in a.rows() {
        for (o, &g) in out.iter_mut().zip(row.iter()) {
            *o += g * g;
        }
    }
    out
}

/// Estimate the largest eigenvalue of a symmetric PSD operator of size `n`.
///
/// Starts from a seeded uniform random vector and returns the Rayleigh
/// quotient after `iterations` power steps. Returns 0.0 for the null operator.
pub fn power_iteration<F>(op: F, n: usize, iterations: usize, seed: u64) -> f64
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    if n == 0 {
        return 0.0;
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut x: Vec<f64> = (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let nx = norm2(&x);
    if nx == 0.0 {
        x[0] = 1.0;
    } else {
        x.iter_mut().for_each(|v| *v /= nx);
    }

    let mut lambda = 0.0;
    for _ in 0..iterations.max(1) {
        let y = op(&x);
        lambda = dot(&x, &y);
        let ny = norm2(&y);
        if ny <= f64::MIN_POSITIVE {
            return 0.0;
        }
        x = y.into_iter().map(|v| v / ny).collect();
    }
    lambda.max(0.0)
}
