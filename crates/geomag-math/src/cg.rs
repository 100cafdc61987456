// ─────────────────────────────────────────────────────────────────────
// SCPN GeoMag — Preconditioned Conjugate Gradient
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Truncated, Jacobi-preconditioned conjugate gradient.
//!
//! Solves `A x = b` for a symmetric operator given as a closure, starting
//! from `x = 0`. The iteration stops on the relative residual
//! `‖r‖ / ‖b‖ < tol`, on the iteration budget, or on a direction of
//! non-positive curvature (`pᵀAp ≤ 0`). Breakdown is not fatal: the
//! iterate reached so far is returned and flagged.

use geomag_types::error::GeoMagError;

use crate::linalg::{axpy, dot, norm2};

/// Curvature below this multiple of ‖p‖² counts as breakdown.
const CURVATURE_FLOOR: f64 = 1e-14;

/// Configuration for the CG solver.
#[derive(Debug, Clone)]
pub struct CgConfig {
    /// Iteration budget (default: 30).
    pub max_iter: usize,
    /// Relative residual tolerance (default: 1e-3).
    pub tol: f64,
}

impl Default for CgConfig {
    fn default() -> Self {
        CgConfig {
            max_iter: 30,
            tol: 1e-3,
        }
    }
}

/// Non-positive curvature encountered along a search direction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CgBreakdown {
    pub iteration: usize,
    pub curvature: f64,
}

/// Result of a CG solve.
#[derive(Debug, Clone)]
pub struct CgResult {
    pub x: Vec<f64>,
    /// Operator applications performed.
    pub iterations: usize,
    /// Final ‖r‖ / ‖b‖.
    pub relative_residual: f64,
    pub converged: bool,
    pub breakdown: Option<CgBreakdown>,
}

impl CgResult {
    /// Breakdown as a [`GeoMagError::Numerical`] for reporting.
    pub fn breakdown_error(&self) -> Option<GeoMagError> {
        self.breakdown.map(|b| GeoMagError::Numerical {
            iteration: b.iteration,
            message: format!(
                "CG direction with non-positive curvature pᵀAp = {:.3e}",
                b.curvature
            ),
        })
    }
}

/// Solve `A x = b` with a diagonal preconditioner given by its inverse.
///
/// `inv_diag` holds `1 / diag(A)` (or any positive scaling); pass a slice of
/// ones for plain CG.
pub fn pcg_solve<F>(a_op: F, b: &[f64], inv_diag: &[f64], cfg: &CgConfig) -> CgResult
where
    F: Fn(&[f64]) -> Vec<f64>,
{
    let n = b.len();
    debug_assert_eq!(inv_diag.len(), n);
    let mut x = vec![0.0; n];

    let b_norm = norm2(b);
    if b_norm == 0.0 {
        return CgResult {
            x,
            iterations: 0,
            relative_residual: 0.0,
            converged: true,
            breakdown: None,
        };
    }

    let mut r = b.to_vec();
    let mut z: Vec<f64> = r.iter().zip(inv_diag.iter()).map(|(ri, mi)| ri * mi).collect();
    let mut p = z.clone();
    let mut rz = dot(&r, &z);
    let mut rel = 1.0;

    for iter in 0..cfg.max_iter {
        let ap = a_op(&p);
        let pap = dot(&p, &ap);
        let pp = dot(&p, &p);
        if pap <= CURVATURE_FLOOR * pp {
            return CgResult {
                x,
                iterations: iter + 1,
                relative_residual: rel,
                converged: false,
                breakdown: Some(CgBreakdown {
                    iteration: iter,
                    curvature: pap,
                }),
            };
        }

        let alpha = rz / pap;
        axpy(alpha, &p, &mut x);
        axpy(-alpha, &ap, &mut r);

        rel = norm2(&r) / b_norm;
        if rel < cfg.tol {
            return CgResult {
                x,
                iterations: iter + 1,
                relative_residual: rel,
                converged: true,
                breakdown: None,
            };
        }

        for ((zi, ri), mi) in z.iter_mut().zip(r.iter()).zip(inv_diag.iter()) {
            *zi = ri * mi;
        }
        let rz_new = dot(&r, &z);
        let beta = rz_new / rz;
        rz = rz_new;
        for (pi, zi) in p.iter_mut().zip(z.iter()) {
            *pi = zi + beta * *pi;
        }
    }

    CgResult {
        x,
        iterations: cfg.max_iter,
        relative_residual: rel,
        converged: false,
        breakdown: None,
    }
}
