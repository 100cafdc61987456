// ─────────────────────────────────────────────────────────────────────
// SCPN GeoMag — Sparse Regularization (IRLS)
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Mixed-norm model objective via iteratively reweighted least squares.
//!
//! Four terms k ∈ {smallness, ∂x, ∂y, ∂z}, each with residual f_k:
//!   smallness  f_s[i] = m_i − m_ref
//!   gradient   f_a[e] = m_j − m_i   for neighbours (i, j) along axis a
//! The quadratic surrogate is
//!   φ_m(m) = Σ_k α_k Σ_e w_k[e]² R_k[e] f_k[e]²
//! with w the sensitivity cell weights (face-averaged for gradients) and
//!   R_k[e] = ε_k^(2−p_k) (f_k[e]² + ε_k²)^((p_k−2)/2)
//! frozen between IRLS updates. Before sparsification R ≡ 1 (p = 2).

use std::collections::HashMap;

use geomag_types::config::{RegularizationConfig, N_REG_TERMS};
use geomag_types::constants::{FACE_MATCH_TOL, MIN_IRLS_WEIGHT};
use geomag_types::error::{GeoMagError, GeoMagResult};
use geomag_types::state::Prism;

use crate::objective::ObjectiveTerm;

/// Below this exponent the p → 0 limit of the penalty is used.
const P_ZERO: f64 = 1e-8;

pub const TERM_NAMES: [&str; N_REG_TERMS] = ["smallness", "x", "y", "z"];

/// Snap coordinates along one axis into clusters closer than `tol`.
struct AxisSnap {
    starts: Vec<f64>,
    tol: f64,
}

impl AxisSnap {
    fn new(mut values: Vec<f64>, tol: f64) -> Self {
        values.sort_by(|a, b| a.total_cmp(b));
        let mut starts: Vec<f64> = Vec::new();
        let mut last = f64::NEG_INFINITY;
        for v in values {
            if v - last > tol {
                starts.push(v);
            }
            last = v;
        }
        AxisSnap { starts, tol }
    }

    fn id(&self, v: f64) -> usize {
        self.starts
            .partition_point(|&s| s <= v + self.tol)
            .saturating_sub(1)
    }
}

/// Neighbour pairs (i, j) per axis: cell j touches the upper face of cell i
/// with identical extents on the other two axes.
pub fn neighbour_pairs(cells: &[Prism]) -> GeoMagResult<[Vec<(usize, usize)>; 3]> {
    if cells.is_empty() {
        return Err(GeoMagError::Geometry(
            "cannot build difference operators without cells".to_string(),
        ));
    }
    let min_extent = cells
        .iter()
        .map(Prism::min_extent)
        .fold(f64::INFINITY, f64::min);
    if !min_extent.is_finite() || min_extent <= 0.0 {
        return Err(GeoMagError::Geometry(
            "cells must have positive extent on every axis".to_string(),
        ));
    }
    let tol = FACE_MATCH_TOL * min_extent;

    let snaps: Vec<AxisSnap> = (0..3)
        .map(|a| {
            let values = cells
                .iter()
                .flat_map(|c| [c.lower[a], c.upper[a]])
                .collect();
            AxisSnap::new(values, tol)
        })
        .collect();
    let ids: Vec<[[usize; 2]; 3]> = cells
        .iter()
        .map(|c| {
            [
                [snaps[0].id(c.lower[0]), snaps[0].id(c.upper[0])],
                [snaps[1].id(c.lower[1]), snaps[1].id(c.upper[1])],
                [snaps[2].id(c.lower[2]), snaps[2].id(c.upper[2])],
            ]
        })
        .collect();

    let mut pairs: [Vec<(usize, usize)>; 3] = Default::default();
    for (axis, axis_pairs) in pairs.iter_mut().enumerate() {
        let (b, c) = ((axis + 1) % 3, (axis + 2) % 3);
        let key = |face: usize, id: &[[usize; 2]; 3]| -> [usize; 5] {
            [face, id[b][0], id[b][1], id[c][0], id[c][1]]
        };
        let by_lower_face: HashMap<[usize; 5], usize> = ids
            .iter()
            .enumerate()
            .map(|(j, id)| (key(id[axis][0], id), j))
            .collect();
        for (i, id) in ids.iter().enumerate() {
            if let Some(&j) = by_lower_face.get(&key(id[axis][1], id)) {
                axis_pairs.push((i, j));
            }
        }
    }
    Ok(pairs)
}

/// IRLS reweighting factor for one residual value.
#[inline]
fn irls_factor(f: f64, p: f64, eps: f64) -> f64 {
    let r = eps.powf(2.0 - p) * (f * f + eps * eps).powf(0.5 * (p - 2.0));
    r.max(MIN_IRLS_WEIGHT)
}

/// Smoothed p-norm penalty majorized by the IRLS surrogate:
/// ρ(f) = (2/p) ε^(2−p) [(f² + ε²)^(p/2) − ε^p], ε² ln(1 + f²/ε²) as p → 0.
#[inline]
fn lp_penalty(f: f64, p: f64, eps: f64) -> f64 {
    if p < P_ZERO {
        eps * eps * (f * f / (eps * eps)).ln_1p()
    } else {
        (2.0 / p) * eps.powf(2.0 - p) * ((f * f + eps * eps).powf(0.5 * p) - eps.powf(p))
    }
}

#[derive(Debug, Clone)]
pub struct SparseRegularization {
    n_cells: usize,
    alphas: [f64; N_REG_TERMS],
    norms: [f64; N_REG_TERMS],
    epsilons: [f64; N_REG_TERMS],
    reference: f64,
    /// Gradient-term neighbour pairs, per axis.
    pairs: [Vec<(usize, usize)>; 3],
    /// Squared sensitivity weights per residual entry, per term.
    base: [Vec<f64>; N_REG_TERMS],
    /// Current IRLS factors per residual entry, per term.
    irls: [Vec<f64>; N_REG_TERMS],
    sparse: bool,
}

impl SparseRegularization {
    /// `cell_weights` must be strictly positive, one per active cell.
    pub fn new(
        cells: &[Prism],
        cell_weights: &[f64],
        cfg: &RegularizationConfig,
    ) -> GeoMagResult<Self> {
        if cell_weights.len() != cells.len() {
            return Err(GeoMagError::Data(format!(
                "Length mismatch: cells={}, cell weights={}",
                cells.len(),
                cell_weights.len()
            )));
        }
        if let Some(i) = cell_weights
            .iter()
            .position(|w| !w.is_finite() || *w <= 0.0)
        {
            return Err(GeoMagError::Data(format!(
                "cell weight {i} must be finite and > 0"
            )));
        }
        for k in 0..N_REG_TERMS {
            if !(0.0..=2.0).contains(&cfg.norms[k]) || cfg.epsilons[k].is_nan() || cfg.epsilons[k] <= 0.0 {
                return Err(GeoMagError::ConfigError(format!(
                    "regularization term {} needs p in [0, 2] and ε > 0",
                    TERM_NAMES[k]
                )));
            }
        }

        let pairs = neighbour_pairs(cells)?;
        let smallness: Vec<f64> = cell_weights.iter().map(|w| w * w).collect();
        let face = |axis_pairs: &Vec<(usize, usize)>| -> Vec<f64> {
            axis_pairs
                .iter()
                .map(|&(i, j)| (0.5 * (cell_weights[i] + cell_weights[j])).powi(2))
                .collect()
        };
        let base = [smallness, face(&pairs[0]), face(&pairs[1]), face(&pairs[2])];
        let irls = [
            vec![1.0; base[0].len()],
            vec![1.0; base[1].len()],
            vec![1.0; base[2].len()],
            vec![1.0; base[3].len()],
        ];

        Ok(SparseRegularization {
            n_cells: cells.len(),
            alphas: cfg.alphas,
            norms: cfg.norms,
            epsilons: cfg.epsilons,
            reference: cfg.reference_model,
            pairs,
            base,
            irls,
            sparse: false,
        })
    }

    pub fn norms(&self) -> [f64; N_REG_TERMS] {
        self.norms
    }

    pub fn epsilons(&self) -> [f64; N_REG_TERMS] {
        self.epsilons
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    /// True when some term asks for a norm below 2.
    pub fn has_sparse_terms(&self) -> bool {
        self.norms
            .iter()
            .zip(self.alphas.iter())
            .any(|(&p, &a)| a > 0.0 && p < 2.0)
    }

    /// Exponent in effect: 2 until sparsification is switched on.
    pub fn effective_norm(&self, term: usize) -> f64 {
        if self.sparse {
            self.norms[term]
        } else {
            2.0
        }
    }

    pub fn neighbour_pairs(&self, axis: usize) -> &[(usize, usize)] {
        &self.pairs[axis]
    }

    pub fn irls_weights(&self, term: usize) -> &[f64] {
        &self.irls[term]
    }

    /// Residual vector f_k of one term.
    pub fn term_residual(&self, term: usize, model: &[f64]) -> Vec<f64> {
        match term {
            0 => model.iter().map(|m| m - self.reference).collect(),
            axis => self.pairs[axis - 1]
                .iter()
                .map(|&(i, j)| model[j] - model[i])
                .collect(),
        }
    }

    /// Largest |f_k| of each term.
    pub fn max_abs_residuals(&self, model: &[f64]) -> [f64; N_REG_TERMS] {
        let mut out = [0.0; N_REG_TERMS];
        for (k, o) in out.iter_mut().enumerate() {
            *o = self
                .term_residual(k, model)
                .iter()
                .fold(0.0, |acc: f64, f| acc.max(f.abs()));
        }
        out
    }

    /// Switch on p < 2 norms, with new thresholds, reweighting at `model`.
    pub fn activate_sparse(&mut self, model: &[f64], epsilons: [f64; N_REG_TERMS]) {
        self.sparse = true;
        self.update_irls_weights(model, epsilons);
    }

    /// Recompute R_k from the current model. No-op weights (R ≡ 1) while
    /// the smooth phase is running.
    pub fn update_irls_weights(&mut self, model: &[f64], epsilons: [f64; N_REG_TERMS]) {
        self.epsilons = epsilons;
        for k in 0..N_REG_TERMS {
            let p = self.effective_norm(k);
            let eps = self.epsilons[k];
            let f = self.term_residual(k, model);
            self.irls[k] = f.iter().map(|&fi| irls_factor(fi, p, eps)).collect();
        }
    }

    /// Smoothed p-norm objective that the surrogate majorizes; equals the
    /// surrogate value in the smooth phase.
    pub fn lp_value(&self, model: &[f64]) -> f64 {
        (0..N_REG_TERMS)
            .map(|k| {
                if self.alphas[k] == 0.0 {
                    return 0.0;
                }
                let p = self.effective_norm(k);
                let eps = self.epsilons[k];
                let f = self.term_residual(k, model);
                let sum: f64 = f
                    .iter()
                    .zip(self.base[k].iter())
                    .map(|(&fi, &b)| {
                        if p >= 2.0 {
                            b * fi * fi
                        } else {
                            b * lp_penalty(fi, p, eps)
                        }
                    })
                    .sum();
                self.alphas[k] * sum
            })
            .sum()
    }

    /// Per-entry weights α_k w_k² R_k of one term.
    fn term_weights(&self, term: usize) -> Vec<f64> {
        let alpha = self.alphas[term];
        self.base[term]
            .iter()
            .zip(self.irls[term].iter())
            .map(|(b, r)| alpha * b * r)
            .collect()
    }

    /// Accumulate 2 D_kᵀ diag(c) f into `out`.
    fn add_transpose(&self, term: usize, weighted: &[f64], out: &mut [f64]) {
        match term {
            0 => {
                for (o, v) in out.iter_mut().zip(weighted.iter()) {
                    *o += 2.0 * v;
                }
            }
            axis => {
                for (&(i, j), &v) in self.pairs[axis - 1].iter().zip(weighted.iter()) {
                    out[j] += 2.0 * v;
                    out[i] -= 2.0 * v;
                }
            }
        }
    }

    fn difference(&self, term: usize, v: &[f64]) -> Vec<f64> {
        match term {
            0 => v.to_vec(),
            axis => self.pairs[axis - 1]
                .iter()
                .map(|&(i, j)| v[j] - v[i])
                .collect(),
        }
    }
}

impl ObjectiveTerm for SparseRegularization {
    fn n_params(&self) -> usize {
        self.n_cells
    }

    fn value(&self, model: &[f64]) -> f64 {
        (0..N_REG_TERMS)
            .map(|k| {
                self.term_residual(k, model)
                    .iter()
                    .zip(self.term_weights(k).iter())
                    .map(|(f, c)| c * f * f)
                    .sum::<f64>()
            })
            .sum()
    }

    fn gradient(&self, model: &[f64]) -> Vec<f64> {
        let mut g = vec![0.0; self.n_cells];
        for k in 0..N_REG_TERMS {
            let weighted: Vec<f64> = self
                .term_residual(k, model)
                .iter()
                .zip(self.term_weights(k).iter())
                .map(|(f, c)| c * f)
                .collect();
            self.add_transpose(k, &weighted, &mut g);
        }
        g
    }

    fn hess_vec(&self, v: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.n_cells];
        for k in 0..N_REG_TERMS {
            let weighted: Vec<f64> = self
                .difference(k, v)
                .iter()
                .zip(self.term_weights(k).iter())
                .map(|(d, c)| c * d)
                .collect();
            self.add_transpose(k, &weighted, &mut out);
        }
        out
    }

    fn hessian_diagonal(&self) -> Vec<f64> {
        let mut diag = vec![0.0; self.n_cells];
        for (d, c) in diag.iter_mut().zip(self.term_weights(0).iter()) {
            *d += 2.0 * c;
        }
        for axis in 0..3 {
            for (&(i, j), c) in self.pairs[axis].iter().zip(self.term_weights(axis + 1)) {
                diag[i] += 2.0 * c;
                diag[j] += 2.0 * c;
            }
        }
        diag
    }
}
