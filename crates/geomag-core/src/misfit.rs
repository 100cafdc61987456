// ─────────────────────────────────────────────────────────────────────
// SCPN GeoMag — Data Misfit
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Weighted least-squares data misfit φ_d(m) = ‖W (G m − d_obs)‖², W = diag(1/σ).

use geomag_math::linalg::column_sq_norms;
use geomag_types::error::{GeoMagError, GeoMagResult};

use crate::forward::SensitivityMatrix;
use crate::objective::ObjectiveTerm;

#[derive(Debug, Clone)]
pub struct DataMisfit {
    sim: SensitivityMatrix,
    observed: Vec<f64>,
    uncertainty: Vec<f64>,
    /// 1/σ² per datum.
    w2: Vec<f64>,
    /// diag(2 Gᵀ W² G), fixed for the life of the misfit.
    hess_diag: Vec<f64>,
}

impl DataMisfit {
    /// Fails when lengths disagree with G or any σ is not strictly positive.
    pub fn new(
        sim: SensitivityMatrix,
        observed: Vec<f64>,
        uncertainty: Vec<f64>,
    ) -> GeoMagResult<Self> {
        let n = sim.n_data();
        if observed.len() != n || uncertainty.len() != n {
            return Err(GeoMagError::Data(format!(
                "Length mismatch: receivers={}, data={}, uncertainties={}",
                n,
                observed.len(),
                uncertainty.len()
            )));
        }
        if let Some((i, s)) = uncertainty
            .iter()
            .enumerate()
            .find(|(_, s)| !s.is_finite() || **s <= 0.0)
        {
            return Err(GeoMagError::Data(format!(
                "uncertainty[{i}] must be finite and > 0, got {s}"
            )));
        }
        if let Some(i) = observed.iter().position(|d| !d.is_finite()) {
            return Err(GeoMagError::Data(format!("observed[{i}] is not finite")));
        }

        let w2: Vec<f64> = uncertainty.iter().map(|s| 1.0 / (s * s)).collect();
        let weighted = {
            let mut g = sim.matrix().clone();
            for (mut row, &w) in g.rows_mut().into_iter().zip(w2.iter()) {
                row.mapv_inplace(|v| v * w.sqrt());
            }
            g
        };
        let hess_diag = column_sq_norms(&weighted)
            .into_iter()
            .map(|v| 2.0 * v)
            .collect();

        Ok(DataMisfit {
            sim,
            observed,
            uncertainty,
            w2,
            hess_diag,
        })
    }

    pub fn simulation(&self) -> &SensitivityMatrix {
        &self.sim
    }

    pub fn observed(&self) -> &[f64] {
        &self.observed
    }

    pub fn uncertainty(&self) -> &[f64] {
        &self.uncertainty
    }

    pub fn n_data(&self) -> usize {
        self.observed.len()
    }

    /// G m − d_obs.
    pub fn residual(&self, model: &[f64]) -> Vec<f64> {
        self.sim
            .apply(model)
            .into_iter()
            .zip(self.observed.iter())
            .map(|(p, d)| p - d)
            .collect()
    }

    pub fn predicted(&self, model: &[f64]) -> Vec<f64> {
        self.sim.apply(model)
    }
}

impl ObjectiveTerm for DataMisfit {
    fn n_params(&self) -> usize {
        self.sim.n_cells()
    }

    fn value(&self, model: &[f64]) -> f64 {
        self.residual(model)
            .iter()
            .zip(self.w2.iter())
            .map(|(r, w2)| r * r * w2)
            .sum()
    }

    /// 2 Gᵀ W² (G m − d_obs)
    fn gradient(&self, model: &[f64]) -> Vec<f64> {
        let weighted: Vec<f64> = self
            .residual(model)
            .into_iter()
            .zip(self.w2.iter())
            .map(|(r, w2)| 2.0 * r * w2)
            .collect();
        self.sim.apply_adjoint(&weighted)
    }

    /// 2 Gᵀ W² G v
    fn hess_vec(&self, v: &[f64]) -> Vec<f64> {
        let weighted: Vec<f64> = self
            .sim
            .apply(v)
            .into_iter()
            .zip(self.w2.iter())
            .map(|(gv, w2)| 2.0 * gv * w2)
            .collect();
        self.sim.apply_adjoint(&weighted)
    }

    fn hessian_diagonal(&self) -> Vec<f64> {
        self.hess_diag.clone()
    }
}

/// Mean and standard deviation of the normalised residual (pred − obs)/σ.
pub fn residual_statistics(
    predicted: &[f64],
    observed: &[f64],
    uncertainty: &[f64],
) -> GeoMagResult<(f64, f64)> {
    let n = predicted.len();
    if observed.len() != n || uncertainty.len() != n {
        return Err(GeoMagError::Data(format!(
            "Length mismatch: predicted={n}, observed={}, uncertainties={}",
            observed.len(),
            uncertainty.len()
        )));
    }
    if n == 0 {
        return Ok((0.0, 0.0));
    }
    let normalized: Vec<f64> = (0..n)
        .map(|i| (predicted[i] - observed[i]) / uncertainty[i])
        .collect();
    let mean = normalized.iter().sum::<f64>() / n as f64;
    let var = normalized.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64;
    Ok((mean, var.sqrt()))
}
