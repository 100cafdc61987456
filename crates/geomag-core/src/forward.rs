// ─────────────────────────────────────────────────────────────────────
// SCPN GeoMag — Forward Operator
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Dense TMI sensitivity matrix built from active-cell prisms.
//!
//! G[i, j] is the TMI response (nT) at receiver i per unit susceptibility
//! of active cell j. Rows are computed in parallel, one rayon task per
//! receiver; G is immutable once built.

use std::time::Instant;

use geomag_math::linalg::{column_sq_norms, matvec, matvec_transpose};
use geomag_types::constants::{MIN_CELL_WEIGHT, SINGULARITY_EPS};
use geomag_types::error::{GeoMagError, GeoMagResult};
use geomag_types::state::{InducingField, Prism, Receiver};
use ndarray::Array2;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::prism::tmi_kernel;

/// Linear forward operator for one survey.
#[derive(Debug, Clone)]
pub struct SensitivityMatrix {
    g: Array2<f64>,
    field: InducingField,
}

impl SensitivityMatrix {
    /// Evaluate every (receiver, cell) pair.
    ///
    /// Fails on degenerate prisms, invalid field parameters, empty inputs,
    /// or a receiver lying strictly inside a cell.
    pub fn build(
        cells: &[Prism],
        receivers: &[Receiver],
        field: &InducingField,
    ) -> GeoMagResult<Self> {
        if cells.is_empty() || receivers.is_empty() {
            return Err(GeoMagError::Geometry(format!(
                "need at least one cell and one receiver, got {} cells and {} receivers",
                cells.len(),
                receivers.len()
            )));
        }
        field.validate()?;
        for (j, cell) in cells.iter().enumerate() {
            cell.validate()
                .map_err(|e| GeoMagError::Geometry(format!("active cell {j}: {e}")))?;
        }
        for (i, rx) in receivers.iter().enumerate() {
            if rx.location.iter().any(|c| !c.is_finite()) {
                return Err(GeoMagError::Geometry(format!(
                    "receiver {i} has non-finite coordinates"
                )));
            }
        }

        let n_data = receivers.len();
        let n_cells = cells.len();
        info!(n_data, n_cells, "building TMI sensitivity matrix");
        let started = Instant::now();

        let rows: Vec<Vec<f64>> = receivers
            .par_iter()
            .enumerate()
            .map(|(i, rx)| {
                cells
                    .iter()
                    .enumerate()
                    .map(|(j, cell)| {
                        let tol = SINGULARITY_EPS * cell.min_extent();
                        if cell.contains_strictly(rx.location, tol) {
                            return Err(GeoMagError::Geometry(format!(
                                "receiver {i} at {:?} lies inside active cell {j}",
                                rx.location
                            )));
                        }
                        Ok(tmi_kernel(cell, rx.location, field))
                    })
                    .collect::<GeoMagResult<Vec<f64>>>()
            })
            .collect::<GeoMagResult<Vec<_>>>()?;

        let flat: Vec<f64> = rows.into_iter().flatten().collect();
        let g = Array2::from_shape_vec((n_data, n_cells), flat)
            .map_err(|e| GeoMagError::Numerical {
                iteration: 0,
                message: format!("sensitivity reshape failed: {e}"),
            })?;

        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "sensitivity matrix ready");
        Ok(SensitivityMatrix { g, field: *field })
    }

    /// Wrap an existing matrix (rows = receivers, columns = active cells).
    pub fn from_matrix(g: Array2<f64>, field: InducingField) -> GeoMagResult<Self> {
        if g.nrows() == 0 || g.ncols() == 0 {
            return Err(GeoMagError::Geometry(
                "sensitivity matrix must be non-empty".to_string(),
            ));
        }
        if g.iter().any(|v| !v.is_finite()) {
            return Err(GeoMagError::Numerical {
                iteration: 0,
                message: "sensitivity matrix contains non-finite entries".to_string(),
            });
        }
        field.validate()?;
        let g = if g.is_standard_layout() {
            g
        } else {
            g.as_standard_layout().into_owned()
        };
        Ok(SensitivityMatrix { g, field })
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.g
    }

    pub fn field(&self) -> &InducingField {
        &self.field
    }

    pub fn n_data(&self) -> usize {
        self.g.nrows()
    }

    pub fn n_cells(&self) -> usize {
        self.g.ncols()
    }

    /// Predicted data G · m.
    pub fn predict(&self, model: &[f64]) -> GeoMagResult<Vec<f64>> {
        if model.len() != self.n_cells() {
            return Err(GeoMagError::Data(format!(
                "Length mismatch: model has {}, expected {} active cells",
                model.len(),
                self.n_cells()
            )));
        }
        Ok(self.apply(model))
    }

    /// Gᵀ · r.
    pub fn adjoint(&self, data: &[f64]) -> GeoMagResult<Vec<f64>> {
        if data.len() != self.n_data() {
            return Err(GeoMagError::Data(format!(
                "Length mismatch: data vector has {}, expected {}",
                data.len(),
                self.n_data()
            )));
        }
        Ok(self.apply_adjoint(data))
    }

    pub(crate) fn apply(&self, model: &[f64]) -> Vec<f64> {
        matvec(&self.g, model)
    }

    pub(crate) fn apply_adjoint(&self, data: &[f64]) -> Vec<f64> {
        matvec_transpose(&self.g, data)
    }

    /// Sensitivity-based cell weights: column L2 norms of G divided by
    /// their maximum, floored at `MIN_CELL_WEIGHT`.
    pub fn cell_weights(&self) -> Vec<f64> {
        let norms: Vec<f64> = column_sq_norms(&self.g).into_iter().map(f64::sqrt).collect();
        let max = norms.iter().cloned().fold(0.0, f64::max);
        if max <= 0.0 {
            return vec![1.0; norms.len()];
        }
        norms
            .into_iter()
            .map(|w| (w / max).max(MIN_CELL_WEIGHT))
            .collect()
    }
}
