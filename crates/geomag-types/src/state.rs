// ─────────────────────────────────────────────────────────────────────
// SCPN GeoMag — State
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Survey geometry: prisms, receivers, inducing field and the active-cell map.
//!
//! Coordinates are right-handed (x = easting, y = northing, z = up) in metres.

use crate::error::{GeoMagError, GeoMagResult};
use serde::{Deserialize, Serialize};

/// Axis-aligned rectangular prism.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prism {
    pub lower: [f64; 3],
    pub upper: [f64; 3],
}

impl Prism {
    pub fn new(lower: [f64; 3], upper: [f64; 3]) -> Self {
        Prism { lower, upper }
    }

    /// Reject non-finite corners and zero or negative volume.
    pub fn validate(&self) -> GeoMagResult<()> {
        for axis in 0..3 {
            let (lo, hi) = (self.lower[axis], self.upper[axis]);
            if !lo.is_finite() || !hi.is_finite() {
                return Err(GeoMagError::Geometry(format!(
                    "prism corner on axis {axis} is not finite: [{lo}, {hi}]"
                )));
            }
            if hi <= lo {
                return Err(GeoMagError::Geometry(format!(
                    "degenerate prism on axis {axis}: lower={lo}, upper={hi}"
                )));
            }
        }
        Ok(())
    }

    pub fn center(&self) -> [f64; 3] {
        [
            0.5 * (self.lower[0] + self.upper[0]),
            0.5 * (self.lower[1] + self.upper[1]),
            0.5 * (self.lower[2] + self.upper[2]),
        ]
    }

    pub fn extent(&self) -> [f64; 3] {
        [
            self.upper[0] - self.lower[0],
            self.upper[1] - self.lower[1],
            self.upper[2] - self.lower[2],
        ]
    }

    pub fn min_extent(&self) -> f64 {
        let e = self.extent();
        e[0].min(e[1]).min(e[2])
    }

    /// True when `point` lies inside the prism by more than `tol` on every axis.
    pub fn contains_strictly(&self, point: [f64; 3], tol: f64) -> bool {
        (0..3).all(|a| point[a] > self.lower[a] + tol && point[a] < self.upper[a] - tol)
    }
}

/// Location at which one TMI datum is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Receiver {
    pub location: [f64; 3],
}

impl Receiver {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Receiver {
            location: [x, y, z],
        }
    }
}

/// Ambient inducing field, constant across the survey.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InducingField {
    /// Field strength (nT).
    pub intensity: f64,
    /// Inclination below horizontal (degrees).
    pub inclination: f64,
    /// Declination east of north (degrees).
    pub declination: f64,
}

impl InducingField {
    pub fn new(intensity: f64, inclination: f64, declination: f64) -> GeoMagResult<Self> {
        let field = InducingField {
            intensity,
            inclination,
            declination,
        };
        field.validate()?;
        Ok(field)
    }

    pub fn validate(&self) -> GeoMagResult<()> {
        if !self.intensity.is_finite() || self.intensity <= 0.0 {
            return Err(GeoMagError::Geometry(format!(
                "inducing field intensity must be finite and > 0, got {}",
                self.intensity
            )));
        }
        if !self.inclination.is_finite() || !(-90.0..=90.0).contains(&self.inclination) {
            return Err(GeoMagError::Geometry(format!(
                "inclination must lie in [-90, 90] degrees, got {}",
                self.inclination
            )));
        }
        if !self.declination.is_finite() {
            return Err(GeoMagError::Geometry(
                "declination must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Unit direction of the field in (east, north, up).
    pub fn unit_vector(&self) -> [f64; 3] {
        let inc = self.inclination.to_radians();
        let dec = self.declination.to_radians();
        [inc.cos() * dec.sin(), inc.cos() * dec.cos(), -inc.sin()]
    }
}

/// Regular tensor grid of prisms, x index fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid3D {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    /// South-west bottom corner.
    pub origin: [f64; 3],
    pub spacing: [f64; 3],
}

impl Grid3D {
    pub fn new(
        nx: usize,
        ny: usize,
        nz: usize,
        origin: [f64; 3],
        spacing: [f64; 3],
    ) -> GeoMagResult<Self> {
        if nx == 0 || ny == 0 || nz == 0 {
            return Err(GeoMagError::Geometry(format!(
                "grid needs at least one cell per axis, got {nx}x{ny}x{nz}"
            )));
        }
        if spacing.iter().any(|h| !h.is_finite() || *h <= 0.0) {
            return Err(GeoMagError::Geometry(format!(
                "grid spacing must be finite and > 0, got {spacing:?}"
            )));
        }
        Ok(Grid3D {
            nx,
            ny,
            nz,
            origin,
            spacing,
        })
    }

    pub fn n_cells(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    #[inline]
    pub fn cell_index(&self, ix: usize, iy: usize, iz: usize) -> usize {
        (iz * self.ny + iy) * self.nx + ix
    }

    pub fn cell(&self, ix: usize, iy: usize, iz: usize) -> Prism {
        let lower = [
            self.origin[0] + ix as f64 * self.spacing[0],
            self.origin[1] + iy as f64 * self.spacing[1],
            self.origin[2] + iz as f64 * self.spacing[2],
        ];
        let upper = [
            lower[0] + self.spacing[0],
            lower[1] + self.spacing[1],
            lower[2] + self.spacing[2],
        ];
        Prism { lower, upper }
    }

    pub fn cells(&self) -> Vec<Prism> {
        let mut out = Vec::with_capacity(self.n_cells());
        for iz in 0..self.nz {
            for iy in 0..self.ny {
                for ix in 0..self.nx {
                    out.push(self.cell(ix, iy, iz));
                }
            }
        }
        out
    }

    /// Top of the grid.
    pub fn top(&self) -> f64 {
        self.origin[2] + self.nz as f64 * self.spacing[2]
    }
}

/// Fixed bijection between reduced (active) and full mesh indexing.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveCells {
    n_full: usize,
    indices: Vec<usize>,
}

impl ActiveCells {
    /// `indices` are full-mesh indices of the active cells, strictly increasing.
    pub fn new(n_full: usize, indices: Vec<usize>) -> GeoMagResult<Self> {
        if indices.is_empty() {
            return Err(GeoMagError::Geometry(
                "active cell set must be non-empty".to_string(),
            ));
        }
        for w in indices.windows(2) {
            if w[1] <= w[0] {
                return Err(GeoMagError::Geometry(format!(
                    "active indices must be strictly increasing: {} then {}",
                    w[0], w[1]
                )));
            }
        }
        if let Some(&last) = indices.last() {
            if last >= n_full {
                return Err(GeoMagError::Geometry(format!(
                    "active index {last} out of range for mesh of {n_full} cells"
                )));
            }
        }
        Ok(ActiveCells { n_full, indices })
    }

    pub fn from_mask(mask: &[bool]) -> GeoMagResult<Self> {
        let indices = mask
            .iter()
            .enumerate()
            .filter_map(|(i, &a)| a.then_some(i))
            .collect();
        Self::new(mask.len(), indices)
    }

    pub fn all(n_full: usize) -> GeoMagResult<Self> {
        Self::new(n_full, (0..n_full).collect())
    }

    pub fn n_active(&self) -> usize {
        self.indices.len()
    }

    pub fn n_full(&self) -> usize {
        self.n_full
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Pick the active entries out of a full-mesh slice (e.g. prisms).
    pub fn select<T: Clone>(&self, full: &[T]) -> GeoMagResult<Vec<T>> {
        if full.len() != self.n_full {
            return Err(GeoMagError::Data(format!(
                "Length mismatch: full-mesh vector has {}, expected {}",
                full.len(),
                self.n_full
            )));
        }
        Ok(self.indices.iter().map(|&i| full[i].clone()).collect())
    }

    /// Inject a reduced-space vector into full-mesh space, filling inactive
    /// cells with `sentinel`.
    pub fn to_full(&self, reduced: &[f64], sentinel: f64) -> GeoMagResult<Vec<f64>> {
        if reduced.len() != self.indices.len() {
            return Err(GeoMagError::Data(format!(
                "Length mismatch: reduced vector has {}, expected {}",
                reduced.len(),
                self.indices.len()
            )));
        }
        let mut full = vec![sentinel; self.n_full];
        for (&idx, &v) in self.indices.iter().zip(reduced.iter()) {
            full[idx] = v;
        }
        Ok(full)
    }

    pub fn to_reduced(&self, full: &[f64]) -> GeoMagResult<Vec<f64>> {
        self.select(full)
    }
}
