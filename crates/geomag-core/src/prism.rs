// ─────────────────────────────────────────────────────────────────────
// SCPN GeoMag — Prism Magnetic Tensor
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Closed-form magnetic tensor of a uniformly magnetised rectangular prism.
//!
//! With U(r) = ∫∫∫ dV' / |r − r'| over the prism, the tensor is
//!   T_ab = (1/4π) ∂²U / ∂a ∂b
//! so that the anomalous field of a cell with susceptibility χ under an
//! inducing field B0 is b = χ · T · B0. Relative to the observation point,
//! with corner coordinates (ξ, η, ζ) and r = √(ξ² + η² + ζ²):
//!   T_xx = −Σ μ atan(ηζ / (ξ r))     T_xy = Σ μ ln(ζ + r)
//!   T_yy = −Σ μ atan(ξζ / (η r))     T_xz = Σ μ ln(η + r)
//!   T_zz = −Σ μ atan(ξη / (ζ r))     T_yz = Σ μ ln(ξ + r)
//! where μ = +1 on the all-upper corner and alternates across the 8 vertices.
//!
//! A relative coordinate closer to zero than `SINGULARITY_EPS · min_extent`
//! is pushed to that distance on the exterior side of its face: lower-face
//! coordinates become `+eps`, upper-face coordinates `−eps`. A receiver on a
//! face, edge or corner therefore sees the limit taken from outside the cell.

use geomag_types::constants::{INV_FOUR_PI, SINGULARITY_EPS};
use geomag_types::state::{InducingField, Prism};

/// Symmetric 3×3 tensor, upper triangle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MagneticTensor {
    pub xx: f64,
    pub xy: f64,
    pub xz: f64,
    pub yy: f64,
    pub yz: f64,
    pub zz: f64,
}

impl MagneticTensor {
    pub fn trace(&self) -> f64 {
        self.xx + self.yy + self.zz
    }

    /// T · v
    pub fn apply(&self, v: [f64; 3]) -> [f64; 3] {
        [
            self.xx * v[0] + self.xy * v[1] + self.xz * v[2],
            self.xy * v[0] + self.yy * v[1] + self.yz * v[2],
            self.xz * v[0] + self.yz * v[1] + self.zz * v[2],
        ]
    }

    /// uᵀ · T · u
    pub fn quadratic_form(&self, u: [f64; 3]) -> f64 {
        let tu = self.apply(u);
        u[0] * tu[0] + u[1] * tu[1] + u[2] * tu[2]
    }
}

/// `outward` is `+eps` for lower-face coordinates and `−eps` for upper ones.
#[inline]
fn nudge(v: f64, outward: f64) -> f64 {
    if v.abs() < outward.abs() {
        outward
    } else {
        v
    }
}

/// ln(a + r) with r = √(a² + others_sq), cancellation-free for a < 0.
#[inline]
fn ln_a_plus_r(a: f64, r: f64, others_sq: f64) -> f64 {
    if a >= 0.0 {
        (a + r).ln()
    } else {
        (others_sq / (r - a)).ln()
    }
}

/// Tensor of `prism` seen from `point`, per unit magnetisation.
pub fn prism_tensor(prism: &Prism, point: [f64; 3]) -> MagneticTensor {
    let eps = SINGULARITY_EPS * prism.min_extent();
    let xs = [
        nudge(prism.lower[0] - point[0], eps),
        nudge(prism.upper[0] - point[0], -eps),
    ];
    let ys = [
        nudge(prism.lower[1] - point[1], eps),
        nudge(prism.upper[1] - point[1], -eps),
    ];
    let zs = [
        nudge(prism.lower[2] - point[2], eps),
        nudge(prism.upper[2] - point[2], -eps),
    ];

    let mut t = MagneticTensor::default();
    for (i, &x) in xs.iter().enumerate() {
        for (j, &y) in ys.iter().enumerate() {
            for (k, &z) in zs.iter().enumerate() {
                let sign = if (i + j + k) % 2 == 1 { 1.0 } else { -1.0 };
                let (x2, y2, z2) = (x * x, y * y, z * z);
                let r = (x2 + y2 + z2).sqrt();

                t.xx -= sign * (y * z / (x * r)).atan();
                t.yy -= sign * (x * z / (y * r)).atan();
                t.zz -= sign * (x * y / (z * r)).atan();
                t.xy += sign * ln_a_plus_r(z, r, x2 + y2);
                t.xz += sign * ln_a_plus_r(y, r, x2 + z2);
                t.yz += sign * ln_a_plus_r(x, r, y2 + z2);
            }
        }
    }

    MagneticTensor {
        xx: t.xx * INV_FOUR_PI,
        xy: t.xy * INV_FOUR_PI,
        xz: t.xz * INV_FOUR_PI,
        yy: t.yy * INV_FOUR_PI,
        yz: t.yz * INV_FOUR_PI,
        zz: t.zz * INV_FOUR_PI,
    }
}

/// Anomalous field (nT) at `point` for unit susceptibility: T · B0.
pub fn anomalous_field(prism: &Prism, point: [f64; 3], field: &InducingField) -> [f64; 3] {
    let u = field.unit_vector();
    let b = prism_tensor(prism, point).apply(u);
    [
        field.intensity * b[0],
        field.intensity * b[1],
        field.intensity * b[2],
    ]
}

/// TMI sensitivity (nT per unit susceptibility): anomalous field projected
/// onto the inducing direction, B0 · uᵀ T u.
pub fn tmi_kernel(prism: &Prism, point: [f64; 3], field: &InducingField) -> f64 {
    field.intensity * prism_tensor(prism, point).quadratic_form(field.unit_vector())
}
