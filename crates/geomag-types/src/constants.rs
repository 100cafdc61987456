// ─────────────────────────────────────────────────────────────────────
// SCPN GeoMag — Constants
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
/// 1/(4π): prefactor of the prism tensor so that B_anomaly = χ · T · B0.
pub const INV_FOUR_PI: f64 = 0.25 / std::f64::consts::PI;

/// Relative offset used to move a receiver off a prism face, edge or corner.
/// Scaled by the smallest extent of the prism being evaluated.
pub const SINGULARITY_EPS: f64 = 1e-10;

/// Relative tolerance for matching coincident faces between cells.
pub const FACE_MATCH_TOL: f64 = 1e-6;

/// Floor for normalised sensitivity weights (keeps them strictly positive).
pub const MIN_CELL_WEIGHT: f64 = 1e-12;

/// Floor for IRLS reweighting factors.
pub const MIN_IRLS_WEIGHT: f64 = 1e-12;

/// Value written into inactive cells when mapping back to full-mesh space.
/// NaN keeps air cells out of any downstream statistics.
pub const INACTIVE_SENTINEL: f64 = f64::NAN;
