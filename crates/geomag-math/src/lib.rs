//! Mathematical primitives for SCPN GeoMag.

pub mod cg;
pub mod linalg;
