//! Prism forward modelling and sparse magnetic susceptibility inversion.
//!
//! Forward: prism tensor, sensitivity matrix
//! Inverse: misfit, IRLS regularization, projected Gauss-Newton, directives

pub mod directives;
pub mod forward;
pub mod inversion;
pub mod misfit;
pub mod objective;
pub mod optimizer;
pub mod prism;
pub mod regularization;
