//! Common interface of the misfit and regularization terms, and the
//! combined objective φ(m) = φ_d(m) + β · φ_m(m) seen by the optimizer.

use geomag_math::linalg::axpy;

/// A twice-differentiable quadratic (or quadratic-surrogate) term.
pub trait ObjectiveTerm {
    fn n_params(&self) -> usize;
    fn value(&self, model: &[f64]) -> f64;
    fn gradient(&self, model: &[f64]) -> Vec<f64>;
    /// Hessian-vector product; the Hessian is never formed.
    fn hess_vec(&self, v: &[f64]) -> Vec<f64>;
    fn hessian_diagonal(&self) -> Vec<f64>;
}

/// Values of the two terms at one model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObjectiveValue {
    pub phi_d: f64,
    pub phi_m: f64,
    pub total: f64,
}

/// φ_d + β φ_m for fixed β and fixed regularization weights.
pub struct CombinedObjective<'a, D: ObjectiveTerm, R: ObjectiveTerm> {
    pub misfit: &'a D,
    pub regularization: &'a R,
    pub beta: f64,
}

impl<'a, D: ObjectiveTerm, R: ObjectiveTerm> CombinedObjective<'a, D, R> {
    pub fn new(misfit: &'a D, regularization: &'a R, beta: f64) -> Self {
        CombinedObjective {
            misfit,
            regularization,
            beta,
        }
    }

    pub fn n_params(&self) -> usize {
        self.misfit.n_params()
    }

    pub fn evaluate(&self, model: &[f64]) -> ObjectiveValue {
        let phi_d = self.misfit.value(model);
        let phi_m = self.regularization.value(model);
        ObjectiveValue {
            phi_d,
            phi_m,
            total: phi_d + self.beta * phi_m,
        }
    }

    pub fn gradient(&self, model: &[f64]) -> Vec<f64> {
        let mut g = self.misfit.gradient(model);
        axpy(self.beta, &self.regularization.gradient(model), &mut g);
        g
    }

    pub fn hess_vec(&self, v: &[f64]) -> Vec<f64> {
        let mut hv = self.misfit.hess_vec(v);
        axpy(self.beta, &self.regularization.hess_vec(v), &mut hv);
        hv
    }

    /// Inverse of diag(H_d + β H_m): the Jacobi preconditioner.
    pub fn jacobi_preconditioner(&self) -> Vec<f64> {
        let mut d = self.misfit.hessian_diagonal();
        axpy(self.beta, &self.regularization.hessian_diagonal(), &mut d);
        d.into_iter()
            .map(|v| if v > f64::MIN_POSITIVE { 1.0 / v } else { 1.0 })
            .collect()
    }
}
