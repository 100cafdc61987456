// ─────────────────────────────────────────────────────────────────────
// SCPN GeoMag — Projected Gauss-Newton
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Bound-constrained Gauss-Newton with a truncated PCG inner solve.
//!
//! One call to [`ProjectedGaussNewton::step`] performs one outer iteration:
//!
//! 1. split coordinates into free and bound-clamped (at `lower` with a
//!    positive gradient, or at `upper` with a negative one);
//! 2. solve `H Δ = −g` on the free set with Jacobi-preconditioned CG;
//! 3. backtrack `m ← P(m + t Δ)` with `t = 1, ½, ¼, …` until the Armijo
//!    condition holds on the projected step.
//!
//! CG breakdown and a non-descent CG direction fall back to the scaled
//! steepest-descent direction. A failed line search leaves `m` unchanged.

use geomag_math::cg::{pcg_solve, CgConfig};
use geomag_math::linalg::{dot, norm2};
use geomag_types::config::{BoundsConfig, OptimizerConfig};
use geomag_types::error::{GeoMagError, GeoMagResult};
use tracing::{debug, warn};

use crate::objective::{CombinedObjective, ObjectiveTerm, ObjectiveValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizerState {
    Init,
    Running,
    /// Tolerances met for the current objective; [`ProjectedGaussNewton::resume`]
    /// re-arms the optimizer after β or the weights change.
    Converged,
    BudgetExhausted,
}

/// Diagnostics of one outer iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// 1-based outer iteration number.
    pub iteration: usize,
    pub before: ObjectiveValue,
    pub after: ObjectiveValue,
    pub cg_iterations: usize,
    pub cg_relative_residual: f64,
    pub line_search_trials: usize,
    pub accepted: bool,
    pub step_length: f64,
    /// Norm of the gradient restricted to the free set, at the start of the step.
    pub projected_gradient: f64,
    pub used_fallback: bool,
    /// Number of coordinates clamped at a bound.
    pub n_clamped: usize,
    pub state: OptimizerState,
}

#[derive(Debug, Clone)]
pub struct ProjectedGaussNewton {
    cfg: OptimizerConfig,
    lower: f64,
    upper: f64,
    state: OptimizerState,
    iteration: usize,
    /// Projected-gradient norm at the first step since the last (re)start.
    pg0: Option<f64>,
    /// Cached 1 / diag(H); rebuilt on demand.
    inv_diag: Option<Vec<f64>>,
}

impl ProjectedGaussNewton {
    pub fn new(cfg: OptimizerConfig, bounds: &BoundsConfig) -> GeoMagResult<Self> {
        if !bounds.lower.is_finite() || !bounds.upper.is_finite() || bounds.lower >= bounds.upper {
            return Err(GeoMagError::ConfigError(format!(
                "bounds.lower must be < bounds.upper (got [{}, {}])",
                bounds.lower, bounds.upper
            )));
        }
        if cfg.max_iterations == 0 || cfg.cg_max_iterations == 0 || cfg.line_search_max_trials == 0
        {
            return Err(GeoMagError::ConfigError(
                "optimizer iteration budgets must be >= 1".to_string(),
            ));
        }
        Ok(ProjectedGaussNewton {
            cfg,
            lower: bounds.lower,
            upper: bounds.upper,
            state: OptimizerState::Init,
            iteration: 0,
            pg0: None,
            inv_diag: None,
        })
    }

    pub fn state(&self) -> OptimizerState {
        self.state
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn bounds(&self) -> (f64, f64) {
        (self.lower, self.upper)
    }

    pub fn is_terminated(&self) -> bool {
        matches!(
            self.state,
            OptimizerState::Converged | OptimizerState::BudgetExhausted
        )
    }

    /// Clip every coordinate into `[lower, upper]`.
    pub fn project(&self, model: &mut [f64]) {
        for m in model.iter_mut() {
            *m = m.clamp(self.lower, self.upper);
        }
    }

    /// Recompute the Jacobi preconditioner from the current objective.
    pub fn refresh_preconditioner<D: ObjectiveTerm, R: ObjectiveTerm>(
        &mut self,
        objective: &CombinedObjective<'_, D, R>,
    ) {
        self.inv_diag = Some(objective.jacobi_preconditioner());
    }

    pub fn has_preconditioner(&self) -> bool {
        self.inv_diag.is_some()
    }

    /// Leave the converged state after the objective was modified.
    pub fn resume(&mut self) {
        if self.state == OptimizerState::Converged {
            self.state = OptimizerState::Running;
            self.pg0 = None;
        }
    }

    fn free_mask(&self, model: &[f64], gradient: &[f64]) -> Vec<bool> {
        model
            .iter()
            .zip(gradient.iter())
            .map(|(&m, &g)| !((m <= self.lower && g > 0.0) || (m >= self.upper && g < 0.0)))
            .collect()
    }

    /// One outer iteration. `model` must lie inside the bounds and is
    /// updated in place when the line search succeeds.
    pub fn step<D: ObjectiveTerm, R: ObjectiveTerm>(
        &mut self,
        objective: &CombinedObjective<'_, D, R>,
        model: &mut [f64],
    ) -> GeoMagResult<StepReport> {
        if self.is_terminated() {
            return Err(GeoMagError::Numerical {
                iteration: self.iteration,
                message: format!("optimizer stepped in terminal state {:?}", self.state),
            });
        }
        let n = objective.n_params();
        if model.len() != n {
            return Err(GeoMagError::Data(format!(
                "Length mismatch: model has {}, objective expects {n}",
                model.len()
            )));
        }

        self.iteration += 1;
        self.state = OptimizerState::Running;
        let iteration = self.iteration;

        let before = objective.evaluate(model);
        let gradient = objective.gradient(model);
        let free = self.free_mask(model, &gradient);
        let n_clamped = free.iter().filter(|f| !**f).count();
        let masked_gradient: Vec<f64> = gradient
            .iter()
            .zip(free.iter())
            .map(|(&g, &f)| if f { g } else { 0.0 })
            .collect();
        let pg = norm2(&masked_gradient);
        let pg0 = *self.pg0.get_or_insert(pg);

        let mut report = StepReport {
            iteration,
            before,
            after: before,
            cg_iterations: 0,
            cg_relative_residual: 0.0,
            line_search_trials: 0,
            accepted: false,
            step_length: 0.0,
            projected_gradient: pg,
            used_fallback: false,
            n_clamped,
            state: OptimizerState::Running,
        };

        if pg == 0.0 {
            debug!(iteration, "projected gradient vanishes");
            self.state = OptimizerState::Converged;
            report.state = self.state;
            return Ok(report);
        }

        if self.inv_diag.as_ref().map_or(true, |d| d.len() != n) {
            self.refresh_preconditioner(objective);
        }
        let masked_inv: Vec<f64> = match &self.inv_diag {
            Some(inv) => inv
                .iter()
                .zip(free.iter())
                .map(|(&d, &f)| if f { d } else { 0.0 })
                .collect(),
            None => vec![1.0; n],
        };

        let rhs: Vec<f64> = masked_gradient.iter().map(|g| -g).collect();
        let cg_cfg = CgConfig {
            max_iter: self.cfg.cg_max_iterations,
            tol: self.cfg.cg_tolerance,
        };
        let restricted_hess = |v: &[f64]| -> Vec<f64> {
            let masked: Vec<f64> = v
                .iter()
                .zip(free.iter())
                .map(|(&x, &f)| if f { x } else { 0.0 })
                .collect();
            let mut hv = objective.hess_vec(&masked);
            for (h, &f) in hv.iter_mut().zip(free.iter()) {
                if !f {
                    *h = 0.0;
                }
            }
            hv
        };
        let cg = pcg_solve(restricted_hess, &rhs, &masked_inv, &cg_cfg);
        report.cg_iterations = cg.iterations;
        report.cg_relative_residual = cg.relative_residual;
        if let Some(err) = cg.breakdown_error() {
            debug!(iteration, %err, "CG breakdown, keeping partial iterate");
        }

        let mut direction = cg.x;
        let slope = dot(&gradient, &direction);
        // NaN slope lands here too.
        if !(slope < 0.0) {
            report.used_fallback = true;
            direction = masked_gradient
                .iter()
                .zip(masked_inv.iter())
                .map(|(g, d)| -g * d)
                .collect();
            debug!(iteration, slope, "CG direction not descent, using scaled gradient");
        }

        let mut t = 1.0;
        let mut trial = vec![0.0; n];
        for _ in 0..self.cfg.line_search_max_trials {
            report.line_search_trials += 1;
            for ((x, &m), &d) in trial.iter_mut().zip(model.iter()).zip(direction.iter()) {
                *x = (m + t * d).clamp(self.lower, self.upper);
            }
            let realized: f64 = gradient
                .iter()
                .zip(trial.iter().zip(model.iter()))
                .map(|(g, (x, m))| g * (x - m))
                .sum();
            let value = objective.evaluate(&trial);
            if value.total <= before.total + self.cfg.armijo * realized.min(0.0) {
                model.copy_from_slice(&trial);
                report.accepted = true;
                report.after = value;
                report.step_length = t;
                break;
            }
            t *= 0.5;
        }

        if !report.accepted {
            warn!(
                iteration,
                trials = report.line_search_trials,
                "line search failed, model unchanged"
            );
        } else {
            let decrease =
                (before.total - report.after.total) / before.total.abs().max(f64::MIN_POSITIVE);
            let gradient_ratio = if pg0 > 0.0 { pg / pg0 } else { 0.0 };
            if decrease < self.cfg.objective_tolerance
                && gradient_ratio < self.cfg.gradient_tolerance
            {
                self.state = OptimizerState::Converged;
            }
        }

        if self.state != OptimizerState::Converged && self.iteration >= self.cfg.max_iterations {
            self.state = OptimizerState::BudgetExhausted;
        }
        report.state = self.state;
        debug!(
            iteration,
            phi = report.after.total,
            cg_iterations = report.cg_iterations,
            step = report.step_length,
            clamped = n_clamped,
            "gauss-newton step"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::SensitivityMatrix;
    use crate::misfit::DataMisfit;
    use geomag_types::state::InducingField;
    use ndarray::arr2;

    /// ‖m‖², enough regularization to exercise the optimizer.
    struct Ridge(usize);

    impl ObjectiveTerm for Ridge {
        fn n_params(&self) -> usize {
            self.0
        }
        fn value(&self, model: &[f64]) -> f64 {
            model.iter().map(|m| m * m).sum()
        }
        fn gradient(&self, model: &[f64]) -> Vec<f64> {
            model.iter().map(|m| 2.0 * m).collect()
        }
        fn hess_vec(&self, v: &[f64]) -> Vec<f64> {
            v.iter().map(|x| 2.0 * x).collect()
        }
        fn hessian_diagonal(&self) -> Vec<f64> {
            vec![2.0; self.0]
        }
    }

    /// c · m: zero curvature, so CG cannot produce a descent direction.
    struct Linear(Vec<f64>);

    impl ObjectiveTerm for Linear {
        fn n_params(&self) -> usize {
            self.0.len()
        }
        fn value(&self, model: &[f64]) -> f64 {
            self.0.iter().zip(model.iter()).map(|(c, m)| c * m).sum()
        }
        fn gradient(&self, _model: &[f64]) -> Vec<f64> {
            self.0.clone()
        }
        fn hess_vec(&self, v: &[f64]) -> Vec<f64> {
            vec![0.0; v.len()]
        }
        fn hessian_diagonal(&self) -> Vec<f64> {
            vec![0.0; self.0.len()]
        }
    }

    fn misfit(observed: Vec<f64>) -> DataMisfit {
        let g = arr2(&[
            [1.0, 0.5, 0.0],
            [0.2, 1.0, 0.3],
            [0.0, 0.4, 1.0],
            [0.5, 0.5, 0.5],
        ]);
        let field = InducingField::new(50_000.0, 60.0, 0.0).unwrap();
        let sim = SensitivityMatrix::from_matrix(g, field).unwrap();
        DataMisfit::new(sim, observed, vec![1.0; 4]).unwrap()
    }

    fn optimizer(lower: f64, upper: f64, max_iterations: usize) -> ProjectedGaussNewton {
        let cfg = OptimizerConfig {
            max_iterations,
            ..OptimizerConfig::default()
        };
        ProjectedGaussNewton::new(cfg, &BoundsConfig { lower, upper }).unwrap()
    }

    #[test]
    fn test_unconstrained_quadratic_solves_in_few_steps() {
        // True model (1, 2, 3) well inside wide bounds, tiny β.
        let d = misfit(vec![2.0, 3.1, 3.8, 3.0]);
        let ridge = Ridge(3);
        let obj = CombinedObjective::new(&d, &ridge, 1e-8);
        let mut opt = optimizer(-10.0, 10.0, 20);
        let mut m = vec![0.0; 3];
        for _ in 0..20 {
            if opt.is_terminated() {
                break;
            }
            opt.step(&obj, &mut m).unwrap();
        }
        for (got, want) in m.iter().zip([1.0, 2.0, 3.0]) {
            assert!((got - want).abs() < 1e-3, "{got} vs {want}");
        }
    }

    #[test]
    fn test_objective_never_increases() {
        let d = misfit(vec![2.0, 3.1, 3.8, 3.0]);
        let ridge = Ridge(3);
        let obj = CombinedObjective::new(&d, &ridge, 0.3);
        let mut opt = optimizer(0.0, 1.5, 10);
        let mut m = vec![0.0; 3];
        while !opt.is_terminated() {
            let r = opt.step(&obj, &mut m).unwrap();
            assert!(r.after.total <= r.before.total + 1e-12);
        }
    }

    #[test]
    fn test_bounds_hold_and_saturate() {
        let d = misfit(vec![2.0, 3.1, 3.8, 3.0]);
        let ridge = Ridge(3);
        let obj = CombinedObjective::new(&d, &ridge, 1e-6);
        let mut opt = optimizer(0.0, 0.5, 15);
        let mut m = vec![0.0; 3];
        while !opt.is_terminated() {
            opt.step(&obj, &mut m).unwrap();
            assert!(m.iter().all(|&v| (0.0..=0.5).contains(&v)));
        }
        // Unconstrained optimum exceeds 0.5 in every coordinate.
        for v in &m {
            assert!((v - 0.5).abs() < 1e-12, "expected saturation, got {v}");
        }
    }

    #[test]
    fn test_stationary_start_converges_immediately() {
        let d = misfit(vec![0.0; 4]);
        let ridge = Ridge(3);
        let obj = CombinedObjective::new(&d, &ridge, 1.0);
        let mut opt = optimizer(0.0, 1.0, 5);
        let mut m = vec![0.0; 3];
        let r = opt.step(&obj, &mut m).unwrap();
        assert_eq!(r.state, OptimizerState::Converged);
        assert_eq!(m, vec![0.0; 3]);
        assert!(opt.step(&obj, &mut m).is_err());
    }

    #[test]
    fn test_budget_exhaustion_reported_not_fatal() {
        let d = misfit(vec![2.0, 3.1, 3.8, 3.0]);
        let ridge = Ridge(3);
        let obj = CombinedObjective::new(&d, &ridge, 1e-3);
        let cfg = OptimizerConfig {
            max_iterations: 1,
            cg_max_iterations: 1,
            ..OptimizerConfig::default()
        };
        let mut opt = ProjectedGaussNewton::new(cfg, &BoundsConfig::default()).unwrap();
        let mut m = vec![0.0; 3];
        let r = opt.step(&obj, &mut m).unwrap();
        assert_eq!(r.state, OptimizerState::BudgetExhausted);
        assert!(r.accepted);
    }

    #[test]
    fn test_resume_rearms_converged_optimizer() {
        let d = misfit(vec![0.0; 4]);
        let ridge = Ridge(3);
        let obj = CombinedObjective::new(&d, &ridge, 1.0);
        let mut opt = optimizer(0.0, 1.0, 5);
        let mut m = vec![0.0; 3];
        opt.step(&obj, &mut m).unwrap();
        opt.resume();
        assert_eq!(opt.state(), OptimizerState::Running);
    }

    #[test]
    fn test_rejects_bad_bounds_and_lengths() {
        let cfg = OptimizerConfig::default();
        assert!(ProjectedGaussNewton::new(cfg.clone(), &BoundsConfig { lower: 1.0, upper: 0.0 }).is_err());
        let d = misfit(vec![0.0; 4]);
        let ridge = Ridge(3);
        let obj = CombinedObjective::new(&d, &ridge, 1.0);
        let mut opt = ProjectedGaussNewton::new(cfg, &BoundsConfig::default()).unwrap();
        let mut m = vec![0.0; 2];
        assert!(matches!(opt.step(&obj, &mut m), Err(GeoMagError::Data(_))));
    }

    #[test]
    fn test_flat_curvature_falls_back_to_scaled_gradient() {
        let linear = Linear(vec![1.0, -2.0, 0.5]);
        let obj = CombinedObjective::new(&linear, &linear, 0.0);
        let mut opt = optimizer(-1.0, 1.0, 5);
        let mut m = vec![0.0; 3];
        let r = opt.step(&obj, &mut m).unwrap();
        assert!(r.used_fallback);
        assert!(r.accepted);
        assert!(r.after.total < r.before.total);
        // Unit preconditioner: the full step −g lands on the bounds.
        assert_eq!(m, vec![-1.0, 1.0, -0.5]);
    }

    #[test]
    fn test_failed_line_search_keeps_model() {
        let d = misfit(vec![2.0, 3.1, 3.8, 3.0]);
        let ridge = Ridge(3);
        let obj = CombinedObjective::new(&d, &ridge, 1e-8);
        // A full Newton step on a quadratic only achieves half the predicted
        // decrease, so a near-unit Armijo constant with one trial rejects it.
        let cfg = OptimizerConfig {
            line_search_max_trials: 1,
            armijo: 0.999,
            ..OptimizerConfig::default()
        };
        let mut opt =
            ProjectedGaussNewton::new(cfg, &BoundsConfig { lower: -10.0, upper: 10.0 }).unwrap();
        let mut m = vec![0.0; 3];
        let r = opt.step(&obj, &mut m).unwrap();
        assert!(!r.accepted);
        assert_eq!(r.line_search_trials, 1);
        assert_eq!(r.step_length, 0.0);
        assert_eq!(r.after, r.before);
        assert_eq!(m, vec![0.0; 3]);
        assert_eq!(r.state, OptimizerState::Running);
        assert!(!opt.is_terminated());
    }
}
