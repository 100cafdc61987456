// ─────────────────────────────────────────────────────────────────────
// SCPN GeoMag — Schedule Directives
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Policies run by the driver around each outer iteration.
//!
//! Directives never touch the inversion state directly. Each hook reads a
//! [`DirectiveContext`] and returns [`DirectiveAction`]s which the driver
//! applies in order before building the context for the next directive.

use geomag_math::linalg::{norm2, power_iteration};
use geomag_types::config::{BetaConfig, InversionConfig, IrlsConfig, N_REG_TERMS};
use tracing::{info, warn};

use crate::misfit::DataMisfit;
use crate::objective::ObjectiveTerm;
use crate::optimizer::OptimizerState;
use crate::regularization::SparseRegularization;

/// Relative |φ_d − target| inside which IRLS leaves β alone.
const BETA_ADJUST_BAND: f64 = 0.1;
const BETA_ADJUST_MIN: f64 = 0.5;
const BETA_ADJUST_MAX: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrlsPhase {
    /// Smooth (p = 2) iterations.
    PreIrls,
    Active,
    Converged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Optimizer met its tolerances and no directive changed the objective.
    OptimizerConverged,
    /// Outer iteration budget exhausted.
    IterationBudget,
    /// Relative model change between IRLS iterations fell below tolerance.
    IrlsConverged,
    /// IRLS iteration cap reached before the model settled.
    IrlsBudget,
}

impl StopReason {
    pub fn is_converged(self) -> bool {
        matches!(self, StopReason::OptimizerConverged | StopReason::IrlsConverged)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectiveAction {
    SetBeta(f64),
    SnapshotSmoothModel,
    ActivateSparse { epsilons: [f64; N_REG_TERMS] },
    UpdateIrlsWeights { epsilons: [f64; N_REG_TERMS] },
    RefreshPreconditioner,
    Stop(StopReason),
}

/// What changed since the start of the current hook phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Changes {
    pub beta: bool,
    pub weights: bool,
}

impl Changes {
    pub fn any(&self) -> bool {
        self.beta || self.weights
    }
}

/// Read-only view handed to every hook.
pub struct DirectiveContext<'a> {
    /// Zero-based outer iteration the hook belongs to.
    pub iteration: usize,
    pub model: &'a [f64],
    pub beta: f64,
    pub phi_d: f64,
    pub target_misfit: f64,
    pub misfit: &'a DataMisfit,
    pub regularization: &'a SparseRegularization,
    pub irls_phase: IrlsPhase,
    pub optimizer_state: OptimizerState,
    pub has_preconditioner: bool,
    pub changes: Changes,
}

/// β0 = ratio · λmax(H_d) / λmax(H_m), once, before the first step.
#[derive(Debug, Clone)]
pub struct BetaEstimate {
    cfg: BetaConfig,
    done: bool,
}

impl BetaEstimate {
    pub fn new(cfg: BetaConfig) -> Self {
        BetaEstimate { cfg, done: false }
    }

    fn estimate(&self, ctx: &DirectiveContext<'_>) -> f64 {
        if let Some(beta) = self.cfg.initial {
            return beta;
        }
        let n = ctx.model.len();
        let iters = self.cfg.power_iterations;
        let lambda_d = power_iteration(|v| ctx.misfit.hess_vec(v), n, iters, self.cfg.seed);
        let lambda_m = power_iteration(
            |v| ctx.regularization.hess_vec(v),
            n,
            iters,
            self.cfg.seed.wrapping_add(1),
        );
        if lambda_d <= 0.0 || lambda_m <= 0.0 {
            warn!(
                lambda_d,
                lambda_m, "degenerate eigenvalue estimate, falling back to β = eigen_ratio"
            );
            return self.cfg.eigen_ratio;
        }
        self.cfg.eigen_ratio * lambda_d / lambda_m
    }

    pub fn pre_iteration(&mut self, ctx: &DirectiveContext<'_>) -> Vec<DirectiveAction> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        let beta = self.estimate(ctx);
        info!(beta, "initial trade-off parameter");
        vec![DirectiveAction::SetBeta(beta)]
    }
}

/// β ← β / factor every `rate` smooth iterations while φ_d is above target.
#[derive(Debug, Clone)]
pub struct BetaCooling {
    factor: f64,
    rate: usize,
}

impl BetaCooling {
    pub fn new(cfg: &BetaConfig) -> Self {
        BetaCooling {
            factor: cfg.cooling_factor,
            rate: cfg.cooling_rate.max(1),
        }
    }

    pub fn post_iteration(&mut self, ctx: &DirectiveContext<'_>) -> Vec<DirectiveAction> {
        if ctx.irls_phase != IrlsPhase::PreIrls
            || (ctx.iteration + 1) % self.rate != 0
            || ctx.phi_d <= ctx.target_misfit
            || self.factor == 1.0
        {
            return Vec::new();
        }
        vec![DirectiveAction::SetBeta(ctx.beta / self.factor)]
    }
}

/// PRE_IRLS → ACTIVE → CONVERGED.
#[derive(Debug, Clone)]
pub struct IrlsSchedule {
    cfg: IrlsConfig,
    phase: IrlsPhase,
    /// Lower limits of ε, and the values used when cooling is off.
    floors: [f64; N_REG_TERMS],
    epsilons: [f64; N_REG_TERMS],
    smooth_iterations: usize,
    irls_iterations: usize,
    prev_phi_d: Option<f64>,
    prev_model: Option<Vec<f64>>,
}

impl IrlsSchedule {
    pub fn new(cfg: IrlsConfig, epsilons: [f64; N_REG_TERMS]) -> Self {
        IrlsSchedule {
            cfg,
            phase: IrlsPhase::PreIrls,
            floors: epsilons,
            epsilons,
            smooth_iterations: 0,
            irls_iterations: 0,
            prev_phi_d: None,
            prev_model: None,
        }
    }

    pub fn phase(&self) -> IrlsPhase {
        self.phase
    }

    pub fn irls_iterations(&self) -> usize {
        self.irls_iterations
    }

    pub fn epsilons(&self) -> [f64; N_REG_TERMS] {
        self.epsilons
    }

    fn initial_epsilons(&self, ctx: &DirectiveContext<'_>) -> [f64; N_REG_TERMS] {
        if self.cfg.epsilon_cooling.is_none() {
            return self.floors;
        }
        let max_abs = ctx.regularization.max_abs_residuals(ctx.model);
        let mut eps = self.floors;
        for (e, m) in eps.iter_mut().zip(max_abs.iter()) {
            *e = e.max(*m);
        }
        eps
    }

    fn cool_epsilons(&mut self) {
        if let Some(factor) = self.cfg.epsilon_cooling {
            for (e, floor) in self.epsilons.iter_mut().zip(self.floors.iter()) {
                *e = (*e / factor).max(*floor);
            }
        }
    }

    /// Multiplicative β correction toward the target misfit.
    pub fn beta_adjustment(phi_d: f64, target: f64) -> f64 {
        if phi_d <= f64::MIN_POSITIVE {
            return BETA_ADJUST_MAX;
        }
        let ratio = target / phi_d;
        let factor = if ratio > 1.0 {
            0.5 * (2.0 + ratio)
        } else {
            0.5 * (0.75 + ratio)
        };
        factor.clamp(BETA_ADJUST_MIN, BETA_ADJUST_MAX)
    }

    fn smooth_post(&mut self, ctx: &DirectiveContext<'_>) -> Vec<DirectiveAction> {
        self.smooth_iterations += 1;
        let plateau = self.prev_phi_d.map_or(false, |prev| {
            (prev - ctx.phi_d).abs() / prev.abs().max(f64::MIN_POSITIVE)
                < self.cfg.misfit_plateau_tolerance
        });
        self.prev_phi_d = Some(ctx.phi_d);
        let stabilized = self.smooth_iterations >= self.cfg.min_smooth_iterations
            && (ctx.phi_d <= ctx.target_misfit || plateau);
        let optimizer_done = ctx.optimizer_state == OptimizerState::Converged;
        if !stabilized && !optimizer_done {
            return Vec::new();
        }

        if !ctx.regularization.has_sparse_terms() {
            info!(
                iteration = ctx.iteration,
                "smooth solve stabilized and every norm is 2, nothing to reweight"
            );
            self.phase = IrlsPhase::Converged;
            return vec![
                DirectiveAction::SnapshotSmoothModel,
                DirectiveAction::Stop(StopReason::IrlsConverged),
            ];
        }

        self.epsilons = self.initial_epsilons(ctx);
        self.phase = IrlsPhase::Active;
        self.prev_model = Some(ctx.model.to_vec());
        info!(
            iteration = ctx.iteration,
            phi_d = ctx.phi_d,
            plateau,
            epsilons = ?self.epsilons,
            "switching to sparse norms"
        );
        vec![
            DirectiveAction::SnapshotSmoothModel,
            DirectiveAction::ActivateSparse {
                epsilons: self.epsilons,
            },
        ]
    }

    fn active_post(&mut self, ctx: &DirectiveContext<'_>) -> Vec<DirectiveAction> {
        self.irls_iterations += 1;
        let change = match self.prev_model.as_deref() {
            Some(prev) => {
                let diff: Vec<f64> = ctx.model.iter().zip(prev.iter()).map(|(a, b)| a - b).collect();
                norm2(&diff) / norm2(prev).max(f64::MIN_POSITIVE)
            }
            None => f64::INFINITY,
        };
        self.prev_model = Some(ctx.model.to_vec());

        if change < self.cfg.model_change_tolerance {
            info!(
                iteration = ctx.iteration,
                irls_iterations = self.irls_iterations,
                change,
                "IRLS converged"
            );
            self.phase = IrlsPhase::Converged;
            return vec![DirectiveAction::Stop(StopReason::IrlsConverged)];
        }
        if self.irls_iterations >= self.cfg.max_irls_iterations {
            warn!(
                irls_iterations = self.irls_iterations,
                change, "IRLS iteration cap reached"
            );
            self.phase = IrlsPhase::Converged;
            return vec![DirectiveAction::Stop(StopReason::IrlsBudget)];
        }

        self.cool_epsilons();
        let mut actions = vec![DirectiveAction::UpdateIrlsWeights {
            epsilons: self.epsilons,
        }];
        if self.cfg.adjust_beta {
            let target = ctx.target_misfit;
            if (ctx.phi_d - target).abs() / target > BETA_ADJUST_BAND {
                let factor = Self::beta_adjustment(ctx.phi_d, target);
                actions.push(DirectiveAction::SetBeta(ctx.beta * factor));
            }
        }
        actions
    }

    pub fn post_iteration(&mut self, ctx: &DirectiveContext<'_>) -> Vec<DirectiveAction> {
        match self.phase {
            IrlsPhase::PreIrls => self.smooth_post(ctx),
            IrlsPhase::Active => self.active_post(ctx),
            IrlsPhase::Converged => Vec::new(),
        }
    }
}

/// Rebuild the Jacobi preconditioner whenever β or the weights moved.
#[derive(Debug, Clone, Default)]
pub struct PreconditionerUpdate;

impl PreconditionerUpdate {
    fn check(&self, ctx: &DirectiveContext<'_>) -> Vec<DirectiveAction> {
        if ctx.changes.any() || !ctx.has_preconditioner {
            vec![DirectiveAction::RefreshPreconditioner]
        } else {
            Vec::new()
        }
    }

    pub fn pre_iteration(&mut self, ctx: &DirectiveContext<'_>) -> Vec<DirectiveAction> {
        self.check(ctx)
    }

    pub fn post_iteration(&mut self, ctx: &DirectiveContext<'_>) -> Vec<DirectiveAction> {
        self.check(ctx)
    }
}

/// Closed set of schedule policies, invoked in list order.
#[derive(Debug, Clone)]
pub enum Directive {
    BetaEstimate(BetaEstimate),
    BetaCooling(BetaCooling),
    Irls(IrlsSchedule),
    PreconditionerUpdate(PreconditionerUpdate),
}

impl Directive {
    /// The standard sequence: estimate β, cool it, run IRLS, keep the
    /// preconditioner current.
    pub fn standard(cfg: &InversionConfig) -> Vec<Directive> {
        vec![
            Directive::BetaEstimate(BetaEstimate::new(cfg.beta.clone())),
            Directive::BetaCooling(BetaCooling::new(&cfg.beta)),
            Directive::Irls(IrlsSchedule::new(
                cfg.irls.clone(),
                cfg.regularization.epsilons,
            )),
            Directive::PreconditionerUpdate(PreconditionerUpdate),
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Directive::BetaEstimate(_) => "beta_estimate",
            Directive::BetaCooling(_) => "beta_cooling",
            Directive::Irls(_) => "irls",
            Directive::PreconditionerUpdate(_) => "preconditioner_update",
        }
    }

    pub fn pre_iteration(&mut self, ctx: &DirectiveContext<'_>) -> Vec<DirectiveAction> {
        match self {
            Directive::BetaEstimate(d) => d.pre_iteration(ctx),
            Directive::PreconditionerUpdate(d) => d.pre_iteration(ctx),
            Directive::BetaCooling(_) | Directive::Irls(_) => Vec::new(),
        }
    }

    pub fn post_iteration(&mut self, ctx: &DirectiveContext<'_>) -> Vec<DirectiveAction> {
        match self {
            Directive::BetaCooling(d) => d.post_iteration(ctx),
            Directive::Irls(d) => d.post_iteration(ctx),
            Directive::PreconditionerUpdate(d) => d.post_iteration(ctx),
            Directive::BetaEstimate(_) => Vec::new(),
        }
    }
}
