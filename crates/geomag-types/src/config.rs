// ─────────────────────────────────────────────────────────────────────
// SCPN GeoMag — Config
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
use crate::error::{GeoMagError, GeoMagResult};
use serde::{Deserialize, Serialize};

/// Number of regularization terms: smallness, then x, y, z gradients.
pub const N_REG_TERMS: usize = 4;

/// Top-level inversion configuration.
/// Every section falls back to its defaults when absent from JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InversionConfig {
    #[serde(default)]
    pub bounds: BoundsConfig,
    #[serde(default)]
    pub regularization: RegularizationConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub beta: BetaConfig,
    #[serde(default)]
    pub irls: IrlsConfig,
}

/// Box constraint on the susceptibility model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundsConfig {
    pub lower: f64,
    pub upper: f64,
}

impl Default for BoundsConfig {
    fn default() -> Self {
        BoundsConfig {
            lower: 0.0,
            upper: 1.0,
        }
    }
}

/// Sparse regularization: one entry per term in the order
/// [smallness, d/dx, d/dy, d/dz].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegularizationConfig {
    /// Norm exponent per term, each in [0, 2].
    #[serde(default = "default_norms")]
    pub norms: [f64; N_REG_TERMS],
    /// IRLS threshold per term (ε_p for smallness, ε_q for the gradients).
    #[serde(default = "default_epsilons")]
    pub epsilons: [f64; N_REG_TERMS],
    /// Scalar weight per term.
    #[serde(default = "default_alphas")]
    pub alphas: [f64; N_REG_TERMS],
    /// Reference susceptibility for the smallness term.
    #[serde(default)]
    pub reference_model: f64,
}

fn default_norms() -> [f64; N_REG_TERMS] {
    [0.0, 1.0, 1.0, 1.0]
}
fn default_epsilons() -> [f64; N_REG_TERMS] {
    [1e-3, 1e-3, 1e-3, 1e-3]
}
fn default_alphas() -> [f64; N_REG_TERMS] {
    [1.0, 1.0, 1.0, 1.0]
}

impl Default for RegularizationConfig {
    fn default() -> Self {
        RegularizationConfig {
            norms: default_norms(),
            epsilons: default_epsilons(),
            alphas: default_alphas(),
            reference_model: 0.0,
        }
    }
}

/// Projected Gauss-Newton settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Outer iteration budget.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default = "default_cg_max_iterations")]
    pub cg_max_iterations: usize,
    /// Relative residual tolerance of the inner CG solve.
    #[serde(default = "default_cg_tolerance")]
    pub cg_tolerance: f64,
    #[serde(default = "default_line_search_max_trials")]
    pub line_search_max_trials: usize,
    /// Sufficient-decrease constant of the Armijo test.
    #[serde(default = "default_armijo")]
    pub armijo: f64,
    /// Relative objective decrease below which a step counts as stalled.
    #[serde(default = "default_objective_tolerance")]
    pub objective_tolerance: f64,
    /// Projected-gradient norm, relative to its first value.
    #[serde(default = "default_gradient_tolerance")]
    pub gradient_tolerance: f64,
}

fn default_max_iterations() -> usize {
    30
}
fn default_cg_max_iterations() -> usize {
    30
}
fn default_cg_tolerance() -> f64 {
    1e-3
}
fn default_line_search_max_trials() -> usize {
    10
}
fn default_armijo() -> f64 {
    1e-4
}
fn default_objective_tolerance() -> f64 {
    1e-4
}
fn default_gradient_tolerance() -> f64 {
    1e-3
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig {
            max_iterations: default_max_iterations(),
            cg_max_iterations: default_cg_max_iterations(),
            cg_tolerance: default_cg_tolerance(),
            line_search_max_trials: default_line_search_max_trials(),
            armijo: default_armijo(),
            objective_tolerance: default_objective_tolerance(),
            gradient_tolerance: default_gradient_tolerance(),
        }
    }
}

/// Trade-off parameter initialisation and cooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BetaConfig {
    /// β0 = ratio · λmax(misfit) / λmax(regularization).
    #[serde(default = "default_eigen_ratio")]
    pub eigen_ratio: f64,
    #[serde(default = "default_power_iterations")]
    pub power_iterations: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// β ← β / cooling_factor while the smooth misfit is above target.
    #[serde(default = "default_cooling_factor")]
    pub cooling_factor: f64,
    /// Cool every `cooling_rate` iterations.
    #[serde(default = "default_cooling_rate")]
    pub cooling_rate: usize,
    /// Skip the eigenvalue estimate and start from this β.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<f64>,
}

fn default_eigen_ratio() -> f64 {
    10.0
}
fn default_power_iterations() -> usize {
    5
}
fn default_seed() -> u64 {
    518_400
}
fn default_cooling_factor() -> f64 {
    2.0
}
fn default_cooling_rate() -> usize {
    1
}

impl Default for BetaConfig {
    fn default() -> Self {
        BetaConfig {
            eigen_ratio: default_eigen_ratio(),
            power_iterations: default_power_iterations(),
            seed: default_seed(),
            cooling_factor: default_cooling_factor(),
            cooling_rate: default_cooling_rate(),
            initial: None,
        }
    }
}

/// IRLS schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IrlsConfig {
    /// Smooth (p = 2) Gauss-Newton iterations before sparsification may start.
    #[serde(default = "default_min_smooth_iterations")]
    pub min_smooth_iterations: usize,
    /// Relative misfit change that counts as a plateau.
    #[serde(default = "default_misfit_plateau_tolerance")]
    pub misfit_plateau_tolerance: f64,
    /// Relative model change below which IRLS has converged.
    #[serde(default = "default_model_change_tolerance")]
    pub model_change_tolerance: f64,
    #[serde(default = "default_max_irls_iterations")]
    pub max_irls_iterations: usize,
    /// Target misfit = chi_factor · n_data.
    #[serde(default = "default_chi_factor")]
    pub chi_factor: f64,
    /// Nudge β toward the target misfit while reweighting.
    #[serde(default = "default_adjust_beta")]
    pub adjust_beta: bool,
    /// When set, ε starts at the largest |f| of the smooth model and is
    /// divided by this factor every IRLS iteration down to the configured floor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epsilon_cooling: Option<f64>,
}

fn default_min_smooth_iterations() -> usize {
    3
}
fn default_misfit_plateau_tolerance() -> f64 {
    0.05
}
fn default_model_change_tolerance() -> f64 {
    1e-2
}
fn default_max_irls_iterations() -> usize {
    15
}
fn default_chi_factor() -> f64 {
    1.0
}
fn default_adjust_beta() -> bool {
    true
}

impl Default for IrlsConfig {
    fn default() -> Self {
        IrlsConfig {
            min_smooth_iterations: default_min_smooth_iterations(),
            misfit_plateau_tolerance: default_misfit_plateau_tolerance(),
            model_change_tolerance: default_model_change_tolerance(),
            max_irls_iterations: default_max_irls_iterations(),
            chi_factor: default_chi_factor(),
            adjust_beta: default_adjust_beta(),
            epsilon_cooling: None,
        }
    }
}

fn positive_finite(value: f64, key: &str) -> GeoMagResult<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(GeoMagError::ConfigError(format!(
            "{key} must be finite and > 0"
        )));
    }
    Ok(())
}

fn at_least_one(value: usize, key: &str) -> GeoMagResult<()> {
    if value == 0 {
        return Err(GeoMagError::ConfigError(format!("{key} must be >= 1")));
    }
    Ok(())
}

impl InversionConfig {
    /// Load from a JSON file.
    pub fn from_file(path: &str) -> GeoMagResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> GeoMagResult<()> {
        let b = &self.bounds;
        if !b.lower.is_finite() || !b.upper.is_finite() || b.lower >= b.upper {
            return Err(GeoMagError::ConfigError(format!(
                "bounds.lower must be < bounds.upper (got [{}, {}])",
                b.lower, b.upper
            )));
        }

        let reg = &self.regularization;
        for (k, &p) in reg.norms.iter().enumerate() {
            if !p.is_finite() || !(0.0..=2.0).contains(&p) {
                return Err(GeoMagError::ConfigError(format!(
                    "regularization.norms[{k}] must lie in [0, 2], got {p}"
                )));
            }
        }
        for (k, &eps) in reg.epsilons.iter().enumerate() {
            positive_finite(eps, &format!("regularization.epsilons[{k}]"))?;
        }
        for (k, &alpha) in reg.alphas.iter().enumerate() {
            if !alpha.is_finite() || alpha < 0.0 {
                return Err(GeoMagError::ConfigError(format!(
                    "regularization.alphas[{k}] must be finite and >= 0"
                )));
            }
        }
        if reg.alphas.iter().all(|&a| a == 0.0) {
            return Err(GeoMagError::ConfigError(
                "regularization.alphas must contain at least one positive weight".to_string(),
            ));
        }
        if !reg.reference_model.is_finite() {
            return Err(GeoMagError::ConfigError(
                "regularization.reference_model must be finite".to_string(),
            ));
        }

        let opt = &self.optimizer;
        at_least_one(opt.max_iterations, "optimizer.max_iterations")?;
        at_least_one(opt.cg_max_iterations, "optimizer.cg_max_iterations")?;
        at_least_one(opt.line_search_max_trials, "optimizer.line_search_max_trials")?;
        positive_finite(opt.cg_tolerance, "optimizer.cg_tolerance")?;
        positive_finite(opt.objective_tolerance, "optimizer.objective_tolerance")?;
        positive_finite(opt.gradient_tolerance, "optimizer.gradient_tolerance")?;
        if !opt.armijo.is_finite() || !(0.0..1.0).contains(&opt.armijo) {
            return Err(GeoMagError::ConfigError(
                "optimizer.armijo must be finite and in [0, 1)".to_string(),
            ));
        }

        let beta = &self.beta;
        positive_finite(beta.eigen_ratio, "beta.eigen_ratio")?;
        at_least_one(beta.power_iterations, "beta.power_iterations")?;
        at_least_one(beta.cooling_rate, "beta.cooling_rate")?;
        if !beta.cooling_factor.is_finite() || beta.cooling_factor < 1.0 {
            return Err(GeoMagError::ConfigError(
                "beta.cooling_factor must be finite and >= 1".to_string(),
            ));
        }
        if let Some(b0) = beta.initial {
            positive_finite(b0, "beta.initial")?;
        }

        let irls = &self.irls;
        positive_finite(irls.misfit_plateau_tolerance, "irls.misfit_plateau_tolerance")?;
        positive_finite(irls.model_change_tolerance, "irls.model_change_tolerance")?;
        positive_finite(irls.chi_factor, "irls.chi_factor")?;
        at_least_one(irls.max_irls_iterations, "irls.max_irls_iterations")?;
        if let Some(f) = irls.epsilon_cooling {
            if !f.is_finite() || f <= 1.0 {
                return Err(GeoMagError::ConfigError(
                    "irls.epsilon_cooling must be finite and > 1".to_string(),
                ));
            }
        }
        Ok(())
    }
}
