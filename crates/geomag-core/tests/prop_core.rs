// ─────────────────────────────────────────────────────────────────────
// SCPN GeoMag — Property-Based Tests (proptest) for geomag-core
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
//! Property-based tests for geomag-core using proptest.
//!
//! Covers: forward linearity, adjoint consistency, tensor trace, bound
//! invariants of the projected Gauss-Newton iterates.

use geomag_core::forward::SensitivityMatrix;
use geomag_core::misfit::DataMisfit;
use geomag_core::objective::CombinedObjective;
use geomag_core::optimizer::ProjectedGaussNewton;
use geomag_core::prism::prism_tensor;
use geomag_core::regularization::SparseRegularization;
use geomag_types::config::{BoundsConfig, OptimizerConfig, RegularizationConfig};
use geomag_types::state::{Grid3D, InducingField, Prism, Receiver};
use proptest::prelude::*;

fn survey(inclination: f64, declination: f64) -> (Vec<Prism>, SensitivityMatrix) {
    let grid = Grid3D::new(4, 4, 2, [0.0, 0.0, -50.0], [25.0, 25.0, 25.0]).unwrap();
    let cells = grid.cells();
    let receivers: Vec<Receiver> = (0..5)
        .flat_map(|i| (0..5).map(move |j| Receiver::new(i as f64 * 25.0, j as f64 * 25.0, 8.0)))
        .collect();
    let field = InducingField::new(50_000.0, inclination, declination).unwrap();
    let sim = SensitivityMatrix::build(&cells, &receivers, &field).unwrap();
    (cells, sim)
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

// ── Forward Operator ─────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// G(m1 + m2) == G m1 + G m2.
    #[test]
    fn forward_is_linear(
        inc in -90.0f64..90.0,
        dec in -180.0f64..180.0,
        m1 in prop::collection::vec(0.0f64..0.1, 32),
        m2 in prop::collection::vec(0.0f64..0.1, 32),
    ) {
        let (_, sim) = survey(inc, dec);
        let sum: Vec<f64> = m1.iter().zip(m2.iter()).map(|(a, b)| a + b).collect();
        let d1 = sim.predict(&m1).unwrap();
        let d2 = sim.predict(&m2).unwrap();
        let ds = sim.predict(&sum).unwrap();
        for ((a, b), s) in d1.iter().zip(d2.iter()).zip(ds.iter()) {
            prop_assert!((a + b - s).abs() < 1e-9 * (1.0 + s.abs()));
        }
    }

    /// <G x, y> == <x, Gᵀ y>.
    #[test]
    fn adjoint_is_consistent(
        x in prop::collection::vec(-1.0f64..1.0, 32),
        y in prop::collection::vec(-1.0f64..1.0, 25),
    ) {
        let (_, sim) = survey(65.0, 10.0);
        let lhs = dot(&sim.predict(&x).unwrap(), &y);
        let rhs = dot(&x, &sim.adjoint(&y).unwrap());
        prop_assert!((lhs - rhs).abs() < 1e-9 * (1.0 + lhs.abs()));
    }

    /// The prism tensor is trace-free outside the body.
    #[test]
    fn tensor_is_trace_free_outside(
        x in -100.0f64..100.0,
        y in -100.0f64..100.0,
        z in 1.0f64..60.0,
        ex in 1.0f64..40.0,
        ey in 1.0f64..40.0,
        ez in 1.0f64..40.0,
    ) {
        let prism = Prism::new([-ex / 2.0, -ey / 2.0, -ez], [ex / 2.0, ey / 2.0, 0.0]);
        let t = prism_tensor(&prism, [x, y, z]);
        let scale = t.xx.abs() + t.yy.abs() + t.zz.abs();
        prop_assert!(t.trace().abs() < 1e-9 * (1.0 + scale));
    }
}

// ── Optimizer ────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    /// Every iterate stays inside [lower, upper].
    #[test]
    fn iterates_respect_bounds(
        upper in 0.001f64..0.2,
        chi in 0.0f64..0.5,
        beta in 1e-4f64..1e2,
        start in prop::collection::vec(-1.0f64..1.0, 32),
    ) {
        let (cells, sim) = survey(70.0, 5.0);
        let truth: Vec<f64> = (0..32).map(|j| if j % 5 == 0 { chi } else { 0.0 }).collect();
        let observed = sim.predict(&truth).unwrap();
        let weights = sim.cell_weights();
        let reg = SparseRegularization::new(&cells, &weights, &RegularizationConfig::default()).unwrap();
        let misfit = DataMisfit::new(sim, observed, vec![1.0; 25]).unwrap();
        let bounds = BoundsConfig { lower: 0.0, upper };
        let cfg = OptimizerConfig { max_iterations: 6, ..OptimizerConfig::default() };
        let mut opt = ProjectedGaussNewton::new(cfg, &bounds).unwrap();
        let objective = CombinedObjective::new(&misfit, &reg, beta);

        let mut m = start;
        opt.project(&mut m);
        while !opt.is_terminated() {
            opt.step(&objective, &mut m).unwrap();
            prop_assert!(m.iter().all(|&v| (0.0..=upper).contains(&v)));
        }
    }
}
