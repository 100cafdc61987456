// ─────────────────────────────────────────────────────────────────────
// SCPN GeoMag — Inversion Benchmark
// © 1998–2026 Miroslav Šotek. All rights reserved.
// Contact: www.anulum.li | protoscience@anulum.li
// ORCID: https://orcid.org/0009-0009-3560-0851
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────

use criterion::{criterion_group, criterion_main, Criterion};
use geomag_core::forward::SensitivityMatrix;
use geomag_core::inversion::Inversion;
use geomag_types::config::InversionConfig;
use geomag_types::state::{Grid3D, InducingField, Prism, Receiver};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::hint::black_box;

fn synthetic_problem(n: usize) -> (Vec<Prism>, SensitivityMatrix, Vec<f64>) {
    let h = 25.0;
    let nz = n / 2;
    let grid = Grid3D::new(n, n, nz, [0.0, 0.0, -(nz as f64) * h], [h; 3]).expect("valid grid");
    let cells = grid.cells();
    let mid = n / 2;
    let truth: Vec<f64> = (0..grid.n_cells())
        .map(|idx| {
            let ix = idx % n;
            let iy = (idx / n) % n;
            let iz = idx / (n * n);
            let inside = (mid - 1..mid + 1).contains(&ix)
                && (mid - 1..mid + 1).contains(&iy)
                && (nz - 3..nz - 1).contains(&iz);
            if inside {
                0.05
            } else {
                0.0
            }
        })
        .collect();
    let step = n as f64 * h / (n - 1) as f64;
    let receivers: Vec<Receiver> = (0..n)
        .flat_map(|i| (0..n).map(move |j| Receiver::new(i as f64 * step, j as f64 * step, 10.0)))
        .collect();
    let field = InducingField::new(50_000.0, 70.0, 15.0).expect("valid field");
    let sim = SensitivityMatrix::build(&cells, &receivers, &field).expect("build");
    let mut rng = StdRng::seed_from_u64(42);
    let noise = Normal::new(0.0, 1.0).expect("valid normal");
    let observed = sim
        .predict(&truth)
        .expect("predict")
        .into_iter()
        .map(|d| d + noise.sample(&mut rng))
        .collect();
    (cells, sim, observed)
}

fn bench_inversion(c: &mut Criterion) {
    let mut group = c.benchmark_group("sparse_inversion");
    group.sample_size(10);

    for n in [8usize, 12usize] {
        let (cells, sim, observed) = synthetic_problem(n);
        let sigma = vec![1.0; observed.len()];
        group.bench_function(format!("{}cells", cells.len()), |b| {
            b.iter(|| {
                let inv = Inversion::new(
                    sim.clone(),
                    &cells,
                    observed.clone(),
                    sigma.clone(),
                    InversionConfig::default(),
                )
                .expect("inversion setup should succeed");
                let result = inv.run(None).expect("inversion should run");
                black_box(result.diagnostics.n_iterations())
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_inversion);
criterion_main!(benches);
