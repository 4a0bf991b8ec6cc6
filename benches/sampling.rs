use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use mini_hmc::distributions::IsotropicGaussian;
use mini_hmc::hmc::HamiltonianMcmc;
use mini_hmc::integrators::LeapfrogIntegrator;
use mini_hmc::sampler::SampleOptions;
use mini_hmc::system::{EuclideanMetricSystem, System};
use mini_hmc::transitions::DynamicOptions;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

const N_SAMPLE: usize = 500;

fn gaussian_system() -> Arc<dyn System> {
    Arc::new(EuclideanMetricSystem::new(IsotropicGaussian::new(1.0)))
}

fn bench_single_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_chain");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(10));

    for dim in [2usize, 20, 100] {
        group.bench_with_input(BenchmarkId::new("static", dim), &dim, |b, &dim| {
            let mut hmc = HamiltonianMcmc::static_metropolis(
                gaussian_system(),
                Arc::new(LeapfrogIntegrator::new(0.2)),
                10,
            )
            .expect("Expecting a valid static sampler")
            .set_seed(42);
            b.iter(|| {
                let output = hmc
                    .sample_chain(N_SAMPLE, vec![0.5; dim], &[], &SampleOptions::default())
                    .expect("Expecting sampling to succeed");
                black_box(output.final_state)
            })
        });
        group.bench_with_input(BenchmarkId::new("dynamic", dim), &dim, |b, &dim| {
            let mut hmc = HamiltonianMcmc::dynamic_multinomial(
                gaussian_system(),
                Arc::new(LeapfrogIntegrator::new(0.2)),
                DynamicOptions::default(),
            )
            .expect("Expecting a valid dynamic sampler")
            .set_seed(42);
            b.iter(|| {
                let output = hmc
                    .sample_chain(N_SAMPLE, vec![0.5; dim], &[], &SampleOptions::default())
                    .expect("Expecting sampling to succeed");
                black_box(output.final_state)
            })
        });
    }
    group.finish();
}

fn bench_worker_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("sample_chains");
    group.sample_size(10);

    for n_process in [1usize, 4] {
        group.bench_with_input(
            BenchmarkId::from_parameter(n_process),
            &n_process,
            |b, &n_process| {
                let mut hmc = HamiltonianMcmc::dynamic_multinomial(
                    gaussian_system(),
                    Arc::new(LeapfrogIntegrator::new(0.2)),
                    DynamicOptions::default(),
                )
                .expect("Expecting a valid dynamic sampler")
                .set_seed(7);
                b.iter(|| {
                    let init_states = (0..4).map(|i| vec![i as f64; 10].into()).collect();
                    let output = hmc
                        .sample_chains(
                            N_SAMPLE,
                            init_states,
                            &[],
                            n_process,
                            &SampleOptions::default(),
                        )
                        .expect("Expecting sampling to succeed");
                    black_box(output.final_states)
                })
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_single_chain, bench_worker_pool);
criterion_main!(benches);
