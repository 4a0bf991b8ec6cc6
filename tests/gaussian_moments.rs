//! Checks that every integration policy recovers the moments of a
//! correlated 2D Gaussian, and that the chains agree with each other.

use mini_hmc::distributions::Gaussian2D;
use mini_hmc::hmc::{HamiltonianMcmc, INTEGRATION_TRANSITION};
use mini_hmc::integrators::LeapfrogIntegrator;
use mini_hmc::sampler::{ChainsOutput, SampleOptions};
use mini_hmc::stats::summarize;
use mini_hmc::system::{EuclideanMetricSystem, Metric, System};
use mini_hmc::transitions::{CorrelatedMomentumTransition, DynamicOptions};
use ndarray::{arr1, arr2, Array2, Axis};
use std::sync::Arc;

const SEED: u64 = 42;
const N_SAMPLE: usize = 2_000;
const N_CHAIN: usize = 4;

fn target() -> Gaussian2D {
    Gaussian2D {
        mean: arr1(&[1.0, -2.0]),
        cov: arr2(&[[1.0, 0.6], [0.6, 2.0]]),
    }
}

fn system() -> Arc<dyn System> {
    Arc::new(EuclideanMetricSystem::new(target()))
}

fn init_states() -> Vec<mini_hmc::state::InitState> {
    (0..N_CHAIN)
        .map(|i| vec![i as f64 - 1.5, 1.0 - i as f64].into())
        .collect()
}

/// Pools the draws of all chains after discarding a burn-in.
fn pooled(output: &ChainsOutput, burn_in: usize) -> Array2<f64> {
    let views: Vec<_> = output.traces["pos"]
        .iter()
        .map(|t| t.view().into_dimensionality::<ndarray::Ix2>().unwrap())
        .collect();
    let kept: Vec<_> = views
        .iter()
        .map(|v| v.slice_axis(Axis(0), ndarray::Slice::from(burn_in..)))
        .collect();
    ndarray::concatenate(Axis(0), &kept).unwrap()
}

fn check_moments(output: &ChainsOutput) {
    let samples = pooled(output, 200);
    let mean = samples.mean_axis(Axis(0)).unwrap();
    let expected = target();
    for d in 0..2 {
        assert!(
            (mean[d] - expected.mean[d]).abs() < 0.2,
            "mean[{d}] = {}, expected {}",
            mean[d],
            expected.mean[d]
        );
    }
    let centered = &samples - &mean;
    let cov = centered.t().dot(&centered) / (samples.nrows() - 1) as f64;
    for i in 0..2 {
        for j in 0..2 {
            let rel = (cov[(i, j)] - expected.cov[(i, j)]).abs() / expected.cov[(i, j)];
            assert!(rel < 0.25, "cov[{i},{j}] = {}", cov[(i, j)]);
        }
    }
    let summary = summarize(&output.traces["pos"]).unwrap();
    assert!(summary.max_rhat().unwrap() < 1.05);
    assert!(summary.min_ess().unwrap() > 200.0);
}

#[test]
fn test_static_metropolis_moments() {
    let mut hmc =
        HamiltonianMcmc::static_metropolis(system(), Arc::new(LeapfrogIntegrator::new(0.3)), 8)
            .unwrap()
            .set_seed(SEED);
    let output = hmc
        .sample_chains(N_SAMPLE, init_states(), &[], 2, &SampleOptions::default())
        .unwrap();
    check_moments(&output);
}

#[test]
fn test_random_metropolis_moments() {
    let mut hmc = HamiltonianMcmc::random_metropolis(
        system(),
        Arc::new(LeapfrogIntegrator::new(0.3)),
        (4, 12),
    )
    .unwrap()
    .set_seed(SEED);
    let output = hmc
        .sample_chains(N_SAMPLE, init_states(), &[], 2, &SampleOptions::default())
        .unwrap();
    check_moments(&output);
}

#[test]
fn test_dynamic_multinomial_moments() {
    let mut hmc = HamiltonianMcmc::dynamic_multinomial(
        system(),
        Arc::new(LeapfrogIntegrator::new(0.4)),
        DynamicOptions::default(),
    )
    .unwrap()
    .set_seed(SEED);
    let output = hmc
        .sample_chains(N_SAMPLE, init_states(), &[], 2, &SampleOptions::default())
        .unwrap();
    check_moments(&output);

    let diverging = &output.statistics[INTEGRATION_TRANSITION]["diverging"];
    let n_diverging: f64 = diverging.iter().map(|d| d.view().sum()).sum();
    assert_eq!(n_diverging, 0.0);
}

#[test]
fn test_correlated_momentum_with_diagonal_metric() {
    let system: Arc<dyn System> = Arc::new(
        EuclideanMetricSystem::new(target())
            .set_metric(Metric::Diagonal(arr1(&[1.0, 2.0])))
            .unwrap(),
    );
    let momentum = CorrelatedMomentumTransition::new(system.clone(), 0.3).unwrap();
    let mut hmc = HamiltonianMcmc::dynamic_multinomial(
        system,
        Arc::new(LeapfrogIntegrator::new(0.4)),
        DynamicOptions::default(),
    )
    .unwrap()
    .with_momentum_transition(momentum)
    .unwrap()
    .set_seed(SEED);
    let output = hmc
        .sample_chains(N_SAMPLE, init_states(), &[], 1, &SampleOptions::default())
        .unwrap();
    check_moments(&output);
}
