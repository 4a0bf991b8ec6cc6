//! Samples the Rosenbrock "banana" density with dynamic multinomial HMC and
//! reports tree depths, divergences and diagnostics.
//!
//! With the `burn` feature the gradient is computed by autodiff instead of
//! the closed form.

use mini_hmc::distributions::{Rosenbrock2D, Target};
use mini_hmc::hmc::{HamiltonianMcmc, INTEGRATION_TRANSITION};
use mini_hmc::integrators::LeapfrogIntegrator;
use mini_hmc::sampler::SampleOptions;
use mini_hmc::stats::summarize;
use mini_hmc::system::{EuclideanMetricSystem, System};
use mini_hmc::transitions::{DynamicOptions, TerminationCriterion};

use std::error::Error;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[cfg(feature = "parquet")]
use mini_hmc::io::save_trace_parquet;

#[cfg(feature = "burn")]
fn system() -> Arc<dyn System> {
    use burn::backend::{Autodiff, NdArray};
    use burn::tensor::Tensor;
    use mini_hmc::burn_target::BurnTarget;

    type BackendType = Autodiff<NdArray>;

    // log π(x, y) = -[(1 - x)² + 5 (y - x²)²]
    let target = BurnTarget::<BackendType, _>::new(|theta: Tensor<BackendType, 1>| {
        let x = theta.clone().slice([0..1]);
        let y = theta.slice([1..2]);
        let valley = y - x.clone().powf_scalar(2.0);
        (x.neg().add_scalar(1.0).powf_scalar(2.0) + valley.powf_scalar(2.0).mul_scalar(5.0))
            .neg()
            .sum()
    });
    Arc::new(EuclideanMetricSystem::new(target))
}

#[cfg(not(feature = "burn"))]
fn system() -> Arc<dyn System> {
    Arc::new(EuclideanMetricSystem::new(Rosenbrock2D { a: 1.0, b: 5.0 }))
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    const N_SAMPLE: usize = 2_000;
    const N_CHAINS: usize = 4;

    let options = DynamicOptions::default()
        .set_max_tree_depth(8)
        .set_termination_criterion(TerminationCriterion::RiemannianNoUTurn);
    let integrator = Arc::new(LeapfrogIntegrator::new(0.05));
    let mut hmc = HamiltonianMcmc::dynamic_multinomial(system(), integrator, options)?.set_seed(7);

    // The closed form is kept around to check the start points.
    let reference = Rosenbrock2D { a: 1.0, b: 5.0 };
    let starts = [[0.0, 0.0], [1.0, 1.0], [-1.0, 1.0], [0.5, 0.25]];
    for start in &starts {
        let logp = reference.log_density(ndarray::arr1(start).view());
        println!("start {start:?}: log density {logp:.3}");
    }
    let init_states = starts
        .iter()
        .take(N_CHAINS)
        .map(|s| s.to_vec().into())
        .collect();

    let run_options = SampleOptions::default().set_display_progress(true);
    let output = hmc.sample_chains(N_SAMPLE, init_states, &[], N_CHAINS, &run_options)?;

    let stats = &output.statistics[INTEGRATION_TRANSITION];
    for chain in 0..output.chain_indices.len() {
        let depth = stats["tree_depth"][chain].to_owned();
        let diverging = stats["diverging"][chain].to_owned().sum();
        println!(
            "chain {chain}: mean tree depth {:.2}, max {}, {diverging} divergent transitions",
            depth.mean().unwrap_or(f64::NAN),
            depth.iter().cloned().fold(0.0, f64::max),
        );
    }

    let summary = summarize(&output.traces["pos"])?;
    println!(
        "max split R-hat {:.3}, min ESS {:.0}",
        summary.max_rhat()?,
        summary.min_ess()?
    );

    #[cfg(feature = "parquet")]
    save_trace_parquet(&output.traces["pos"], "/tmp/rosenbrock_dynamic_hmc.parquet")?;

    Ok(())
}
