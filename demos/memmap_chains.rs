//! Runs several chains with memory-mapped traces and shows how an interrupt
//! stops them early.
//!
//! A background thread triggers the interrupt after two seconds. Chains that
//! finished by then are kept, unfinished chains and their files are removed.
//! The trace files of the kept chains stay in the output directory and can be
//! reopened with `PersistedArray::open`.

use mini_hmc::distributions::IsotropicGaussian;
use mini_hmc::hmc::{default_trace_fn, HamiltonianMcmc};
use mini_hmc::integrators::LeapfrogIntegrator;
use mini_hmc::interrupt::Interrupt;
use mini_hmc::persist::PersistedArray;
use mini_hmc::sampler::{trace_fn, SampleOptions};
use mini_hmc::state::ChainState;
use mini_hmc::system::{EuclideanMetricSystem, System};
use mini_hmc::transitions::DynamicOptions;

use ndarray::arr0;
use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("mini_hmc=info"))
        .init();

    const DIM: usize = 50;
    const N_CHAINS: usize = 6;
    // Trace files are never overwritten, so every run writes to a new directory.
    let started = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
    let out_dir = std::env::temp_dir().join(format!(
        "mini_hmc_memmap_chains_{started}_{}",
        std::process::id()
    ));

    let system: Arc<dyn System> =
        Arc::new(EuclideanMetricSystem::new(IsotropicGaussian::new(1.0)));
    let mut hmc = HamiltonianMcmc::dynamic_multinomial(
        system.clone(),
        Arc::new(LeapfrogIntegrator::new(0.3)),
        DynamicOptions::default(),
    )?
    .set_seed(2024);

    let squared_norm = trace_fn(|state: &ChainState| {
        let sq_norm = arr0(state.pos.dot(&state.pos)).into_dyn();
        BTreeMap::from([("pos.sq_norm".to_string(), sq_norm)])
    });
    let trace_funcs = [default_trace_fn(system), squared_norm];

    let interrupt = Interrupt::new();
    let trigger = interrupt.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(2));
        trigger.trigger();
    });

    let init_states = (0..N_CHAINS).map(|i| vec![i as f64; DIM].into()).collect();
    let options = SampleOptions::default()
        .set_memmap_dir(&out_dir)
        .set_display_progress(true)
        .set_interrupt(interrupt);
    let output = hmc.sample_chains(20_000, init_states, &trace_funcs, 3, &options)?;

    info!(
        interrupted = output.interrupted,
        chains = ?output.chain_indices,
        "Sampling returned"
    );
    for (i, trace) in output.traces["pos.sq_norm"].iter().enumerate() {
        let Some(path) = trace.path() else { continue };
        let reopened = PersistedArray::open(path)?;
        let mean = reopened.view().mean().unwrap_or(f64::NAN);
        println!(
            "chain {}: {} rows in {}, mean squared norm {mean:.2} (expected {DIM})",
            output.chain_indices[i],
            reopened.shape()[0],
            path.display()
        );
    }
    Ok(())
}
