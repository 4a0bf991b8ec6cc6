//! Behavioural properties of the chain drivers: reproducibility, array
//! lengths, independence from the number of workers, fail-fast validation,
//! integrator step counts and interrupt handling.

use mini_hmc::distributions::IsotropicGaussian;
use mini_hmc::error::{IntegratorError, McmcError};
use mini_hmc::hmc::{HamiltonianMcmc, INTEGRATION_TRANSITION};
use mini_hmc::integrators::{Integrator, LeapfrogIntegrator};
use mini_hmc::interrupt::Interrupt;
use mini_hmc::sampler::{MarkovChainMonteCarloMethod, SampleOptions};
use mini_hmc::state::{ChainState, InitState, StateVariable};
use mini_hmc::system::{EuclideanMetricSystem, Metric, System};
use mini_hmc::transitions::{
    DynamicOptions, IndependentMomentumTransition, IntegrationTransition,
    MetropolisStaticIntegrationTransition, StatValue, StatisticType, Statistics, Transition,
};
use ndarray::arr1;
use rand::RngCore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn gaussian_system() -> Arc<dyn System> {
    Arc::new(EuclideanMetricSystem::new(IsotropicGaussian::new(1.0)))
}

fn init_states(n: usize) -> Vec<InitState> {
    (0..n)
        .map(|i| InitState::from(vec![i as f64 - 1.0, 0.5 * i as f64]))
        .collect()
}

/// Leapfrog integrator counting how often it is stepped.
struct CountingIntegrator {
    inner: LeapfrogIntegrator,
    calls: AtomicUsize,
}

impl CountingIntegrator {
    fn new(step_size: f64) -> Self {
        Self {
            inner: LeapfrogIntegrator::new(step_size),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Integrator for CountingIntegrator {
    fn step_size(&self) -> f64 {
        self.inner.step_size()
    }

    fn step(&self, system: &dyn System, state: &ChainState) -> Result<ChainState, IntegratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.step(system, state)
    }
}

/// Counts calls across all chains, records the running count and triggers
/// `interrupt` on call `at`.
struct TriggerAt {
    calls: Arc<AtomicUsize>,
    at: usize,
    interrupt: Interrupt,
}

impl Transition for TriggerAt {
    fn state_variables(&self) -> &[StateVariable] {
        &[StateVariable::Pos]
    }

    fn statistic_types(&self) -> Vec<(&'static str, StatisticType)> {
        vec![("call", StatisticType::int())]
    }

    fn sample(
        &self,
        state: ChainState,
        _rng: &mut dyn RngCore,
    ) -> (ChainState, Option<Statistics>) {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.at {
            self.interrupt.trigger();
        }
        let stats = Statistics::from([("call".to_string(), StatValue::Int(n as i64))]);
        (state, Some(stats))
    }
}

#[test]
fn test_same_seed_gives_identical_results() {
    let run = |seed: u64| {
        let mut hmc = HamiltonianMcmc::dynamic_multinomial(
            gaussian_system(),
            Arc::new(LeapfrogIntegrator::new(0.3)),
            DynamicOptions::default(),
        )
        .unwrap()
        .set_seed(seed);
        hmc.sample_chains(60, init_states(2), &[], 1, &SampleOptions::default())
            .unwrap()
    };
    let a = run(17);
    let b = run(17);
    for chain in 0..2 {
        assert_eq!(
            a.traces["pos"][chain].view(),
            b.traces["pos"][chain].view()
        );
        for key in ["accept_stat", "n_step", "tree_depth", "diverging"] {
            let sa = &a.statistics[INTEGRATION_TRANSITION][key][chain];
            let sb = &b.statistics[INTEGRATION_TRANSITION][key][chain];
            assert_eq!(sa.view(), sb.view(), "statistic {key} differs");
        }
    }
    let c = run(18);
    assert_ne!(a.traces["pos"][0].view(), c.traces["pos"][0].view());
}

#[test]
fn test_completed_runs_have_full_length_arrays() {
    let mut hmc = HamiltonianMcmc::random_metropolis(
        gaussian_system(),
        Arc::new(LeapfrogIntegrator::new(0.2)),
        (3, 8),
    )
    .unwrap()
    .set_seed(5);
    let output = hmc
        .sample_chains(75, init_states(3), &[], 2, &SampleOptions::default())
        .unwrap();
    assert!(!output.interrupted);
    assert_eq!(output.chain_indices, vec![0, 1, 2]);
    for traces in output.traces.values() {
        assert_eq!(traces.len(), 3);
        assert!(traces.iter().all(|t| t.len() == 75));
    }
    for stats in output.statistics.values() {
        for arrays in stats.values() {
            assert!(arrays.iter().all(|t| t.len() == 75));
        }
    }
    for n_step in &output.statistics[INTEGRATION_TRANSITION]["n_step"] {
        assert!(n_step.view().iter().all(|&n| (3.0..8.0).contains(&n)));
    }
}

#[test]
fn test_worker_count_does_not_change_results() {
    let run = |n_process: usize| {
        let mut hmc = HamiltonianMcmc::static_metropolis(
            gaussian_system(),
            Arc::new(LeapfrogIntegrator::new(0.25)),
            6,
        )
        .unwrap()
        .set_seed(99);
        hmc.sample_chains(40, init_states(4), &[], n_process, &SampleOptions::default())
            .unwrap()
    };
    let sequential = run(1);
    let parallel = run(3);
    assert_eq!(sequential.final_states, parallel.final_states);
    for chain in 0..4 {
        assert_eq!(
            sequential.traces["pos"][chain].view(),
            parallel.traces["pos"][chain].view()
        );
        assert_eq!(
            sequential.traces["hamiltonian"][chain].view(),
            parallel.traces["hamiltonian"][chain].view()
        );
    }
}

#[test]
fn test_missing_state_variable_fails_before_sampling() {
    let system = gaussian_system();
    let integrator = Arc::new(CountingIntegrator::new(0.1));
    let transition = IntegrationTransition::Static(
        MetropolisStaticIntegrationTransition::new(system, integrator.clone(), 5).unwrap(),
    );
    let mut method = MarkovChainMonteCarloMethod::new(vec![(
        INTEGRATION_TRANSITION.to_string(),
        Arc::new(transition) as Arc<dyn Transition>,
    )])
    .unwrap();

    let err = method
        .sample_chain(10, vec![0.0, 0.0], &[], &SampleOptions::default())
        .unwrap_err();
    match err {
        McmcError::MissingStateVariable {
            variable,
            transition,
        } => {
            assert_eq!(variable, StateVariable::Mom);
            assert_eq!(transition, INTEGRATION_TRANSITION);
        }
        other => panic!("unexpected error {other}"),
    }

    let states = vec![
        InitState::from(ChainState::new(arr1(&[0.0])).with_mom(arr1(&[1.0]))),
        InitState::from(vec![0.0]),
    ];
    let err = method
        .sample_chains(10, states, &[], 1, &SampleOptions::default())
        .unwrap_err();
    assert!(matches!(err, McmcError::MissingStateVariable { .. }));
    assert_eq!(integrator.calls(), 0);
}

#[test]
fn test_metric_dimension_mismatch_fails_before_sampling() {
    let system: Arc<dyn System> = Arc::new(
        EuclideanMetricSystem::new(IsotropicGaussian::new(1.0))
            .set_metric(Metric::Diagonal(arr1(&[1.0, 2.0, 3.0])))
            .unwrap(),
    );
    let integrator = Arc::new(CountingIntegrator::new(0.1));
    let mut hmc = HamiltonianMcmc::static_metropolis(system.clone(), integrator.clone(), 4)
        .unwrap()
        .set_seed(3);
    let err = hmc
        .sample_chain(10, vec![0.0, 0.0], &[], &SampleOptions::default())
        .unwrap_err();
    assert!(matches!(err, McmcError::InvalidInitState(_)));
    let err = hmc
        .sample_chains(10, init_states(2), &[], 2, &SampleOptions::default())
        .unwrap_err();
    assert!(matches!(err, McmcError::InvalidInitState(_)));

    let mut method = MarkovChainMonteCarloMethod::new(vec![
        (
            "momentum".to_string(),
            Arc::new(IndependentMomentumTransition::new(system.clone())) as Arc<dyn Transition>,
        ),
        (
            INTEGRATION_TRANSITION.to_string(),
            Arc::new(IntegrationTransition::Static(
                MetropolisStaticIntegrationTransition::new(system, integrator.clone(), 4).unwrap(),
            )) as Arc<dyn Transition>,
        ),
    ])
    .unwrap();
    let state = ChainState::new(arr1(&[0.0, 0.0])).with_mom(arr1(&[0.5, -0.5]));
    let err = method
        .sample_chain(10, state, &[], &SampleOptions::default())
        .unwrap_err();
    assert!(matches!(err, McmcError::InvalidInitState(_)));
    assert_eq!(integrator.calls(), 0);
}

#[test]
fn test_static_integration_step_count() {
    let integrator = Arc::new(CountingIntegrator::new(0.1));
    let mut hmc = HamiltonianMcmc::static_metropolis(gaussian_system(), integrator.clone(), 5)
        .unwrap()
        .set_seed(1);
    let output = hmc
        .sample_chain(100, vec![0.3, -0.3], &[], &SampleOptions::default())
        .unwrap();
    assert_eq!(integrator.calls(), 500);
    let n_step = output.statistics[INTEGRATION_TRANSITION]["n_step"].to_owned();
    assert_eq!(n_step.sum(), 500.0);
}

#[test]
fn test_dynamic_step_statistic_matches_integrator_calls() {
    let integrator = Arc::new(CountingIntegrator::new(0.2));
    let mut hmc = HamiltonianMcmc::dynamic_multinomial(
        gaussian_system(),
        integrator.clone(),
        DynamicOptions::default(),
    )
    .unwrap()
    .set_seed(2);
    let output = hmc
        .sample_chain(50, vec![1.0, 1.0], &[], &SampleOptions::default())
        .unwrap();
    let n_step = output.statistics[INTEGRATION_TRANSITION]["n_step"].to_owned();
    assert_eq!(n_step.sum() as usize, integrator.calls());
}

#[test]
fn test_sequential_interrupt_keeps_partial_chain() {
    const N_SAMPLE: usize = 50;
    let interrupt = Interrupt::new();
    let trigger = TriggerAt {
        calls: Arc::new(AtomicUsize::new(0)),
        at: N_SAMPLE + 10,
        interrupt: interrupt.clone(),
    };
    let mut method = MarkovChainMonteCarloMethod::new(vec![(
        "trigger".to_string(),
        Arc::new(trigger) as Arc<dyn Transition>,
    )])
    .unwrap()
    .set_seed(4);
    let pos_trace = mini_hmc::sampler::trace_fn(|state: &ChainState| {
        std::collections::BTreeMap::from([("pos".to_string(), state.pos.clone().into_dyn())])
    });
    let options = SampleOptions::default().set_interrupt(interrupt.clone());

    let output = method
        .sample_chains(N_SAMPLE, init_states(3), &[pos_trace], 1, &options)
        .unwrap();
    assert!(output.interrupted);
    assert_eq!(output.chain_indices, vec![0, 1]);
    assert_eq!(output.final_states.len(), 2);
    let lengths: Vec<usize> = output.traces["pos"].iter().map(|t| t.len()).collect();
    assert_eq!(lengths, vec![N_SAMPLE, 10]);
    let calls = &output.statistics["trigger"]["call"];
    let lengths: Vec<usize> = calls.iter().map(|t| t.len()).collect();
    assert_eq!(lengths, vec![N_SAMPLE, 10]);
    assert_eq!(calls[1].view()[[9]], (N_SAMPLE + 10) as f64);
    assert!(!interrupt.is_triggered());
}

#[test]
fn test_single_chain_interrupted_before_start() {
    let interrupt = Interrupt::new();
    interrupt.trigger();
    let mut hmc = HamiltonianMcmc::static_metropolis(
        gaussian_system(),
        Arc::new(LeapfrogIntegrator::new(0.1)),
        3,
    )
    .unwrap();
    let options = SampleOptions::default().set_interrupt(interrupt.clone());
    let output = hmc.sample_chain(20, vec![0.0], &[], &options).unwrap();
    assert!(output.interrupted);
    assert_eq!(output.n_completed, 0);
    assert_eq!(output.traces["pos"].shape(), &[0, 1]);
    assert_eq!(
        output.statistics[INTEGRATION_TRANSITION]["accept_stat"].len(),
        0
    );
    assert!(!interrupt.is_triggered());
}

#[test]
fn test_transfer_limit_without_memmap() {
    let mut hmc = HamiltonianMcmc::static_metropolis(
        gaussian_system(),
        Arc::new(LeapfrogIntegrator::new(0.1)),
        3,
    )
    .unwrap();
    let options = SampleOptions::default().set_max_transfer_bytes(1_000);
    let err = hmc
        .sample_chains(1_000, init_states(2), &[], 2, &options)
        .unwrap_err();
    assert!(matches!(
        err,
        McmcError::TransferLimit { limit: 1_000, .. }
    ));

    // Sequential runs never move results between threads.
    let output = hmc
        .sample_chains(1_000, init_states(2), &[], 1, &options)
        .unwrap();
    assert_eq!(output.final_states.len(), 2);
}
