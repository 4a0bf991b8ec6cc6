/*!
Hamiltonian Monte Carlo built from a momentum transition followed by an
integration transition.

Every iteration first updates the momentum (by default resampling it
independently) and then simulates the Hamiltonian dynamics with the chosen
integration policy:

- [`HamiltonianMcmc::static_metropolis`]: fixed number of integrator steps
  with a Metropolis accept step.
- [`HamiltonianMcmc::random_metropolis`]: number of steps drawn uniformly per
  iteration.
- [`HamiltonianMcmc::dynamic_multinomial`]: trajectory length chosen by a
  no-U-turn criterion, next state drawn multinomially from the trajectory.

# Example

```rust
use mini_hmc::distributions::Rosenbrock2D;
use mini_hmc::hmc::HamiltonianMcmc;
use mini_hmc::integrators::LeapfrogIntegrator;
use mini_hmc::sampler::SampleOptions;
use mini_hmc::system::EuclideanMetricSystem;
use mini_hmc::transitions::DynamicOptions;
use std::sync::Arc;

let system = Arc::new(EuclideanMetricSystem::new(Rosenbrock2D { a: 1.0, b: 5.0 }));
let integrator = Arc::new(LeapfrogIntegrator::new(0.05));
let mut hmc = HamiltonianMcmc::dynamic_multinomial(system, integrator, DynamicOptions::default())
    .unwrap()
    .set_seed(7);
let init_states = vec![vec![0.0, 0.0].into(), vec![1.0, 1.0].into()];
let output = hmc
    .sample_chains(100, init_states, &[], 2, &SampleOptions::default())
    .unwrap();
assert_eq!(output.traces["pos"].len(), 2);
assert_eq!(output.statistics["integration_transition"]["tree_depth"][0].len(), 100);
```
*/

use ndarray::arr0;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{McmcError, Result};
use crate::integrators::Integrator;
use crate::sampler::{
    trace_fn, ChainOutput, ChainsOutput, MarkovChainMonteCarloMethod, NamedTransition,
    SampleOptions, TraceFn,
};
use crate::state::{ChainState, InitState, StateVariable};
use crate::system::System;
use crate::transitions::{
    DynamicOptions, IndependentMomentumTransition, IntegrationTransition,
    MetropolisRandomIntegrationTransition, MetropolisStaticIntegrationTransition,
    MomentumTransition, MultinomialDynamicIntegrationTransition, Transition,
};

/// Name under which the momentum transition's statistics are recorded.
pub const MOMENTUM_TRANSITION: &str = "momentum_transition";
/// Name under which the integration transition's statistics are recorded.
pub const INTEGRATION_TRANSITION: &str = "integration_transition";

/// Trace function recording the position (`pos`) and the total energy
/// (`hamiltonian`) after every iteration.
pub fn default_trace_fn(system: Arc<dyn System>) -> TraceFn {
    trace_fn(move |state: &ChainState| {
        BTreeMap::from([
            ("pos".to_string(), state.pos.clone().into_dyn()),
            ("hamiltonian".to_string(), arr0(system.h(state)).into_dyn()),
        ])
    })
}

/// A Hamiltonian Monte Carlo sampler.
pub struct HamiltonianMcmc {
    system: Arc<dyn System>,
    momentum_transition: Arc<dyn MomentumTransition>,
    integration_transition: Arc<IntegrationTransition>,
    method: MarkovChainMonteCarloMethod,
}

impl HamiltonianMcmc {
    /// Creates a sampler around `integration_transition`, with independent
    /// momentum resampling.
    pub fn new(integration_transition: IntegrationTransition) -> Result<Self> {
        let system = integration_transition.system().clone();
        let momentum = Arc::new(IndependentMomentumTransition::new(system.clone()));
        let integration_transition = Arc::new(integration_transition);
        let transitions: Vec<NamedTransition> = vec![
            (
                MOMENTUM_TRANSITION.to_string(),
                momentum.clone() as Arc<dyn Transition>,
            ),
            (
                INTEGRATION_TRANSITION.to_string(),
                integration_transition.clone() as Arc<dyn Transition>,
            ),
        ];
        Ok(Self {
            system,
            momentum_transition: momentum,
            integration_transition,
            method: MarkovChainMonteCarloMethod::new(transitions)?,
        })
    }

    /// Metropolis-adjusted HMC with `n_step` integrator steps per iteration.
    pub fn static_metropolis(
        system: Arc<dyn System>,
        integrator: Arc<dyn Integrator>,
        n_step: usize,
    ) -> Result<Self> {
        let transition = MetropolisStaticIntegrationTransition::new(system, integrator, n_step)?;
        Self::new(IntegrationTransition::Static(transition))
    }

    /// Metropolis-adjusted HMC with the number of steps drawn uniformly from
    /// `n_step_range.0..n_step_range.1` every iteration.
    pub fn random_metropolis(
        system: Arc<dyn System>,
        integrator: Arc<dyn Integrator>,
        n_step_range: (usize, usize),
    ) -> Result<Self> {
        let transition =
            MetropolisRandomIntegrationTransition::new(system, integrator, n_step_range)?;
        Self::new(IntegrationTransition::Random(transition))
    }

    /// Dynamic HMC with multinomial sampling from the trajectory.
    pub fn dynamic_multinomial(
        system: Arc<dyn System>,
        integrator: Arc<dyn Integrator>,
        options: DynamicOptions,
    ) -> Result<Self> {
        let transition = MultinomialDynamicIntegrationTransition::new(system, integrator, options)?;
        Self::new(IntegrationTransition::Dynamic(transition))
    }

    /// Replaces the momentum transition.
    ///
    /// The new transition must target the same system instance and read the
    /// momentum.
    pub fn with_momentum_transition<M>(mut self, momentum_transition: M) -> Result<Self>
    where
        M: MomentumTransition + 'static,
    {
        if !Arc::ptr_eq(momentum_transition.system(), &self.system) {
            return Err(McmcError::IncompatibleMomentumTransition(
                "momentum transition targets a different system".to_string(),
            ));
        }
        if !momentum_transition
            .state_variables()
            .contains(&StateVariable::Mom)
        {
            return Err(McmcError::IncompatibleMomentumTransition(
                "momentum transition does not update `mom`".to_string(),
            ));
        }
        let momentum_transition = Arc::new(momentum_transition);
        self.method.transitions_mut()[0] = (
            MOMENTUM_TRANSITION.to_string(),
            momentum_transition.clone() as Arc<dyn Transition>,
        );
        self.momentum_transition = momentum_transition;
        Ok(self)
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.method = self.method.set_seed(seed);
        self
    }

    pub fn system(&self) -> &Arc<dyn System> {
        &self.system
    }

    pub fn integrator(&self) -> &Arc<dyn Integrator> {
        self.integration_transition.integrator()
    }

    pub fn momentum_transition(&self) -> &Arc<dyn MomentumTransition> {
        &self.momentum_transition
    }

    pub fn integration_transition(&self) -> &IntegrationTransition {
        &self.integration_transition
    }

    pub fn method(&self) -> &MarkovChainMonteCarloMethod {
        &self.method
    }

    /// Converts an initial state, drawing a momentum from the system if none
    /// is given.
    fn prepare_state(&mut self, init_state: InitState) -> Result<ChainState> {
        let mut state = ChainState::try_from(init_state)?;
        self.system.check_state(&state)?;
        if state.mom.is_none() {
            let mom = self.system.sample_momentum(&state, self.method.rng_mut());
            state.mom = Some(mom);
        }
        self.method.validate_state(&state)?;
        Ok(state)
    }

    fn trace_funcs_or_default(&self, trace_funcs: &[TraceFn]) -> Vec<TraceFn> {
        if trace_funcs.is_empty() {
            vec![default_trace_fn(self.system.clone())]
        } else {
            trace_funcs.to_vec()
        }
    }

    /// Runs one chain; see [`MarkovChainMonteCarloMethod::sample_chain`].
    ///
    /// An empty `trace_funcs` records [`default_trace_fn`].
    pub fn sample_chain(
        &mut self,
        n_sample: usize,
        init_state: impl Into<InitState>,
        trace_funcs: &[TraceFn],
        options: &SampleOptions,
    ) -> Result<ChainOutput> {
        let state = self.prepare_state(init_state.into())?;
        let trace_funcs = self.trace_funcs_or_default(trace_funcs);
        self.method
            .sample_prepared_chain(n_sample, state, &trace_funcs, options)
    }

    /// Runs one chain per initial state; see
    /// [`MarkovChainMonteCarloMethod::sample_chains`].
    ///
    /// Missing momenta are drawn in chain order before any chain starts. An
    /// empty `trace_funcs` records [`default_trace_fn`].
    pub fn sample_chains(
        &mut self,
        n_sample: usize,
        init_states: Vec<InitState>,
        trace_funcs: &[TraceFn],
        n_process: usize,
        options: &SampleOptions,
    ) -> Result<ChainsOutput> {
        let states = init_states
            .into_iter()
            .map(|init| self.prepare_state(init))
            .collect::<Result<Vec<_>>>()?;
        let trace_funcs = self.trace_funcs_or_default(trace_funcs);
        self.method
            .sample_prepared_chains(n_sample, states, &trace_funcs, n_process, options)
    }
}
