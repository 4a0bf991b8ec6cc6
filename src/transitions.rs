/*!
Markov transitions applied once per chain iteration.

A chain iteration of a Hamiltonian sampler is the composition of a momentum
transition, which leaves the conditional distribution of the momentum given
the position invariant, and an integration transition, which proposes a new
joint state by simulating the dynamics and decides whether to move there.

All transitions implement the object-safe [`Transition`] trait. The three
built-in integration policies are variants of [`IntegrationTransition`]:

- [`MetropolisStaticIntegrationTransition`]: a fixed number of steps.
- [`MetropolisRandomIntegrationTransition`]: a uniformly drawn number of steps.
- [`MultinomialDynamicIntegrationTransition`]: a trajectory grown by tree
  doubling until a no-U-turn criterion fires, with the next state drawn
  multinomially from the trajectory.
*/

use ndarray::Array1;
use rand::RngCore;
use rand_distr::{Distribution, Standard, Uniform};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{McmcError, Result};
use crate::integrators::Integrator;
use crate::state::{ChainState, StateVariable};
use crate::system::System;

/// Numeric kind of a per-iteration statistic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticKind {
    Float,
    Int,
    Bool,
}

/// A single statistic value emitted by a transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StatValue {
    Float(f64),
    Int(i64),
    Bool(bool),
}

impl StatValue {
    /// Value as stored in a statistics array.
    pub fn as_f64(&self) -> f64 {
        match *self {
            StatValue::Float(x) => x,
            StatValue::Int(n) => n as f64,
            StatValue::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

/// Declared kind and fill value of a statistic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatisticType {
    pub kind: StatisticKind,
    pub default: StatValue,
}

impl StatisticType {
    pub const fn float() -> Self {
        Self {
            kind: StatisticKind::Float,
            default: StatValue::Float(f64::NAN),
        }
    }

    pub const fn int() -> Self {
        Self {
            kind: StatisticKind::Int,
            default: StatValue::Int(-1),
        }
    }

    pub const fn boolean() -> Self {
        Self {
            kind: StatisticKind::Bool,
            default: StatValue::Bool(false),
        }
    }
}

/// Statistics emitted by one call of [`Transition::sample`].
pub type Statistics = BTreeMap<String, StatValue>;

/// A Markov transition operator.
pub trait Transition: Send + Sync {
    /// Fields of [`ChainState`] that [`Transition::sample`] reads.
    fn state_variables(&self) -> &[StateVariable];

    /// Statistics this transition may emit, with their kinds and fill values.
    fn statistic_types(&self) -> Vec<(&'static str, StatisticType)> {
        Vec::new()
    }

    /// Checks that `state` fits this transition beyond carrying its
    /// variables, for instance that its dimensions match the system.
    fn check_state(&self, _state: &ChainState) -> Result<()> {
        Ok(())
    }

    /// Samples the next state given the current one.
    fn sample(&self, state: ChainState, rng: &mut dyn RngCore) -> (ChainState, Option<Statistics>);
}

/// A transition that only updates the momentum of a Hamiltonian system.
pub trait MomentumTransition: Transition {
    /// The system whose conditional momentum distribution is left invariant.
    fn system(&self) -> &Arc<dyn System>;
}

fn uniform(rng: &mut dyn RngCore) -> f64 {
    Standard.sample(rng)
}

/// Resamples the momentum independently from its conditional distribution.
#[derive(Clone)]
pub struct IndependentMomentumTransition {
    system: Arc<dyn System>,
}

impl IndependentMomentumTransition {
    pub fn new(system: Arc<dyn System>) -> Self {
        Self { system }
    }
}

impl Transition for IndependentMomentumTransition {
    fn state_variables(&self) -> &[StateVariable] {
        &[StateVariable::Pos, StateVariable::Mom]
    }

    fn check_state(&self, state: &ChainState) -> Result<()> {
        self.system.check_state(state)
    }

    fn sample(
        &self,
        mut state: ChainState,
        rng: &mut dyn RngCore,
    ) -> (ChainState, Option<Statistics>) {
        state.mom = Some(self.system.sample_momentum(&state, rng));
        (state, None)
    }
}

impl MomentumTransition for IndependentMomentumTransition {
    fn system(&self) -> &Arc<dyn System> {
        &self.system
    }
}

/// Partially refreshes the momentum,
/// `mom' = damping · mom + √(1 - damping²) · fresh`.
///
/// `damping = 0` reduces to [`IndependentMomentumTransition`]; `damping = 1`
/// leaves the momentum untouched.
#[derive(Clone)]
pub struct CorrelatedMomentumTransition {
    system: Arc<dyn System>,
    damping: f64,
}

impl CorrelatedMomentumTransition {
    pub fn new(system: Arc<dyn System>, damping: f64) -> Result<Self> {
        if !(0.0..=1.0).contains(&damping) {
            return Err(McmcError::InvalidConfig(format!(
                "damping must lie in [0, 1], got {damping}"
            )));
        }
        Ok(Self { system, damping })
    }

    pub fn damping(&self) -> f64 {
        self.damping
    }
}

impl Transition for CorrelatedMomentumTransition {
    fn state_variables(&self) -> &[StateVariable] {
        &[StateVariable::Pos, StateVariable::Mom]
    }

    fn check_state(&self, state: &ChainState) -> Result<()> {
        self.system.check_state(state)
    }

    fn sample(
        &self,
        mut state: ChainState,
        rng: &mut dyn RngCore,
    ) -> (ChainState, Option<Statistics>) {
        let fresh = self.system.sample_momentum(&state, rng);
        let mut mom = state.mom().clone();
        mom *= self.damping;
        mom.scaled_add((1.0 - self.damping * self.damping).sqrt(), &fresh);
        state.mom = Some(mom);
        (state, None)
    }
}

impl MomentumTransition for CorrelatedMomentumTransition {
    fn system(&self) -> &Arc<dyn System> {
        &self.system
    }
}

const INTEGRATION_VARIABLES: &[StateVariable] =
    &[StateVariable::Pos, StateVariable::Mom, StateVariable::Dir];

fn metropolis_statistic_types() -> Vec<(&'static str, StatisticType)> {
    vec![
        ("accept_stat", StatisticType::float()),
        ("n_step", StatisticType::int()),
        ("integration_error", StatisticType::boolean()),
    ]
}

/// Shared Metropolis step for the static and random policies: integrate
/// `n_step` steps along `state.dir`, accept with probability
/// `min(1, exp(H₀ - H₁))`, and reverse the direction on rejection.
fn metropolis_integrate(
    system: &dyn System,
    integrator: &dyn Integrator,
    mut state: ChainState,
    n_step: usize,
    rng: &mut dyn RngCore,
) -> (ChainState, Statistics) {
    let h_init = system.h(&state);
    let mut proposal = Ok(state.clone());
    for _ in 0..n_step {
        proposal = proposal.and_then(|s| integrator.step(system, &s));
        if proposal.is_err() {
            break;
        }
    }

    let (accept_prob, proposal, integration_error) = match proposal {
        Ok(proposal) => {
            let delta = h_init - system.h(&proposal);
            let prob = if delta.is_nan() { 0.0 } else { delta.exp().min(1.0) };
            (prob, Some(proposal), false)
        }
        Err(_) => (0.0, None, true),
    };

    match proposal {
        Some(proposal) if uniform(rng) < accept_prob => state = proposal,
        _ => state.dir = -state.dir,
    }

    let mut stats = Statistics::new();
    stats.insert("accept_stat".to_string(), StatValue::Float(accept_prob));
    stats.insert("n_step".to_string(), StatValue::Int(n_step as i64));
    stats.insert(
        "integration_error".to_string(),
        StatValue::Bool(integration_error),
    );
    (state, stats)
}

/// Metropolis-adjusted integration with a fixed number of steps.
#[derive(Clone)]
pub struct MetropolisStaticIntegrationTransition {
    system: Arc<dyn System>,
    integrator: Arc<dyn Integrator>,
    n_step: usize,
}

impl MetropolisStaticIntegrationTransition {
    pub fn new(
        system: Arc<dyn System>,
        integrator: Arc<dyn Integrator>,
        n_step: usize,
    ) -> Result<Self> {
        if n_step == 0 {
            return Err(McmcError::InvalidConfig(
                "n_step must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            system,
            integrator,
            n_step,
        })
    }

    pub fn n_step(&self) -> usize {
        self.n_step
    }
}

impl Transition for MetropolisStaticIntegrationTransition {
    fn state_variables(&self) -> &[StateVariable] {
        INTEGRATION_VARIABLES
    }

    fn statistic_types(&self) -> Vec<(&'static str, StatisticType)> {
        metropolis_statistic_types()
    }

    fn check_state(&self, state: &ChainState) -> Result<()> {
        self.system.check_state(state)
    }

    fn sample(&self, state: ChainState, rng: &mut dyn RngCore) -> (ChainState, Option<Statistics>) {
        let (state, stats) = metropolis_integrate(
            self.system.as_ref(),
            self.integrator.as_ref(),
            state,
            self.n_step,
            rng,
        );
        (state, Some(stats))
    }
}

/// Metropolis-adjusted integration with the number of steps drawn uniformly
/// from `lower..upper` each iteration.
///
/// Randomizing the trajectory length avoids resonances with systems that
/// have a natural oscillation period.
#[derive(Clone)]
pub struct MetropolisRandomIntegrationTransition {
    system: Arc<dyn System>,
    integrator: Arc<dyn Integrator>,
    n_step_range: (usize, usize),
}

impl MetropolisRandomIntegrationTransition {
    /// `n_step_range` is `(lower, upper)` with `upper` exclusive.
    pub fn new(
        system: Arc<dyn System>,
        integrator: Arc<dyn Integrator>,
        n_step_range: (usize, usize),
    ) -> Result<Self> {
        let (lower, upper) = n_step_range;
        if lower == 0 || lower >= upper {
            return Err(McmcError::InvalidConfig(format!(
                "n_step_range must satisfy 1 <= lower < upper, got ({lower}, {upper})"
            )));
        }
        Ok(Self {
            system,
            integrator,
            n_step_range,
        })
    }

    pub fn n_step_range(&self) -> (usize, usize) {
        self.n_step_range
    }
}

impl Transition for MetropolisRandomIntegrationTransition {
    fn state_variables(&self) -> &[StateVariable] {
        INTEGRATION_VARIABLES
    }

    fn statistic_types(&self) -> Vec<(&'static str, StatisticType)> {
        metropolis_statistic_types()
    }

    fn check_state(&self, state: &ChainState) -> Result<()> {
        self.system.check_state(state)
    }

    fn sample(&self, state: ChainState, rng: &mut dyn RngCore) -> (ChainState, Option<Statistics>) {
        let (lower, upper) = self.n_step_range;
        let n_step = Uniform::new(lower, upper).sample(rng);
        let (state, stats) = metropolis_integrate(
            self.system.as_ref(),
            self.integrator.as_ref(),
            state,
            n_step,
            rng,
        );
        (state, Some(stats))
    }
}

/// Stopping rule for growing a dynamic trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminationCriterion {
    /// Generalized no-U-turn criterion on the summed momentum, valid for any
    /// metric.
    #[default]
    RiemannianNoUTurn,
    /// Original no-U-turn criterion on the position displacement between the
    /// trajectory ends.
    EuclideanNoUTurn,
}

impl TerminationCriterion {
    /// Returns `true` if the trajectory spanning `left` to `right` (in
    /// integration time) should stop growing.
    pub fn terminates(
        &self,
        system: &dyn System,
        left: &ChainState,
        right: &ChainState,
        sum_mom: &Array1<f64>,
    ) -> bool {
        match self {
            TerminationCriterion::RiemannianNoUTurn => {
                system.dh_dmom(left).dot(sum_mom) < 0.0 || system.dh_dmom(right).dot(sum_mom) < 0.0
            }
            TerminationCriterion::EuclideanNoUTurn => {
                let displacement = &right.pos - &left.pos;
                left.mom().dot(&displacement) < 0.0 || right.mom().dot(&displacement) < 0.0
            }
        }
    }
}

/// Settings of [`MultinomialDynamicIntegrationTransition`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicOptions {
    /// Maximum number of tree doublings per iteration.
    pub max_tree_depth: usize,
    /// Energy error above which a step is treated as diverging.
    pub max_delta_h: f64,
    pub termination_criterion: TerminationCriterion,
    /// Also check the termination criterion on the subtrees spanning the
    /// junction of two merged subtrees.
    pub do_extra_subtree_checks: bool,
}

impl Default for DynamicOptions {
    fn default() -> Self {
        Self {
            max_tree_depth: 10,
            max_delta_h: 1000.0,
            termination_criterion: TerminationCriterion::default(),
            do_extra_subtree_checks: true,
        }
    }
}

impl DynamicOptions {
    pub fn set_max_tree_depth(mut self, max_tree_depth: usize) -> Self {
        self.max_tree_depth = max_tree_depth;
        self
    }

    pub fn set_max_delta_h(mut self, max_delta_h: f64) -> Self {
        self.max_delta_h = max_delta_h;
        self
    }

    pub fn set_termination_criterion(mut self, criterion: TerminationCriterion) -> Self {
        self.termination_criterion = criterion;
        self
    }

    pub fn set_extra_subtree_checks(mut self, enabled: bool) -> Self {
        self.do_extra_subtree_checks = enabled;
        self
    }
}

/// A fully built subtree of a dynamic trajectory.
struct Subtree {
    /// Earliest state in integration time.
    left: ChainState,
    /// Latest state in integration time.
    right: ChainState,
    /// Sum of momenta over all leaves.
    sum_mom: Array1<f64>,
    /// `log Σ exp(H₀ - H)` over all leaves.
    log_weight: f64,
    proposal: ChainState,
}

/// Running counters for one dynamic transition.
#[derive(Default)]
struct TreeStats {
    n_step: usize,
    sum_accept_prob: f64,
    diverging: bool,
}

fn log_sum_exp(a: f64, b: f64) -> f64 {
    let max = a.max(b);
    if max == f64::NEG_INFINITY {
        f64::NEG_INFINITY
    } else {
        max + ((a - max).exp() + (b - max).exp()).ln()
    }
}

/// Dynamic integration with multinomial sampling from the trajectory.
///
/// Each iteration doubles a binary tree of states forward or backward in time
/// (direction chosen uniformly) until the termination criterion fires on the
/// whole trajectory or one of its subtrees, a step diverges, or
/// `max_tree_depth` doublings were made. Within a subtree the proposal is
/// chosen with probability proportional to `exp(-H)`; when a new subtree is
/// merged into the trajectory its proposal replaces the current one with
/// probability `min(1, w_subtree / w_trajectory)`, favouring states far from
/// the starting point.
#[derive(Clone)]
pub struct MultinomialDynamicIntegrationTransition {
    system: Arc<dyn System>,
    integrator: Arc<dyn Integrator>,
    options: DynamicOptions,
}

impl MultinomialDynamicIntegrationTransition {
    pub fn new(
        system: Arc<dyn System>,
        integrator: Arc<dyn Integrator>,
        options: DynamicOptions,
    ) -> Result<Self> {
        if options.max_tree_depth == 0 {
            return Err(McmcError::InvalidConfig(
                "max_tree_depth must be at least 1".to_string(),
            ));
        }
        if options.max_delta_h.is_nan() || options.max_delta_h <= 0.0 {
            return Err(McmcError::InvalidConfig(format!(
                "max_delta_h must be positive, got {}",
                options.max_delta_h
            )));
        }
        Ok(Self {
            system,
            integrator,
            options,
        })
    }

    pub fn options(&self) -> &DynamicOptions {
        &self.options
    }

    fn terminates(&self, left: &ChainState, right: &ChainState, sum_mom: &Array1<f64>) -> bool {
        self.options
            .termination_criterion
            .terminates(self.system.as_ref(), left, right, sum_mom)
    }

    /// Builds a subtree of `2^depth` leaves starting one step beyond `edge`
    /// in direction `edge.dir`. Returns `None` if the subtree terminated or
    /// diverged, in which case none of its states may be used.
    fn build_tree(
        &self,
        depth: usize,
        edge: &ChainState,
        h_init: f64,
        stats: &mut TreeStats,
        rng: &mut dyn RngCore,
    ) -> Option<Subtree> {
        if depth == 0 {
            return self.build_leaf(edge, h_init, stats);
        }
        let inner = self.build_tree(depth - 1, edge, h_init, stats, rng)?;
        let outer_edge = if edge.dir > 0 { &inner.right } else { &inner.left };
        let outer = self.build_tree(depth - 1, outer_edge, h_init, stats, rng)?;

        let (left, right) = if edge.dir > 0 {
            (&inner, &outer)
        } else {
            (&outer, &inner)
        };
        let sum_mom = &inner.sum_mom + &outer.sum_mom;
        if self.terminates(&left.left, &right.right, &sum_mom) {
            return None;
        }
        if self.options.do_extra_subtree_checks {
            let left_sum = &left.sum_mom + right.left.mom();
            if self.terminates(&left.left, &right.left, &left_sum) {
                return None;
            }
            let right_sum = &right.sum_mom + left.right.mom();
            if self.terminates(&left.right, &right.right, &right_sum) {
                return None;
            }
        }

        let log_weight = log_sum_exp(inner.log_weight, outer.log_weight);
        let take_outer = uniform(rng) < (outer.log_weight - log_weight).exp();
        let (left_state, right_state) = if edge.dir > 0 {
            (inner.left, outer.right)
        } else {
            (outer.left, inner.right)
        };
        Some(Subtree {
            left: left_state,
            right: right_state,
            sum_mom,
            log_weight,
            proposal: if take_outer {
                outer.proposal
            } else {
                inner.proposal
            },
        })
    }

    fn build_leaf(&self, edge: &ChainState, h_init: f64, stats: &mut TreeStats) -> Option<Subtree> {
        stats.n_step += 1;
        let state = match self.integrator.step(self.system.as_ref(), edge) {
            Ok(state) => state,
            Err(_) => {
                stats.diverging = true;
                return None;
            }
        };
        let h = self.system.h(&state);
        if h.is_nan() || (h - h_init).abs() > self.options.max_delta_h {
            stats.diverging = true;
            return None;
        }
        let log_weight = h_init - h;
        stats.sum_accept_prob += log_weight.exp().min(1.0);
        Some(Subtree {
            left: state.clone(),
            right: state.clone(),
            sum_mom: state.mom().clone(),
            log_weight,
            proposal: state,
        })
    }
}

impl Transition for MultinomialDynamicIntegrationTransition {
    fn state_variables(&self) -> &[StateVariable] {
        INTEGRATION_VARIABLES
    }

    fn statistic_types(&self) -> Vec<(&'static str, StatisticType)> {
        vec![
            ("accept_stat", StatisticType::float()),
            ("n_step", StatisticType::int()),
            ("tree_depth", StatisticType::int()),
            ("diverging", StatisticType::boolean()),
        ]
    }

    fn check_state(&self, state: &ChainState) -> Result<()> {
        self.system.check_state(state)
    }

    fn sample(&self, state: ChainState, rng: &mut dyn RngCore) -> (ChainState, Option<Statistics>) {
        let h_init = self.system.h(&state);
        let mut left = state.clone();
        left.dir = -1;
        let mut right = state.clone();
        right.dir = 1;
        let mut sum_mom = state.mom().clone();
        let mut log_weight = 0.0;
        let mut proposal = state;
        let mut stats = TreeStats::default();
        let mut tree_depth = 0;

        while tree_depth < self.options.max_tree_depth {
            let forward = uniform(rng) < 0.5;
            let edge = if forward { &right } else { &left };
            let subtree = match self.build_tree(tree_depth, edge, h_init, &mut stats, rng) {
                Some(subtree) => subtree,
                None => break,
            };
            tree_depth += 1;

            // Biased progressive sampling towards the new subtree.
            if uniform(rng) < (subtree.log_weight - log_weight).exp() {
                proposal = subtree.proposal;
            }
            log_weight = log_sum_exp(log_weight, subtree.log_weight);
            sum_mom += &subtree.sum_mom;
            if forward {
                right = subtree.right;
            } else {
                left = subtree.left;
            }
            if self.terminates(&left, &right, &sum_mom) {
                break;
            }
        }

        let accept_stat = if stats.n_step > 0 {
            stats.sum_accept_prob / stats.n_step as f64
        } else {
            0.0
        };
        proposal.dir = 1;

        let mut out = Statistics::new();
        out.insert("accept_stat".to_string(), StatValue::Float(accept_stat));
        out.insert("n_step".to_string(), StatValue::Int(stats.n_step as i64));
        out.insert("tree_depth".to_string(), StatValue::Int(tree_depth as i64));
        out.insert("diverging".to_string(), StatValue::Bool(stats.diverging));
        (proposal, Some(out))
    }
}

/// The built-in integration policies behind one [`Transition`] interface.
#[derive(Clone)]
pub enum IntegrationTransition {
    Static(MetropolisStaticIntegrationTransition),
    Random(MetropolisRandomIntegrationTransition),
    Dynamic(MultinomialDynamicIntegrationTransition),
}

impl IntegrationTransition {
    fn inner(&self) -> &dyn Transition {
        match self {
            IntegrationTransition::Static(t) => t,
            IntegrationTransition::Random(t) => t,
            IntegrationTransition::Dynamic(t) => t,
        }
    }

    pub fn system(&self) -> &Arc<dyn System> {
        match self {
            IntegrationTransition::Static(t) => &t.system,
            IntegrationTransition::Random(t) => &t.system,
            IntegrationTransition::Dynamic(t) => &t.system,
        }
    }

    pub fn integrator(&self) -> &Arc<dyn Integrator> {
        match self {
            IntegrationTransition::Static(t) => &t.integrator,
            IntegrationTransition::Random(t) => &t.integrator,
            IntegrationTransition::Dynamic(t) => &t.integrator,
        }
    }
}

impl Transition for IntegrationTransition {
    fn state_variables(&self) -> &[StateVariable] {
        self.inner().state_variables()
    }

    fn statistic_types(&self) -> Vec<(&'static str, StatisticType)> {
        self.inner().statistic_types()
    }

    fn check_state(&self, state: &ChainState) -> Result<()> {
        self.inner().check_state(state)
    }

    fn sample(&self, state: ChainState, rng: &mut dyn RngCore) -> (ChainState, Option<Statistics>) {
        self.inner().sample(state, rng)
    }
}
