/*!
Chain drivers shared by every sampler built from [`Transition`]s.

[`MarkovChainMonteCarloMethod`] holds an ordered list of named transitions
and runs them, one after the other, for every iteration of a chain. After
each iteration the caller-supplied trace functions are evaluated and their
values, together with the statistics the transitions emit, are written into
preallocated buffers.

- [`MarkovChainMonteCarloMethod::sample_chain`] runs one chain.
- [`MarkovChainMonteCarloMethod::sample_chains`] runs several chains,
  sequentially or on a pool of worker threads.

Traces are kept in memory unless [`SampleOptions::memmap_dir`] is set, in
which case every buffer is a memory-mapped file in that directory (see
[`crate::persist`]).

# Interrupts

Setting [`SampleOptions::interrupt`] lets another thread stop sampling. A
running chain notices the interrupt before its next iteration and keeps the
iterations already completed. With several chains run sequentially, chains
that have not started yet are skipped. With worker threads, chains that have
finished are kept and chains still running are dropped, together with their
files.
*/

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ndarray::{arr0, ArrayD};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::ThreadPoolBuilder;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::error::{McmcError, Result};
use crate::interrupt::Interrupt;
use crate::persist::{
    allocate, stats_file_name, trace_file_name, ResizableArray, StoredArray, TraceArray,
};
use crate::state::{ChainState, InitState};
use crate::stats::AcceptanceTracker;
use crate::transitions::{StatValue, StatisticType, Statistics, Transition};

/// Maps a chain state to named arrays to record at every iteration.
pub type TraceFn = Arc<dyn Fn(&ChainState) -> BTreeMap<String, ArrayD<f64>> + Send + Sync>;

/// A transition together with the name its statistics are recorded under.
pub type NamedTransition = (String, Arc<dyn Transition>);

/// Wraps a closure into a [`TraceFn`].
pub fn trace_fn<F>(f: F) -> TraceFn
where
    F: Fn(&ChainState) -> BTreeMap<String, ArrayD<f64>> + Send + Sync + 'static,
{
    Arc::new(f)
}

const UPDATE_INTERVAL: Duration = Duration::from_millis(500);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Options shared by the single- and multi-chain drivers.
#[derive(Debug, Clone)]
pub struct SampleOptions {
    /// Directory for memory-mapped trace files; traces stay in memory if
    /// `None`.
    pub memmap_dir: Option<PathBuf>,
    /// Show one progress bar per chain.
    pub display_progress: bool,
    /// Index used to name the files of a single chain.
    pub chain_index: usize,
    /// Token checked before every iteration.
    pub interrupt: Option<Interrupt>,
    /// Upper bound on the estimated in-memory result size of one chain when
    /// chains run on worker threads without memory mapping.
    pub max_transfer_bytes: u64,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            memmap_dir: None,
            display_progress: false,
            chain_index: 0,
            interrupt: None,
            max_transfer_bytes: i32::MAX as u64,
        }
    }
}

impl SampleOptions {
    pub fn set_memmap_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.memmap_dir = Some(dir.into());
        self
    }

    pub fn set_display_progress(mut self, display: bool) -> Self {
        self.display_progress = display;
        self
    }

    pub fn set_chain_index(mut self, chain_index: usize) -> Self {
        self.chain_index = chain_index;
        self
    }

    pub fn set_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    pub fn set_max_transfer_bytes(mut self, bytes: u64) -> Self {
        self.max_transfer_bytes = bytes;
        self
    }
}

/// Result of [`MarkovChainMonteCarloMethod::sample_chain`].
#[derive(Debug)]
pub struct ChainOutput {
    /// State after the last completed iteration.
    pub final_state: ChainState,
    /// Trace arrays keyed by trace name, shape `[n_completed, ..]`.
    pub traces: BTreeMap<String, TraceArray>,
    /// Statistic arrays keyed by transition name, then statistic name.
    pub statistics: BTreeMap<String, BTreeMap<String, TraceArray>>,
    pub n_completed: usize,
    pub interrupted: bool,
}

/// Result of [`MarkovChainMonteCarloMethod::sample_chains`].
///
/// Every vector holds one entry per returned chain, in chain order.
#[derive(Debug, Default)]
pub struct ChainsOutput {
    pub final_states: Vec<ChainState>,
    pub traces: BTreeMap<String, Vec<TraceArray>>,
    pub statistics: BTreeMap<String, BTreeMap<String, Vec<TraceArray>>>,
    /// Indices of the returned chains among the initial states.
    pub chain_indices: Vec<usize>,
    pub interrupted: bool,
}

impl ChainsOutput {
    fn push(&mut self, chain_index: usize, output: ChainOutput) {
        self.chain_indices.push(chain_index);
        self.final_states.push(output.final_state);
        for (key, trace) in output.traces {
            self.traces.entry(key).or_default().push(trace);
        }
        for (transition, stats) in output.statistics {
            let entry = self.statistics.entry(transition).or_default();
            for (key, stat) in stats {
                entry.entry(key).or_default().push(stat);
            }
        }
    }
}

/// Runs chains of a fixed sequence of named transitions.
pub struct MarkovChainMonteCarloMethod {
    transitions: Vec<NamedTransition>,
    rng: SmallRng,
}

impl MarkovChainMonteCarloMethod {
    /// Creates a method applying `transitions` in the given order.
    ///
    /// Transition names must be unique.
    pub fn new(transitions: Vec<NamedTransition>) -> Result<Self> {
        let mut names = BTreeSet::new();
        for (name, _) in &transitions {
            if !names.insert(name.as_str()) {
                return Err(McmcError::InvalidConfig(format!(
                    "duplicate transition name `{name}`"
                )));
            }
        }
        Ok(Self {
            transitions,
            rng: SmallRng::from_entropy(),
        })
    }

    /// Seeds the generator all chain generators are derived from.
    pub fn set_seed(mut self, seed: u64) -> Self {
        self.rng = SmallRng::seed_from_u64(seed);
        self
    }

    pub fn transitions(&self) -> &[NamedTransition] {
        &self.transitions
    }

    pub(crate) fn transitions_mut(&mut self) -> &mut Vec<NamedTransition> {
        &mut self.transitions
    }

    pub(crate) fn rng_mut(&mut self) -> &mut SmallRng {
        &mut self.rng
    }

    /// Checks that `state` carries every variable the transitions read and
    /// that each transition accepts its dimensions.
    pub fn validate_state(&self, state: &ChainState) -> Result<()> {
        for (name, transition) in &self.transitions {
            for &variable in transition.state_variables() {
                if !state.has(variable) {
                    return Err(McmcError::MissingStateVariable {
                        variable,
                        transition: name.clone(),
                    });
                }
            }
            transition.check_state(state)?;
        }
        Ok(())
    }

    fn prepare_state(&self, init_state: InitState) -> Result<ChainState> {
        let state = ChainState::try_from(init_state)?;
        self.validate_state(&state)?;
        Ok(state)
    }

    /**
    Runs one chain for `n_sample` iterations from `init_state`.

    Fails before any iteration if the initial state lacks a variable required
    by one of the transitions. If the interrupt in `options` is triggered the
    chain stops early; the returned arrays then hold the completed
    iterations only and `interrupted` is set.

    # Examples

    ```rust
    use mini_hmc::distributions::IsotropicGaussian;
    use mini_hmc::hmc::HamiltonianMcmc;
    use mini_hmc::integrators::LeapfrogIntegrator;
    use mini_hmc::sampler::SampleOptions;
    use mini_hmc::system::EuclideanMetricSystem;
    use std::sync::Arc;

    let system = Arc::new(EuclideanMetricSystem::new(IsotropicGaussian::new(1.0)));
    let integrator = Arc::new(LeapfrogIntegrator::new(0.2));
    let mut hmc = HamiltonianMcmc::static_metropolis(system, integrator, 10)
        .unwrap()
        .set_seed(42);
    let output = hmc
        .sample_chain(50, vec![1.0, -1.0], &[], &SampleOptions::default())
        .unwrap();
    assert_eq!(output.traces["pos"].shape(), &[50, 2]);
    ```
    */
    pub fn sample_chain(
        &mut self,
        n_sample: usize,
        init_state: impl Into<InitState>,
        trace_funcs: &[TraceFn],
        options: &SampleOptions,
    ) -> Result<ChainOutput> {
        let state = self.prepare_state(init_state.into())?;
        self.sample_prepared_chain(n_sample, state, trace_funcs, options)
    }

    pub(crate) fn sample_prepared_chain(
        &mut self,
        n_sample: usize,
        state: ChainState,
        trace_funcs: &[TraceFn],
        options: &SampleOptions,
    ) -> Result<ChainOutput> {
        if let Some(dir) = &options.memmap_dir {
            fs::create_dir_all(dir)?;
        }
        let rng = SmallRng::from_rng(&mut self.rng)?;
        let progress = options.display_progress.then(|| {
            let pb = ProgressBar::new(n_sample as u64);
            pb.set_prefix(format!("Chain {}", options.chain_index));
            pb.set_style(progress_style());
            pb
        });
        let job = ChainJob {
            chain_index: options.chain_index,
            n_sample,
            state,
            rng,
            transitions: self.transitions.clone(),
            trace_funcs: trace_funcs.to_vec(),
            memmap_dir: options.memmap_dir.clone(),
            progress,
        };
        let stop = options.interrupt.clone().unwrap_or_default();
        let run = run_chain(job, &stop)?;
        if run.interrupted {
            stop.reset();
        }
        run.load()
    }

    /**
    Runs one chain per initial state, on `n_process` worker threads.

    Every chain gets its own generator, derived from the method's generator
    in chain order before any chain starts, so the per-chain results do not
    depend on `n_process`.

    With `n_process == 1` chains run one after the other on the calling
    thread. Otherwise a thread pool runs them and the calling thread waits
    for results, watching the interrupt in `options`.

    Without memory mapping, a parallel run first checks that the estimated
    size of a single chain's results stays within
    [`SampleOptions::max_transfer_bytes`].
    */
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
        self.sample_prepared_chains(n_sample, states, trace_funcs, n_process, options)
    }

    pub(crate) fn sample_prepared_chains(
        &mut self,
        n_sample: usize,
        states: Vec<ChainState>,
        trace_funcs: &[TraceFn],
        n_process: usize,
        options: &SampleOptions,
    ) -> Result<ChainsOutput> {
        if states.is_empty() {
            return Err(McmcError::InvalidConfig(
                "at least one initial state is required".to_string(),
            ));
        }
        if n_process == 0 {
            return Err(McmcError::InvalidConfig(
                "n_process must be at least 1".to_string(),
            ));
        }
        if n_process > 1 && options.memmap_dir.is_none() {
            self.check_transfer_limit(n_sample, &states, trace_funcs, options.max_transfer_bytes)?;
        }
        if let Some(dir) = &options.memmap_dir {
            fs::create_dir_all(dir)?;
        }

        let n_chain = states.len();
        let rngs = (0..n_chain)
            .map(|_| SmallRng::from_rng(&mut self.rng))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        debug!(n_chain, n_process, "Derived per-chain generators");

        let multi = options.display_progress.then(MultiProgress::new);
        let jobs: Vec<ChainJob> = states
            .into_iter()
            .zip(rngs)
            .enumerate()
            .map(|(chain_index, (state, rng))| {
                let progress = multi.as_ref().map(|multi| {
                    let pb = multi.add(ProgressBar::new(n_sample as u64));
                    pb.set_prefix(format!("Chain {chain_index}"));
                    pb.set_style(progress_style());
                    pb
                });
                ChainJob {
                    chain_index,
                    n_sample,
                    state,
                    rng,
                    transitions: self.transitions.clone(),
                    trace_funcs: trace_funcs.to_vec(),
                    memmap_dir: options.memmap_dir.clone(),
                    progress,
                }
            })
            .collect();

        let (runs, interrupted) = if n_process == 1 {
            run_sequential(jobs, options)?
        } else {
            run_parallel(jobs, n_process, options)?
        };

        let mut output = ChainsOutput {
            interrupted,
            ..ChainsOutput::default()
        };
        for run in runs {
            let chain_index = run.chain_index;
            output.push(chain_index, run.load()?);
        }
        Ok(output)
    }

    fn check_transfer_limit(
        &self,
        n_sample: usize,
        states: &[ChainState],
        trace_funcs: &[TraceFn],
        limit: u64,
    ) -> Result<()> {
        let n_stats: usize = self
            .transitions
            .iter()
            .map(|(_, t)| t.statistic_types().len())
            .sum();
        for state in states {
            let values = evaluate_traces(trace_funcs, state)?;
            let per_row = values.values().map(|v| v.len()).sum::<usize>() + n_stats;
            let required = (n_sample as u64)
                .saturating_mul(per_row as u64)
                .saturating_mul(std::mem::size_of::<f64>() as u64);
            if required > limit {
                return Err(McmcError::TransferLimit { required, limit });
            }
        }
        Ok(())
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("{prefix} [{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
        .expect("Expecting a valid progress bar template")
        .progress_chars("##-")
}

fn run_sequential(jobs: Vec<ChainJob>, options: &SampleOptions) -> Result<(Vec<ChainRun>, bool)> {
    let stop = options.interrupt.clone().unwrap_or_default();
    let mut runs: Vec<ChainRun> = Vec::with_capacity(jobs.len());
    for job in jobs {
        let run = match run_chain(job, &stop) {
            Ok(run) => run,
            Err(e) => {
                discard_runs(runs);
                return Err(e);
            }
        };
        let interrupted = run.interrupted;
        runs.push(run);
        if interrupted {
            warn!(
                n_complete = runs.len() - 1,
                "Sampling interrupted; returning completed chains and the partial chain"
            );
            stop.reset();
            return Ok((runs, true));
        }
    }
    Ok((runs, false))
}

fn run_parallel(
    jobs: Vec<ChainJob>,
    n_process: usize,
    options: &SampleOptions,
) -> Result<(Vec<ChainRun>, bool)> {
    let n_chain = jobs.len();
    let pool = ThreadPoolBuilder::new()
        .num_threads(n_process)
        .thread_name(|i| format!("mini-hmc-chain-{i}"))
        .build()?;
    debug!(n_process, "Started chain worker pool");

    // Workers only ever see this private flag, never the caller's interrupt.
    let abort = Interrupt::new();
    let (tx, rx) = mpsc::channel();
    for job in jobs {
        let tx = tx.clone();
        let abort = abort.clone();
        pool.spawn(move || {
            let chain_index = job.chain_index;
            let result = run_chain(job, &abort);
            let _ = tx.send((chain_index, result));
        });
    }
    drop(tx);

    let mut results: Vec<Option<ChainRun>> = (0..n_chain).map(|_| None).collect();
    let mut first_error: Option<McmcError> = None;
    let mut user_interrupted = false;
    let mut received = 0;
    while received < n_chain {
        if let Some(interrupt) = &options.interrupt {
            if interrupt.is_triggered() && !abort.is_triggered() {
                warn!("Interrupt received; stopping running chains");
                user_interrupted = true;
                abort.trigger();
            }
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok((chain_index, Ok(run))) => {
                received += 1;
                results[chain_index] = Some(run);
            }
            Ok((_, Err(e))) => {
                received += 1;
                abort.trigger();
                first_error.get_or_insert(e);
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if first_error.is_none() && received < n_chain {
        let missing = results.iter().position(Option::is_none);
        first_error = Some(McmcError::WorkerFailed(missing));
    }
    if let Some(e) = first_error {
        discard_runs(results.into_iter().flatten());
        return Err(e);
    }

    let mut runs = Vec::with_capacity(n_chain);
    let mut discarded = Vec::new();
    for run in results.into_iter().flatten() {
        if user_interrupted && run.interrupted {
            discarded.push(run);
        } else {
            runs.push(run);
        }
    }
    if user_interrupted {
        warn!(
            n_complete = runs.len(),
            n_discarded = discarded.len(),
            "Sampling interrupted; discarding unfinished chains"
        );
        discard_runs(discarded);
        if let Some(interrupt) = &options.interrupt {
            interrupt.reset();
        }
    }
    Ok((runs, user_interrupted))
}

fn discard_runs(runs: impl IntoIterator<Item = ChainRun>) {
    for run in runs {
        let chain_index = run.chain_index;
        if let Err(e) = run.discard() {
            warn!(chain = chain_index, error = %e, "Failed to remove chain files");
        }
    }
}

/// Everything a worker needs to run one chain.
struct ChainJob {
    chain_index: usize,
    n_sample: usize,
    state: ChainState,
    rng: SmallRng,
    transitions: Vec<NamedTransition>,
    trace_funcs: Vec<TraceFn>,
    memmap_dir: Option<PathBuf>,
    progress: Option<ProgressBar>,
}

/// A finished chain as sent back by a worker.
struct ChainRun {
    chain_index: usize,
    final_state: ChainState,
    traces: BTreeMap<String, StoredArray>,
    statistics: BTreeMap<String, BTreeMap<String, StoredArray>>,
    n_completed: usize,
    interrupted: bool,
}

impl ChainRun {
    fn load(self) -> Result<ChainOutput> {
        let traces = self
            .traces
            .into_iter()
            .map(|(key, stored)| Ok((key, stored.load()?)))
            .collect::<Result<_>>()?;
        let statistics = self
            .statistics
            .into_iter()
            .map(|(name, stats)| {
                let stats = stats
                    .into_iter()
                    .map(|(key, stored)| Ok((key, stored.load()?)))
                    .collect::<Result<_>>()?;
                Ok((name, stats))
            })
            .collect::<Result<_>>()?;
        Ok(ChainOutput {
            final_state: self.final_state,
            traces,
            statistics,
            n_completed: self.n_completed,
            interrupted: self.interrupted,
        })
    }

    fn discard(self) -> Result<()> {
        for stored in self.traces.into_values() {
            stored.remove()?;
        }
        for stats in self.statistics.into_values() {
            for stored in stats.into_values() {
                stored.remove()?;
            }
        }
        Ok(())
    }
}

fn evaluate_traces(
    trace_funcs: &[TraceFn],
    state: &ChainState,
) -> Result<BTreeMap<String, ArrayD<f64>>> {
    let mut values = BTreeMap::new();
    for trace_func in trace_funcs {
        for (key, value) in trace_func(state) {
            if values.contains_key(&key) {
                return Err(McmcError::TraceShape {
                    key,
                    reason: "returned by more than one trace function".to_string(),
                });
            }
            values.insert(key, value);
        }
    }
    Ok(values)
}

/// Rejects keys that map onto the same file once sanitized, before any file
/// of the chain is created.
fn check_file_names(
    chain_index: usize,
    transitions: &[NamedTransition],
    initial_values: &BTreeMap<String, ArrayD<f64>>,
) -> Result<()> {
    let mut seen: BTreeMap<String, String> = BTreeMap::new();
    let stat_files = transitions.iter().flat_map(|(name, transition)| {
        transition.statistic_types().into_iter().map(move |(key, _)| {
            (stats_file_name(name, key, chain_index), format!("statistic {name}/{key}"))
        })
    });
    let trace_files = initial_values
        .keys()
        .map(|key| (trace_file_name(key, chain_index), format!("trace {key}")));
    for (file, owner) in stat_files.chain(trace_files) {
        if let Some(previous) = seen.insert(file.clone(), owner.clone()) {
            return Err(McmcError::InvalidConfig(format!(
                "{previous} and {owner} would both be persisted to {file}"
            )));
        }
    }
    Ok(())
}

struct StatBuffer {
    stat_type: StatisticType,
    buffer: Box<dyn ResizableArray>,
}

/// Per-chain trace and statistic buffers.
#[derive(Default)]
struct ChainBuffers {
    traces: BTreeMap<String, Box<dyn ResizableArray>>,
    statistics: BTreeMap<String, BTreeMap<String, StatBuffer>>,
    /// Undeclared statistics already warned about.
    warned: BTreeSet<(String, String)>,
}

impl ChainBuffers {
    fn allocate(
        &mut self,
        n_sample: usize,
        chain_index: usize,
        transitions: &[NamedTransition],
        initial_values: &BTreeMap<String, ArrayD<f64>>,
        memmap_dir: Option<&Path>,
    ) -> Result<()> {
        if memmap_dir.is_some() {
            check_file_names(chain_index, transitions, initial_values)?;
        }
        for (name, transition) in transitions {
            let stats = self.statistics.entry(name.clone()).or_default();
            for (key, stat_type) in transition.statistic_types() {
                let path = memmap_dir.map(|dir| dir.join(stats_file_name(name, key, chain_index)));
                let buffer = allocate(&[n_sample], path)?;
                stats.insert(key.to_string(), StatBuffer { stat_type, buffer });
            }
        }
        for (key, value) in initial_values {
            let mut shape = vec![n_sample];
            shape.extend_from_slice(value.shape());
            let path = memmap_dir.map(|dir| dir.join(trace_file_name(key, chain_index)));
            let buffer = allocate(&shape, path)?;
            self.traces.insert(key.clone(), buffer);
        }
        Ok(())
    }

    /// Writes the statistics of one transition at row `index`, filling
    /// declared statistics the transition did not emit with their defaults.
    fn record_statistics(
        &mut self,
        index: usize,
        transition: &str,
        emitted: Option<&Statistics>,
    ) -> Result<()> {
        let Some(buffers) = self.statistics.get_mut(transition) else {
            return Ok(());
        };
        for (key, stat) in buffers.iter_mut() {
            let value = emitted
                .and_then(|stats| stats.get(key))
                .copied()
                .unwrap_or(stat.stat_type.default);
            stat.buffer
                .write_row(index, arr0(value.as_f64()).into_dyn().view())?;
        }
        if let Some(emitted) = emitted {
            for key in emitted.keys() {
                if !buffers.contains_key(key)
                    && self.warned.insert((transition.to_string(), key.clone()))
                {
                    warn!(
                        transition,
                        statistic = key.as_str(),
                        "Dropping undeclared statistic"
                    );
                }
            }
        }
        Ok(())
    }

    fn record_traces(&mut self, index: usize, values: BTreeMap<String, ArrayD<f64>>) -> Result<()> {
        if values.len() != self.traces.len() {
            let key = values
                .keys()
                .find(|k| !self.traces.contains_key(*k))
                .or_else(|| self.traces.keys().find(|k| !values.contains_key(*k)))
                .cloned()
                .unwrap_or_default();
            return Err(McmcError::TraceShape {
                key,
                reason: "set of trace keys changed during sampling".to_string(),
            });
        }
        for (key, value) in values {
            let buffer = self.traces.get_mut(&key).ok_or_else(|| McmcError::TraceShape {
                key: key.clone(),
                reason: "set of trace keys changed during sampling".to_string(),
            })?;
            if value.shape() != &buffer.shape()[1..] {
                return Err(McmcError::TraceShape {
                    reason: format!(
                        "expected shape {:?}, got {:?}",
                        &buffer.shape()[1..],
                        value.shape()
                    ),
                    key,
                });
            }
            buffer.write_row(index, value.view())?;
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn finish(
        self,
        n_rows: usize,
    ) -> Result<(
        BTreeMap<String, StoredArray>,
        BTreeMap<String, BTreeMap<String, StoredArray>>,
    )> {
        let mut traces = BTreeMap::new();
        for (key, buffer) in self.traces {
            traces.insert(key, buffer.truncate(n_rows)?);
        }
        let mut statistics = BTreeMap::new();
        for (name, stats) in self.statistics {
            let mut finished = BTreeMap::new();
            for (key, stat) in stats {
                finished.insert(key, stat.buffer.truncate(n_rows)?);
            }
            statistics.insert(name, finished);
        }
        Ok((traces, statistics))
    }

    fn discard(self) {
        let buffers = self
            .traces
            .into_values()
            .chain(
                self.statistics
                    .into_values()
                    .flat_map(|stats| stats.into_values().map(|stat| stat.buffer)),
            );
        for buffer in buffers {
            if let Err(e) = buffer.discard() {
                warn!(error = %e, "Failed to remove trace buffer");
            }
        }
    }
}

#[instrument(skip_all, fields(chain = job.chain_index))]
fn run_chain(job: ChainJob, stop: &Interrupt) -> Result<ChainRun> {
    let ChainJob {
        chain_index,
        n_sample,
        mut state,
        mut rng,
        transitions,
        trace_funcs,
        memmap_dir,
        progress,
    } = job;
    info!(n_sample, "Starting chain");

    let initial_values = evaluate_traces(&trace_funcs, &state)?;
    let mut buffers = ChainBuffers::default();
    if let Err(e) = buffers.allocate(
        n_sample,
        chain_index,
        &transitions,
        &initial_values,
        memmap_dir.as_deref(),
    ) {
        buffers.discard();
        return Err(e);
    }

    let mut tracker = AcceptanceTracker::default();
    let mut last_update = Instant::now();
    let mut n_completed = 0;
    let mut interrupted = false;
    for i in 0..n_sample {
        if stop.is_triggered() {
            warn!(
                chain = chain_index,
                iteration = i,
                "Chain interrupted; keeping completed iterations"
            );
            interrupted = true;
            break;
        }
        for (name, transition) in &transitions {
            let (next, stats) = transition.sample(state, &mut rng);
            state = next;
            if let Some(StatValue::Float(accept)) =
                stats.as_ref().and_then(|s| s.get("accept_stat"))
            {
                tracker.step(*accept);
            }
            if let Err(e) = buffers.record_statistics(i, name, stats.as_ref()) {
                buffers.discard();
                return Err(e);
            }
        }
        let recorded = evaluate_traces(&trace_funcs, &state)
            .and_then(|values| buffers.record_traces(i, values));
        if let Err(e) = recorded {
            buffers.discard();
            return Err(e);
        }
        n_completed = i + 1;

        if let Some(pb) = &progress {
            if last_update.elapsed() >= UPDATE_INTERVAL || n_completed == n_sample {
                pb.set_position(n_completed as u64);
                pb.set_message(format!("accept_stat={:.3}", tracker.mean()));
                last_update = Instant::now();
            }
        }
    }
    if let Some(pb) = &progress {
        if interrupted {
            pb.abandon_with_message("Interrupted");
        } else {
            pb.finish_with_message("Done!");
        }
    }

    let (traces, statistics) = buffers.finish(n_completed)?;
    info!(n_completed, interrupted, "Chain finished");
    Ok(ChainRun {
        chain_index,
        final_state: state,
        traces,
        statistics,
        n_completed,
        interrupted,
    })
}
