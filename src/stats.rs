//! Convergence diagnostics over recorded traces and a running acceptance
//! tracker for progress display.

use ndarray::prelude::*;
use ndarray_stats::QuantileExt;
use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use std::collections::VecDeque;

use crate::error::{McmcError, Result};
use crate::persist::TraceArray;

/// Sliding-window mean of the per-iteration `accept_stat`.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptanceTracker {
    window: usize,
    queue: VecDeque<f64>,
    sum: f64,
}

impl AcceptanceTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            queue: VecDeque::with_capacity(window.max(1)),
            sum: 0.0,
        }
    }

    /// Records one value; NaN values are ignored.
    pub fn step(&mut self, accept_stat: f64) {
        if accept_stat.is_nan() {
            return;
        }
        self.queue.push_back(accept_stat);
        self.sum += accept_stat;
        if self.queue.len() > self.window {
            if let Some(removed) = self.queue.pop_front() {
                self.sum -= removed;
            }
        }
    }

    /// Mean over the window, NaN before the first value.
    pub fn mean(&self) -> f64 {
        if self.queue.is_empty() {
            f64::NAN
        } else {
            self.sum / self.queue.len() as f64
        }
    }
}

impl Default for AcceptanceTracker {
    fn default() -> Self {
        Self::new(100)
    }
}

/// Potential scale reduction factor of `chains`, each of shape
/// `(n_sample, n_params)`, computed per parameter.
///
/// All chains must have the same shape with at least two samples, and at least
/// two chains are needed.
pub fn rhat(chains: &[ArrayView2<f64>]) -> Result<Array1<f64>> {
    let (n, n_params) = common_shape(chains)?;
    if chains.len() < 2 || n < 2 {
        return Err(McmcError::Diagnostics(
            "R-hat needs at least two chains of two samples".to_string(),
        ));
    }
    let m = chains.len() as f64;
    let nf = n as f64;

    let mut means = Array2::<f64>::zeros((chains.len(), n_params));
    let mut sm2 = Array2::<f64>::zeros((chains.len(), n_params));
    for (c, chain) in chains.iter().enumerate() {
        let mean = chain
            .mean_axis(Axis(0))
            .expect("Expecting non-empty chain for mean");
        let var = chain.var_axis(Axis(0), 1.0);
        means.row_mut(c).assign(&mean);
        sm2.row_mut(c).assign(&var);
    }

    let grand_mean = means
        .mean_axis(Axis(0))
        .expect("Expecting at least one chain");
    let between = (&means - &grand_mean.insert_axis(Axis(0)))
        .pow2()
        .sum_axis(Axis(0))
        * (nf / (m - 1.0));
    let within = sm2
        .mean_axis(Axis(0))
        .expect("Expecting at least one chain");
    let var = &within * ((nf - 1.0) / nf) + &between * (1.0 / nf);
    Ok((var / within).sqrt())
}

/// R-hat after splitting every chain into its first and second half, which
/// also detects non-stationarity within single chains.
pub fn split_rhat(chains: &[ArrayView2<f64>]) -> Result<Array1<f64>> {
    let (n, _) = common_shape(chains)?;
    if n < 4 {
        return Err(McmcError::Diagnostics(format!(
            "split R-hat needs at least four samples per chain, got {n}"
        )));
    }
    let half = n / 2;
    let mut halves = Vec::with_capacity(2 * chains.len());
    for chain in chains {
        halves.push(chain.slice(s![..half, ..]));
        halves.push(chain.slice(s![n - half.., ..]));
    }
    rhat(&halves)
}

fn common_shape(chains: &[ArrayView2<f64>]) -> Result<(usize, usize)> {
    let first = chains
        .first()
        .ok_or_else(|| McmcError::Diagnostics("no chains given".to_string()))?;
    let shape = first.dim();
    if chains.iter().any(|chain| chain.dim() != shape) {
        return Err(McmcError::Diagnostics(
            "chains have different shapes".to_string(),
        ));
    }
    Ok(shape)
}

/// Autocovariance of `x` at every lag, computed with an FFT.
fn autocovariance(x: ArrayView1<f64>, planner: &mut FftPlanner<f64>) -> Vec<f64> {
    let n = x.len();
    let mean = x.mean().unwrap_or(0.0);
    let len = 2 * n;
    let mut buf: Vec<Complex<f64>> = x
        .iter()
        .map(|&v| Complex::new(v - mean, 0.0))
        .chain(std::iter::repeat(Complex::new(0.0, 0.0)).take(len - n))
        .collect();
    planner.plan_fft_forward(len).process(&mut buf);
    for c in buf.iter_mut() {
        *c = Complex::new(c.norm_sqr(), 0.0);
    }
    planner.plan_fft_inverse(len).process(&mut buf);
    buf.iter()
        .take(n)
        .map(|c| c.re / (len as f64 * n as f64))
        .collect()
}

/// Effective sample size per parameter of `chains`, each of shape
/// `(n_sample, n_params)`, using Geyer's initial monotone sequence
/// estimator on the combined autocorrelations.
pub fn effective_sample_size(chains: &[ArrayView2<f64>]) -> Result<Array1<f64>> {
    let (n, n_params) = common_shape(chains)?;
    if n < 4 {
        return Err(McmcError::Diagnostics(format!(
            "ESS needs at least four samples per chain, got {n}"
        )));
    }
    let m = chains.len();
    let nf = n as f64;
    let mut planner = FftPlanner::new();
    let mut ess = Array1::<f64>::zeros(n_params);

    for p in 0..n_params {
        let acovs: Vec<Vec<f64>> = chains
            .iter()
            .map(|chain| autocovariance(chain.column(p), &mut planner))
            .collect();
        let chain_means: Array1<f64> = chains
            .iter()
            .map(|chain| chain.column(p).mean().unwrap_or(0.0))
            .collect();

        let mean_var = acovs.iter().map(|a| a[0]).sum::<f64>() / m as f64 * nf / (nf - 1.0);
        let mut var_plus = mean_var * (nf - 1.0) / nf;
        if m > 1 {
            var_plus += chain_means.var(1.0);
        }
        if var_plus <= 0.0 || !var_plus.is_finite() {
            ess[p] = f64::NAN;
            continue;
        }

        let rho = |lag: usize| -> f64 {
            let mean_acov = acovs.iter().map(|a| a[lag]).sum::<f64>() / m as f64;
            1.0 - (mean_var - mean_acov) / var_plus
        };

        let mut tau = -1.0;
        let mut prev_pair = f64::INFINITY;
        let mut lag = 0;
        while lag + 1 < n {
            let pair = rho(lag) + rho(lag + 1);
            if pair <= 0.0 {
                break;
            }
            let pair = pair.min(prev_pair);
            tau += 2.0 * pair;
            prev_pair = pair;
            lag += 2;
        }
        let total = (m * n) as f64;
        ess[p] = total / tau.max(1.0 / total.log10().max(1.0));
    }
    Ok(ess)
}

/// Summary statistics of one scalar component of a trace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentSummary {
    pub mean: f64,
    pub std: f64,
    pub split_rhat: f64,
    pub ess: f64,
}

/// Per-component summaries of a trace recorded by several chains.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceSummary {
    pub components: Vec<ComponentSummary>,
}

impl TraceSummary {
    /// Largest split R-hat over all components.
    pub fn max_rhat(&self) -> Result<f64> {
        let rhats: Array1<f64> = self.components.iter().map(|c| c.split_rhat).collect();
        rhats
            .max()
            .copied()
            .map_err(|e| McmcError::Diagnostics(format!("cannot take max R-hat: {e}")))
    }

    /// Smallest effective sample size over all components.
    pub fn min_ess(&self) -> Result<f64> {
        let ess: Array1<f64> = self.components.iter().map(|c| c.ess).collect();
        ess.min()
            .copied()
            .map_err(|e| McmcError::Diagnostics(format!("cannot take min ESS: {e}")))
    }
}

/// Summarizes the per-chain arrays of one trace key.
///
/// Values of any shape are flattened into components, in row-major order.
/// Chains of different lengths (as left by an interrupted run) are cut to the
/// shortest one.
pub fn summarize(traces: &[TraceArray]) -> Result<TraceSummary> {
    let n = traces
        .iter()
        .map(|t| t.len())
        .min()
        .ok_or_else(|| McmcError::Diagnostics("no chains given".to_string()))?;
    let flattened: Vec<Array2<f64>> = traces
        .iter()
        .map(|t| {
            let view = t.view();
            let n_params = view.len() / view.shape()[0].max(1);
            let rows = view.slice_axis(Axis(0), ndarray::Slice::from(0..n));
            let rows = rows.as_standard_layout();
            Array2::from_shape_vec((n, n_params), rows.iter().copied().collect())
                .map_err(|e| McmcError::Diagnostics(e.to_string()))
        })
        .collect::<Result<_>>()?;
    let views: Vec<ArrayView2<f64>> = flattened.iter().map(|a| a.view()).collect();
    let stacked = ndarray::concatenate(Axis(0), &views)
        .map_err(|e| McmcError::Diagnostics(e.to_string()))?;

    let mean = stacked
        .mean_axis(Axis(0))
        .ok_or_else(|| McmcError::Diagnostics("empty trace".to_string()))?;
    let std = stacked.std_axis(Axis(0), 1.0);
    let rhat = split_rhat(&views)?;
    let ess = effective_sample_size(&views)?;

    let components = (0..mean.len())
        .map(|i| ComponentSummary {
            mean: mean[i],
            std: std[i],
            split_rhat: rhat[i],
            ess: ess[i],
        })
        .collect();
    Ok(TraceSummary { components })
}
