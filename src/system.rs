//! Hamiltonian systems: the joint position-momentum energy that the
//! integrators simulate and the transitions leave invariant.

use ndarray::{Array1, Zip};
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};

use crate::distributions::Target;
use crate::error::{McmcError, Result};
use crate::state::ChainState;

/// A Hamiltonian `H(pos, mom) = U(pos) + K(pos, mom)` over chain states.
///
/// States passed to the momentum-dependent methods must carry a momentum.
pub trait System: Send + Sync {
    /// Potential energy `U(pos)`, the negative log-density of the target.
    fn neg_log_dens(&self, state: &ChainState) -> f64;

    /// Gradient of the potential energy with respect to position.
    fn grad_neg_log_dens(&self, state: &ChainState) -> Array1<f64>;

    /// Kinetic energy `K(pos, mom)`.
    fn kinetic_energy(&self, state: &ChainState) -> f64;

    /// Derivative of the Hamiltonian with respect to momentum (the velocity).
    fn dh_dmom(&self, state: &ChainState) -> Array1<f64>;

    /// Draws a momentum from its conditional distribution given position.
    fn sample_momentum(&self, state: &ChainState, rng: &mut dyn RngCore) -> Array1<f64>;

    /// Total energy.
    fn h(&self, state: &ChainState) -> f64 {
        self.neg_log_dens(state) + self.kinetic_energy(state)
    }

    /// Derivative of the Hamiltonian with respect to position.
    fn dh_dpos(&self, state: &ChainState) -> Array1<f64> {
        self.grad_neg_log_dens(state)
    }
    /// Checks that `state` has dimensions this system can evaluate.
    fn check_state(&self, _state: &ChainState) -> Result<()> {
        Ok(())
    }
}

/// Positive definite metric of a Euclidean system, used as the momentum
/// covariance.
#[derive(Debug, Clone, PartialEq)]
pub enum Metric {
    Identity,
    /// Diagonal entries of the metric matrix.
    Diagonal(Array1<f64>),
}

/// Hamiltonian system with a position-independent metric,
/// `H = -log π(pos) + ½ momᵀ M⁻¹ mom`.
#[derive(Debug, Clone)]
pub struct EuclideanMetricSystem<T> {
    target: T,
    metric: Metric,
}

impl<T: Target> EuclideanMetricSystem<T> {
    /// Creates a system with an identity metric.
    pub fn new(target: T) -> Self {
        Self {
            target,
            metric: Metric::Identity,
        }
    }

    /// Replaces the metric. Diagonal entries must be finite and positive.
    pub fn set_metric(mut self, metric: Metric) -> Result<Self> {
        if let Metric::Diagonal(diag) = &metric {
            if let Some(bad) = diag.iter().find(|m| !m.is_finite() || **m <= 0.0) {
                return Err(McmcError::InvalidConfig(format!(
                    "diagonal metric entries must be finite and positive, got {bad}"
                )));
            }
        }
        self.metric = metric;
        Ok(self)
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn metric(&self) -> &Metric {
        &self.metric
    }
}

impl<T: Target> System for EuclideanMetricSystem<T> {
    fn neg_log_dens(&self, state: &ChainState) -> f64 {
        -self.target.log_density(state.pos.view())
    }

    fn grad_neg_log_dens(&self, state: &ChainState) -> Array1<f64> {
        -self.target.grad_log_density(state.pos.view())
    }

    fn kinetic_energy(&self, state: &ChainState) -> f64 {
        let mom = state.mom();
        0.5 * mom.dot(&self.dh_dmom(state))
    }

    fn dh_dmom(&self, state: &ChainState) -> Array1<f64> {
        let mom = state.mom();
        match &self.metric {
            Metric::Identity => mom.clone(),
            Metric::Diagonal(diag) => {
                let mut out = mom.clone();
                Zip::from(&mut out).and(diag).for_each(|p, &m| *p /= m);
                out
            }
        }
    }

    fn check_state(&self, state: &ChainState) -> Result<()> {
        let dim = state.pos.len();
        if let Metric::Diagonal(diag) = &self.metric {
            if diag.len() != dim {
                return Err(McmcError::InvalidInitState(format!(
                    "position has {dim} dimensions but the metric has {}",
                    diag.len()
                )));
            }
        }
        if let Some(mom) = &state.mom {
            if mom.len() != dim {
                return Err(McmcError::InvalidInitState(format!(
                    "position has {dim} dimensions but the momentum has {}",
                    mom.len()
                )));
            }
        }
        Ok(())
    }

    fn sample_momentum(&self, state: &ChainState, rng: &mut dyn RngCore) -> Array1<f64> {
        let mut mom: Array1<f64> =
            Array1::from_shape_fn(state.pos.len(), |_| StandardNormal.sample(&mut *rng));
        if let Metric::Diagonal(diag) = &self.metric {
            Zip::from(&mut mom)
                .and(diag)
                .for_each(|p, &m| *p *= m.sqrt());
        }
        mom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::IsotropicGaussian;
    use approx::assert_abs_diff_eq;
    use ndarray::arr1;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_identity_hamiltonian() {
        let system = EuclideanMetricSystem::new(IsotropicGaussian::new(1.0));
        let state = ChainState::new(arr1(&[1.0, 2.0])).with_mom(arr1(&[0.5, -0.5]));
        // U = ½(1 + 4), K = ½(0.25 + 0.25)
        assert_abs_diff_eq!(system.h(&state), 2.75, epsilon = 1e-12);
        assert_abs_diff_eq!(system.dh_dpos(&state), arr1(&[1.0, 2.0]), epsilon = 1e-12);
        assert_abs_diff_eq!(system.dh_dmom(&state), arr1(&[0.5, -0.5]), epsilon = 1e-12);
    }

    #[test]
    fn test_diagonal_metric_kinetic_energy() {
        let system = EuclideanMetricSystem::new(IsotropicGaussian::new(1.0))
            .set_metric(Metric::Diagonal(arr1(&[2.0, 4.0])))
            .unwrap();
        let state = ChainState::new(arr1(&[0.0, 0.0])).with_mom(arr1(&[2.0, 4.0]));
        // K = ½(4/2 + 16/4)
        assert_abs_diff_eq!(system.kinetic_energy(&state), 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(system.dh_dmom(&state), arr1(&[1.0, 1.0]), epsilon = 1e-12);
    }

    #[test]
    fn test_sampled_momentum_scales_with_metric() {
        let system = EuclideanMetricSystem::new(IsotropicGaussian::new(1.0))
            .set_metric(Metric::Diagonal(arr1(&[1.0, 100.0])))
            .unwrap();
        let state = ChainState::new(arr1(&[0.0, 0.0]));
        let mut rng = SmallRng::seed_from_u64(7);
        let n = 20_000;
        let mut sum_sq = arr1(&[0.0, 0.0]);
        for _ in 0..n {
            let mom = system.sample_momentum(&state, &mut rng);
            sum_sq += &mom.mapv(|x| x * x);
        }
        let var = sum_sq / n as f64;
        assert_abs_diff_eq!(var[0], 1.0, epsilon = 0.1);
        assert_abs_diff_eq!(var[1], 100.0, epsilon = 10.0);
    }

    #[test]
    fn test_invalid_metric_entries_rejected() {
        for diag in [arr1(&[-1.0]), arr1(&[1.0, 0.0]), arr1(&[f64::NAN, 1.0])] {
            let result = EuclideanMetricSystem::new(IsotropicGaussian::new(1.0))
                .set_metric(Metric::Diagonal(diag));
            assert!(matches!(result, Err(McmcError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_check_state_dimensions() {
        let system = EuclideanMetricSystem::new(IsotropicGaussian::new(1.0))
            .set_metric(Metric::Diagonal(arr1(&[1.0, 2.0, 3.0])))
            .unwrap();
        assert!(system.check_state(&ChainState::new(arr1(&[0.0, 0.0, 0.0]))).is_ok());
        let err = system
            .check_state(&ChainState::new(arr1(&[0.0, 0.0])))
            .unwrap_err();
        assert!(matches!(err, McmcError::InvalidInitState(_)));
    }
}
