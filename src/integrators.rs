//! Symplectic integrators for simulating Hamiltonian dynamics.
//!
//! The integration transitions only talk to the [`Integrator`] trait, so any
//! reversible, volume-preserving scheme can be plugged in.

use ndarray::Array1;

use crate::error::IntegratorError;
use crate::state::ChainState;
use crate::system::System;

/// A reversible, volume-preserving single-step map of the joint state.
pub trait Integrator: Send + Sync {
    /// Magnitude of one time step.
    fn step_size(&self) -> f64;

    /// Advances `state` by one step in the direction given by `state.dir`.
    ///
    /// Returns [`IntegratorError`] if the new state is not finite.
    fn step(&self, system: &dyn System, state: &ChainState) -> Result<ChainState, IntegratorError>;
}

/// The Störmer-Verlet (leapfrog) scheme: half momentum step, full position
/// step, half momentum step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeapfrogIntegrator {
    pub step_size: f64,
}

impl LeapfrogIntegrator {
    pub fn new(step_size: f64) -> Self {
        Self { step_size }
    }
}

impl Integrator for LeapfrogIntegrator {
    fn step_size(&self) -> f64 {
        self.step_size
    }

    fn step(&self, system: &dyn System, state: &ChainState) -> Result<ChainState, IntegratorError> {
        let dt = state.dir_sign() * self.step_size;
        let mut next = state.clone();

        let mut mom = next.mom().clone();
        mom.scaled_add(-0.5 * dt, &system.dh_dpos(&next));
        next.mom = Some(mom);

        let velocity = system.dh_dmom(&next);
        next.pos.scaled_add(dt, &velocity);
        check_finite(&next.pos, "position")?;

        let mut mom = next.mom().clone();
        mom.scaled_add(-0.5 * dt, &system.dh_dpos(&next));
        check_finite(&mom, "momentum")?;
        next.mom = Some(mom);

        Ok(next)
    }
}

fn check_finite(values: &Array1<f64>, quantity: &'static str) -> Result<(), IntegratorError> {
    if values.iter().all(|x| x.is_finite()) {
        Ok(())
    } else {
        Err(IntegratorError::NonFinite { quantity })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributions::{IsotropicGaussian, Target};
    use crate::system::EuclideanMetricSystem;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, ArrayView1};

    #[test]
    fn test_leapfrog_conserves_energy_approximately() {
        let system = EuclideanMetricSystem::new(IsotropicGaussian::new(1.0));
        let integrator = LeapfrogIntegrator::new(0.1);
        let mut state = ChainState::new(arr1(&[1.0, -0.5])).with_mom(arr1(&[0.3, 0.8]));
        let h0 = system.h(&state);
        for _ in 0..100 {
            state = integrator.step(&system, &state).unwrap();
        }
        assert_abs_diff_eq!(system.h(&state), h0, epsilon = 1e-2);
    }

    #[test]
    fn test_leapfrog_is_reversible() {
        let system = EuclideanMetricSystem::new(IsotropicGaussian::new(0.7));
        let integrator = LeapfrogIntegrator::new(0.25);
        let start = ChainState::new(arr1(&[0.4, 1.1, -2.0])).with_mom(arr1(&[1.0, 0.0, -0.3]));
        let mut state = start.clone();
        for _ in 0..10 {
            state = integrator.step(&system, &state).unwrap();
        }
        state.dir = -1;
        for _ in 0..10 {
            state = integrator.step(&system, &state).unwrap();
        }
        assert_abs_diff_eq!(state.pos, start.pos, epsilon = 1e-10);
        assert_abs_diff_eq!(state.mom(), start.mom(), epsilon = 1e-10);
    }

    struct Explosive;

    impl Target for Explosive {
        fn log_density(&self, pos: ArrayView1<f64>) -> f64 {
            pos.mapv(|x| x.exp()).sum()
        }

        fn grad_log_density(&self, pos: ArrayView1<f64>) -> Array1<f64> {
            pos.mapv(|x| x.exp() * f64::MAX)
        }
    }

    #[test]
    fn test_leapfrog_reports_non_finite_state() {
        let system = EuclideanMetricSystem::new(Explosive);
        let integrator = LeapfrogIntegrator::new(1.0);
        let state = ChainState::new(arr1(&[10.0])).with_mom(arr1(&[1.0]));
        let err = integrator.step(&system, &state).unwrap_err();
        assert!(matches!(err, IntegratorError::NonFinite { .. }));
    }
}
