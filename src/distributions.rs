/*!
Target distributions for gradient-based sampling.

A [`Target`] provides an unnormalized log-density and its gradient with
respect to position. Hamiltonian systems (see [`crate::system`]) turn a target
into a potential energy.

# Examples

```rust
use mini_hmc::distributions::{Gaussian2D, Target};
use ndarray::{arr1, arr2};

let target = Gaussian2D {
    mean: arr1(&[0.0, 1.0]),
    cov: arr2(&[[4.0, 2.0], [2.0, 3.0]]),
};
let logp = target.log_density(arr1(&[0.5, -0.5]).view());
let grad = target.grad_log_density(arr1(&[0.5, -0.5]).view());
assert!(logp < 0.0);
assert_eq!(grad.len(), 2);
```
*/

use ndarray::{Array1, Array2, ArrayView1};

/// A continuous target distribution with a differentiable log-density.
pub trait Target: Send + Sync {
    /// Returns the log of the unnormalized density at `pos`.
    fn log_density(&self, pos: ArrayView1<f64>) -> f64;

    /// Returns the gradient of [`Target::log_density`] at `pos`.
    fn grad_log_density(&self, pos: ArrayView1<f64>) -> Array1<f64>;

    /// Returns log-density and gradient together.
    ///
    /// Override when both share intermediate work.
    fn log_density_and_grad(&self, pos: ArrayView1<f64>) -> (f64, Array1<f64>) {
        (self.log_density(pos), self.grad_log_density(pos))
    }
}

/**
An isotropic zero-mean Gaussian with standard deviation `std` in every
coordinate, valid in any dimension.

```rust
use mini_hmc::distributions::{IsotropicGaussian, Target};
use ndarray::arr1;

let target = IsotropicGaussian::new(2.0);
let logp = target.log_density(arr1(&[2.0]).view());
assert!((logp + 0.5).abs() < 1e-12);
```
*/
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IsotropicGaussian {
    pub std: f64,
}

impl IsotropicGaussian {
    pub fn new(std: f64) -> Self {
        Self { std }
    }
}

impl Target for IsotropicGaussian {
    fn log_density(&self, pos: ArrayView1<f64>) -> f64 {
        -0.5 * pos.dot(&pos) / (self.std * self.std)
    }

    fn grad_log_density(&self, pos: ArrayView1<f64>) -> Array1<f64> {
        pos.mapv(|x| -x / (self.std * self.std))
    }
}

/// A 2D Gaussian parameterized by a mean vector and a 2×2 covariance matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Gaussian2D {
    pub mean: Array1<f64>,
    pub cov: Array2<f64>,
}

impl Gaussian2D {
    fn precision(&self) -> Array2<f64> {
        let (a, b, c, d) = (
            self.cov[(0, 0)],
            self.cov[(0, 1)],
            self.cov[(1, 0)],
            self.cov[(1, 1)],
        );
        let det = a * d - b * c;
        ndarray::arr2(&[[d, -b], [-c, a]]) / det
    }
}

impl Target for Gaussian2D {
    fn log_density(&self, pos: ArrayView1<f64>) -> f64 {
        let diff = &pos - &self.mean;
        -0.5 * diff.dot(&self.precision().dot(&diff))
    }

    fn grad_log_density(&self, pos: ArrayView1<f64>) -> Array1<f64> {
        let diff = &pos - &self.mean;
        -self.precision().dot(&diff)
    }

    fn log_density_and_grad(&self, pos: ArrayView1<f64>) -> (f64, Array1<f64>) {
        let diff = &pos - &self.mean;
        let scaled = self.precision().dot(&diff);
        (-0.5 * diff.dot(&scaled), -scaled)
    }
}

/// The Rosenbrock "banana" density
/// `log π(x, y) = -[(a - x)² + b (y - x²)²]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rosenbrock2D {
    pub a: f64,
    pub b: f64,
}

impl Target for Rosenbrock2D {
    fn log_density(&self, pos: ArrayView1<f64>) -> f64 {
        let (x, y) = (pos[0], pos[1]);
        -((self.a - x).powi(2) + self.b * (y - x * x).powi(2))
    }

    fn grad_log_density(&self, pos: ArrayView1<f64>) -> Array1<f64> {
        let (x, y) = (pos[0], pos[1]);
        let r = y - x * x;
        ndarray::arr1(&[
            2.0 * (self.a - x) + 4.0 * self.b * x * r,
            -2.0 * self.b * r,
        ])
    }
}
