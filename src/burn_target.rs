//! [`Target`] adapter that computes gradients with `burn` autodiff.
//!
//! Only the log-density has to be written, as a function of a rank-1 tensor
//! returning a single-element tensor:
//!
//! ```rust
//! use burn::backend::{Autodiff, NdArray};
//! use mini_hmc::burn_target::BurnTarget;
//! use mini_hmc::distributions::Target;
//! use ndarray::arr1;
//!
//! type BackendType = Autodiff<NdArray>;
//!
//! let target = BurnTarget::<BackendType, _>::new(|x| x.powf_scalar(2.0).sum().mul_scalar(-0.5));
//! let grad = target.grad_log_density(arr1(&[1.0, -2.0]).view());
//! assert!((grad[1] - 2.0).abs() < 1e-5);
//! ```

use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::cast::ToElement;
use ndarray::{Array1, ArrayView1};

use crate::distributions::Target;

/// A target whose log-density is a `burn` tensor expression.
#[derive(Debug, Clone)]
pub struct BurnTarget<B: AutodiffBackend, F> {
    log_prob: F,
    device: B::Device,
}

impl<B, F> BurnTarget<B, F>
where
    B: AutodiffBackend,
    F: Fn(Tensor<B, 1>) -> Tensor<B, 1> + Send + Sync,
{
    /// Uses the backend's default device.
    pub fn new(log_prob: F) -> Self {
        Self {
            log_prob,
            device: B::Device::default(),
        }
    }

    pub fn with_device(log_prob: F, device: B::Device) -> Self {
        Self { log_prob, device }
    }

    fn position(&self, pos: ArrayView1<f64>) -> Tensor<B, 1> {
        let td = TensorData::new(pos.to_vec(), [pos.len()]);
        Tensor::<B, 1>::from_data(td, &self.device)
    }
}

impl<B, F> Target for BurnTarget<B, F>
where
    B: AutodiffBackend,
    F: Fn(Tensor<B, 1>) -> Tensor<B, 1> + Send + Sync,
{
    fn log_density(&self, pos: ArrayView1<f64>) -> f64 {
        (self.log_prob)(self.position(pos)).into_scalar().to_f64()
    }

    fn grad_log_density(&self, pos: ArrayView1<f64>) -> Array1<f64> {
        self.log_density_and_grad(pos).1
    }

    fn log_density_and_grad(&self, pos: ArrayView1<f64>) -> (f64, Array1<f64>) {
        let x = self.position(pos).require_grad();
        let logp = (self.log_prob)(x.clone());
        let grads = logp.backward();
        let grad = x
            .grad(&grads)
            .expect("Expecting a gradient for the position tensor");
        let grad = grad
            .into_data()
            .convert::<f64>()
            .to_vec::<f64>()
            .expect("Expecting gradient data convertible to f64");
        (logp.into_scalar().to_f64(), Array1::from(grad))
    }
}
