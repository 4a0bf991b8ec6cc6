pub mod distributions;
pub mod error;
pub mod hmc;
pub mod integrators;
pub mod interrupt;
pub mod io;
pub mod persist;
pub mod sampler;
pub mod state;
pub mod stats;
pub mod system;
pub mod transitions;

#[cfg(feature = "burn")]
pub mod burn_target;

pub use error::{McmcError, Result};
