//! Torch components
pub mod distributions;
pub mod initializers;
pub mod modules;
pub mod optimizers;
pub mod packed;

pub use distributions::Categorical;
pub use initializers::{Initializer, VarianceScale};
pub use optimizers::{clip_grad_norm, OptimizerConfig};
