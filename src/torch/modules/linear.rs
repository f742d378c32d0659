//! Linear layer
use crate::torch::initializers::Initializer;
use serde::{Deserialize, Serialize};
use tch::{nn::Path, Tensor};

/// Configuration for the [`Linear`] module.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearConfig {
    /// Initializer for the kernel (weight) matrix.
    pub kernel_init: Initializer,
    /// Initializer for the bias vector, if one exists.
    pub bias_init: Option<Initializer>,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            kernel_init: Initializer::default(),
            bias_init: Some(Initializer::default()),
        }
    }
}

impl LinearConfig {
    /// Configuration for a layer without bias.
    pub fn without_bias() -> Self {
        Self {
            bias_init: None,
            ..Self::default()
        }
    }

    pub fn build(&self, path: &Path, in_dim: usize, out_dim: usize) -> Linear {
        Linear::new(path, in_dim, out_dim, self)
    }
}

/// Linear fully-connected layer module.
#[derive(Debug)]
pub struct Linear {
    kernel: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    pub fn new(path: &Path, in_dim: usize, out_dim: usize, config: &LinearConfig) -> Self {
        // Total fan_in is the weigths in_dim + 1 for the bias.
        let fan_in = (in_dim + 1) as i64;
        Self {
            kernel: config.kernel_init.add_tensor(
                path,
                "kernel",
                &[out_dim as i64, in_dim as i64],
                Some(fan_in),
            ),
            bias: config
                .bias_init
                .map(|init| init.add_tensor(path, "bias", &[out_dim as i64], Some(fan_in))),
        }
    }

    /// Apply to the last dimension of `input`.
    pub fn forward(&self, input: &Tensor) -> Tensor {
        input.linear(&self.kernel, self.bias.as_ref())
    }
}
