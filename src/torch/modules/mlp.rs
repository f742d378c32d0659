//! Multi-layer perceptron
use super::{Linear, LinearConfig};
use serde::{Deserialize, Serialize};
use std::iter;
use tch::{nn::Path, Tensor};

/// Configuration for the [`Mlp`] module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MlpConfig {
    /// Sizes of the hidden layers
    pub hidden_sizes: Vec<usize>,
    /// Dropout probability after each hidden activation.
    pub dropout: f64,
    /// Configuration for the linear layers
    pub linear_config: LinearConfig,
}

impl Default for MlpConfig {
    fn default() -> Self {
        Self {
            hidden_sizes: vec![128],
            dropout: 0.0,
            linear_config: LinearConfig::default(),
        }
    }
}

impl MlpConfig {
    pub fn build(&self, path: &Path, in_dim: usize, out_dim: usize) -> Mlp {
        Mlp::new(path, in_dim, out_dim, self)
    }
}

/// Multi-layer perceptron with ReLU hidden activations.
#[derive(Debug)]
pub struct Mlp {
    layers: Vec<Linear>,
    dropout: f64,
}

impl Mlp {
    pub fn new(path: &Path, in_dim: usize, out_dim: usize, config: &MlpConfig) -> Self {
        let in_dims = iter::once(&in_dim).chain(&config.hidden_sizes);
        let out_dims = config.hidden_sizes.iter().chain(iter::once(&out_dim));
        let layers = in_dims
            .zip(out_dims)
            .enumerate()
            .map(|(i, (&in_, &out_))| config.linear_config.build(&(path / format!("layer_{}", i)), in_, out_))
            .collect();
        Self {
            layers,
            dropout: config.dropout,
        }
    }

    pub fn forward(&self, input: &Tensor, train: bool) -> Tensor {
        let mut iter_layers = self.layers.iter();
        let mut hidden = iter_layers
            .next()
            .expect("must have >= 1 layers by construction")
            .forward(input);
        for layer in iter_layers {
            hidden = hidden.relu().dropout(self.dropout, train);
            hidden = layer.forward(&hidden);
        }
        hidden
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Device, Kind};

    #[test]
    fn forward_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let config = MlpConfig {
            hidden_sizes: vec![5, 4],
            dropout: 0.5,
            ..MlpConfig::default()
        };
        let mlp = config.build(&vs.root(), 3, 1);
        let input = Tensor::randn(&[7, 3], (Kind::Float, Device::Cpu));
        assert_eq!(mlp.forward(&input, true).size(), vec![7, 1]);
        assert_eq!(vs.trainable_variables().len(), 6);
    }

    #[test]
    fn eval_is_deterministic() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mlp = MlpConfig {
            dropout: 0.5,
            ..MlpConfig::default()
        }
        .build(&vs.root(), 3, 2);
        let input = Tensor::randn(&[4, 3], (Kind::Float, Device::Cpu));
        assert_eq!(mlp.forward(&input, false), mlp.forward(&input, false));
    }
}
