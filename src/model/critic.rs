//! State value critic.
use crate::torch::modules::{Mlp, MlpConfig};
use serde::{Deserialize, Serialize};
use tch::{nn::Path, Tensor};

/// Configuration for [`Critic`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriticConfig {
    pub mlp: MlpConfig,
}

impl Default for CriticConfig {
    fn default() -> Self {
        Self {
            mlp: MlpConfig {
                hidden_sizes: vec![512],
                dropout: 0.5,
                ..MlpConfig::default()
            },
        }
    }
}

/// Estimates the value of a decoder state from its context-aware hidden vector.
#[derive(Debug)]
pub struct Critic {
    mlp: Mlp,
}

impl Critic {
    pub fn new(path: &Path, hidden_size: usize, config: &CriticConfig) -> Self {
        Self {
            mlp: config.mlp.build(path, hidden_size, 1),
        }
    }

    /// Value estimates. `[batch]`
    ///
    /// # Args
    /// * `h` - Decoder LSTM hidden state. `[batch, hidden_size]`
    pub fn values(&self, h: &Tensor, train: bool) -> Tensor {
        self.mlp.forward(h, train).squeeze_dim(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn::VarStore, Device, Kind};

    #[test]
    fn values_shape() {
        let vs = VarStore::new(Device::Cpu);
        let critic = Critic::new(&vs.root(), 6, &CriticConfig::default());
        let h = Tensor::randn(&[4, 6], (Kind::Float, Device::Cpu));
        assert_eq!(critic.values(&h, true).size(), vec![4]);
    }

    #[test]
    fn eval_is_deterministic() {
        let vs = VarStore::new(Device::Cpu);
        let critic = Critic::new(&vs.root(), 6, &CriticConfig::default());
        let h = Tensor::randn(&[3, 6], (Kind::Float, Device::Cpu));
        let a = critic.values(&h, false);
        let b = critic.values(&h, false);
        assert!(a.allclose(&b, 0.0, 0.0, false));
    }
}
