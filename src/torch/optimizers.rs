//! Optimizer configuration and gradient clipping
use serde::{Deserialize, Serialize};
use tch::{nn::VarStore, COptimizer, TchError, Tensor};

/// Configuration for the SGD optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SgdConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Momentum
    pub momentum: f64,
    /// Weight decay (L2 penalty)
    pub weight_decay: f64,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-2,
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }
}

#[allow(clippy::doc_markdown)] // false positive on RMSProp
/// Configuration for the RMSProp optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RmsPropConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Smoothing factor
    pub alpha: f64,
    /// A term added to the denominator to improve numerical stability
    pub eps: f64,
    /// Weight decay (L2 penalty)
    pub weight_decay: f64,
}

impl Default for RmsPropConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            alpha: 0.99,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

/// Configuration for the Adam optimizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// Coefficient for the running average of the gradient
    pub beta1: f64,
    /// Coefficient for the running average of the square of the gradient
    pub beta2: f64,
    /// Weight decay (L2 penalty)
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.0,
        }
    }
}

/// Optimizer selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OptimizerConfig {
    Sgd(SgdConfig),
    RmsProp(RmsPropConfig),
    Adam(AdamConfig),
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::RmsProp(RmsPropConfig::default())
    }
}

impl TryFrom<&OptimizerConfig> for COptimizer {
    type Error = TchError;
    fn try_from(config: &OptimizerConfig) -> Result<Self, Self::Error> {
        match config {
            OptimizerConfig::Sgd(c) => {
                Self::sgd(c.learning_rate, c.momentum, 0.0, c.weight_decay, false)
            }
            OptimizerConfig::RmsProp(c) => {
                Self::rms_prop(c.learning_rate, c.alpha, c.eps, c.weight_decay, 0.0, false)
            }
            OptimizerConfig::Adam(c) => Self::adam(c.learning_rate, c.beta1, c.beta2, c.weight_decay),
        }
    }
}

impl OptimizerConfig {
    /// Whether the optimizer keeps per-parameter running statistics between steps.
    pub fn has_state(&self) -> bool {
        match self {
            Self::Sgd(c) => c.momentum != 0.0,
            Self::RmsProp(_) | Self::Adam(_) => true,
        }
    }

    /// Build an optimizer over the trainable variables of `vs`.
    pub fn build(&self, vs: &VarStore) -> Result<COptimizer, TchError> {
        let mut optimizer = COptimizer::try_from(self)?;
        for var in vs.trainable_variables() {
            optimizer.add_parameters(&var, 0)?;
        }
        Ok(optimizer)
    }
}

/// Rescale gradients in place so that their joint L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping. Variables without a gradient are skipped.
pub fn clip_grad_norm(variables: &[Tensor], max_norm: f64) -> f64 {
    tch::no_grad(|| {
        let grads: Vec<Tensor> = variables
            .iter()
            .map(Tensor::grad)
            .filter(Tensor::defined)
            .collect();
        let total_norm = grads
            .iter()
            .map(|g| g.norm().double_value(&[]).powi(2))
            .sum::<f64>()
            .sqrt();
        let scale = max_norm / (total_norm + 1e-6);
        if scale < 1.0 {
            for mut grad in grads {
                grad *= scale;
            }
        }
        total_norm
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tch::{nn, Device, Kind};

    fn quadratic_step(config: &OptimizerConfig) -> (f64, f64) {
        let vs = nn::VarStore::new(Device::Cpu);
        let x = vs.root().var("x", &[2], nn::Init::Const(1.0));
        let mut optimizer = config.build(&vs).unwrap();
        let loss = || (&x * &x).sum(Kind::Float);
        let initial = loss().double_value(&[]);
        optimizer.zero_grad().unwrap();
        loss().backward();
        optimizer.step().unwrap();
        (initial, loss().double_value(&[]))
    }

    #[rstest]
    #[case(OptimizerConfig::Sgd(SgdConfig::default()))]
    #[case(OptimizerConfig::RmsProp(RmsPropConfig::default()))]
    #[case(OptimizerConfig::Adam(AdamConfig::default()))]
    fn step_reduces_loss(#[case] config: OptimizerConfig) {
        let (initial, after) = quadratic_step(&config);
        assert!(after < initial, "{} !< {}", after, initial);
    }

    #[test]
    fn clip_scales_large_gradients() {
        let vs = nn::VarStore::new(Device::Cpu);
        let x = vs.root().var("x", &[2], nn::Init::Const(10.0));
        (&x * &x).sum(Kind::Float).backward();
        // grad = 2x = [20, 20], norm = 20 * sqrt(2)
        let norm = clip_grad_norm(&vs.trainable_variables(), 1.0);
        assert!((norm - 20.0 * 2f64.sqrt()).abs() < 1e-3);
        let clipped = x.grad().norm().double_value(&[]);
        assert!((clipped - 1.0).abs() < 1e-3);
    }

    #[test]
    fn clip_keeps_small_gradients() {
        let vs = nn::VarStore::new(Device::Cpu);
        let x = vs.root().var("x", &[1], nn::Init::Const(0.1));
        (&x * &x).sum(Kind::Float).backward();
        clip_grad_norm(&vs.trainable_variables(), 40.0);
        assert!((x.grad().double_value(&[0]) - 0.2).abs() < 1e-6);
    }

    #[rstest]
    #[case(OptimizerConfig::Sgd(SgdConfig::default()), false)]
    #[case(OptimizerConfig::Sgd(SgdConfig { momentum: 0.9, ..SgdConfig::default() }), true)]
    #[case(OptimizerConfig::RmsProp(RmsPropConfig::default()), true)]
    #[case(OptimizerConfig::Adam(AdamConfig::default()), true)]
    fn stateful_optimizers(#[case] config: OptimizerConfig, #[case] expected: bool) {
        assert_eq!(config.has_state(), expected);
    }
}
