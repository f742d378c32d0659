//! Tensor initializers
use serde::{Deserialize, Serialize};
use tch::{nn::Path, Kind, Tensor};

/// Tensor initializers.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum Initializer {
    /// Initialize to all zeros
    Zeros,
    /// Uniform distribution with variance scaled by the tensor dimensions.
    Uniform(VarianceScale),
    /// Normal distribution with variance scaled by the tensor dimensions.
    Normal(VarianceScale),
    /// Initialize as an orthogonal matrix.
    Orthogonal,
}

/// Defaults to `Uniform(FanAvg)` a.k.a. Glorot or Xavier initialization.
impl Default for Initializer {
    fn default() -> Self {
        Self::Uniform(VarianceScale::FanAvg)
    }
}

/// Variance scaling mode.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
pub enum VarianceScale {
    /// Sampling variance equal to the given constant.
    Constant(f64),
    /// Variance `1 / fan_in`.
    FanIn,
    /// Variance `2 / (fan_in + fan_out)`.
    FanAvg,
}

impl VarianceScale {
    fn variance(self, fan_in: i64, fan_out: i64) -> f64 {
        match self {
            Self::Constant(v) => v,
            Self::FanIn => (fan_in as f64).recip(),
            Self::FanAvg => 2.0 / (fan_in + fan_out) as f64,
        }
    }
}

/// `(fan_in, fan_out)` for a weight shape `[out, in, ...]`.
fn fans(shape: &[i64]) -> (i64, i64) {
    let receptive: i64 = shape.iter().skip(2).product();
    let fan_in = shape.get(1).copied().unwrap_or(1) * receptive;
    let fan_out = shape.first().copied().unwrap_or(1) * receptive;
    (fan_in, fan_out)
}

impl Initializer {
    /// Create a trainable variable of the given shape in `path`.
    ///
    /// # Args
    /// * `path`   - Variable store path that owns the tensor.
    /// * `name`   - Variable name within `path`.
    /// * `shape`  - Tensor shape.
    /// * `fan_in` - Override the number of input features calculated from `shape`.
    pub fn add_tensor(&self, path: &Path, name: &str, shape: &[i64], fan_in: Option<i64>) -> Tensor {
        let tensor = tch::no_grad(|| self.build(shape, fan_in));
        path.var_copy(name, &tensor)
    }

    fn build(&self, shape: &[i64], fan_in: Option<i64>) -> Tensor {
        let options = (Kind::Float, tch::Device::Cpu);
        let (calc_fan_in, fan_out) = fans(shape);
        let fan_in = fan_in.unwrap_or(calc_fan_in);
        match self {
            Self::Zeros => Tensor::zeros(shape, options),
            Self::Uniform(scale) => {
                let lim = (3.0 * scale.variance(fan_in, fan_out)).sqrt();
                Tensor::empty(shape, options).uniform_(-lim, lim)
            }
            Self::Normal(scale) => {
                let stddev = scale.variance(fan_in, fan_out).sqrt();
                Tensor::empty(shape, options).normal_(0.0, stddev)
            }
            Self::Orthogonal => init_orthogonal(shape),
        }
    }
}

/// Orthogonal initialization following `torch.nn.init.orthogonal_`.
fn init_orthogonal(shape: &[i64]) -> Tensor {
    let options = (Kind::Float, tch::Device::Cpu);
    if shape.len() < 2 {
        return Initializer::default().build(shape, None);
    }
    let num_rows = shape[0];
    let num_cols: i64 = shape[1..].iter().product();
    let mut flattened = Tensor::empty(&[num_rows, num_cols], options).normal_(0.0, 1.0);
    if num_rows < num_cols {
        let _ = flattened.t_();
    }

    let (mut q, r) = Tensor::linalg_qr(&flattened, "reduced");
    q *= r.diag(0).sign();
    if num_rows < num_cols {
        let _ = q.t_();
    }
    // Copy so that the data is contiguous
    let mut out = Tensor::empty(shape, options);
    out.copy_(&q.reshape(shape));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tch::{nn, Device};

    #[test]
    fn zeros() {
        let vs = nn::VarStore::new(Device::Cpu);
        let a = Initializer::Zeros.add_tensor(&vs.root(), "a", &[5], None);
        assert_eq!(a, Tensor::zeros(&[5], (Kind::Float, Device::Cpu)));
    }

    #[test]
    fn orthogonal_is_orthogonal() {
        let vs = nn::VarStore::new(Device::Cpu);
        let a = Initializer::Orthogonal.add_tensor(&vs.root(), "a", &[5, 5], None);
        assert!(a.matmul(&a.tr()).allclose(
            &Tensor::eye(5, (Kind::Float, Device::Cpu)),
            1e-4,
            1e-4,
            false
        ));
    }

    #[rstest]
    #[case(&[2, 3])]
    #[case(&[8, 2])]
    fn orthogonal_shape(#[case] shape: &[i64]) {
        let vs = nn::VarStore::new(Device::Cpu);
        let a = Initializer::Orthogonal.add_tensor(&vs.root(), "a", shape, None);
        assert_eq!(a.size(), shape);
    }

    #[test]
    fn fan_in_bounds() {
        // With fan_in of 1, max is sqrt(3) ~ 1.73
        let vs = nn::VarStore::new(Device::Cpu);
        let a = Initializer::Uniform(VarianceScale::FanIn).add_tensor(&vs.root(), "a", &[1, 100], Some(1));
        let max = a.max().double_value(&[]);
        assert!(max <= 1.74, "{:?}", max);
        assert!(max >= 1.73 * 0.75, "{:?}", max);
    }

    #[test]
    fn registered_as_trainable() {
        let vs = nn::VarStore::new(Device::Cpu);
        let a = Initializer::default().add_tensor(&vs.root(), "a", &[2, 2], None);
        assert!(a.requires_grad());
        assert_eq!(vs.trainable_variables().len(), 1);
    }
}
