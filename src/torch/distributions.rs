//! Categorical distribution
use tch::{Kind, Tensor};

/// Categorical distribution(s).
#[derive(Debug)]
pub struct Categorical {
    /// Log probability of each event.
    ///
    /// A tensor of shape `[BATCH_SHAPE.., NUM_EVENTS]`.
    logits: Tensor,
}

impl Categorical {
    /// Initialize from possibly unnormalized log probabilities.
    ///
    /// Events with `-inf` logits have zero probability.
    pub fn new(logits: &Tensor) -> Self {
        Self {
            logits: logits.log_softmax(-1, Kind::Float),
        }
    }

    /// Draw one event per batch element. `[BATCH_SHAPE..]`, `i64`
    pub fn sample(&self) -> Tensor {
        tch::no_grad(|| self.logits.exp().multinomial(1, true).squeeze_dim(-1))
    }

    /// Log probability of the given events.
    pub fn log_probs(&self, elements: &Tensor) -> Tensor {
        self.logits
            .gather(-1, &elements.unsqueeze(-1), false)
            .squeeze_dim(-1)
    }

    pub fn entropy(&self) -> Tensor {
        // Clamp to avoid 0 * -inf on impossible events
        let clamped_logits = self.logits.clamp_min(f64::from(f32::MIN));
        -(clamped_logits * self.logits.exp()).sum_dim_intlist(&[-1], false, Kind::Float)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_probs() {
        let logits = Tensor::of_slice(&[
            f32::NEG_INFINITY,
            0.0,
            f32::NEG_INFINITY,
            // elem: 2
            f32::NEG_INFINITY,
            0.0,
            0.0,
            // elem: 0
            -1.0,
            0.0,
            1.0,
        ])
        .reshape(&[-1, 3]);
        let distribution = Categorical::new(&logits);
        let elements = Tensor::of_slice(&[1_i64, 2, 0]);

        let log_normalizer = f32::ln(f32::exp(-1.0) + 1.0 + f32::exp(1.0));
        let expected = Tensor::of_slice(&[0.0, -f32::ln(2.0), -1.0 - log_normalizer]);
        assert!(distribution
            .log_probs(&elements)
            .allclose(&expected, 1e-5, 1e-5, false));
    }

    #[test]
    fn entropy_ignores_impossible_events() {
        let logits = Tensor::of_slice(&[0.0f32, 0.0, f32::NEG_INFINITY]).reshape(&[1, 3]);
        let entropy = Categorical::new(&logits).entropy();
        let expected = Tensor::of_slice(&[f32::ln(2.0)]);
        assert!(entropy.allclose(&expected, 1e-5, 1e-5, false));
    }

    #[test]
    fn samples_never_masked() {
        let logits = Tensor::of_slice(&[0.0f32, f32::NEG_INFINITY, 0.0, f32::NEG_INFINITY])
            .reshape(&[1, 4])
            .repeat(&[200, 1]);
        let samples = Vec::<i64>::from(&Categorical::new(&logits).sample());
        assert_eq!(samples.len(), 200);
        assert!(samples.iter().all(|&s| s == 0 || s == 2));
    }
}
