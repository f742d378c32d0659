//! Dot-product attention
use super::{Linear, LinearConfig};
use tch::{nn::Path, Kind, Tensor};

/// Softmax over the last dimension ignoring positions where `mask` is `true`.
///
/// Rows that are entirely masked produce zeros rather than NaN.
pub fn masked_softmax(logits: &Tensor, mask: &Tensor) -> Tensor {
    let probs = logits
        .masked_fill(mask, f64::NEG_INFINITY)
        .softmax(-1, Kind::Float);
    probs.masked_fill(mask, 0.0)
}

/// Soft dot-product attention of a query vector over a context sequence.
///
/// The query is projected into the context space, scored against every context position,
/// and the normalized scores weight the context.
#[derive(Debug)]
pub struct SoftDotAttention {
    linear_in: Linear,
    linear_out: Linear,
}

impl SoftDotAttention {
    pub fn new(path: &Path, query_dim: usize, ctx_dim: usize) -> Self {
        let config = LinearConfig::without_bias();
        Self {
            linear_in: config.build(&(path / "linear_in"), query_dim, ctx_dim),
            linear_out: config.build(&(path / "linear_out"), query_dim + ctx_dim, query_dim),
        }
    }

    /// Unnormalized attention scores. `[batch, seq_len]`
    ///
    /// # Args
    /// * `query`   - `[batch, query_dim]`
    /// * `context` - `[batch, seq_len, ctx_dim]`
    /// * `mask`    - Optional `[batch, seq_len]` boolean tensor, `true` positions score `-inf`.
    pub fn scores(&self, query: &Tensor, context: &Tensor, mask: Option<&Tensor>) -> Tensor {
        let target = self.linear_in.forward(query).unsqueeze(2);
        let logits = context.bmm(&target).squeeze_dim(2);
        match mask {
            Some(mask) => logits.masked_fill(mask, f64::NEG_INFINITY),
            None => logits,
        }
    }

    /// Attention-weighted context and the attention distribution.
    ///
    /// Returns `(weighted [batch, ctx_dim], attention [batch, seq_len])`.
    pub fn attend(&self, query: &Tensor, context: &Tensor, mask: Option<&Tensor>) -> (Tensor, Tensor) {
        let attention = self.scores(query, context, mask).softmax(-1, Kind::Float);
        (Self::weigh(&attention, context), attention)
    }

    /// Weighted sum of `context` using `attention`.
    pub fn weigh(attention: &Tensor, context: &Tensor) -> Tensor {
        attention.unsqueeze(1).bmm(context).squeeze_dim(1)
    }

    /// Combine the query with an attended context: `tanh(W [weighted; query])`.
    pub fn combine(&self, query: &Tensor, weighted: &Tensor) -> Tensor {
        self.linear_out
            .forward(&Tensor::cat(&[weighted, query], 1))
            .tanh()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Device};

    fn attention() -> (nn::VarStore, SoftDotAttention) {
        let vs = nn::VarStore::new(Device::Cpu);
        let attention = SoftDotAttention::new(&vs.root(), 4, 3);
        (vs, attention)
    }

    #[test]
    fn masked_positions_get_no_weight() {
        let (_vs, attention) = attention();
        let query = Tensor::randn(&[2, 4], (Kind::Float, Device::Cpu));
        let context = Tensor::randn(&[2, 5, 3], (Kind::Float, Device::Cpu));
        let mask = Tensor::of_slice(&[
            false, false, true, true, true, //
            false, false, false, false, true,
        ])
        .reshape(&[2, 5]);
        let (weighted, probs) = attention.attend(&query, &context, Some(&mask));
        assert_eq!(weighted.size(), vec![2, 3]);
        let masked_mass = probs.masked_select(&mask).sum(Kind::Float).double_value(&[]);
        assert_eq!(masked_mass, 0.0);
        let totals = probs.sum_dim_intlist(&[1], false, Kind::Float);
        assert!(totals.allclose(&Tensor::ones(&[2], (Kind::Float, Device::Cpu)), 1e-5, 1e-5, false));
    }

    #[test]
    fn combine_shape() {
        let (_vs, attention) = attention();
        let query = Tensor::randn(&[2, 4], (Kind::Float, Device::Cpu));
        let weighted = Tensor::randn(&[2, 3], (Kind::Float, Device::Cpu));
        assert_eq!(attention.combine(&query, &weighted).size(), vec![2, 4]);
    }

    #[test]
    fn masked_softmax_all_masked_row_is_zero() {
        let logits = Tensor::of_slice(&[1.0f32, 2.0, 3.0, 4.0]).reshape(&[2, 2]);
        let mask = Tensor::of_slice(&[true, true, false, true]).reshape(&[2, 2]);
        let probs = masked_softmax(&logits, &mask);
        assert_eq!(
            Vec::<f32>::from(&probs.reshape(&[-1])),
            vec![0.0, 0.0, 1.0, 0.0]
        );
    }
}
