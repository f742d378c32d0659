//! Long Short-Term Memory
use crate::torch::initializers::Initializer;
use crate::torch::packed::PackedBatch;
use tch::{nn::Path, Kind, Tensor};

/// Flat LSTM weights in the layout expected by the torch RNN kernels.
///
/// Per layer and direction: `weight_ih`, `weight_hh`, `bias_ih`, `bias_hh`.
/// Reverse-direction weights follow the forward ones and carry a `_reverse` suffix.
#[derive(Debug)]
pub struct RnnWeights {
    flat_weights: Vec<Tensor>,
    num_layers: usize,
    bidirectional: bool,
}

impl RnnWeights {
    /// Initialize weights.
    ///
    /// * Input-to-hidden weights: Glorot Uniform (aka Xavier)
    /// * Hidden-to-hidden weights: Orthogonal
    /// * Biases: Zero
    pub fn init(
        path: &Path,
        in_dim: usize,
        hidden_size: usize,
        num_layers: usize,
        bidirectional: bool,
    ) -> Self {
        let gates_size = 4 * hidden_size as i64;
        let hidden = hidden_size as i64;
        let num_directions = if bidirectional { 2 } else { 1 };
        let mut flat_weights = Vec::with_capacity(num_layers * num_directions * 4);
        for layer in 0..num_layers {
            let layer_input_size = if layer == 0 {
                in_dim as i64
            } else {
                hidden * num_directions as i64
            };
            for direction in 0..num_directions {
                let suffix = if direction == 0 { "" } else { "_reverse" };
                flat_weights.push(Initializer::default().add_tensor(
                    path,
                    &format!("weight_ih_l{}{}", layer, suffix),
                    &[gates_size, layer_input_size],
                    None,
                ));
                flat_weights.push(Initializer::Orthogonal.add_tensor(
                    path,
                    &format!("weight_hh_l{}{}", layer, suffix),
                    &[gates_size, hidden],
                    None,
                ));
                for name in ["bias_ih", "bias_hh"] {
                    flat_weights.push(Initializer::Zeros.add_tensor(
                        path,
                        &format!("{}_l{}{}", name, layer, suffix),
                        &[gates_size],
                        None,
                    ));
                }
            }
        }
        Self {
            flat_weights,
            num_layers,
            bidirectional,
        }
    }

    pub fn flat_weights(&self) -> &[Tensor] {
        &self.flat_weights
    }
}

/// Output of [`BiLstm::forward`].
#[derive(Debug)]
pub struct BiLstmOutput {
    /// Per-token outputs, zero past each sequence end. `[batch, seq_len, num_directions * hidden]`
    pub output: Tensor,
    /// Final hidden state of the last layer, directions concatenated. `[batch, num_directions * hidden]`
    pub hidden: Tensor,
    /// Final cell state of the last layer, directions concatenated. `[batch, num_directions * hidden]`
    pub cell: Tensor,
}

/// Multi-layer (optionally bidirectional) LSTM over padded batches sorted by length.
#[derive(Debug)]
pub struct BiLstm {
    weights: RnnWeights,
    hidden_size: i64,
    dropout: f64,
}

impl BiLstm {
    pub fn new(
        path: &Path,
        in_dim: usize,
        hidden_size: usize,
        num_layers: usize,
        bidirectional: bool,
        dropout: f64,
    ) -> Self {
        Self {
            weights: RnnWeights::init(path, in_dim, hidden_size, num_layers, bidirectional),
            hidden_size: hidden_size as i64,
            dropout,
        }
    }

    const fn num_directions(&self) -> i64 {
        if self.weights.bidirectional {
            2
        } else {
            1
        }
    }

    /// Run over a batch-first padded input.
    ///
    /// # Args
    /// * `inputs`  - `[batch, seq_len, in_dim]`
    /// * `lengths` - Sequence lengths, non-increasing.
    /// * `train`   - Apply inter-layer dropout.
    pub fn forward(&self, inputs: &Tensor, lengths: &[usize], train: bool) -> BiLstmOutput {
        let packed = PackedBatch::new(lengths, inputs.device());
        let data = packed.pack(inputs);
        let batch_size = lengths.len() as i64;
        let num_layers = self.weights.num_layers as i64;
        let zeros = Tensor::zeros(
            &[num_layers * self.num_directions(), batch_size, self.hidden_size],
            (Kind::Float, inputs.device()),
        );
        let initial_state = [zeros.shallow_clone(), zeros];
        let (output, hidden, cell) = Tensor::lstm_data(
            &data,
            packed.batch_sizes(),
            &initial_state,
            self.weights.flat_weights(),
            true, // has biases
            num_layers,
            self.dropout,
            train,
            self.weights.bidirectional,
        );
        let seq_len = inputs.size()[1];
        BiLstmOutput {
            output: packed.unpack(&output, seq_len),
            hidden: self.last_layer(&hidden),
            cell: self.last_layer(&cell),
        }
    }

    /// Concatenate the directions of the last layer of a `[layers * dirs, batch, hidden]` state.
    fn last_layer(&self, state: &Tensor) -> Tensor {
        let dirs = self.num_directions();
        let total = state.size()[0];
        let last = state.narrow(0, total - dirs, dirs);
        Tensor::cat(&last.unbind(0), 1)
    }
}

/// Single LSTM cell.
#[derive(Debug)]
pub struct LstmCell {
    weights: RnnWeights,
}

impl LstmCell {
    pub fn new(path: &Path, in_dim: usize, hidden_size: usize) -> Self {
        Self {
            weights: RnnWeights::init(path, in_dim, hidden_size, 1, false),
        }
    }

    /// One step. Returns the new `(hidden, cell)` state, each `[batch, hidden]`.
    pub fn step(&self, input: &Tensor, hidden: &Tensor, cell: &Tensor) -> (Tensor, Tensor) {
        let w = self.weights.flat_weights();
        input.lstm_cell(&[hidden, cell], &w[0], &w[1], Some(&w[2]), Some(&w[3]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tch::{nn, Device};

    #[rstest]
    #[case(true, 6)]
    #[case(false, 3)]
    fn bilstm_shapes(#[case] bidirectional: bool, #[case] out_dim: i64) {
        let vs = nn::VarStore::new(Device::Cpu);
        let lstm = BiLstm::new(&vs.root(), 2, 3, 1, bidirectional, 0.0);
        let inputs = Tensor::randn(&[3, 4, 2], (Kind::Float, Device::Cpu));
        let out = lstm.forward(&inputs, &[4, 2, 1], false);
        assert_eq!(out.output.size(), vec![3, 4, out_dim]);
        assert_eq!(out.hidden.size(), vec![3, out_dim]);
        assert_eq!(out.cell.size(), vec![3, out_dim]);
    }

    #[test]
    fn bilstm_output_zero_past_length() {
        let vs = nn::VarStore::new(Device::Cpu);
        let lstm = BiLstm::new(&vs.root(), 2, 3, 1, true, 0.0);
        let inputs = Tensor::randn(&[2, 4, 2], (Kind::Float, Device::Cpu));
        let out = lstm.forward(&inputs, &[4, 2], false);
        let tail = out.output.get(1).narrow(0, 2, 2);
        assert_eq!(tail.abs().sum(Kind::Float).double_value(&[]), 0.0);
    }

    #[test]
    fn padding_does_not_change_outputs() {
        // The second sequence is identical in both batches up to its length.
        let vs = nn::VarStore::new(Device::Cpu);
        let lstm = BiLstm::new(&vs.root(), 2, 3, 1, true, 0.0);
        let inputs = Tensor::randn(&[2, 4, 2], (Kind::Float, Device::Cpu));
        let noisy = inputs.copy();
        let _ = noisy.get(1).narrow(0, 2, 2).fill_(100.0);
        let a = lstm.forward(&inputs, &[4, 2], false);
        let b = lstm.forward(&noisy, &[4, 2], false);
        assert!(a.hidden.allclose(&b.hidden, 1e-5, 1e-5, false));
    }

    #[test]
    fn cell_step_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let cell = LstmCell::new(&vs.root(), 5, 3);
        let input = Tensor::randn(&[2, 5], (Kind::Float, Device::Cpu));
        let zeros = Tensor::zeros(&[2, 3], (Kind::Float, Device::Cpu));
        let (h, c) = cell.step(&input, &zeros, &zeros);
        assert_eq!(h.size(), vec![2, 3]);
        assert_eq!(c.size(), vec![2, 3]);
    }
}
