//! Instruction encoder with configuration pooling.
//!
//! The instruction is encoded once per episode by a bidirectional LSTM. Separator tokens split
//! the token sequence into configuration spans; each span is summarized by three attention
//! pools queried with
//! * the span's boundary token,
//! * the configuration's motion indicator embedding,
//! * the mean of the configuration's landmark embeddings,
//!
//! and the three summaries are averaged into one context vector per configuration.
use super::FeatureDims;
use crate::features::ConfigurationBatch;
use crate::torch::modules::{BiLstm, Linear, LinearConfig, SoftDotAttention};
use serde::{Deserialize, Serialize};
use tch::{nn, nn::Module, nn::Path, Device, Kind, Tensor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderConfig {
    pub vocab_size: usize,
    /// Word embedding size.
    pub embedding_size: usize,
    /// Output size; split between the two directions when bidirectional.
    pub hidden_size: usize,
    pub num_layers: usize,
    pub bidirectional: bool,
    pub dropout: f64,
    pub padding_idx: i64,
    /// Token that ends each configuration span.
    pub separator_token: i64,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            vocab_size: 992,
            embedding_size: 256,
            hidden_size: 512,
            num_layers: 1,
            bidirectional: true,
            dropout: 0.5,
            padding_idx: 0,
            separator_token: 2,
        }
    }
}

/// Token-level encoding of a sorted instruction batch.
#[derive(Debug)]
pub struct EncoderOutput {
    /// `[batch, seq_len, hidden]`
    pub ctx: Tensor,
    /// Initial decoder hidden state. `[batch, hidden]`
    pub h_t: Tensor,
    /// Initial decoder cell state. `[batch, hidden]`
    pub c_t: Tensor,
}

/// Per-configuration instruction context.
#[derive(Debug)]
pub struct ConfigContext {
    /// `[batch, max_configs, hidden]`
    pub ctx: Tensor,
    /// `true` for configurations without a text span. `[batch, max_configs]`
    pub mask: Tensor,
    /// Number of usable configurations per agent.
    pub counts: Vec<usize>,
}

impl ConfigContext {
    /// Select rows in the given order.
    pub fn index_select(&self, index: &[usize]) -> Self {
        let idx: Vec<i64> = index.iter().map(|&i| i as i64).collect();
        let idx = Tensor::of_slice(&idx).to_device(self.ctx.device());
        Self {
            ctx: self.ctx.index_select(0, &idx),
            mask: self.mask.index_select(0, &idx),
            counts: index.iter().map(|&i| self.counts[i]).collect(),
        }
    }
}

/// Token span `start..=boundary` of one configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Span {
    pub start: usize,
    /// Index of the separator (or final) token closing the span.
    pub boundary: usize,
}

impl Span {
    pub const fn num_tokens(&self) -> usize {
        self.boundary - self.start + 1
    }
}

/// Split an instruction into configuration spans at separator tokens.
///
/// Tokens after the last separator form a final span closed by the last token.
pub fn segment_instruction(tokens: &[i64], separator: i64) -> Vec<Span> {
    let mut spans = Vec::new();
    let mut start = 0;
    for (i, &token) in tokens.iter().enumerate() {
        if token == separator {
            spans.push(Span { start, boundary: i });
            start = i + 1;
        }
    }
    if start < tokens.len() {
        spans.push(Span {
            start,
            boundary: tokens.len() - 1,
        });
    }
    spans
}

/// Match segmented spans to the number of labelled configurations.
///
/// Surplus spans are merged into the last labelled one; missing spans leave trailing
/// configurations without text.
fn align_spans(instr_index: usize, mut spans: Vec<Span>, num_configs: usize) -> Vec<Span> {
    if spans.len() != num_configs {
        log::warn!(
            "instruction {} has {} segments but {} configurations",
            instr_index,
            spans.len(),
            num_configs
        );
    }
    if spans.len() > num_configs {
        let boundary = spans[spans.len() - 1].boundary;
        spans.truncate(num_configs.max(1));
        if let Some(last) = spans.last_mut() {
            last.boundary = boundary;
        }
    }
    spans
}

/// Encodes instructions and pools them into per-configuration context.
#[derive(Debug)]
pub struct InstructionEncoder {
    embedding: nn::Embedding,
    lstm: BiLstm,
    encoder2decoder: Linear,
    text_pool: SoftDotAttention,
    motion_pool: SoftDotAttention,
    landmark_pool: SoftDotAttention,
    hidden_size: usize,
    dropout: f64,
    separator_token: i64,
}

impl InstructionEncoder {
    pub fn new(path: &Path, config: &EncoderConfig, dims: &FeatureDims) -> Self {
        let num_directions = if config.bidirectional { 2 } else { 1 };
        let hidden = config.hidden_size;
        Self {
            embedding: nn::embedding(
                path / "embedding",
                config.vocab_size as i64,
                config.embedding_size as i64,
                Default::default(),
            ),
            lstm: BiLstm::new(
                &(path / "lstm"),
                config.embedding_size,
                hidden / num_directions,
                config.num_layers,
                config.bidirectional,
                config.dropout,
            ),
            encoder2decoder: LinearConfig::default().build(&(path / "encoder2decoder"), hidden, hidden),
            text_pool: SoftDotAttention::new(&(path / "text_pool"), hidden, hidden),
            motion_pool: SoftDotAttention::new(&(path / "motion_pool"), dims.text_dim, hidden),
            landmark_pool: SoftDotAttention::new(&(path / "landmark_pool"), dims.text_dim, hidden),
            hidden_size: hidden,
            dropout: config.dropout,
            separator_token: config.separator_token,
        }
    }

    /// Encode a sorted token batch.
    ///
    /// # Args
    /// * `tokens`  - `[batch, seq_len]` token ids.
    /// * `lengths` - True lengths, non-increasing.
    pub fn encode(&self, tokens: &Tensor, lengths: &[usize], train: bool) -> EncoderOutput {
        let embeds = self.embedding.forward(tokens).dropout(self.dropout, train);
        let out = self.lstm.forward(&embeds, lengths, train);
        EncoderOutput {
            ctx: out.output.dropout(self.dropout, train),
            h_t: self.encoder2decoder.forward(&out.hidden).tanh(),
            c_t: out.cell,
        }
    }

    /// Pool the token context into one vector per configuration.
    ///
    /// # Args
    /// * `encoded` - Output of [`InstructionEncoder::encode`] for the same batch.
    /// * `tokens`  - `[batch, seq_len]` token ids.
    /// * `lengths` - True instruction lengths.
    /// * `configs` - Configuration features in the same (sorted) order.
    pub fn configure(
        &self,
        encoded: &EncoderOutput,
        tokens: &Tensor,
        lengths: &[usize],
        configs: &ConfigurationBatch,
    ) -> ConfigContext {
        let device = encoded.ctx.device();
        let batch_size = lengths.len();
        let seq_len = encoded.ctx.size()[1] as usize;
        let num_configs = configs.max_count();
        let token_rows: Vec<i64> = Vec::<i64>::from(&tokens.reshape(&[-1]).to_device(Device::Cpu));

        let spans: Vec<Vec<Span>> = lengths
            .iter()
            .enumerate()
            .map(|(b, &len)| {
                let row = &token_rows[b * seq_len..b * seq_len + len];
                let spans = segment_instruction(row, self.separator_token);
                align_spans(b, spans, configs.counts[b].max(1))
            })
            .collect();
        let counts: Vec<usize> = spans.iter().map(Vec::len).collect();
        let max_span = spans.iter().flatten().map(Span::num_tokens).max().unwrap_or(1);

        let rows = batch_size * num_configs;
        let mut span_index = vec![0_i64; rows * max_span];
        let mut span_mask = vec![true; rows * max_span];
        let mut cls_index = vec![0_i64; rows];
        let mut has_span = vec![false; rows];
        for (b, spans) in spans.iter().enumerate() {
            for (k, span) in spans.iter().enumerate() {
                let row = b * num_configs + k;
                for (s, t) in (span.start..=span.boundary).enumerate() {
                    span_index[row * max_span + s] = (b * seq_len + t) as i64;
                    span_mask[row * max_span + s] = false;
                }
                cls_index[row] = (b * seq_len + span.boundary) as i64;
                has_span[row] = true;
            }
        }
        // Rows without a span attend to a single dummy position and are zeroed afterwards
        for (row, _) in has_span.iter().enumerate().filter(|(_, &has)| !has) {
            span_mask[row * max_span] = false;
        }

        let hidden = self.hidden_size as i64;
        let (rows_i, max_span_i) = (rows as i64, max_span as i64);
        let ctx_flat = encoded.ctx.reshape(&[-1, hidden]);
        let span_index = Tensor::of_slice(&span_index).to_device(device);
        let spans_ctx = ctx_flat
            .index_select(0, &span_index)
            .reshape(&[rows_i, max_span_i, hidden]);
        let span_mask = Tensor::of_slice(&span_mask)
            .reshape(&[rows_i, max_span_i])
            .to_device(device);
        let cls = ctx_flat.index_select(0, &Tensor::of_slice(&cls_index).to_device(device));

        let text_dim = configs.motion.size()[2];
        let motion = configs.motion.reshape(&[rows_i, text_dim]);
        let landmark_count = configs
            .landmark_mask
            .sum_dim_intlist(&[-1], true, Kind::Float)
            .clamp_min(1.0);
        let landmark_mean = ((&configs.landmarks * configs.landmark_mask.unsqueeze(-1))
            .sum_dim_intlist(&[2], false, Kind::Float)
            / landmark_count)
            .reshape(&[rows_i, text_dim]);

        let (text, _) = self.text_pool.attend(&cls, &spans_ctx, Some(&span_mask));
        let (motion, _) = self.motion_pool.attend(&motion, &spans_ctx, Some(&span_mask));
        let (landmark, _) = self
            .landmark_pool
            .attend(&landmark_mean, &spans_ctx, Some(&span_mask));

        let valid: Vec<f32> = has_span.iter().map(|&has| if has { 1.0 } else { 0.0 }).collect();
        let valid = Tensor::of_slice(&valid).to_device(device);
        let ctx = Tensor::stack(&[text, motion, landmark], 1).mean_dim(&[1], false, Kind::Float)
            * valid.unsqueeze(-1);
        let no_span: Vec<bool> = has_span.iter().map(|&has| !has).collect();
        let mask = Tensor::of_slice(&no_span).to_device(device);
        let num_configs = num_configs as i64;
        ConfigContext {
            ctx: ctx.reshape(&[batch_size as i64, num_configs, hidden]),
            mask: mask.reshape(&[batch_size as i64, num_configs]),
            counts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::sort_batch;
    use crate::envs::{Simulator, ToyConfig, ToyWorld};
    use crate::features::FeatureAssembler;
    use rstest::rstest;
    use std::sync::Arc;

    #[rstest]
    #[case(&[5, 6, 2, 7, 2], vec![(0, 2), (3, 4)])]
    #[case(&[5, 6, 2, 7, 8], vec![(0, 2), (3, 4)])]
    #[case(&[5, 6, 7], vec![(0, 2)])]
    #[case(&[2, 2], vec![(0, 0), (1, 1)])]
    fn segments(#[case] tokens: &[i64], #[case] expected: Vec<(usize, usize)>) {
        let spans: Vec<_> = segment_instruction(tokens, 2)
            .into_iter()
            .map(|s| (s.start, s.boundary))
            .collect();
        assert_eq!(spans, expected);
    }

    #[test]
    fn surplus_segments_merge_into_last() {
        let spans = segment_instruction(&[5, 2, 6, 2, 7, 2], 2);
        let aligned = align_spans(0, spans, 2);
        assert_eq!(
            aligned,
            vec![
                Span { start: 0, boundary: 1 },
                Span { start: 2, boundary: 5 }
            ]
        );
    }

    #[test]
    fn missing_segments_are_left_out() {
        let spans = segment_instruction(&[5, 2], 2);
        assert_eq!(align_spans(0, spans, 3).len(), 1);
    }

    #[test]
    fn configure_shapes_and_mask() {
        let world = ToyWorld::new(ToyConfig::default());
        let obs = world.observations();
        let assembler = FeatureAssembler::new(Arc::new(world.feature_stores()), 4, Device::Cpu).unwrap();
        let dims = FeatureDims {
            angle_feat_size: 4,
            visual_size: world.config().feature_size,
            text_dim: world.config().text_dim,
            relation_dim: world.config().relation_dim,
        };
        let config = EncoderConfig {
            vocab_size: world.config().vocab_size,
            embedding_size: 6,
            hidden_size: 8,
            ..EncoderConfig::default()
        };
        let vs = nn::VarStore::new(Device::Cpu);
        let encoder = InstructionEncoder::new(&vs.root(), &config, &dims);

        let batch = sort_batch(&obs, 0, Device::Cpu).unwrap();
        let configs = assembler
            .configurations(&crate::batch::permute(&obs, &batch.perm))
            .unwrap();
        let encoded = encoder.encode(&batch.tokens, &batch.lengths, false);
        assert_eq!(encoded.h_t.size(), vec![obs.len() as i64, 8]);

        let context = encoder.configure(&encoded, &batch.tokens, &batch.lengths, &configs);
        let k = configs.max_count() as i64;
        assert_eq!(context.ctx.size(), vec![obs.len() as i64, k, 8]);
        for (b, &count) in context.counts.iter().enumerate() {
            let unmasked = context
                .mask
                .get(b as i64)
                .logical_not()
                .sum(Kind::Int64)
                .int64_value(&[]);
            assert_eq!(unmasked, count as i64);
        }
    }
}
