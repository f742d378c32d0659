//! Single-step action decoder.
//!
//! Each step attends over the panorama, advances an LSTM cell, moves a soft pointer over the
//! instruction configurations, and scores every navigable candidate. Candidate scores mix a
//! visual attention score with optional object similarity signals selected by
//! [`DecoderCapabilities`].
use super::{ConfigContext, FeatureDims};
use crate::features::{ConfigurationBatch, ObjectDetail, StepFeatures};
use crate::torch::modules::{masked_softmax, Linear, LinearConfig, LstmCell, SoftDotAttention};
use serde::{Deserialize, Serialize};
use tch::{nn::Path, Kind, Tensor};

/// Auxiliary candidate scoring signals.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecoderCapabilities {
    /// Similarity between detected objects and configuration landmarks.
    pub landmark_similarity: bool,
    /// Similarity between object pairs and configuration landmark triplets.
    pub relation_similarity: bool,
}

impl Default for DecoderCapabilities {
    fn default() -> Self {
        Self {
            landmark_similarity: true,
            relation_similarity: false,
        }
    }
}

impl DecoderCapabilities {
    /// Object features the decoder needs from the feature assembler.
    pub const fn object_detail(&self) -> ObjectDetail {
        if self.relation_similarity {
            ObjectDetail::TextAndRelations
        } else if self.landmark_similarity {
            ObjectDetail::Text
        } else {
            ObjectDetail::None
        }
    }

    const fn num_signals(&self) -> usize {
        1 + self.landmark_similarity as usize + self.relation_similarity as usize
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecoderConfig {
    pub action_embedding_size: usize,
    pub hidden_size: usize,
    pub dropout: f64,
    /// Dropout on visual features (not on their directional encoding).
    pub feature_dropout: f64,
    pub capabilities: DecoderCapabilities,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            action_embedding_size: 64,
            hidden_size: 512,
            dropout: 0.5,
            feature_dropout: 0.3,
            capabilities: DecoderCapabilities::default(),
        }
    }
}

/// Recurrent decoder state carried between steps.
#[derive(Debug)]
pub struct DecoderState {
    /// LSTM hidden state; the critic input. `[batch, hidden]`
    pub h: Tensor,
    /// Context-aware hidden state. `[batch, hidden]`
    pub h_tilde: Tensor,
    /// LSTM cell state. `[batch, hidden]`
    pub c: Tensor,
    /// Attention distribution over configurations. `[batch, max_configs]`
    pub config_attn: Tensor,
}

impl DecoderState {
    /// State at the start of an episode: attention on the first configuration.
    pub fn initial(h_t: &Tensor, c_t: &Tensor, num_configs: usize) -> Self {
        let batch_size = h_t.size()[0];
        let config_attn = Tensor::zeros(&[batch_size, num_configs as i64], (Kind::Float, h_t.device()));
        let _ = config_attn.narrow(1, 0, 1).fill_(1.0);
        Self {
            h: h_t.shallow_clone(),
            h_tilde: h_t.shallow_clone(),
            c: c_t.shallow_clone(),
            config_attn,
        }
    }

    /// Rows of this state for the given batch positions.
    pub fn index_select(&self, index: &Tensor) -> Self {
        Self {
            h: self.h.index_select(0, index),
            h_tilde: self.h_tilde.index_select(0, index),
            c: self.c.index_select(0, index),
            config_attn: self.config_attn.index_select(0, index),
        }
    }

    /// Row `i` without the batch dimension.
    pub fn row(&self, i: i64) -> Self {
        Self {
            h: self.h.get(i),
            h_tilde: self.h_tilde.get(i),
            c: self.c.get(i),
            config_attn: self.config_attn.get(i),
        }
    }

    /// Stack unbatched rows into a batch.
    pub fn stack(rows: &[&Self]) -> Self {
        let stack = |f: fn(&Self) -> &Tensor| {
            Tensor::stack(&rows.iter().map(|s| f(s)).collect::<Vec<_>>(), 0)
        };
        Self {
            h: stack(|s| &s.h),
            h_tilde: stack(|s| &s.h_tilde),
            c: stack(|s| &s.c),
            config_attn: stack(|s| &s.config_attn),
        }
    }

    pub fn shallow_clone(&self) -> Self {
        Self {
            h: self.h.shallow_clone(),
            h_tilde: self.h_tilde.shallow_clone(),
            c: self.c.shallow_clone(),
            config_attn: self.config_attn.shallow_clone(),
        }
    }
}

/// Inputs of one decoder step; every tensor is in the same batch order.
#[derive(Debug)]
pub struct DecoderInput<'a> {
    /// Angle features of the previous action. `[batch, angle_feat_size]`
    pub action: &'a Tensor,
    pub features: &'a StepFeatures,
    pub context: &'a ConfigContext,
    pub configurations: &'a ConfigurationBatch,
    /// Episode step of each agent; the configuration pointer does not move at step 0.
    pub steps: &'a [usize],
    /// Soft switch `[stay, advance]` over configurations. `[batch, 2]`
    /// Predicted from the hidden state when `None`.
    pub phase: Option<&'a Tensor>,
}

/// Output of one decoder step.
#[derive(Debug)]
pub struct DecoderOutput {
    pub state: DecoderState,
    /// Unmasked candidate scores. `[batch, max_candidates + 1]`
    pub logits: Tensor,
}

/// Configuration-aware single-step decoder.
#[derive(Debug)]
pub struct StepDecoder {
    action_embedding: Linear,
    lstm: LstmCell,
    feature_attention: SoftDotAttention,
    config_attention: SoftDotAttention,
    phase_linear: Linear,
    candidate_attention: SoftDotAttention,
    object_relation: Option<Linear>,
    text_relation: Option<Linear>,
    mix: Linear,
    angle_feat_size: i64,
    dropout: f64,
    feature_dropout: f64,
    capabilities: DecoderCapabilities,
}

impl StepDecoder {
    pub fn new(path: &Path, config: &DecoderConfig, dims: &FeatureDims) -> Self {
        let hidden = config.hidden_size;
        let feature_size = dims.feature_size();
        let linear = LinearConfig::default();
        let relation = config.capabilities.relation_similarity;
        Self {
            action_embedding: linear.build(
                &(path / "action_embedding"),
                dims.angle_feat_size,
                config.action_embedding_size,
            ),
            lstm: LstmCell::new(
                &(path / "lstm"),
                config.action_embedding_size + feature_size,
                hidden,
            ),
            feature_attention: SoftDotAttention::new(&(path / "feature_attention"), hidden, feature_size),
            config_attention: SoftDotAttention::new(&(path / "config_attention"), hidden, hidden),
            phase_linear: linear.build(&(path / "phase"), hidden, 2),
            candidate_attention: SoftDotAttention::new(
                &(path / "candidate_attention"),
                hidden,
                feature_size,
            ),
            object_relation: relation
                .then(|| linear.build(&(path / "object_relation"), dims.relation_dim, dims.text_dim)),
            text_relation: relation
                .then(|| linear.build(&(path / "text_relation"), dims.text_dim, dims.text_dim)),
            mix: linear.build(&(path / "mix"), config.capabilities.num_signals(), 1),
            angle_feat_size: dims.angle_feat_size as i64,
            dropout: config.dropout,
            feature_dropout: config.feature_dropout,
            capabilities: config.capabilities,
        }
    }

    pub const fn capabilities(&self) -> &DecoderCapabilities {
        &self.capabilities
    }

    /// Dropout on the visual part of `[.., visual + angle]` features.
    fn drop_visual(&self, features: &Tensor, train: bool) -> Tensor {
        if !train || self.feature_dropout == 0.0 {
            return features.shallow_clone();
        }
        let size = features.size();
        let visual = size[size.len() - 1] - self.angle_feat_size;
        let last = (size.len() - 1) as i64;
        Tensor::cat(
            &[
                features.narrow(last, 0, visual).dropout(self.feature_dropout, train),
                features.narrow(last, visual, self.angle_feat_size),
            ],
            last,
        )
    }

    /// Advance the configuration pointer.
    ///
    /// The prior moves mass from each configuration to the next one in proportion to
    /// `phase[:, 1]`, is restricted to valid configurations, and is combined with the
    /// attention of `query` over the configuration context.
    fn update_config_attention(
        &self,
        query: &Tensor,
        previous: &Tensor,
        phase: &Tensor,
        context: &ConfigContext,
        steps: &[usize],
    ) -> Tensor {
        let num_configs = previous.size()[1];
        let advanced = if num_configs > 1 {
            Tensor::cat(
                &[
                    previous.zeros_like().narrow(1, 0, 1),
                    previous.narrow(1, 0, num_configs - 1),
                ],
                1,
            )
        } else {
            previous.zeros_like()
        };
        let moved = phase.narrow(1, 0, 1) * previous + phase.narrow(1, 1, 1) * advanced;
        let prior = if steps.iter().all(|&step| step > 0) {
            moved
        } else {
            let first: Vec<f32> = steps
                .iter()
                .map(|&step| if step == 0 { 1.0 } else { 0.0 })
                .collect();
            let later: Vec<f32> = first.iter().map(|x| 1.0 - x).collect();
            let gate = |g: &[f32]| {
                Tensor::of_slice(g)
                    .to_device(previous.device())
                    .unsqueeze(1)
            };
            gate(&first) * previous + gate(&later) * moved
        };
        let prior = prior.masked_fill(&context.mask, 0.0);
        let prior = &prior / (prior.sum_dim_intlist(&[1], true, Kind::Float) + 1e-10);

        let scores = self.config_attention.scores(query, &context.ctx, None);
        let attention = masked_softmax(&scores, &context.mask);
        let posterior = prior * attention;
        &posterior / (posterior.sum_dim_intlist(&[1], true, Kind::Float) + 1e-10)
    }

    /// Landmark similarity per candidate. `[batch, num_candidates]`
    fn landmark_signal(
        features: &StepFeatures,
        configs: &ConfigurationBatch,
        config_attn: &Tensor,
    ) -> Option<Tensor> {
        let objects = features.objects.as_ref()?;
        let size = objects.text.size();
        let (b, c, o, d) = (size[0], size[1], size[2], size[3]);
        let lsize = configs.landmarks.size();
        let (k, l) = (lsize[1], lsize[2]);

        let similarity = objects
            .text
            .reshape(&[b, c * o, d])
            .bmm(&configs.landmarks.reshape(&[b, k * l, d]).transpose(1, 2))
            .reshape(&[b, c, o, k, l]);
        let landmark_mask = configs.landmark_mask.reshape(&[b, 1, 1, k, l]);
        let similarity = (similarity * &landmark_mask).sum_dim_intlist(&[-1], false, Kind::Float)
            / landmark_mask
                .sum_dim_intlist(&[-1], false, Kind::Float)
                .clamp_min(1.0);
        let weighted = similarity
            .matmul(&config_attn.reshape(&[b, 1, k, 1]))
            .squeeze_dim(-1)
            * &objects.mask;
        Some(weighted.max_dim(-1, false).0)
    }

    /// Relation similarity per candidate. `[batch, num_candidates]`
    fn relation_signal(
        &self,
        features: &StepFeatures,
        configs: &ConfigurationBatch,
        config_attn: &Tensor,
    ) -> Option<Tensor> {
        let objects = features.objects.as_ref()?;
        let relation = objects.relation.as_ref()?;
        let object_relation = self.object_relation.as_ref()?;
        let text_relation = self.text_relation.as_ref()?;

        let size = objects.text.size();
        let (b, c, o, d) = (size[0], size[1], size[2], size[3]);
        let tsize = configs.triplets.size();
        let (k, t) = (tsize[1], tsize[2]);

        let subjects = configs.triplets.select(3, 0).reshape(&[b, k * t, d]);
        let predicates = text_relation
            .forward(&configs.triplets.select(3, 1))
            .reshape(&[b, k * t, d]);
        let targets = configs.triplets.select(3, 2).reshape(&[b, k * t, d]);

        let text = objects.text.reshape(&[b, c * o, d]);
        let subject_sim = text
            .bmm(&subjects.transpose(1, 2))
            .reshape(&[b, c, o, 1, k * t]);
        let target_sim = text
            .bmm(&targets.transpose(1, 2))
            .reshape(&[b, c, 1, o, k * t]);
        let predicate_sim = object_relation
            .forward(relation)
            .reshape(&[b, c * o * o, d])
            .bmm(&predicates.transpose(1, 2))
            .reshape(&[b, c, o, o, k * t]);
        let similarity = ((subject_sim + target_sim + predicate_sim) / 3.0).reshape(&[b, c, o, o, k, t]);

        let triplet_mask = configs.triplet_mask.reshape(&[b, 1, 1, 1, k, t]);
        let similarity = (similarity * &triplet_mask).sum_dim_intlist(&[-1], false, Kind::Float)
            / triplet_mask
                .sum_dim_intlist(&[-1], false, Kind::Float)
                .clamp_min(1.0);
        let pair_mask = objects.mask.unsqueeze(-1) * objects.mask.unsqueeze(-2);
        let weighted = similarity
            .matmul(&config_attn.reshape(&[b, 1, 1, k, 1]))
            .squeeze_dim(-1)
            * pair_mask;
        Some(weighted.reshape(&[b, c, o * o]).max_dim(-1, false).0)
    }

    /// Take one decoding step.
    pub fn step(&self, input: &DecoderInput, state: &DecoderState, train: bool) -> DecoderOutput {
        let action_embeds = self
            .action_embedding
            .forward(input.action)
            .tanh()
            .dropout(self.dropout, train);

        let panoramic = self.drop_visual(&input.features.panoramic, train);
        let prev_h1_drop = state.h_tilde.dropout(self.dropout, train);
        let (attn_feat, _) = self.feature_attention.attend(&prev_h1_drop, &panoramic, None);

        let lstm_input = Tensor::cat(&[action_embeds, attn_feat], 1);
        let (h_1, c_1) = self.lstm.step(&lstm_input, &state.h_tilde, &state.c);
        let h_1_drop = h_1.dropout(self.dropout, train);

        let phase = match input.phase {
            Some(phase) => phase.shallow_clone(),
            None => self.phase_linear.forward(&h_1_drop).softmax(-1, Kind::Float),
        };
        let config_attn = self.update_config_attention(
            &h_1_drop,
            &state.config_attn,
            &phase,
            input.context,
            input.steps,
        );
        let weighted_ctx = SoftDotAttention::weigh(&config_attn, &input.context.ctx);
        let h_tilde = self.config_attention.combine(&h_1_drop, &weighted_ctx);
        let h_tilde_drop = h_tilde.dropout(self.dropout, train);

        let candidates = self.drop_visual(&input.features.candidates, train);
        let baseline = self
            .candidate_attention
            .scores(&h_tilde_drop, &candidates, None);

        let mut signals = Vec::with_capacity(self.capabilities.num_signals());
        if self.capabilities.landmark_similarity {
            if let Some(signal) =
                Self::landmark_signal(input.features, input.configurations, &config_attn)
            {
                signals.push(signal);
            }
        }
        if self.capabilities.relation_similarity {
            if let Some(signal) =
                self.relation_signal(input.features, input.configurations, &config_attn)
            {
                signals.push(signal);
            }
        }
        // Missing object features contribute a zero signal
        while signals.len() + 1 < self.capabilities.num_signals() {
            signals.push(baseline.zeros_like());
        }
        signals.push(baseline);
        let logits = self
            .mix
            .forward(&Tensor::stack(&signals, -1))
            .squeeze_dim(-1);

        DecoderOutput {
            state: DecoderState {
                h: h_1,
                h_tilde,
                c: c_1,
                config_attn,
            },
            logits,
        }
    }
}
