//! Navigation agent: rollouts, training, evaluation, and checkpoints.
mod actions;
mod checkpoint;
mod reward;
mod rollout;

pub use actions::{move_to_candidate, Primitive};
pub use checkpoint::{load_models, save_models, CheckpointError, Manifest, ModelEntry};
pub use reward::{discounted_returns, step_reward, FAILURE_REWARD, SUCCESS_REWARD};
pub use rollout::{teacher_actions, RolloutOutput, RolloutStats, IGNORE_ACTION};

use crate::envs::Simulator;
use crate::error::{ConfigError, NavError};
use crate::features::{FeatureAssembler, FeatureError, FeatureStores};
use crate::logging::StatsLogger;
use crate::model::{
    Critic, CriticConfig, DecoderCapabilities, DecoderConfig, EncoderConfig, FeatureDims,
    InstructionEncoder, StepDecoder,
};
use crate::results::{write_results, PathPoint};
use crate::torch::{clip_grad_norm, OptimizerConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tch::{nn::VarStore, COptimizer, Device, Kind, TchError, Tensor};
use thiserror::Error;

/// Failure of a rollout. Every variant aborts the rollout it occurred in.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("{instr_id}: teacher viewpoint {teacher} is neither a candidate of {viewpoint} nor the current viewpoint")]
    TeacherMismatch {
        instr_id: String,
        viewpoint: String,
        teacher: String,
    },
    #[error("slot {slot}: expected to reach {expected:?} but simulator is at {actual:?}")]
    StateDivergence {
        slot: usize,
        expected: String,
        actual: String,
    },
    #[error("slot {slot}: view index {point_id} not reached after a full turn")]
    TurnLimit { slot: usize, point_id: usize },
    #[error("{instr_id}: move left the distance to the goal unchanged at {distance}")]
    NoDistanceChange { instr_id: String, distance: f64 },
    #[error("{instr_id}: action {action} is not a candidate or stop")]
    InvalidAction { instr_id: String, action: i64 },
    #[error("{0}: empty instruction")]
    EmptyInstruction(String),
    #[error(transparent)]
    Feature(#[from] FeatureError),
    #[error(transparent)]
    Torch(#[from] TchError),
}

/// Agent variant, selecting the auxiliary candidate scoring signals of the decoder.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentKind {
    /// Landmark similarity.
    Configuration,
    /// Landmark and relation similarity.
    ConfigurationRelation,
}

impl Default for AgentKind {
    fn default() -> Self {
        Self::Configuration
    }
}

impl AgentKind {
    pub const fn capabilities(self) -> DecoderCapabilities {
        match self {
            Self::Configuration => DecoderCapabilities {
                landmark_similarity: true,
                relation_similarity: false,
            },
            Self::ConfigurationRelation => DecoderCapabilities {
                landmark_similarity: true,
                relation_similarity: true,
            },
        }
    }
}

impl FromStr for AgentKind {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "configuration" => Ok(Self::Configuration),
            "configuration-relation" => Ok(Self::ConfigurationRelation),
            _ => Err(ConfigError::UnknownAgent(s.into())),
        }
    }
}

/// Action selection policy of a rollout.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feedback {
    /// Follow the ground-truth path.
    Teacher,
    /// Take the highest scoring candidate.
    Argmax,
    /// Sample a candidate from the policy distribution.
    Sample,
}

impl FromStr for Feedback {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "teacher" => Ok(Self::Teacher),
            "argmax" => Ok(Self::Argmax),
            "sample" => Ok(Self::Sample),
            _ => Err(ConfigError::UnsupportedFeedback(s.into())),
        }
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::Teacher => "teacher",
            Self::Argmax => "argmax",
            Self::Sample => "sample",
        };
        f.write_str(name)
    }
}

/// Normalization of the reinforcement loss.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LossNormalization {
    /// Divide by the number of valid steps.
    Total,
    /// Divide by the batch size.
    Batch,
    None,
}

impl Default for LossNormalization {
    fn default() -> Self {
        Self::Total
    }
}

impl FromStr for LossNormalization {
    type Err = ConfigError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "total" => Ok(Self::Total),
            "batch" => Ok(Self::Batch),
            "none" => Ok(Self::None),
            _ => Err(ConfigError::UnsupportedNormalization(s.into())),
        }
    }
}

/// Handling of a move that leaves the distance to the goal unchanged.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ZeroProgressPolicy {
    /// Abort the rollout with [`RolloutError::NoDistanceChange`].
    Fail,
    /// Log a warning and give zero reward.
    Warn,
}

impl Default for ZeroProgressPolicy {
    fn default() -> Self {
        Self::Fail
    }
}

/// Configuration of a [`NavAgent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub kind: AgentKind,
    pub encoder: EncoderConfig,
    pub decoder: DecoderConfig,
    pub critic: CriticConfig,
    pub optimizer: OptimizerConfig,
    pub angle_feat_size: usize,
    /// Maximum number of steps per episode.
    pub episode_len: usize,
    pub gamma: f64,
    pub entropy_weight: f64,
    /// Weight of the imitation loss when training with sampled actions.
    pub ml_weight: f64,
    /// Weight of the imitation loss when training with teacher forcing.
    pub teacher_weight: f64,
    /// Maximum global gradient norm of the encoder and the decoder.
    pub grad_clip: f64,
    /// Stopping closer than this to the goal counts as success.
    pub success_radius: f64,
    pub normalize_loss: LossNormalization,
    pub zero_progress: ZeroProgressPolicy,
    /// Mask candidates already visited in the current episode.
    pub avoid_revisit: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            kind: AgentKind::default(),
            encoder: EncoderConfig::default(),
            decoder: DecoderConfig::default(),
            critic: CriticConfig::default(),
            optimizer: OptimizerConfig::default(),
            angle_feat_size: 128,
            episode_len: 20,
            gamma: 0.9,
            entropy_weight: 0.01,
            ml_weight: 0.05,
            teacher_weight: 1.0,
            grad_clip: 40.0,
            success_radius: 3.0,
            normalize_loss: LossNormalization::default(),
            zero_progress: ZeroProgressPolicy::default(),
            avoid_revisit: false,
        }
    }
}

impl AgentConfig {
    /// Load from a JSON file. Missing fields take their default values.
    pub fn from_json_path<P: AsRef<Path>>(path: P) -> Result<Self, NavError> {
        let file = std::fs::File::open(path)?;
        Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.encoder.bidirectional && self.encoder.hidden_size % 2 != 0 {
            return Err(ConfigError::OddBidirectionalHidden(self.encoder.hidden_size));
        }
        if self.encoder.hidden_size != self.decoder.hidden_size {
            return Err(ConfigError::HiddenSizeMismatch {
                encoder: self.encoder.hidden_size,
                decoder: self.decoder.hidden_size,
            });
        }
        Ok(())
    }
}

/// A learned model with its own variables and optimizer.
struct Trainable<M> {
    vs: VarStore,
    model: M,
    optimizer: COptimizer,
}

impl<M> Trainable<M> {
    fn new<F>(device: Device, optimizer: &OptimizerConfig, build: F) -> Result<Self, TchError>
    where
        F: FnOnce(&tch::nn::Path) -> M,
    {
        let vs = VarStore::new(device);
        let model = build(&vs.root());
        let optimizer = optimizer.build(&vs)?;
        Ok(Self {
            vs,
            model,
            optimizer,
        })
    }
}

/// Vision-and-language navigation agent over a batched simulator.
pub struct NavAgent<S> {
    sim: S,
    config: AgentConfig,
    assembler: FeatureAssembler,
    encoder: Trainable<InstructionEncoder>,
    decoder: Trainable<StepDecoder>,
    critic: Trainable<Critic>,
    results: BTreeMap<String, Vec<PathPoint>>,
}

impl<S: Simulator> NavAgent<S> {
    /// Build an agent.
    ///
    /// The decoder capabilities are taken from `config.kind`.
    pub fn new(
        sim: S,
        stores: Arc<FeatureStores>,
        config: AgentConfig,
        visual_size: usize,
        device: Device,
    ) -> Result<Self, NavError> {
        config.validate()?;
        let assembler = FeatureAssembler::new(Arc::clone(&stores), config.angle_feat_size, device)?;
        let dims = FeatureDims {
            angle_feat_size: config.angle_feat_size,
            visual_size,
            text_dim: stores.objects.text_dim,
            relation_dim: stores.objects.relation_dim,
        };
        let decoder_config = DecoderConfig {
            capabilities: config.kind.capabilities(),
            ..config.decoder.clone()
        };
        let encoder = Trainable::new(device, &config.optimizer, |path| {
            InstructionEncoder::new(path, &config.encoder, &dims)
        })?;
        let decoder = Trainable::new(device, &config.optimizer, |path| {
            StepDecoder::new(path, &decoder_config, &dims)
        })?;
        let critic = Trainable::new(device, &config.optimizer, |path| {
            Critic::new(path, config.decoder.hidden_size, &config.critic)
        })?;
        log::info!(
            "{:?} agent with {} encoder, {} decoder, and {} critic variables",
            config.kind,
            encoder.vs.variables().len(),
            decoder.vs.variables().len(),
            critic.vs.variables().len()
        );
        Ok(Self {
            sim,
            config,
            assembler,
            encoder,
            decoder,
            critic,
            results: BTreeMap::new(),
        })
    }

    pub const fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub const fn simulator(&self) -> &S {
        &self.sim
    }

    pub fn simulator_mut(&mut self) -> &mut S {
        &mut self.sim
    }

    /// Mutable simulator together with the models, for inference outside of rollouts.
    pub(crate) fn inference_parts(
        &mut self,
    ) -> (&mut S, &FeatureAssembler, &InstructionEncoder, &StepDecoder) {
        (
            &mut self.sim,
            &self.assembler,
            &self.encoder.model,
            &self.decoder.model,
        )
    }

    /// Trajectories collected by the last call to [`NavAgent::test`], by instruction id.
    pub const fn results(&self) -> &BTreeMap<String, Vec<PathPoint>> {
        &self.results
    }

    /// Write the collected trajectories as JSON.
    pub fn write_results<P: AsRef<Path>>(&self, path: P) -> Result<(), NavError> {
        write_results(path, &self.results)?;
        Ok(())
    }

    /// Train for `n_iters` iterations.
    ///
    /// * `Feedback::Teacher` - one teacher-forced rollout weighted by `teacher_weight`.
    /// * `Feedback::Sample` - a teacher-forced rollout weighted by `ml_weight` (skipped when
    ///     zero) followed by a sampled rollout with the actor-critic loss.
    ///
    /// Every iteration clips the encoder and decoder gradients then steps all optimizers.
    pub fn train<L: StatsLogger>(
        &mut self,
        n_iters: usize,
        feedback: Feedback,
        logger: &mut L,
    ) -> Result<(), NavError> {
        if feedback == Feedback::Argmax {
            return Err(ConfigError::UnsupportedFeedback(feedback.to_string()).into());
        }
        for _ in 0..n_iters {
            self.encoder.optimizer.zero_grad()?;
            self.decoder.optimizer.zero_grad()?;
            self.critic.optimizer.zero_grad()?;

            let mut outputs = Vec::with_capacity(2);
            match feedback {
                Feedback::Teacher => {
                    let weight = self.config.teacher_weight;
                    outputs.push(self.rollout(Feedback::Teacher, Some(weight), false, true)?);
                }
                _ => {
                    if self.config.ml_weight != 0.0 {
                        let weight = self.config.ml_weight;
                        outputs.push(self.rollout(Feedback::Teacher, Some(weight), false, true)?);
                    }
                    outputs.push(self.rollout(Feedback::Sample, None, true, true)?);
                }
            }

            let loss = outputs.iter().fold(
                Tensor::zeros(&[], (Kind::Float, self.assembler.device())),
                |acc, output| acc + &output.loss,
            );
            logger.log_elapsed("update", |_| -> Result<(), TchError> {
                if loss.requires_grad() {
                    loss.backward();
                }
                clip_grad_norm(&self.encoder.vs.trainable_variables(), self.config.grad_clip);
                clip_grad_norm(&self.decoder.vs.trainable_variables(), self.config.grad_clip);
                self.encoder.optimizer.step()?;
                self.decoder.optimizer.step()?;
                self.critic.optimizer.step()?;
                Ok(())
            })?;

            logger.log_scalar("loss", loss.double_value(&[]));
            for output in &outputs {
                output.stats.log(logger);
            }
            logger.log_counter_increment("iteration", 1);
        }
        Ok(())
    }

    /// Evaluate without gradients, collecting one trajectory per instruction.
    ///
    /// Runs `iters` batches, or until an instruction repeats when `iters` is `None`.
    pub fn test(&mut self, feedback: Feedback, iters: Option<usize>) -> Result<(), NavError> {
        self.results.clear();
        self.sim.reset_epoch(false);
        let mut batches = 0;
        loop {
            let output = tch::no_grad(|| self.rollout(feedback, None, false, false))?;
            batches += 1;
            let mut looped = false;
            for trajectory in output.trajectories {
                if self.results.contains_key(&trajectory.instr_id) {
                    looped = true;
                } else {
                    self.results
                        .insert(trajectory.instr_id, trajectory.trajectory);
                }
            }
            let done = match iters {
                Some(n) => batches >= n,
                None => looped,
            };
            if done {
                break;
            }
        }
        log::info!("collected {} trajectories in {} batches", self.results.len(), batches);
        Ok(())
    }

    /// Save all models into a checkpoint directory.
    pub fn save<P: AsRef<Path>>(&self, epoch: usize, dir: P) -> Result<(), NavError> {
        save_models(
            dir,
            epoch,
            &[
                ("encoder", &self.encoder.vs),
                ("decoder", &self.decoder.vs),
                ("critic", &self.critic.vs),
            ],
        )?;
        Ok(())
    }

    /// Load all models from a checkpoint directory, returning its epoch.
    ///
    /// Optimizers keep their current state; checkpoints hold model variables only.
    pub fn load<P: AsRef<Path>>(&mut self, dir: P) -> Result<usize, NavError> {
        if self.config.optimizer.has_state() {
            log::warn!(
                "checkpoints do not hold optimizer state; {:?} statistics restart from zero",
                self.config.optimizer
            );
        }
        Ok(load_models(
            dir,
            &mut [
                ("encoder", &mut self.encoder.vs),
                ("decoder", &mut self.decoder.vs),
                ("critic", &mut self.critic.vs),
            ],
        )?)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::envs::{ToyConfig, ToyWorld};
    use crate::model::EncoderConfig;
    use crate::torch::optimizers::AdamConfig;

    /// A small agent over the toy world.
    pub fn toy_agent(kind: AgentKind, toy: ToyConfig) -> NavAgent<ToyWorld> {
        toy_agent_with(kind, toy, |world| world)
    }

    /// A small agent over a simulator wrapping the toy world.
    pub fn toy_agent_with<S, F>(kind: AgentKind, toy: ToyConfig, wrap: F) -> NavAgent<S>
    where
        S: Simulator,
        F: FnOnce(ToyWorld) -> S,
    {
        let world = ToyWorld::new(toy);
        let stores = Arc::new(world.feature_stores());
        let toy = world.config().clone();
        let config = AgentConfig {
            kind,
            encoder: EncoderConfig {
                vocab_size: toy.vocab_size,
                embedding_size: 8,
                hidden_size: 8,
                padding_idx: toy.padding_idx,
                separator_token: toy.separator_token,
                ..EncoderConfig::default()
            },
            decoder: DecoderConfig {
                action_embedding_size: 4,
                hidden_size: 8,
                ..DecoderConfig::default()
            },
            critic: CriticConfig::default(),
            optimizer: OptimizerConfig::Adam(AdamConfig {
                learning_rate: 1e-3,
                ..AdamConfig::default()
            }),
            angle_feat_size: 4,
            episode_len: 5,
            ..AgentConfig::default()
        };
        NavAgent::new(wrap(world), stores, config, toy.feature_size, Device::Cpu).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::toy_agent;
    use super::*;
    use crate::envs::ToyConfig;
    use crate::logging::{LogError, LogValue};
    use rstest::rstest;

    #[rstest]
    #[case("teacher", Feedback::Teacher)]
    #[case("argmax", Feedback::Argmax)]
    #[case("sample", Feedback::Sample)]
    fn parse_feedback(#[case] name: &str, #[case] expected: Feedback) {
        assert_eq!(name.parse::<Feedback>().unwrap(), expected);
        assert_eq!(expected.to_string(), name);
    }

    #[test]
    fn unsupported_feedback_is_a_config_error() {
        assert_eq!(
            "greedy".parse::<Feedback>(),
            Err(ConfigError::UnsupportedFeedback("greedy".into()))
        );
    }

    #[test]
    fn config_json_defaults_missing_fields() {
        let config: AgentConfig =
            serde_json::from_str(r#"{"kind": "configuration-relation", "gamma": 0.5}"#).unwrap();
        assert_eq!(config.kind, AgentKind::ConfigurationRelation);
        assert_eq!(config.gamma, 0.5);
        assert_eq!(config.episode_len, 20);
    }

    #[test]
    fn mismatched_hidden_sizes_are_rejected() {
        let config = AgentConfig {
            decoder: DecoderConfig {
                hidden_size: 256,
                ..DecoderConfig::default()
            },
            ..AgentConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::HiddenSizeMismatch { .. })
        ));
    }

    #[derive(Debug, Default)]
    struct Names(Vec<&'static str>);

    impl StatsLogger for Names {
        fn group_start(&mut self) {}
        fn group_log(&mut self, name: &'static str, _: LogValue) -> Result<(), LogError> {
            self.0.push(name);
            Ok(())
        }
        fn group_end(&mut self) {}
        fn flush(&mut self) {}
    }

    #[rstest]
    #[case(AgentKind::Configuration, Feedback::Teacher)]
    #[case(AgentKind::Configuration, Feedback::Sample)]
    #[case(AgentKind::ConfigurationRelation, Feedback::Sample)]
    fn train_logs_statistics(#[case] kind: AgentKind, #[case] feedback: Feedback) {
        let mut agent = toy_agent(
            kind,
            ToyConfig {
                batch_size: 3,
                ..ToyConfig::default()
            },
        );
        let mut logger = Names::default();
        agent.train(2, feedback, &mut logger).unwrap();
        for name in ["loss", "ml_loss", "reward", "success_rate", "episode_len", "update"] {
            assert!(logger.0.contains(&name), "missing {}", name);
        }
        if feedback == Feedback::Sample {
            for name in ["rl_loss", "entropy"] {
                assert!(logger.0.contains(&name), "missing {}", name);
            }
        }
    }

    #[test]
    fn train_rejects_argmax() {
        let mut agent = toy_agent(AgentKind::Configuration, ToyConfig::default());
        let result = agent.train(1, Feedback::Argmax, &mut ());
        assert!(matches!(
            result,
            Err(NavError::Config(ConfigError::UnsupportedFeedback(_)))
        ));
    }

    #[test]
    fn test_collects_each_instruction_once() {
        let toy = ToyConfig::default();
        let num_episodes = toy.num_episodes;
        let mut agent = toy_agent(AgentKind::Configuration, toy);
        agent.test(Feedback::Argmax, None).unwrap();
        assert_eq!(agent.results().len(), num_episodes);
        for trajectory in agent.results().values() {
            assert!(!trajectory.is_empty());
        }
    }

    #[test]
    fn checkpoint_round_trip() {
        let dir = std::env::temp_dir().join(format!("confignav-agent-{}", std::process::id()));
        let agent = toy_agent(AgentKind::Configuration, ToyConfig::default());
        agent.save(3, &dir).unwrap();
        let mut other = toy_agent(AgentKind::Configuration, ToyConfig::default());
        assert_eq!(other.load(&dir).unwrap(), 3);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
