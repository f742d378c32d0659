//! Episode rollout.
use super::actions::move_to_candidate;
use super::reward::{discounted_returns, step_reward};
use super::{Feedback, LossNormalization, NavAgent, RolloutError, ZeroProgressPolicy};
use crate::batch::{inverse_permutation, permute, sort_batch};
use crate::envs::{Observation, Simulator};
use crate::logging::StatsLogger;
use crate::model::{DecoderInput, DecoderState};
use crate::results::{PathPoint, Trajectory};
use crate::torch::Categorical;
use std::collections::HashSet;
use tch::{Device, Kind, Reduction, Tensor};

/// Action of an agent that has already ended. Excluded from every loss.
pub const IGNORE_ACTION: i64 = -100;

/// Teacher action of each agent.
///
/// The index of the candidate leading to the next ground-truth viewpoint, the stop index
/// (the number of candidates) at the goal, or [`IGNORE_ACTION`] for agents that have ended.
pub fn teacher_actions(obs: &[Observation], ended: &[bool]) -> Result<Vec<i64>, RolloutError> {
    obs.iter()
        .zip(ended)
        .map(|(ob, &ended)| {
            if ended {
                return Ok(IGNORE_ACTION);
            }
            if let Some(k) = ob
                .candidate
                .iter()
                .position(|candidate| candidate.viewpoint_id == ob.teacher)
            {
                Ok(k as i64)
            } else if ob.teacher == ob.viewpoint {
                Ok(ob.candidate.len() as i64)
            } else {
                Err(RolloutError::TeacherMismatch {
                    instr_id: ob.instr_id.clone(),
                    viewpoint: ob.viewpoint.clone(),
                    teacher: ob.teacher.clone(),
                })
            }
        })
        .collect()
}

/// Sampled actions with their log probabilities and the policy entropy. `[batch]` each.
#[derive(Debug)]
struct PolicySample {
    log_probs: Tensor,
    entropy: Tensor,
}

/// Choose one action per agent from masked logits.
fn select_actions(
    feedback: Feedback,
    logits: &Tensor,
    target: &[i64],
) -> (Vec<i64>, Option<PolicySample>) {
    match feedback {
        Feedback::Teacher => (target.to_vec(), None),
        Feedback::Argmax => (Vec::<i64>::from(&logits.argmax(-1, false)), None),
        Feedback::Sample => {
            let distribution = Categorical::new(logits);
            let actions = distribution.sample();
            let sample = PolicySample {
                log_probs: distribution.log_probs(&actions),
                entropy: distribution.entropy(),
            };
            (Vec::<i64>::from(&actions), Some(sample))
        }
    }
}

/// Candidate mask that also excludes viewpoints already visited. The stop slot stays valid.
fn revisit_mask(
    obs: &[Observation],
    visited: &[HashSet<String>],
    num_candidates: usize,
    device: Device,
) -> Tensor {
    let mut mask = Vec::with_capacity(obs.len() * num_candidates);
    for (ob, visited) in obs.iter().zip(visited) {
        mask.extend((0..num_candidates).map(|j| match ob.candidate.get(j) {
            Some(candidate) => visited.contains(&candidate.viewpoint_id),
            None => j != ob.candidate.len(),
        }));
    }
    Tensor::of_slice(&mask)
        .reshape(&[obs.len() as i64, num_candidates as i64])
        .to_device(device)
}

/// Summary statistics of a rollout.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RolloutStats {
    /// Imitation loss per agent.
    pub ml_loss: Option<f64>,
    /// Normalized actor-critic loss.
    pub rl_loss: Option<f64>,
    /// Mean policy entropy per valid step.
    pub entropy: Option<f64>,
    /// Total reward per agent.
    pub reward: f64,
    /// Fraction of agents that finished within the success radius of the goal.
    pub success_rate: f64,
    /// Mean number of actions per agent, including stop.
    pub episode_len: f64,
}

impl RolloutStats {
    pub fn log<L: StatsLogger + ?Sized>(&self, logger: &mut L) {
        let optional = [
            ("ml_loss", self.ml_loss),
            ("rl_loss", self.rl_loss),
            ("entropy", self.entropy),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                logger.log_scalar(name, value);
            }
        }
        logger.log_scalar("reward", self.reward);
        logger.log_scalar("success_rate", self.success_rate);
        logger.log_scalar("episode_len", self.episode_len);
    }
}

/// Result of a rollout.
#[derive(Debug)]
pub struct RolloutOutput {
    /// One trajectory per simulator slot, in slot order.
    pub trajectories: Vec<Trajectory>,
    /// Number of actions taken by each agent, including stop. Slot order.
    pub lengths: Vec<usize>,
    /// Distance to the goal of each agent after its last action. Slot order.
    pub distances: Vec<f64>,
    /// Weighted training loss; zero when no loss was requested.
    pub loss: Tensor,
    pub stats: RolloutStats,
}

impl<S: Simulator> NavAgent<S> {
    /// Run one batch of episodes from a simulator reset.
    ///
    /// # Args
    /// * `feedback` - Action selection policy.
    /// * `train_ml` - Weight of the imitation loss; not computed when `None`.
    /// * `train_rl` - Compute the actor-critic loss. Only has an effect with
    ///     [`Feedback::Sample`].
    /// * `train` - Enable dropout.
    pub fn rollout(
        &mut self,
        feedback: Feedback,
        train_ml: Option<f64>,
        train_rl: bool,
        train: bool,
    ) -> Result<RolloutOutput, RolloutError> {
        let device = self.assembler.device();
        let train_rl = train_rl && feedback == Feedback::Sample;
        let radius = self.config.success_radius;

        let raw_obs = self.sim.reset();
        let batch = sort_batch(&raw_obs, self.config.encoder.padding_idx, device)?;
        let perm = batch.perm.clone();
        let mut obs = permute(&raw_obs, &perm);
        let batch_size = obs.len();

        let configs = self.assembler.configurations(&obs)?;
        let encoder = &self.encoder.model;
        let encoded = encoder.encode(&batch.tokens, &batch.lengths, train);
        let context = encoder.configure(&encoded, &batch.tokens, &batch.lengths, &configs);
        let mut state = DecoderState::initial(&encoded.h_t, &encoded.c_t, configs.max_count());
        let detail = self.decoder.model.capabilities().object_detail();

        let mut trajectories: Vec<Trajectory> = obs
            .iter()
            .map(|ob| {
                let start = PathPoint {
                    viewpoint: ob.viewpoint.clone(),
                    heading: ob.heading,
                    elevation: ob.elevation,
                };
                Trajectory::new(ob.instr_id.clone(), start)
            })
            .collect();
        let mut visited: Vec<HashSet<String>> = obs
            .iter()
            .map(|ob| HashSet::from([ob.viewpoint.clone()]))
            .collect();
        let mut ended = vec![false; batch_size];
        let mut num_actions = vec![0_usize; batch_size];
        let mut last_distance: Vec<f64> = obs.iter().map(|ob| ob.distance).collect();
        let mut action_angles = Tensor::zeros(
            &[batch_size as i64, self.config.angle_feat_size as i64],
            (Kind::Float, device),
        );

        let mut ml_loss = Tensor::zeros(&[], (Kind::Float, device));
        let mut total_rewards = vec![0.0; batch_size];
        let mut rewards: Vec<Vec<f64>> = Vec::new();
        let mut masks: Vec<Vec<f64>> = Vec::new();
        let mut samples: Vec<PolicySample> = Vec::new();
        let mut hidden_states: Vec<Tensor> = Vec::new();

        for t in 0..self.config.episode_len {
            let features = self.assembler.step_features(&obs, detail)?;
            let steps = vec![t; batch_size];
            let input = DecoderInput {
                action: &action_angles,
                features: &features,
                context: &context,
                configurations: &configs,
                steps: &steps,
                phase: None,
            };
            let output = self.decoder.model.step(&input, &state, train);
            let logits = output
                .logits
                .masked_fill(&features.candidate_mask, f64::NEG_INFINITY);

            let target = teacher_actions(&obs, &ended)?;
            if train_ml.is_some() {
                let target = Tensor::of_slice(&target).to_device(device);
                ml_loss += logits.log_softmax(-1, Kind::Float).g_nll_loss(
                    &target,
                    None::<Tensor>,
                    Reduction::Sum,
                    IGNORE_ACTION,
                );
            }

            let selection_logits = if self.config.avoid_revisit {
                let mask = revisit_mask(&obs, &visited, features.num_candidates(), device);
                output.logits.masked_fill(&mask, f64::NEG_INFINITY)
            } else {
                logits
            };
            let (actions, sample) = select_actions(feedback, &selection_logits, &target);
            samples.extend(sample);

            let mut stopped = vec![false; batch_size];
            let mut taken = vec![IGNORE_ACTION; batch_size];
            for (i, ob) in obs.iter().enumerate() {
                if ended[i] {
                    continue;
                }
                let action = actions[i];
                taken[i] = action;
                num_actions[i] += 1;
                match usize::try_from(action) {
                    Ok(k) if k < ob.candidate.len() => {
                        let candidate = &ob.candidate[k];
                        let points = move_to_candidate(&mut self.sim, perm[i], candidate)?;
                        trajectories[i].trajectory.extend(points);
                        visited[i].insert(candidate.viewpoint_id.clone());
                    }
                    Ok(k) if k == ob.candidate.len() => stopped[i] = true,
                    _ => {
                        return Err(RolloutError::InvalidAction {
                            instr_id: ob.instr_id.clone(),
                            action,
                        })
                    }
                }
            }
            action_angles = self.assembler.action_angles(&obs, &taken);
            obs = permute(&self.sim.observations(), &perm);
            hidden_states.push(output.state.h.shallow_clone());

            let mut step_rewards = vec![0.0; batch_size];
            let mut step_mask = vec![0.0; batch_size];
            for i in (0..batch_size).filter(|&i| !ended[i]) {
                step_mask[i] = 1.0;
                let distance = obs[i].distance;
                step_rewards[i] = match step_reward(stopped[i], last_distance[i], distance, radius) {
                    Some(reward) => reward,
                    None => match self.config.zero_progress {
                        ZeroProgressPolicy::Fail => {
                            return Err(RolloutError::NoDistanceChange {
                                instr_id: obs[i].instr_id.clone(),
                                distance,
                            })
                        }
                        ZeroProgressPolicy::Warn => {
                            log::warn!(
                                "{}: move left the distance to the goal unchanged at {}",
                                obs[i].instr_id,
                                distance
                            );
                            0.0
                        }
                    },
                };
                total_rewards[i] += step_rewards[i];
            }
            if train_rl {
                rewards.push(step_rewards);
                masks.push(step_mask);
            }

            for i in 0..batch_size {
                if !ended[i] {
                    last_distance[i] = obs[i].distance;
                }
                ended[i] |= stopped[i];
            }
            state = output.state;
            if ended.iter().all(|&e| e) {
                break;
            }
        }

        let mut loss = Tensor::zeros(&[], (Kind::Float, device));
        let mut stats = RolloutStats {
            success_rate: obs.iter().filter(|ob| ob.distance < radius).count() as f64
                / batch_size as f64,
            episode_len: num_actions.iter().sum::<usize>() as f64 / batch_size as f64,
            reward: total_rewards.iter().sum::<f64>() / batch_size as f64,
            ..RolloutStats::default()
        };

        if let Some(weight) = train_ml {
            stats.ml_loss = Some(ml_loss.double_value(&[]) / batch_size as f64);
            loss += ml_loss * (weight / batch_size as f64);
        }

        if train_rl && !rewards.is_empty() {
            let bootstrap = if ended.iter().all(|&e| e) {
                vec![0.0; batch_size]
            } else {
                let features = self.assembler.step_features(&obs, detail)?;
                let steps = vec![rewards.len(); batch_size];
                let input = DecoderInput {
                    action: &action_angles,
                    features: &features,
                    context: &context,
                    configurations: &configs,
                    steps: &steps,
                    phase: None,
                };
                let last = self.decoder.model.step(&input, &state, train);
                let values = self
                    .critic
                    .model
                    .values(&last.state.h, train)
                    .detach()
                    .to_kind(Kind::Double);
                Vec::<f64>::from(&values)
                    .into_iter()
                    .zip(&ended)
                    .map(|(value, &ended)| if ended { 0.0 } else { value })
                    .collect()
            };
            let returns = discounted_returns(&rewards, &bootstrap, self.config.gamma);

            let mut rl_loss = Tensor::zeros(&[], (Kind::Float, device));
            let mut entropy = 0.0;
            let mut total = 0.0;
            for (t, sample) in samples.iter().enumerate() {
                let mask = Tensor::of_slice(&masks[t]).to_kind(Kind::Float).to_device(device);
                let step_returns = Tensor::of_slice(&returns[t])
                    .to_kind(Kind::Float)
                    .to_device(device);
                let values = self.critic.model.values(&hidden_states[t], train);
                let error = &step_returns - &values;
                let advantage = error.detach();
                rl_loss += (-&sample.log_probs * &advantage * &mask).sum(Kind::Float);
                rl_loss += (&error * &error * &mask).sum(Kind::Float) * 0.5;
                let step_entropy = (&sample.entropy * &mask).sum(Kind::Float);
                entropy += step_entropy.double_value(&[]);
                rl_loss -= step_entropy * self.config.entropy_weight;
                total += masks[t].iter().sum::<f64>();
            }
            let rl_loss = match self.config.normalize_loss {
                LossNormalization::Total => rl_loss / total.max(1.0),
                LossNormalization::Batch => rl_loss / batch_size as f64,
                LossNormalization::None => rl_loss,
            };
            stats.rl_loss = Some(rl_loss.double_value(&[]));
            stats.entropy = Some(entropy / total.max(1.0));
            loss += rl_loss;
        }

        let inverse = inverse_permutation(&perm);
        Ok(RolloutOutput {
            trajectories: permute(&trajectories, &inverse),
            lengths: permute(&num_actions, &inverse),
            distances: permute(&last_distance, &inverse),
            loss,
            stats,
        })
    }
}
