//! Best-first search over candidate paths.
//!
//! Each agent grows a graph of search states keyed by `(viewpoint, incoming action)`. Every
//! round expands, per agent, the highest scoring state not yet visited, where the score is the
//! cumulative log-probability the decoder assigns to the actions leading to it. States reached
//! through a stop action are finished candidate paths. Search states can jump between
//! viewpoints, so a [`FloydGraph`] of the explored viewpoints stitches the physical path the
//! simulator followed.
mod floyd;

pub use floyd::FloydGraph;

use crate::agent::{NavAgent, RolloutError};
use crate::batch::{inverse_permutation, permute, sort_batch};
use crate::envs::{Observation, Simulator, VIEWS_PER_LEVEL};
use crate::features::angle_feature;
use crate::model::{DecoderInput, DecoderState};
use crate::results::PathPoint;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use tch::{Device, Kind, Tensor};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Number of finished paths to collect per instruction.
    pub candidates: usize,
    /// Maximum number of expansion rounds per batch.
    pub max_rounds: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            candidates: 5,
            max_rounds: 300,
        }
    }
}

/// Action leading into a search state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchAction {
    /// Root state at the start viewpoint.
    Start,
    Stop,
    /// Move to the candidate with this index.
    Move(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SearchKey {
    /// Viewpoint the action was taken from.
    viewpoint: String,
    action: SearchAction,
}

#[derive(Debug)]
struct SearchNode {
    /// Viewpoint the simulator is at after the action.
    next_viewpoint: String,
    location: PathPoint,
    decoder: DecoderState,
    /// Angle features of the incoming action. `[angle_feat_size]`
    action_angle: Tensor,
    from: Option<SearchKey>,
    score: f64,
    log_probs: Vec<f64>,
    insertion: usize,
}

/// A finished candidate path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidatePath {
    /// Visited states from the start, ending with the state at which the agent stopped.
    pub trajectory: Vec<PathPoint>,
    /// One action per transition of `trajectory`; the last is [`SearchAction::Stop`].
    pub actions: Vec<SearchAction>,
    /// Log-probability of each action.
    pub log_probs: Vec<f64>,
    pub score: f64,
}

/// Search output for one instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub instr_id: String,
    pub scan: String,
    /// Physical path of the simulator during the search, back to the start viewpoint.
    pub exploration: Vec<String>,
    /// Finished paths, best score first.
    pub paths: Vec<CandidatePath>,
    /// Expansion rounds run for the batch.
    pub rounds: usize,
}

/// Search bookkeeping of one agent.
#[derive(Debug)]
struct AgentSearch {
    instr_id: String,
    scan: String,
    root: SearchKey,
    nodes: HashMap<SearchKey, SearchNode>,
    visited: HashSet<SearchKey>,
    finished: Vec<SearchKey>,
    graph: FloydGraph,
    exploration: Vec<String>,
    ended: bool,
}

impl AgentSearch {
    fn new(ob: &Observation, decoder: DecoderState, action_angle: Tensor) -> Self {
        let root = SearchKey {
            viewpoint: ob.viewpoint.clone(),
            action: SearchAction::Start,
        };
        let node = SearchNode {
            next_viewpoint: ob.viewpoint.clone(),
            location: PathPoint {
                viewpoint: ob.viewpoint.clone(),
                heading: ob.heading,
                elevation: ob.elevation,
            },
            decoder,
            action_angle,
            from: None,
            score: 0.0,
            log_probs: Vec::new(),
            insertion: 0,
        };
        Self {
            instr_id: ob.instr_id.clone(),
            scan: ob.scan.clone(),
            nodes: HashMap::from([(root.clone(), node)]),
            root,
            visited: HashSet::new(),
            finished: Vec::new(),
            graph: FloydGraph::new(),
            exploration: vec![ob.viewpoint.clone()],
            ended: false,
        }
    }

    /// Choose the state to expand this round and mark it visited.
    ///
    /// Ended agents return the root to keep the batch aligned.
    fn select(&mut self, candidates: usize) -> SearchKey {
        if self.ended {
            return self.root.clone();
        }
        let best = self
            .nodes
            .iter()
            .filter(|(key, _)| !self.visited.contains(*key))
            .max_by(|(_, a), (_, b)| {
                a.score
                    .partial_cmp(&b.score)
                    .unwrap_or(Ordering::Equal)
                    .then(b.insertion.cmp(&a.insertion))
            })
            .map(|(key, _)| key.clone());
        let key = match best {
            Some(key) => key,
            None => {
                self.ended = true;
                return self.root.clone();
            }
        };
        self.visited.insert(key.clone());
        if key.action == SearchAction::Stop {
            self.finished.push(key.clone());
            if self.finished.len() >= candidates {
                self.ended = true;
            }
        }
        key
    }

    /// Record the physical move to `ob` and add its outgoing edges to the graph.
    fn explore<S: Simulator + ?Sized>(&mut self, ob: &Observation, sim: &S) {
        if !self.graph.visited(&ob.viewpoint) {
            for candidate in &ob.candidate {
                let distance = sim.distance(&ob.scan, &ob.viewpoint, &candidate.viewpoint_id);
                self.graph
                    .add_edge(&ob.viewpoint, &candidate.viewpoint_id, distance);
            }
            self.graph.update(&ob.viewpoint);
        }
        if let Some(last) = self.exploration.last() {
            let path = self.graph.path(last, &ob.viewpoint);
            self.exploration.extend(path);
        }
    }

    /// Insert a state unless an equal or better scoring one is already known.
    fn relax(&mut self, key: SearchKey, mut node: SearchNode) {
        let known = self.nodes.get(&key).map(|existing| existing.score);
        if known.map_or(true, |score| node.score > score) {
            node.insertion = self.nodes.len();
            self.nodes.insert(key, node);
        }
    }

    /// Follow back-pointers from a finished state to the root.
    fn reconstruct(&self, key: &SearchKey) -> CandidatePath {
        let finished = &self.nodes[key];
        let mut trajectory = Vec::new();
        let mut actions = Vec::new();
        let mut current = key;
        loop {
            let node = &self.nodes[current];
            trajectory.push(node.location.clone());
            match &node.from {
                Some(parent) => {
                    actions.push(current.action);
                    current = parent;
                }
                None => break,
            }
        }
        trajectory.reverse();
        actions.reverse();
        CandidatePath {
            trajectory,
            actions,
            log_probs: finished.log_probs.clone(),
            score: finished.score,
        }
    }

    fn finish(mut self, rounds: usize) -> SearchResult {
        if let Some(last) = self.exploration.last() {
            let back = self.graph.path(last, &self.root.viewpoint);
            self.exploration.extend(back);
        }
        let mut paths: Vec<CandidatePath> =
            self.finished.iter().map(|key| self.reconstruct(key)).collect();
        paths.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        SearchResult {
            instr_id: self.instr_id,
            scan: self.scan,
            exploration: self.exploration,
            paths,
            rounds,
        }
    }
}

/// Heading and elevation of the view with the given index.
fn view_angles(point_id: usize) -> (f64, f64) {
    let heading = (point_id % VIEWS_PER_LEVEL) as f64 * PI / 6.0;
    let elevation = ((point_id / VIEWS_PER_LEVEL) as f64 - 1.0) * PI / 6.0;
    (heading, elevation)
}

/// Best-first search for multiple candidate paths per instruction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PathSearch {
    config: SearchConfig,
}

impl PathSearch {
    pub const fn new(config: SearchConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// Search the next batch of episodes of the agent's simulator.
    pub fn run<S: Simulator>(
        &self,
        agent: &mut NavAgent<S>,
    ) -> Result<Vec<SearchResult>, RolloutError> {
        tch::no_grad(|| self.run_batch(agent))
    }

    /// Search every episode once, or `iters` batches.
    pub fn run_epoch<S: Simulator>(
        &self,
        agent: &mut NavAgent<S>,
        iters: Option<usize>,
    ) -> Result<Vec<SearchResult>, RolloutError> {
        agent.simulator_mut().reset_epoch(false);
        let mut seen = HashSet::new();
        let mut results = Vec::new();
        let mut batches = 0;
        loop {
            let mut looped = false;
            for result in self.run(agent)? {
                if seen.insert(result.instr_id.clone()) {
                    results.push(result);
                } else {
                    looped = true;
                }
            }
            batches += 1;
            let done = match iters {
                Some(n) => batches >= n,
                None => looped,
            };
            if done {
                break;
            }
        }
        log::info!("searched {} instructions in {} batches", results.len(), batches);
        Ok(results)
    }

    fn run_batch<S: Simulator>(
        &self,
        agent: &mut NavAgent<S>,
    ) -> Result<Vec<SearchResult>, RolloutError> {
        let padding_idx = agent.config().encoder.padding_idx;
        let (sim, assembler, encoder, decoder) = agent.inference_parts();
        let device = assembler.device();
        let angle_size = assembler.angle_feat_size();
        let detail = decoder.capabilities().object_detail();

        // Encode in sorted order, then return to slot order
        let obs = sim.reset();
        let batch = sort_batch(&obs, padding_idx, device)?;
        let sorted_configs = assembler.configurations(&permute(&obs, &batch.perm))?;
        let encoded = encoder.encode(&batch.tokens, &batch.lengths, false);
        let context = encoder.configure(&encoded, &batch.tokens, &batch.lengths, &sorted_configs);
        let inverse = inverse_permutation(&batch.perm);
        let context = context.index_select(&inverse);
        let configs = sorted_configs.index_select(&inverse);
        let index = index_tensor(&inverse, device);
        let initial = DecoderState::initial(
            &encoded.h_t.index_select(0, &index),
            &encoded.c_t.index_select(0, &index),
            configs.max_count(),
        );

        let no_action = Tensor::zeros(&[angle_size as i64], (Kind::Float, device));
        let mut agents: Vec<AgentSearch> = obs
            .iter()
            .enumerate()
            .map(|(i, ob)| AgentSearch::new(ob, initial.row(i as i64), no_action.shallow_clone()))
            .collect();

        let mut rounds = 0;
        while rounds < self.config.max_rounds {
            rounds += 1;
            let selected: Vec<SearchKey> = agents
                .iter_mut()
                .map(|search| search.select(self.config.candidates))
                .collect();

            for (slot, (search, key)) in agents.iter().zip(&selected).enumerate() {
                let node = &search.nodes[key];
                sim.new_episode(
                    slot,
                    &search.scan,
                    &node.next_viewpoint,
                    node.location.heading,
                    node.location.elevation,
                );
            }
            let obs = sim.observations();
            for (slot, ((search, key), ob)) in agents.iter_mut().zip(&selected).zip(&obs).enumerate() {
                let expected = &search.nodes[key].next_viewpoint;
                if &ob.viewpoint != expected {
                    return Err(RolloutError::StateDivergence {
                        slot,
                        expected: expected.clone(),
                        actual: ob.viewpoint.clone(),
                    });
                }
                if !search.ended {
                    search.explore(ob, &*sim);
                }
            }

            let features = assembler.step_features(&obs, detail)?;
            let nodes: Vec<&SearchNode> = agents
                .iter()
                .zip(&selected)
                .map(|(search, key)| &search.nodes[key])
                .collect();
            let state = DecoderState::stack(&nodes.iter().map(|node| &node.decoder).collect::<Vec<_>>());
            let action = Tensor::stack(
                &nodes.iter().map(|node| &node.action_angle).collect::<Vec<_>>(),
                0,
            );
            let steps: Vec<usize> = nodes.iter().map(|node| node.log_probs.len()).collect();
            let input = DecoderInput {
                action: &action,
                features: &features,
                context: &context,
                configurations: &configs,
                steps: &steps,
                phase: None,
            };
            let output = decoder.step(&input, &state, false);
            let num_candidates = features.num_candidates();
            let log_probs = output
                .logits
                .masked_fill(&features.candidate_mask, f64::NEG_INFINITY)
                .log_softmax(-1, Kind::Float)
                .to_kind(Kind::Double)
                .reshape(&[-1]);
            let log_probs = Vec::<f64>::from(&log_probs);

            for (i, ((search, key), ob)) in agents.iter_mut().zip(&selected).zip(&obs).enumerate() {
                if search.ended || key.action == SearchAction::Stop {
                    continue;
                }
                let (parent_score, parent_log_probs) = {
                    let parent = &search.nodes[key];
                    (parent.score, parent.log_probs.clone())
                };
                let decoder_state = output.state.row(i as i64);
                for j in 0..=ob.candidate.len() {
                    let log_prob = log_probs[i * num_candidates + j];
                    let (action, next_viewpoint, location, action_angle) = match ob.candidate.get(j) {
                        Some(candidate) => {
                            let (heading, elevation) = view_angles(candidate.point_id);
                            let angle =
                                angle_feature(candidate.heading, candidate.elevation, angle_size);
                            (
                                SearchAction::Move(j),
                                candidate.viewpoint_id.clone(),
                                PathPoint {
                                    viewpoint: candidate.viewpoint_id.clone(),
                                    heading,
                                    elevation,
                                },
                                Tensor::of_slice(&angle).to_device(device),
                            )
                        }
                        None => (
                            SearchAction::Stop,
                            ob.viewpoint.clone(),
                            PathPoint {
                                viewpoint: ob.viewpoint.clone(),
                                heading: ob.heading,
                                elevation: ob.elevation,
                            },
                            no_action.shallow_clone(),
                        ),
                    };
                    let mut child_log_probs = parent_log_probs.clone();
                    child_log_probs.push(log_prob);
                    search.relax(
                        SearchKey {
                            viewpoint: ob.viewpoint.clone(),
                            action,
                        },
                        SearchNode {
                            next_viewpoint,
                            location,
                            decoder: decoder_state.shallow_clone(),
                            action_angle,
                            from: Some(key.clone()),
                            score: parent_score + log_prob,
                            log_probs: child_log_probs,
                            insertion: 0,
                        },
                    );
                }
            }

            for search in &mut agents {
                if search.visited.len() == search.nodes.len() {
                    search.ended = true;
                }
            }
            if agents.iter().all(|search| search.ended) {
                break;
            }
        }

        Ok(agents.into_iter().map(|search| search.finish(rounds)).collect())
    }
}

fn index_tensor(index: &[usize], device: Device) -> Tensor {
    let index: Vec<i64> = index.iter().map(|&i| i as i64).collect();
    Tensor::of_slice(&index).to_device(device)
}

/// Write search results as JSON.
pub fn write_search_results<P: AsRef<Path>>(path: P, results: &[SearchResult]) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(&mut writer, results)?;
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::toy_agent;
    use crate::agent::AgentKind;
    use crate::envs::{ToyConfig, ToyWorld};
    use rstest::{fixture, rstest};

    #[fixture]
    fn single() -> NavAgent<ToyWorld> {
        toy_agent(
            AgentKind::Configuration,
            ToyConfig {
                batch_size: 1,
                ..ToyConfig::default()
            },
        )
    }

    #[rstest]
    fn collects_at_most_candidates(mut single: NavAgent<ToyWorld>) {
        let search = PathSearch::new(SearchConfig {
            candidates: 2,
            max_rounds: 300,
        });
        let results = search.run(&mut single).unwrap();
        assert_eq!(results.len(), 1);
        let paths = &results[0].paths;
        assert!(!paths.is_empty());
        assert!(paths.len() <= 2);
        assert!(results[0].rounds < 300);
    }

    #[rstest]
    fn respects_round_cap(mut single: NavAgent<ToyWorld>) {
        let search = PathSearch::new(SearchConfig {
            candidates: 100,
            max_rounds: 3,
        });
        let results = search.run(&mut single).unwrap();
        assert!(results[0].rounds <= 3);
    }

    #[rstest]
    fn paths_reconstruct_from_start(mut single: NavAgent<ToyWorld>) {
        let search = PathSearch::new(SearchConfig::default());
        let result = search.run(&mut single).unwrap().remove(0);
        let start = &result.exploration[0];
        for path in &result.paths {
            assert_eq!(&path.trajectory[0].viewpoint, start);
            assert_eq!(path.actions.len(), path.trajectory.len() - 1);
            assert_eq!(path.log_probs.len(), path.actions.len());
            assert_eq!(path.actions.last(), Some(&SearchAction::Stop));
            let total: f64 = path.log_probs.iter().sum();
            assert!((total - path.score).abs() < 1e-6);
        }
        for pair in result.paths.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[rstest]
    fn exploration_is_contiguous(mut single: NavAgent<ToyWorld>) {
        let result = PathSearch::default().run(&mut single).unwrap().remove(0);
        let position = |viewpoint: &str| -> i64 {
            viewpoint.rsplit_once('-').unwrap().1.parse().unwrap()
        };
        assert_eq!(result.exploration.first(), result.exploration.last());
        for pair in result.exploration.windows(2) {
            assert_eq!((position(&pair[0]) - position(&pair[1])).abs(), 1);
        }
    }

    #[test]
    fn epoch_covers_every_instruction() {
        let toy = ToyConfig::default();
        let num_episodes = toy.num_episodes;
        let mut agent = toy_agent(AgentKind::ConfigurationRelation, toy);
        let search = PathSearch::new(SearchConfig {
            candidates: 1,
            max_rounds: 50,
        });
        let results = search.run_epoch(&mut agent, None).unwrap();
        assert_eq!(results.len(), num_episodes);
    }

    #[test]
    fn view_angles_of_level_views() {
        let (heading, elevation) = view_angles(15);
        assert!((heading - PI / 2.0).abs() < 1e-12);
        assert_eq!(elevation, 0.0);
    }
}
