//! Deterministic corridor simulator.
//!
//! Every scan is a straight corridor of viewpoints. The next viewpoint lies straight ahead at
//! eye level and the previous one behind and below, so walking backwards needs both turns and
//! a change of elevation. Features are drawn once from a seeded generator, together with
//! matching [`FeatureStores`].
use super::{Candidate, Observation, SimState, Simulator, NUM_VIEWS, VIEWS_PER_LEVEL};
use crate::features::{
    ConfigKey, ConfigurationFeatures, ConfigurationStore, FeatureStores, ObjectFeatures,
    ObjectStore, ViewKey,
};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;

/// View index facing the next viewpoint of the corridor (heading 90°, level).
const FORWARD_POINT: usize = VIEWS_PER_LEVEL + 3;
/// View index facing the previous viewpoint (heading 270°, looking down).
const BACKWARD_POINT: usize = 9;
/// Initial view index of every episode (heading 0°, level).
const START_VIEW: usize = VIEWS_PER_LEVEL;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToyConfig {
    pub num_scans: usize,
    /// Viewpoints per scan.
    pub scan_length: usize,
    pub num_episodes: usize,
    pub batch_size: usize,
    pub feature_size: usize,
    pub vocab_size: usize,
    pub padding_idx: i64,
    pub separator_token: i64,
    pub max_instruction_len: usize,
    pub max_configurations: usize,
    pub num_objects: usize,
    pub text_dim: usize,
    pub relation_dim: usize,
    pub landmarks_per_configuration: usize,
    pub triplets_per_configuration: usize,
    /// Distance between neighbouring viewpoints.
    pub hop_distance: f64,
    pub seed: u64,
}

impl Default for ToyConfig {
    fn default() -> Self {
        Self {
            num_scans: 2,
            scan_length: 6,
            num_episodes: 8,
            batch_size: 2,
            feature_size: 8,
            vocab_size: 24,
            padding_idx: 0,
            separator_token: 2,
            max_instruction_len: 14,
            max_configurations: 3,
            num_objects: 3,
            text_dim: 6,
            relation_dim: 4,
            landmarks_per_configuration: 2,
            triplets_per_configuration: 2,
            hop_distance: 2.5,
            seed: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Episode {
    instr_id: String,
    scan: usize,
    start: usize,
    goal: usize,
    tokens: Vec<i64>,
    configurations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    episode: usize,
    position: usize,
    view_index: usize,
}

/// Corridor simulator with one slot per agent.
#[derive(Debug, Clone)]
pub struct ToyWorld {
    config: ToyConfig,
    episodes: Vec<Episode>,
    order: Vec<usize>,
    cursor: usize,
    slots: Vec<Slot>,
    /// Panoramic features indexed by `[scan][position]`.
    view_features: Vec<Vec<Vec<f32>>>,
    rng: ChaCha8Rng,
}

fn normal_vec(rng: &mut ChaCha8Rng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.sample(StandardNormal)).collect()
}

fn heading_of(view_index: usize) -> f64 {
    (view_index % VIEWS_PER_LEVEL) as f64 * PI / 6.0
}

fn elevation_of(view_index: usize) -> f64 {
    ((view_index / VIEWS_PER_LEVEL) as f64 - 1.0) * PI / 6.0
}

impl ToyWorld {
    pub fn new(config: ToyConfig) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
        let view_features = (0..config.num_scans)
            .map(|_| {
                (0..config.scan_length)
                    .map(|_| normal_vec(&mut rng, NUM_VIEWS * config.feature_size))
                    .collect()
            })
            .collect();
        let episodes = (0..config.num_episodes)
            .map(|i| Self::sample_episode(&config, i, &mut rng))
            .collect();
        let mut world = Self {
            order: (0..config.num_episodes).collect(),
            cursor: 0,
            slots: Vec::new(),
            episodes,
            view_features,
            rng,
            config,
        };
        world.reset();
        world
    }

    fn sample_episode(config: &ToyConfig, index: usize, rng: &mut ChaCha8Rng) -> Episode {
        let scan = rng.gen_range(0..config.num_scans);
        let start = rng.gen_range(0..config.scan_length);
        let goals: Vec<usize> = (0..config.scan_length)
            .filter(|&g| g != start && g.abs_diff(start) <= 3)
            .collect();
        let goal = goals.choose(rng).copied().unwrap_or(start);

        let max_words = (config.max_instruction_len / config.max_configurations)
            .saturating_sub(1)
            .max(1);
        let num_configurations = rng.gen_range(1..=config.max_configurations);
        let mut tokens = Vec::with_capacity(config.max_instruction_len);
        let mut configurations = Vec::with_capacity(num_configurations);
        for k in 0..num_configurations {
            let words = rng.gen_range(1..=max_words);
            for _ in 0..words {
                tokens.push(rng.gen_range(3..config.vocab_size as i64));
            }
            tokens.push(config.separator_token);
            configurations.push(format!("part {}", k));
        }
        tokens.resize(config.max_instruction_len.max(tokens.len()), config.padding_idx);
        Episode {
            instr_id: format!("{}_{}", index, 0),
            scan,
            start,
            goal,
            tokens,
            configurations,
        }
    }

    pub const fn config(&self) -> &ToyConfig {
        &self.config
    }

    fn scan_name(scan: usize) -> String {
        format!("scan{}", scan)
    }

    fn viewpoint_name(scan: usize, position: usize) -> String {
        format!("scan{}-{:02}", scan, position)
    }

    fn position_of(&self, scan: usize, viewpoint: &str) -> Option<usize> {
        let (prefix, position) = viewpoint.rsplit_once('-')?;
        let position: usize = position.parse().ok()?;
        (prefix == Self::scan_name(scan) && position < self.config.scan_length).then(|| position)
    }

    /// Neighbours of a position as `(position, point_id)` in navigable-location order.
    fn neighbours(&self, position: usize) -> Vec<(usize, usize)> {
        let mut neighbours = Vec::with_capacity(2);
        if position + 1 < self.config.scan_length {
            neighbours.push((position + 1, FORWARD_POINT));
        }
        if position > 0 {
            neighbours.push((position - 1, BACKWARD_POINT));
        }
        neighbours
    }

    fn observation(&self, slot: &Slot) -> Observation {
        let episode = &self.episodes[slot.episode];
        let heading = heading_of(slot.view_index);
        let elevation = elevation_of(slot.view_index);
        let panorama = &self.view_features[episode.scan][slot.position];
        let feature_size = self.config.feature_size;

        let candidate = self
            .neighbours(slot.position)
            .into_iter()
            .enumerate()
            .map(|(i, (position, point_id))| Candidate {
                viewpoint_id: Self::viewpoint_name(episode.scan, position),
                point_id,
                heading: heading_of(point_id) - heading,
                elevation: elevation_of(point_id) - elevation,
                location_index: i + 1,
                feature: panorama[point_id * feature_size..(point_id + 1) * feature_size].to_vec(),
            })
            .collect();

        let teacher = match slot.position.cmp(&episode.goal) {
            std::cmp::Ordering::Less => slot.position + 1,
            std::cmp::Ordering::Greater => slot.position - 1,
            std::cmp::Ordering::Equal => slot.position,
        };
        let instructions = episode
            .tokens
            .iter()
            .filter(|&&t| t != self.config.padding_idx)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ");

        Observation {
            instr_id: episode.instr_id.clone(),
            scan: Self::scan_name(episode.scan),
            viewpoint: Self::viewpoint_name(episode.scan, slot.position),
            view_index: slot.view_index,
            heading,
            elevation,
            instructions,
            instr_encoding: episode.tokens.clone(),
            configurations: episode.configurations.clone(),
            candidate,
            feature: panorama.clone(),
            distance: slot.position.abs_diff(episode.goal) as f64 * self.config.hop_distance,
            teacher: Self::viewpoint_name(episode.scan, teacher),
        }
    }

    /// Feature stores consistent with this world.
    pub fn feature_stores(&self) -> FeatureStores {
        let config = &self.config;
        let mut rng = ChaCha8Rng::seed_from_u64(config.seed.wrapping_add(1));
        let mut objects = ObjectStore {
            num_objects: config.num_objects,
            text_dim: config.text_dim,
            relation_dim: config.relation_dim,
            scans: HashMap::new(),
        };
        for scan in 0..config.num_scans {
            for position in 0..config.scan_length {
                let viewpoint = Self::viewpoint_name(scan, position);
                for heading in 0..VIEWS_PER_LEVEL {
                    let valid = rng.gen_range(1..=config.num_objects);
                    let features = ObjectFeatures {
                        text_feature: (0..config.num_objects)
                            .map(|_| normal_vec(&mut rng, config.text_dim))
                            .collect(),
                        text_mask: (0..config.num_objects).map(|o| o < valid).collect(),
                        relation: (0..config.num_objects)
                            .map(|_| {
                                (0..config.num_objects)
                                    .map(|_| normal_vec(&mut rng, config.relation_dim))
                                    .collect()
                            })
                            .collect(),
                    };
                    objects.insert(
                        &Self::scan_name(scan),
                        &viewpoint,
                        ViewKey::from_point_id(heading),
                        features,
                    );
                }
            }
        }

        let mut configurations = ConfigurationStore {
            text_dim: config.text_dim,
            entries: HashMap::new(),
        };
        for episode in &self.episodes {
            for index in 0..episode.configurations.len() {
                let num_landmarks = rng.gen_range(0..=config.landmarks_per_configuration);
                let num_triplets = rng.gen_range(0..=config.triplets_per_configuration);
                let features = ConfigurationFeatures {
                    landmarks: (0..num_landmarks)
                        .map(|_| normal_vec(&mut rng, config.text_dim))
                        .collect(),
                    motion: normal_vec(&mut rng, config.text_dim),
                    triplets: (0..num_triplets)
                        .map(|_| {
                            [
                                normal_vec(&mut rng, config.text_dim),
                                normal_vec(&mut rng, config.text_dim),
                                normal_vec(&mut rng, config.text_dim),
                            ]
                        })
                        .collect(),
                };
                configurations
                    .entries
                    .insert(ConfigKey::new(episode.instr_id.clone(), index), features);
            }
        }
        FeatureStores {
            objects,
            configurations,
        }
    }
}

impl Simulator for ToyWorld {
    fn batch_size(&self) -> usize {
        self.config.batch_size
    }

    fn reset(&mut self) -> Vec<Observation> {
        self.slots = (0..self.config.batch_size)
            .map(|_| {
                let episode = self.order[self.cursor % self.order.len()];
                self.cursor += 1;
                Slot {
                    episode,
                    position: self.episodes[episode].start,
                    view_index: START_VIEW,
                }
            })
            .collect();
        self.observations()
    }

    fn reset_epoch(&mut self, shuffle: bool) {
        if shuffle {
            self.order.shuffle(&mut self.rng);
        }
        self.cursor = 0;
    }

    fn observations(&self) -> Vec<Observation> {
        self.slots.iter().map(|slot| self.observation(slot)).collect()
    }

    fn make_action(&mut self, slot: usize, index: usize, heading: f64, elevation: f64) {
        let state = self.state(slot);
        let scan = self.episodes[self.slots[slot].episode].scan;
        let current = &mut self.slots[slot];
        if index > 0 {
            if let Some(position) = state
                .navigable_locations
                .get(index)
                .and_then(|viewpoint| viewpoint.rsplit_once('-'))
                .and_then(|(_, position)| position.parse().ok())
            {
                current.position = position;
            } else {
                log::warn!("scan{} has no navigable location {}", scan, index);
            }
        }
        let level = (current.view_index / VIEWS_PER_LEVEL) as i64;
        let heading_index = (current.view_index % VIEWS_PER_LEVEL) as i64;
        let level = (level + elevation.round() as i64).clamp(0, 2);
        let heading_index = (heading_index + heading.round() as i64).rem_euclid(12);
        current.view_index = (level * 12 + heading_index) as usize;
    }

    fn state(&self, slot: usize) -> SimState {
        let current = &self.slots[slot];
        let scan = self.episodes[current.episode].scan;
        let mut navigable_locations = vec![Self::viewpoint_name(scan, current.position)];
        navigable_locations.extend(
            self.neighbours(current.position)
                .into_iter()
                .map(|(position, _)| Self::viewpoint_name(scan, position)),
        );
        SimState {
            scan: Self::scan_name(scan),
            viewpoint: Self::viewpoint_name(scan, current.position),
            heading: heading_of(current.view_index),
            elevation: elevation_of(current.view_index),
            view_index: current.view_index,
            navigable_locations,
        }
    }

    fn new_episode(&mut self, slot: usize, scan: &str, viewpoint: &str, heading: f64, elevation: f64) {
        let scan_index = self.episodes[self.slots[slot].episode].scan;
        if scan != Self::scan_name(scan_index) {
            log::warn!("slot {} cannot move from scan{} to {}", slot, scan_index, scan);
            return;
        }
        match self.position_of(scan_index, viewpoint) {
            Some(position) => {
                let heading_index = (heading / (PI / 6.0)).round().rem_euclid(12.0) as usize;
                let level = (elevation / (PI / 6.0)).round().clamp(-1.0, 1.0) + 1.0;
                let current = &mut self.slots[slot];
                current.position = position;
                current.view_index = level as usize * VIEWS_PER_LEVEL + heading_index;
            }
            None => log::warn!("unknown viewpoint {} in {}", viewpoint, scan),
        }
    }

    fn distance(&self, _scan: &str, from: &str, to: &str) -> f64 {
        let parse = |viewpoint: &str| -> Option<usize> {
            viewpoint.rsplit_once('-')?.1.parse().ok()
        };
        match (parse(from), parse(to)) {
            (Some(a), Some(b)) => a.abs_diff(b) as f64 * self.config.hop_distance,
            _ => f64::INFINITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn world() -> ToyWorld {
        ToyWorld::new(ToyConfig::default())
    }

    #[rstest]
    fn reset_gives_one_observation_per_slot(mut world: ToyWorld) {
        let obs = world.reset();
        assert_eq!(obs.len(), world.batch_size());
        for ob in &obs {
            assert_eq!(ob.view_index, START_VIEW);
            assert_eq!(ob.feature.len(), NUM_VIEWS * world.config().feature_size);
            assert!(!ob.candidate.is_empty());
            assert!(ob.distance > 0.0);
        }
    }

    #[rstest]
    fn candidates_match_navigable_locations(world: ToyWorld) {
        let obs = world.observations();
        let state = world.state(0);
        for candidate in &obs[0].candidate {
            assert_eq!(
                state.navigable_locations[candidate.location_index],
                candidate.viewpoint_id
            );
        }
    }

    #[rstest]
    fn turning_wraps_heading(mut world: ToyWorld) {
        world.make_action(0, 0, -1.0, 0.0);
        assert_eq!(world.state(0).view_index, START_VIEW + 11);
        world.make_action(0, 0, 1.0, -1.0);
        assert_eq!(world.state(0).view_index, 0);
        world.make_action(0, 0, 0.0, -1.0);
        assert_eq!(world.state(0).view_index, 0);
    }

    #[rstest]
    fn forward_move_changes_viewpoint(mut world: ToyWorld) {
        let state = world.state(0);
        world.make_action(0, 1, 0.0, 0.0);
        assert_eq!(world.state(0).viewpoint, state.navigable_locations[1]);
    }

    #[rstest]
    fn teacher_leads_to_goal(mut world: ToyWorld) {
        let obs = world.reset();
        for (slot, ob) in obs.iter().enumerate() {
            let mut ob = ob.clone();
            let mut steps = 0;
            while ob.teacher != ob.viewpoint {
                let candidate = ob
                    .candidate
                    .iter()
                    .find(|c| c.viewpoint_id == ob.teacher)
                    .unwrap();
                world.new_episode(slot, &ob.scan, &candidate.viewpoint_id, 0.0, 0.0);
                ob = world.observations()[slot].clone();
                steps += 1;
                assert!(steps <= 3);
            }
            assert_eq!(ob.distance, 0.0);
        }
    }

    #[rstest]
    fn stores_cover_every_lookup(world: ToyWorld) {
        let stores = world.feature_stores();
        for ob in world.observations() {
            for candidate in &ob.candidate {
                assert!(stores
                    .objects
                    .get(&ob.scan, &ob.viewpoint, ViewKey::from_point_id(candidate.point_id))
                    .is_ok());
            }
            for k in 0..ob.configurations.len() {
                assert!(stores.configurations.get(&ob.instr_id, k).is_ok());
            }
        }
    }
}
