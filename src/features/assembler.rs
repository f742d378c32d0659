//! Batched per-step feature tensors.
use super::{FeatureError, FeatureStores, ViewKey};
use crate::envs::{Observation, NUM_VIEWS, VIEWS_PER_LEVEL};
use crate::error::ConfigError;
use std::f64::consts::PI;
use std::sync::Arc;
use tch::{Device, Tensor};

/// Directional encoding `[sin h, cos h, sin e, cos e]` tiled to `size` values.
pub fn angle_feature(heading: f64, elevation: f64, size: usize) -> Vec<f32> {
    let unit = [
        heading.sin() as f32,
        heading.cos() as f32,
        elevation.sin() as f32,
        elevation.cos() as f32,
    ];
    unit.iter().copied().cycle().take(size).collect()
}

/// Boolean mask that is `true` at positions `>= lengths[i]`. `[batch, max_len]`
pub fn length_mask(lengths: &[usize], max_len: usize, device: Device) -> Tensor {
    let mask: Vec<bool> = lengths
        .iter()
        .flat_map(|&len| (0..max_len).map(move |t| t >= len))
        .collect();
    Tensor::of_slice(&mask)
        .reshape(&[lengths.len() as i64, max_len as i64])
        .to_device(device)
}

/// How much object information to gather for each candidate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ObjectDetail {
    None,
    Text,
    TextAndRelations,
}

/// Object detections in the direction of each candidate.
#[derive(Debug)]
pub struct CandidateObjects {
    /// `[batch, num_candidates, num_objects, text_dim]`
    pub text: Tensor,
    /// 1 for real detections, 0 for padding. `[batch, num_candidates, num_objects]`
    pub mask: Tensor,
    /// `[batch, num_candidates, num_objects, num_objects, relation_dim]`
    pub relation: Option<Tensor>,
}

/// Feature tensors for one decoding step.
#[derive(Debug)]
pub struct StepFeatures {
    /// `[batch, 36, feature_size + angle_feat_size]`
    pub panoramic: Tensor,
    /// Candidate features with a trailing all-zero stop slot.
    /// `[batch, max_candidates + 1, feature_size + angle_feat_size]`
    pub candidates: Tensor,
    /// Number of candidates plus one (the stop action) per agent.
    pub candidate_lengths: Vec<usize>,
    /// `true` on padded candidate slots. `[batch, max_candidates + 1]`
    pub candidate_mask: Tensor,
    pub objects: Option<CandidateObjects>,
}

impl StepFeatures {
    pub fn num_candidates(&self) -> usize {
        self.candidate_lengths.iter().copied().max().unwrap_or(1)
    }
}

/// Per-configuration features of each instruction.
#[derive(Debug)]
pub struct ConfigurationBatch {
    /// Number of configurations per agent.
    pub counts: Vec<usize>,
    /// `[batch, max_configs, max_landmarks, text_dim]`
    pub landmarks: Tensor,
    /// 1 for real landmarks. `[batch, max_configs, max_landmarks]`
    pub landmark_mask: Tensor,
    /// `[batch, max_configs, text_dim]`
    pub motion: Tensor,
    /// `[batch, max_configs, max_triplets, 3, text_dim]`
    pub triplets: Tensor,
    /// 1 for real triplets. `[batch, max_configs, max_triplets]`
    pub triplet_mask: Tensor,
}

impl ConfigurationBatch {
    pub fn max_count(&self) -> usize {
        self.counts.iter().copied().max().unwrap_or(1).max(1)
    }

    /// Select rows in the given order.
    pub fn index_select(&self, index: &[usize]) -> Self {
        let device = self.landmarks.device();
        let idx: Vec<i64> = index.iter().map(|&i| i as i64).collect();
        let idx = Tensor::of_slice(&idx).to_device(device);
        Self {
            counts: index.iter().map(|&i| self.counts[i]).collect(),
            landmarks: self.landmarks.index_select(0, &idx),
            landmark_mask: self.landmark_mask.index_select(0, &idx),
            motion: self.motion.index_select(0, &idx),
            triplets: self.triplets.index_select(0, &idx),
            triplet_mask: self.triplet_mask.index_select(0, &idx),
        }
    }
}

fn check_len(what: &'static str, actual: usize, expected: usize) -> Result<(), FeatureError> {
    if actual == expected {
        Ok(())
    } else {
        Err(FeatureError::Length {
            what,
            actual,
            expected,
        })
    }
}

fn to_tensor(data: &[f32], shape: &[usize], device: Device) -> Tensor {
    let shape: Vec<i64> = shape.iter().map(|&d| d as i64).collect();
    Tensor::of_slice(data).reshape(&shape).to_device(device)
}

/// Gathers observation and store features into padded batch tensors.
#[derive(Debug, Clone)]
pub struct FeatureAssembler {
    stores: Arc<FeatureStores>,
    angle_feat_size: usize,
    device: Device,
}

impl FeatureAssembler {
    pub fn new(
        stores: Arc<FeatureStores>,
        angle_feat_size: usize,
        device: Device,
    ) -> Result<Self, ConfigError> {
        if angle_feat_size == 0 || angle_feat_size % 4 != 0 {
            return Err(ConfigError::AngleFeatureSize(angle_feat_size));
        }
        Ok(Self {
            stores,
            angle_feat_size,
            device,
        })
    }

    pub const fn angle_feat_size(&self) -> usize {
        self.angle_feat_size
    }

    pub fn stores(&self) -> &FeatureStores {
        &self.stores
    }

    pub const fn device(&self) -> Device {
        self.device
    }

    /// Angle features of the action each agent took; zero for stop and ignored actions.
    /// `[batch, angle_feat_size]`
    pub fn action_angles(&self, obs: &[Observation], actions: &[i64]) -> Tensor {
        let size = self.angle_feat_size;
        let mut data = vec![0.0; obs.len() * size];
        for (i, (ob, &action)) in obs.iter().zip(actions).enumerate() {
            if let Some(candidate) = usize::try_from(action)
                .ok()
                .and_then(|a| ob.candidate.get(a))
            {
                data[i * size..(i + 1) * size].copy_from_slice(&angle_feature(
                    candidate.heading,
                    candidate.elevation,
                    size,
                ));
            }
        }
        to_tensor(&data, &[obs.len(), size], self.device)
    }

    /// Assemble the features of the current step.
    pub fn step_features(
        &self,
        obs: &[Observation],
        detail: ObjectDetail,
    ) -> Result<StepFeatures, FeatureError> {
        let batch_size = obs.len();
        let feature_size = obs.first().map_or(0, Observation::feature_size);
        let row = feature_size + self.angle_feat_size;

        let mut panoramic = vec![0.0; batch_size * NUM_VIEWS * row];
        for (i, ob) in obs.iter().enumerate() {
            check_len("panoramic feature", ob.feature.len(), NUM_VIEWS * feature_size)?;
            let base = (ob.view_index % VIEWS_PER_LEVEL) as f64;
            for v in 0..NUM_VIEWS {
                let heading = ((v % VIEWS_PER_LEVEL) as f64 - base) * PI / 6.0;
                let elevation = ((v / VIEWS_PER_LEVEL) as f64 - 1.0) * PI / 6.0;
                let out = &mut panoramic[(i * NUM_VIEWS + v) * row..(i * NUM_VIEWS + v + 1) * row];
                out[..feature_size]
                    .copy_from_slice(&ob.feature[v * feature_size..(v + 1) * feature_size]);
                out[feature_size..]
                    .copy_from_slice(&angle_feature(heading, elevation, self.angle_feat_size));
            }
        }

        let candidate_lengths: Vec<usize> = obs.iter().map(|ob| ob.candidate.len() + 1).collect();
        let num_candidates = candidate_lengths.iter().copied().max().unwrap_or(1);
        let mut candidates = vec![0.0; batch_size * num_candidates * row];
        for (i, ob) in obs.iter().enumerate() {
            for (j, candidate) in ob.candidate.iter().enumerate() {
                check_len("candidate feature", candidate.feature.len(), feature_size)?;
                let out = &mut candidates[(i * num_candidates + j) * row..(i * num_candidates + j + 1) * row];
                out[..feature_size].copy_from_slice(&candidate.feature);
                out[feature_size..].copy_from_slice(&angle_feature(
                    candidate.heading,
                    candidate.elevation,
                    self.angle_feat_size,
                ));
            }
        }

        let objects = match detail {
            ObjectDetail::None => None,
            ObjectDetail::Text => Some(self.candidate_objects(obs, num_candidates, false)?),
            ObjectDetail::TextAndRelations => {
                Some(self.candidate_objects(obs, num_candidates, true)?)
            }
        };

        Ok(StepFeatures {
            panoramic: to_tensor(&panoramic, &[batch_size, NUM_VIEWS, row], self.device),
            candidates: to_tensor(&candidates, &[batch_size, num_candidates, row], self.device),
            candidate_mask: length_mask(&candidate_lengths, num_candidates, self.device),
            candidate_lengths,
            objects,
        })
    }

    fn candidate_objects(
        &self,
        obs: &[Observation],
        num_candidates: usize,
        relations: bool,
    ) -> Result<CandidateObjects, FeatureError> {
        let store = &self.stores.objects;
        let (n, o, d, r) = (obs.len(), store.num_objects, store.text_dim, store.relation_dim);
        let mut text = vec![0.0; n * num_candidates * o * d];
        let mut mask = vec![0.0; n * num_candidates * o];
        let mut relation = if relations {
            vec![0.0; n * num_candidates * o * o * r]
        } else {
            Vec::new()
        };

        for (i, ob) in obs.iter().enumerate() {
            for (j, candidate) in ob.candidate.iter().enumerate() {
                let slot = i * num_candidates + j;
                let entry = store.get(
                    &ob.scan,
                    &ob.viewpoint,
                    ViewKey::from_point_id(candidate.point_id),
                )?;
                for (k, (feature, &valid)) in entry
                    .text_feature
                    .iter()
                    .zip(&entry.text_mask)
                    .take(o)
                    .enumerate()
                {
                    check_len("object text feature", feature.len(), d)?;
                    text[(slot * o + k) * d..(slot * o + k + 1) * d].copy_from_slice(feature);
                    mask[slot * o + k] = if valid { 1.0 } else { 0.0 };
                }
                if relations {
                    for (a, row) in entry.relation.iter().take(o).enumerate() {
                        for (b, feature) in row.iter().take(o).enumerate() {
                            check_len("object relation feature", feature.len(), r)?;
                            let start = ((slot * o + a) * o + b) * r;
                            relation[start..start + r].copy_from_slice(feature);
                        }
                    }
                }
            }
        }

        Ok(CandidateObjects {
            text: to_tensor(&text, &[n, num_candidates, o, d], self.device),
            mask: to_tensor(&mask, &[n, num_candidates, o], self.device),
            relation: relations
                .then(|| to_tensor(&relation, &[n, num_candidates, o, o, r], self.device)),
        })
    }

    /// Gather the configuration features of each instruction.
    pub fn configurations(&self, obs: &[Observation]) -> Result<ConfigurationBatch, FeatureError> {
        let store = &self.stores.configurations;
        let d = store.text_dim;
        let mut entries = Vec::with_capacity(obs.len());
        for ob in obs {
            let features = (0..ob.configurations.len())
                .map(|k| store.get(&ob.instr_id, k))
                .collect::<Result<Vec<_>, _>>()?;
            entries.push(features);
        }

        let counts: Vec<usize> = entries.iter().map(Vec::len).collect();
        let k_max = counts.iter().copied().max().unwrap_or(0).max(1);
        let flat = entries.iter().flatten();
        let l_max = flat.clone().map(|c| c.landmarks.len()).max().unwrap_or(0).max(1);
        let t_max = flat.map(|c| c.triplets.len()).max().unwrap_or(0).max(1);

        let n = obs.len();
        let mut landmarks = vec![0.0; n * k_max * l_max * d];
        let mut landmark_mask = vec![0.0; n * k_max * l_max];
        let mut motion = vec![0.0; n * k_max * d];
        let mut triplets = vec![0.0; n * k_max * t_max * 3 * d];
        let mut triplet_mask = vec![0.0; n * k_max * t_max];
        for (i, configs) in entries.iter().enumerate() {
            for (k, config) in configs.iter().enumerate() {
                let ik = i * k_max + k;
                check_len("motion feature", config.motion.len(), d)?;
                motion[ik * d..(ik + 1) * d].copy_from_slice(&config.motion);
                for (l, landmark) in config.landmarks.iter().enumerate() {
                    check_len("landmark feature", landmark.len(), d)?;
                    let ikl = ik * l_max + l;
                    landmarks[ikl * d..(ikl + 1) * d].copy_from_slice(landmark);
                    landmark_mask[ikl] = 1.0;
                }
                for (t, triplet) in config.triplets.iter().enumerate() {
                    let ikt = ik * t_max + t;
                    for (part, vector) in triplet.iter().enumerate() {
                        check_len("triplet feature", vector.len(), d)?;
                        let start = (ikt * 3 + part) * d;
                        triplets[start..start + d].copy_from_slice(vector);
                    }
                    triplet_mask[ikt] = 1.0;
                }
            }
        }

        Ok(ConfigurationBatch {
            counts,
            landmarks: to_tensor(&landmarks, &[n, k_max, l_max, d], self.device),
            landmark_mask: to_tensor(&landmark_mask, &[n, k_max, l_max], self.device),
            motion: to_tensor(&motion, &[n, k_max, d], self.device),
            triplets: to_tensor(&triplets, &[n, k_max, t_max, 3, d], self.device),
            triplet_mask: to_tensor(&triplet_mask, &[n, k_max, t_max], self.device),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envs::{Simulator, ToyConfig, ToyWorld};
    use rstest::{fixture, rstest};

    const ANGLE: usize = 8;

    #[fixture]
    fn world() -> ToyWorld {
        ToyWorld::new(ToyConfig::default())
    }

    fn assembler(world: &ToyWorld) -> FeatureAssembler {
        FeatureAssembler::new(Arc::new(world.feature_stores()), ANGLE, Device::Cpu).unwrap()
    }

    #[test]
    fn angle_feature_tiles() {
        let f = angle_feature(PI / 2.0, 0.0, 8);
        let expected = [1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0];
        for (a, b) in f.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[rstest]
    #[case(0)]
    #[case(6)]
    fn invalid_angle_size(world: ToyWorld, #[case] size: usize) {
        assert!(FeatureAssembler::new(Arc::new(world.feature_stores()), size, Device::Cpu).is_err());
    }

    #[test]
    fn length_mask_marks_padding() {
        let mask = length_mask(&[1, 3], 3, Device::Cpu);
        assert_eq!(
            Vec::<bool>::from(&mask.reshape(&[-1])),
            vec![false, true, true, false, false, false]
        );
    }

    #[rstest]
    fn candidates_padded_with_zero_slots(world: ToyWorld) {
        let mut obs = world.observations();
        let template = obs[1].candidate[0].clone();
        obs[0].candidate = vec![template.clone(); 2];
        obs[1].candidate = vec![template; 4];

        let features = assembler(&world)
            .step_features(&obs, ObjectDetail::None)
            .unwrap();
        let row = (world.config().feature_size + ANGLE) as i64;
        assert_eq!(features.candidate_lengths, vec![3, 5]);
        assert_eq!(features.candidates.size(), vec![2, 5, row]);

        let unused = features.candidates.get(0).narrow(0, 2, 3);
        assert_eq!(unused.abs().sum(tch::Kind::Float).double_value(&[]), 0.0);
        let used = features.candidates.get(1).narrow(0, 0, 4);
        assert!(used.abs().sum(tch::Kind::Float).double_value(&[]) > 0.0);

        let unmasked = features
            .candidate_mask
            .logical_not()
            .sum_dim_intlist(&[1], false, tch::Kind::Int64);
        assert_eq!(Vec::<i64>::from(&unmasked), vec![3, 5]);
    }

    #[rstest]
    fn panoramic_shape(world: ToyWorld) {
        let features = assembler(&world)
            .step_features(&world.observations(), ObjectDetail::None)
            .unwrap();
        let row = (world.config().feature_size + ANGLE) as i64;
        assert_eq!(
            features.panoramic.size(),
            vec![world.batch_size() as i64, NUM_VIEWS as i64, row]
        );
    }

    #[rstest]
    fn objects_zero_on_stop_slot(world: ToyWorld) {
        let obs = world.observations();
        let features = assembler(&world)
            .step_features(&obs, ObjectDetail::TextAndRelations)
            .unwrap();
        let objects = features.objects.unwrap();
        let config = world.config();
        assert_eq!(
            objects.text.size(),
            vec![
                obs.len() as i64,
                features.candidate_lengths.iter().copied().max().unwrap() as i64,
                config.num_objects as i64,
                config.text_dim as i64,
            ]
        );
        for (i, ob) in obs.iter().enumerate() {
            let stop = ob.candidate.len() as i64;
            let stop_mask = objects.mask.get(i as i64).get(stop);
            assert_eq!(stop_mask.sum(tch::Kind::Float).double_value(&[]), 0.0);
            let first = objects.mask.get(i as i64).get(0);
            assert!(first.sum(tch::Kind::Float).double_value(&[]) >= 1.0);
        }
        assert!(objects.relation.is_some());
    }

    #[rstest]
    fn missing_objects_is_an_error(world: ToyWorld) {
        let mut obs = world.observations();
        obs[0].viewpoint = "nowhere".to_string();
        let result = assembler(&world).step_features(&obs, ObjectDetail::Text);
        assert!(matches!(result, Err(FeatureError::MissingObjects { .. })));
    }

    #[rstest]
    fn action_angles_zero_for_stop(world: ToyWorld) {
        let obs = world.observations();
        let assembler = assembler(&world);
        let stop = obs[0].candidate.len() as i64;
        let angles = assembler.action_angles(&obs, &[stop, 0]);
        assert_eq!(angles.size(), vec![2, ANGLE as i64]);
        assert_eq!(angles.get(0).abs().sum(tch::Kind::Float).double_value(&[]), 0.0);
        assert!(angles.get(1).abs().sum(tch::Kind::Float).double_value(&[]) > 0.0);
    }

    #[rstest]
    fn configuration_batch_pads_to_max(world: ToyWorld) {
        let obs = world.observations();
        let batch = assembler(&world).configurations(&obs).unwrap();
        let counts: Vec<usize> = obs.iter().map(|ob| ob.configurations.len()).collect();
        assert_eq!(batch.counts, counts);
        let k = batch.max_count() as i64;
        assert_eq!(batch.motion.size(), vec![obs.len() as i64, k, world.config().text_dim as i64]);
        assert_eq!(batch.landmark_mask.size()[..2], [obs.len() as i64, k]);
    }
}
