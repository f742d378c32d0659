//! Precomputed feature stores and per-step feature assembly.
//!
//! The stores are loaded once at startup and shared read-only (behind an [`Arc`]) by every
//! component that needs them.
//!
//! [`Arc`]: std::sync::Arc
mod assembler;

pub use assembler::{
    angle_feature, length_mask, CandidateObjects, ConfigurationBatch, FeatureAssembler,
    ObjectDetail, StepFeatures,
};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

/// Quantized camera direction used to index object detections.
///
/// Headings are bucketed to multiples of 30 degrees; detections are stored for a single
/// elevation level.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ViewKey {
    /// Heading in degrees, in `[0, 360)`.
    pub heading: u16,
    /// Elevation in degrees.
    pub elevation: i16,
}

impl ViewKey {
    pub const HEADING_STEP: u16 = 30;

    /// Bucket for a discretized view index (`0..36`, 12 headings per elevation level).
    #[must_use]
    pub const fn from_point_id(point_id: usize) -> Self {
        Self {
            heading: (point_id % 12) as u16 * Self::HEADING_STEP,
            elevation: 0,
        }
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}_{}", self.heading, self.elevation)
    }
}

impl FromStr for ViewKey {
    type Err = FeatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || FeatureError::InvalidKey(s.to_string());
        let (heading, elevation) = s.split_once('_').ok_or_else(invalid)?;
        Ok(Self {
            heading: heading.parse().map_err(|_| invalid())?,
            elevation: elevation.parse().map_err(|_| invalid())?,
        })
    }
}

impl TryFrom<String> for ViewKey {
    type Error = FeatureError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ViewKey> for String {
    fn from(key: ViewKey) -> Self {
        key.to_string()
    }
}

/// Object detections visible in one direction from one viewpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectFeatures {
    /// Text embedding of each detected object label. `[num_objects][text_dim]`
    pub text_feature: Vec<Vec<f32>>,
    /// Whether each object slot holds a real detection.
    pub text_mask: Vec<bool>,
    /// Pairwise spatial relation features. `[num_objects][num_objects][relation_dim]`
    #[serde(default)]
    pub relation: Vec<Vec<Vec<f32>>>,
}

/// Object detections keyed by `scan → viewpoint → direction`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectStore {
    /// Number of object slots per direction.
    pub num_objects: usize,
    /// Size of an object text embedding.
    pub text_dim: usize,
    /// Size of a pairwise relation feature.
    pub relation_dim: usize,
    pub scans: HashMap<String, HashMap<String, HashMap<ViewKey, ObjectFeatures>>>,
}

impl ObjectStore {
    /// Load a store from a JSON file.
    pub fn from_json_path<P: AsRef<Path>>(path: P) -> Result<Self, FeatureError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// Objects visible from `viewpoint` in the direction `key`.
    pub fn get(&self, scan: &str, viewpoint: &str, key: ViewKey) -> Result<&ObjectFeatures, FeatureError> {
        self.scans
            .get(scan)
            .and_then(|viewpoints| viewpoints.get(viewpoint))
            .and_then(|views| views.get(&key))
            .ok_or_else(|| FeatureError::MissingObjects {
                scan: scan.to_string(),
                viewpoint: viewpoint.to_string(),
                key,
            })
    }

    pub fn insert(&mut self, scan: &str, viewpoint: &str, key: ViewKey, features: ObjectFeatures) {
        self.scans
            .entry(scan.to_string())
            .or_default()
            .entry(viewpoint.to_string())
            .or_default()
            .insert(key, features);
    }
}

/// Identifies one configuration of one instruction.
///
/// Serialized as `"{instr_id}_{index}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConfigKey {
    pub instr_id: String,
    pub index: usize,
}

impl ConfigKey {
    pub fn new<S: Into<String>>(instr_id: S, index: usize) -> Self {
        Self {
            instr_id: instr_id.into(),
            index,
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}_{}", self.instr_id, self.index)
    }
}

impl FromStr for ConfigKey {
    type Err = FeatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Instruction ids contain underscores themselves; the index is the last component.
        let (instr_id, index) = s
            .rsplit_once('_')
            .ok_or_else(|| FeatureError::InvalidKey(s.to_string()))?;
        let index = index
            .parse()
            .map_err(|_| FeatureError::InvalidKey(s.to_string()))?;
        Ok(Self::new(instr_id, index))
    }
}

impl TryFrom<String> for ConfigKey {
    type Error = FeatureError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ConfigKey> for String {
    fn from(key: ConfigKey) -> Self {
        key.to_string()
    }
}

/// Features describing one instruction configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationFeatures {
    /// Text embeddings of the landmark objects mentioned in the span. `[num_landmarks][text_dim]`
    #[serde(default)]
    pub landmarks: Vec<Vec<f32>>,
    /// Embedding of the motion indicator of the span. `[text_dim]`
    pub motion: Vec<f32>,
    /// `(subject, relation, object)` landmark triplets. `[num_triplets][3][text_dim]`
    #[serde(default)]
    pub triplets: Vec<[Vec<f32>; 3]>,
}

/// Configuration features keyed by [`ConfigKey`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationStore {
    pub text_dim: usize,
    pub entries: HashMap<ConfigKey, ConfigurationFeatures>,
}

impl ConfigurationStore {
    /// Load and merge stores from one or more JSON files (one per data split).
    pub fn from_json_paths<I, P>(paths: I) -> Result<Self, FeatureError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut store = Self::default();
        for path in paths {
            let reader = BufReader::new(File::open(path)?);
            let part: Self = serde_json::from_reader(reader)?;
            store.text_dim = part.text_dim;
            store.entries.extend(part.entries);
        }
        Ok(store)
    }

    pub fn get(&self, instr_id: &str, index: usize) -> Result<&ConfigurationFeatures, FeatureError> {
        let key = ConfigKey::new(instr_id, index);
        self.entries
            .get(&key)
            .ok_or(FeatureError::MissingConfiguration(key))
    }
}

/// All precomputed feature stores.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureStores {
    pub objects: ObjectStore,
    pub configurations: ConfigurationStore,
}

impl FeatureStores {
    pub fn load<P, Q>(object_path: P, configuration_paths: &[Q]) -> Result<Self, FeatureError>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let objects = ObjectStore::from_json_path(object_path)?;
        let configurations = ConfigurationStore::from_json_paths(configuration_paths)?;
        log::info!(
            "loaded objects for {} scans and {} configurations",
            objects.scans.len(),
            configurations.entries.len()
        );
        Ok(Self {
            objects,
            configurations,
        })
    }
}

/// Error looking up precomputed features.
#[derive(Error, Debug)]
pub enum FeatureError {
    #[error("no object features for {scan}/{viewpoint} at {key}")]
    MissingObjects {
        scan: String,
        viewpoint: String,
        key: ViewKey,
    },
    #[error("no configuration features for {0}")]
    MissingConfiguration(ConfigKey),
    #[error("invalid feature key \"{0}\"")]
    InvalidKey(String),
    #[error("{what} has length {actual}, expected {expected}")]
    Length {
        what: &'static str,
        actual: usize,
        expected: usize,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 0)]
    #[case(3, 90)]
    #[case(14, 60)]
    #[case(35, 330)]
    fn view_key_from_point_id(#[case] point_id: usize, #[case] heading: u16) {
        let key = ViewKey::from_point_id(point_id);
        assert_eq!(key.heading, heading);
        assert_eq!(key.elevation, 0);
    }

    #[test]
    fn view_key_string_round_trip() {
        let key = ViewKey {
            heading: 150,
            elevation: 0,
        };
        assert_eq!(key.to_string(), "150_0");
        assert_eq!("150_0".parse::<ViewKey>().unwrap(), key);
        assert!("150".parse::<ViewKey>().is_err());
    }

    #[test]
    fn config_key_uses_last_underscore() {
        let key: ConfigKey = "4231_2_3".parse().unwrap();
        assert_eq!(key, ConfigKey::new("4231_2", 3));
        assert_eq!(key.to_string(), "4231_2_3");
    }

    #[test]
    fn configuration_store_json() {
        let json = r#"{
            "text_dim": 2,
            "entries": {
                "17_0_1": {"landmarks": [[1.0, 0.0]], "motion": [0.5, 0.5]}
            }
        }"#;
        let store: ConfigurationStore = serde_json::from_str(json).unwrap();
        let features = store.get("17_0", 1).unwrap();
        assert_eq!(features.landmarks, vec![vec![1.0, 0.0]]);
        assert!(features.triplets.is_empty());
        assert!(matches!(
            store.get("17_0", 0),
            Err(FeatureError::MissingConfiguration(_))
        ));
    }

    #[test]
    fn object_store_missing_entry() {
        let store = ObjectStore::default();
        let err = store
            .get("scan", "vp", ViewKey::from_point_id(0))
            .unwrap_err();
        assert!(matches!(err, FeatureError::MissingObjects { .. }));
    }
}
