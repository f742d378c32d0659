//! Simulator interface and observation types.
//!
//! The navigation simulator is an external collaborator: the agent only sees the
//! [`Simulator`] verbs and the [`Observation`] fields below.
pub mod toy;

pub use toy::{ToyConfig, ToyWorld};

use serde::{Deserialize, Serialize};

/// Number of discretized views in a panorama (12 headings × 3 elevations).
pub const NUM_VIEWS: usize = 36;
/// Number of discretized headings per elevation level.
pub const VIEWS_PER_LEVEL: usize = 12;

/// A navigable neighbour of the current viewpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub viewpoint_id: String,
    /// Discretized view index (`0..36`) that faces this neighbour.
    pub point_id: usize,
    /// Heading relative to the agent (radians).
    pub heading: f64,
    /// Elevation relative to the agent (radians).
    pub elevation: f64,
    /// Index of the neighbour in [`SimState::navigable_locations`] once facing `point_id`.
    pub location_index: usize,
    /// Visual feature of the view towards the neighbour.
    pub feature: Vec<f32>,
}

/// Per-agent, per-step snapshot produced by the simulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub instr_id: String,
    pub scan: String,
    pub viewpoint: String,
    /// Current discretized view index.
    pub view_index: usize,
    pub heading: f64,
    pub elevation: f64,
    /// Raw instruction text.
    pub instructions: String,
    /// Instruction token ids, padded.
    pub instr_encoding: Vec<i64>,
    /// Ordered sub-goal spans of the instruction.
    pub configurations: Vec<String>,
    pub candidate: Vec<Candidate>,
    /// Panoramic visual features, [`NUM_VIEWS`] rows of equal length, row-major.
    pub feature: Vec<f32>,
    /// Geodesic distance to the goal.
    pub distance: f64,
    /// Next viewpoint on the ground-truth path; equals `viewpoint` at the goal.
    pub teacher: String,
}

impl Observation {
    /// Length of each panoramic feature row.
    pub fn feature_size(&self) -> usize {
        self.feature.len() / NUM_VIEWS
    }
}

/// Simulator state of one batch slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimState {
    pub scan: String,
    pub viewpoint: String,
    pub heading: f64,
    pub elevation: f64,
    pub view_index: usize,
    /// Viewpoints reachable with a forward move from the current view.
    /// Index 0 is the current viewpoint.
    pub navigable_locations: Vec<String>,
}

/// A batched navigation simulator with one slot per agent.
pub trait Simulator {
    /// Number of slots.
    fn batch_size(&self) -> usize;

    /// Start the next batch of episodes.
    fn reset(&mut self) -> Vec<Observation>;

    /// Restart iteration over the episodes, optionally in a new order.
    fn reset_epoch(&mut self, shuffle: bool);

    /// Current observation of every slot.
    fn observations(&self) -> Vec<Observation>;

    /// Apply one primitive action in a slot.
    ///
    /// `index` selects a navigable location to move to (0 for no move);
    /// `heading` and `elevation` are turn amounts in discretized view steps.
    fn make_action(&mut self, slot: usize, index: usize, heading: f64, elevation: f64);

    /// Current state of a slot.
    fn state(&self, slot: usize) -> SimState;

    /// Teleport a slot to a viewpoint, keeping its episode.
    fn new_episode(&mut self, slot: usize, scan: &str, viewpoint: &str, heading: f64, elevation: f64);

    /// Shortest path distance between two viewpoints of a scan.
    fn distance(&self, scan: &str, from: &str, to: &str) -> f64;
}
