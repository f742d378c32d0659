//! Instruction-following navigation agent.
//!
//! An agent reads a natural-language instruction that has been split into ordered
//! configurations (sub-goals) and navigates a viewpoint graph supplied by an external
//! simulator. Training mixes teacher forcing with actor-critic updates;
//! at inference time trajectories come from greedy decoding, sampling,
//! or a best-first search over candidate paths.
#![warn(clippy::cast_lossless)]
#![warn(clippy::doc_markdown)]
#![warn(clippy::explicit_iter_loop)]
#![warn(clippy::for_kv_map)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::redundant_closure_for_method_calls)]
#![warn(clippy::use_self)] // also triggered by macro expansions
pub mod agent;
pub mod batch;
pub mod cli;
pub mod envs;
mod error;
pub mod features;
pub mod logging;
pub mod model;
pub mod results;
pub mod search;
pub mod torch;
pub mod utils;

pub use agent::{AgentConfig, AgentKind, Feedback, NavAgent};
pub use envs::{Candidate, Observation, SimState, Simulator};
pub use error::{ConfigError, NavError};
pub use features::{FeatureAssembler, FeatureStores};
pub use search::{PathSearch, SearchConfig};
