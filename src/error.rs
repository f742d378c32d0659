//! Error type
use crate::agent::{CheckpointError, RolloutError};
use crate::features::FeatureError;
use std::io;
use tch::TchError;
use thiserror::Error;

/// Error from the navigation crate.
#[derive(Error, Debug)]
pub enum NavError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("error loading features")]
    Feature(#[from] FeatureError),
    #[error("rollout failed")]
    Rollout(#[from] RolloutError),
    #[error("checkpoint error")]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    Torch(#[from] TchError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Invalid agent configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported feedback mode \"{0}\"; expected one of teacher, argmax, sample")]
    UnsupportedFeedback(String),
    #[error("unsupported loss normalization \"{0}\"; expected one of total, batch, none")]
    UnsupportedNormalization(String),
    #[error("unknown agent \"{0}\"")]
    UnknownAgent(String),
    #[error("angle feature size {0} must be a positive multiple of 4")]
    AngleFeatureSize(usize),
    #[error("hidden size {0} must be even for a bidirectional encoder")]
    OddBidirectionalHidden(usize),
    #[error("encoder hidden size {encoder} differs from decoder hidden size {decoder}")]
    HiddenSizeMismatch { encoder: usize, decoder: usize },
}
