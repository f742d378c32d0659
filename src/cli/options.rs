//! Command-line options
use crate::agent::Feedback;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    version,
    author,
    about,
    after_help = "Runs over the built-in toy simulator; --toy configures its world."
)]
pub struct Options {
    #[clap(long, global = true)]
    /// Agent configuration JSON file. Defaults are used when absent.
    pub config: Option<PathBuf>,

    #[clap(long, global = true)]
    /// Toy world configuration JSON file
    pub toy: Option<PathBuf>,

    #[clap(long, global = true, default_value = "1")]
    /// Random seed for model initialization and sampling
    pub seed: i64,

    #[clap(long, global = true)]
    /// Run on the CPU even if CUDA is available
    pub cpu: bool,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Train the agent
    Train(TrainOptions),
    /// Roll out one trajectory per instruction
    Eval(EvalOptions),
    /// Search for multiple candidate paths per instruction
    Search(SearchOptions),
}

#[derive(Args, Debug)]
pub struct TrainOptions {
    #[clap(long, default_value = "1000")]
    /// Number of training iterations
    pub iters: usize,

    #[clap(long, default_value = "sample")]
    /// Training feedback: teacher or sample
    pub feedback: Feedback,

    #[clap(long, default_value = "100")]
    /// Iterations between checkpoints
    pub save_every: usize,

    #[clap(long)]
    /// Directory for TensorBoard event files
    pub log_dir: Option<PathBuf>,

    #[clap(long)]
    /// Checkpoint directory; resumed from when it holds a manifest
    pub checkpoint: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct EvalOptions {
    #[clap(long, default_value = "argmax")]
    /// Action selection: teacher, argmax or sample
    pub feedback: Feedback,

    #[clap(long)]
    /// Number of batches; one pass over the episodes when absent
    pub iters: Option<usize>,

    #[clap(long)]
    /// Checkpoint directory to load
    pub checkpoint: Option<PathBuf>,

    #[clap(long)]
    /// Output JSON file for the trajectories
    pub results: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SearchOptions {
    #[clap(long, default_value = "5")]
    /// Finished paths to collect per instruction
    pub candidates: usize,

    #[clap(long, default_value = "300")]
    /// Maximum expansion rounds per batch
    pub max_rounds: usize,

    #[clap(long)]
    /// Number of batches; one pass over the episodes when absent
    pub iters: Option<usize>,

    #[clap(long)]
    /// Checkpoint directory to load
    pub checkpoint: Option<PathBuf>,

    #[clap(long)]
    /// Output JSON file for the search results
    pub results: Option<PathBuf>,
}
