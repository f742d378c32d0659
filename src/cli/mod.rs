//! Command-line interface
mod options;

pub use options::{Command, EvalOptions, Options, SearchOptions, TrainOptions};

use crate::agent::{AgentConfig, NavAgent};
use crate::envs::{ToyConfig, ToyWorld};
use crate::error::NavError;
use crate::logging::{ByTime, DisplayLogger, StatsLogger, TensorBoardLogger};
use crate::search::{write_search_results, PathSearch, SearchConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tch::Device;

/// Run the command given on the command line.
pub fn run(opts: &Options) -> Result<(), NavError> {
    tch::manual_seed(opts.seed);
    let device = if opts.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available()
    };
    let mut agent = build_agent(opts, device)?;
    match &opts.command {
        Command::Train(train) => run_train(&mut agent, train),
        Command::Eval(eval) => run_eval(&mut agent, eval),
        Command::Search(search) => run_search(&mut agent, search),
    }
}

fn build_agent(opts: &Options, device: Device) -> Result<NavAgent<ToyWorld>, NavError> {
    let toy: ToyConfig = match &opts.toy {
        Some(path) => serde_json::from_reader(BufReader::new(File::open(path)?))?,
        None => ToyConfig::default(),
    };
    let mut config = match &opts.config {
        Some(path) => AgentConfig::from_json_path(path)?,
        None => AgentConfig::default(),
    };
    // Vocabulary comes from the world
    config.encoder.vocab_size = toy.vocab_size;
    config.encoder.padding_idx = toy.padding_idx;
    config.encoder.separator_token = toy.separator_token;
    log::info!("agent config: {:?}", config);

    let world = ToyWorld::new(toy);
    let stores = Arc::new(world.feature_stores());
    let visual_size = world.config().feature_size;
    NavAgent::new(world, stores, config, visual_size, device)
}

fn run_train(agent: &mut NavAgent<ToyWorld>, opts: &TrainOptions) -> Result<(), NavError> {
    let mut display = DisplayLogger::default();
    match &opts.log_dir {
        Some(dir) => {
            let mut logger = (display, TensorBoardLogger::new(ByTime::default(), dir));
            train_loop(agent, opts, &mut logger)
        }
        None => train_loop(agent, opts, &mut display),
    }
}

fn train_loop<L: StatsLogger>(
    agent: &mut NavAgent<ToyWorld>,
    opts: &TrainOptions,
    logger: &mut L,
) -> Result<(), NavError> {
    let mut epoch = match &opts.checkpoint {
        Some(dir) if dir.join("manifest.json").exists() => {
            let epoch = agent.load(dir)?;
            log::info!("resuming from epoch {}", epoch);
            epoch
        }
        _ => 0,
    };
    let chunk = opts.save_every.max(1);
    let mut remaining = opts.iters;
    while remaining > 0 {
        let n = remaining.min(chunk);
        agent.train(n, opts.feedback, logger)?;
        remaining -= n;
        epoch += n;
        if let Some(dir) = &opts.checkpoint {
            agent.save(epoch, dir)?;
            log::info!("saved epoch {} to {}", epoch, dir.display());
        }
    }
    logger.flush();
    Ok(())
}

fn load_checkpoint(agent: &mut NavAgent<ToyWorld>, dir: Option<&Path>) -> Result<(), NavError> {
    if let Some(dir) = dir {
        let epoch = agent.load(dir)?;
        log::info!("loaded epoch {} from {}", epoch, dir.display());
    }
    Ok(())
}

fn run_eval(agent: &mut NavAgent<ToyWorld>, opts: &EvalOptions) -> Result<(), NavError> {
    load_checkpoint(agent, opts.checkpoint.as_deref())?;
    agent.test(opts.feedback, opts.iters)?;
    let points: usize = agent.results().values().map(Vec::len).sum();
    log::info!(
        "{} trajectories, {:.2} points on average",
        agent.results().len(),
        points as f64 / agent.results().len().max(1) as f64
    );
    if let Some(path) = &opts.results {
        agent.write_results(path)?;
    }
    Ok(())
}

fn run_search(agent: &mut NavAgent<ToyWorld>, opts: &SearchOptions) -> Result<(), NavError> {
    load_checkpoint(agent, opts.checkpoint.as_deref())?;
    let search = PathSearch::new(SearchConfig {
        candidates: opts.candidates,
        max_rounds: opts.max_rounds,
    });
    let results = search.run_epoch(agent, opts.iters)?;
    let paths: usize = results.iter().map(|result| result.paths.len()).sum();
    log::info!(
        "found {} candidate paths for {} instructions",
        paths,
        results.len()
    );
    if let Some(path) = &opts.results {
        write_search_results(path, &results)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Feedback;
    use clap::Parser;

    #[test]
    fn parse_train() {
        let opts =
            Options::try_parse_from(["confignav", "train", "--feedback", "teacher", "--cpu"]).unwrap();
        assert!(opts.cpu);
        match opts.command {
            Command::Train(train) => {
                assert_eq!(train.feedback, Feedback::Teacher);
                assert_eq!(train.iters, 1000);
            }
            command => panic!("unexpected command {:?}", command),
        }
    }

    #[test]
    fn parse_rejects_unknown_feedback() {
        assert!(Options::try_parse_from(["confignav", "eval", "--feedback", "beam"]).is_err());
    }

    #[test]
    fn parse_search() {
        let opts = Options::try_parse_from(["confignav", "search", "--candidates", "3"]).unwrap();
        match opts.command {
            Command::Search(search) => {
                assert_eq!(search.candidates, 3);
                assert_eq!(search.max_rounds, 300);
                assert!(search.results.is_none());
            }
            command => panic!("unexpected command {:?}", command),
        }
    }
}
