use clap::Parser;
use confignav::cli::{self, Options};
use std::error::Error;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let opts = Options::parse();
    log::debug!("{:#?}", opts);
    cli::run(&opts)?;
    Ok(())
}
