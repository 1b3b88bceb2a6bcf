mod bench;
mod config;
mod diff;
mod pipeline;
mod process;
mod refine;
mod review;
mod sensor;
mod store;
mod system;
mod vcs;
mod workloop;

use clap::Parser;
use config::{Config, ToolLocator};
use pipeline::Pipeline;
use review::ReviewClient;
use std::{
    path::PathBuf,
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use store::ResultsStore;
use system::SystemIdentity;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vcs::GitRepo;
use workloop::WorkLoop;

#[derive(Parser, Debug)]
#[command(version, about = "continuous benchmarking bot for review changes and commit history")]
struct Args {
    /// path to the yaml configuration file
    #[arg(short, long, default_value = "~/.config/benchwatch/config.yml")]
    config: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    if let Err(error) = run(args) {
        error!(error = %error, "startup failed");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config::expand_home(&args.config)?;
    let cfg = Config::load(&config_path)?;
    let tools = ToolLocator::locate()?;
    let dirs = cfg.make_working_dirs()?;

    let source = GitRepo::clone_or_open(&tools, &dirs.source, &cfg.source, cfg.timeouts.sync())?;
    let results = GitRepo::clone_or_open(&tools, &dirs.results, &cfg.results, cfg.timeouts.sync())?;

    let identity = SystemIdentity::detect();
    info!("host fingerprint: {}", identity.id());

    let store = ResultsStore::new(results, identity);
    let review = ReviewClient::new(cfg.review.clone());
    let pipeline = Pipeline::new(cfg.clone(), tools, source.clone(), dirs);

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("termination requested, finishing the current step...");
        flag.store(true, Ordering::Relaxed);
    })?;

    let mut worker = WorkLoop::new(cfg, source, store, review, pipeline, shutdown);
    worker.run();

    Ok(())
}
