//! pipeline - frame acquisition, normalisation, storage and processing daemon
//!
//! Loads a TOML configuration, starts every configured stage on one shared
//! bus and runs until Ctrl-C (or until a source with `max_frames` is done).

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use frame_pipeline::{Pipeline, PipelineConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Sensor frame pipeline daemon")]
struct Args {
    /// Pipeline configuration file (TOML).
    #[arg(long, env = "PIPELINE_CONFIG")]
    config: PathBuf,

    /// Seconds between health log lines (0 disables them).
    #[arg(long, env = "PIPELINE_HEALTH_SECS", default_value_t = 10)]
    health_secs: u64,

    /// Grace period after a finite source is done, so downstream stages drain.
    #[arg(long, default_value_t = 1000)]
    drain_ms: u64,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        log::error!("pipeline failed: {:#}", e);
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config = PipelineConfig::load(&args.config)?;
    let mut pipeline = Pipeline::new(config).context("failed to build pipeline")?;
    pipeline.start().context("failed to start pipeline")?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("error setting Ctrl-C handler")?;

    log::info!("pipeline running, waiting for shutdown signal (Ctrl-C)...");
    let health_every = Duration::from_secs(args.health_secs);
    let mut last_health = Instant::now();
    loop {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                log::info!("shutdown signal received");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }
        if pipeline.source_finished() {
            log::info!("source finished, draining for {} ms", args.drain_ms);
            std::thread::sleep(Duration::from_millis(args.drain_ms));
            break;
        }
        if !health_every.is_zero() && last_health.elapsed() >= health_every {
            log_health(&pipeline);
            last_health = Instant::now();
        }
    }

    pipeline.stop();
    log_health(&pipeline);
    Ok(())
}

fn log_health(pipeline: &Pipeline) {
    for (stage, snapshot) in pipeline.health() {
        log::info!("health {}: {}", stage, snapshot);
    }
}
