//! # Pub/Sub Perftest - Main Entry Point
//!
//! 1. **Parse arguments** and install logging (stderr, optional log file)
//! 2. **Validate** the arguments into a [`TestConfig`]; any error is fatal
//! 3. **Run** the configured role, or every role in-process for the
//!    in-process transport
//! 4. **Write** the optional JSON report
//!
//! Measurement records go to stdout; diagnostics go to stderr.

use anyhow::{Context, Result};
use clap::Parser;
use pubsub_perftest::{cli::Args, logging, results::ResultsManager, runner, TestConfig};
use tracing::{error, info, warn};

fn main() -> Result<()> {
    let args = Args::parse();

    // Dropping the guard flushes the log file, so hold it for the whole run.
    let _log_guard = logging::init_logging(args.verbose, args.quiet, args.log_file.as_deref())?;

    info!("Starting Pub/Sub Perftest v{}", pubsub_perftest::VERSION);

    let config = match TestConfig::from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return Err(e.into());
        }
    };
    config.log_summary();

    let results_manager = config.output_file.as_deref().map(ResultsManager::new);

    let report = runner::run(&config).context("Test run failed")?;

    let unfinished: Vec<i32> = report
        .publishers
        .iter()
        .flat_map(|publisher| publisher.unfinished_subscribers.iter().copied())
        .collect();
    if !unfinished.is_empty() {
        warn!("Subscribers {:?} never acknowledged FINISHED", unfinished);
    }

    if let Some(manager) = results_manager {
        manager.finalize(&config, &report)?;
        info!("Run {} complete", manager.run_id());
    } else {
        info!("Test complete");
    }

    Ok(())
}
