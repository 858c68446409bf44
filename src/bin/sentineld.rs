//! sentineld - Field Sentinel daemon
//!
//! This daemon:
//! 1. Opens the journal and dispatch queue, reconciling sends interrupted by the last run
//! 2. Polls GPS on its own thread
//! 3. Captures frames, runs inference, aggregates and throttles detections
//! 4. Composes geotagged alerts and queues one SMS per emergency contact
//! 5. Drains the queue through the modem with retry and backoff

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use field_sentinel::{pipeline, CycleOutcome, SentinelConfig};

#[derive(Parser, Debug)]
#[command(
    name = "sentineld",
    about = "Detect people and animals on camera and send geotagged SMS alerts"
)]
struct Args {
    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(long, env = "SENTINEL_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    /// Run a single detection cycle and dispatch pass, then exit
    #[arg(long)]
    once: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let config = SentinelConfig::load_from(args.config.as_deref())?;

    log::info!(
        "sentineld {} starting (window {}s, cooldown {}s, retry ceiling {})",
        env!("CARGO_PKG_VERSION"),
        config.detection.window.as_secs(),
        config.alerts.cooldown.as_secs(),
        config.dispatch.max_attempts
    );

    if args.once {
        match pipeline::run_once(&config)? {
            CycleOutcome::Skipped(err) => println!("cycle skipped: {} ({})", err, err.code()),
            CycleOutcome::Observed { counts, .. } => println!(
                "no alert: window human={} cat={} dog={}",
                counts.human, counts.cat, counts.dog
            ),
            CycleOutcome::Alerted { alert, records, .. } => {
                println!("{}", alert.body);
                println!("alert {} queued for {} contact(s)", alert.id, records.len());
            }
        }
        return Ok(());
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))?;

    log::info!("sentineld running; Ctrl-C to stop");
    pipeline::run_daemon(&config, shutdown)
}
