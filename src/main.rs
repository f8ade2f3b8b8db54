// src/main.rs
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyCode};
use intel_ferry_rs::config::{AppConfig, RunMode, CONFIG_FILE};
use intel_ferry_rs::pipeline::{self, PipelineState};
use intel_ferry_rs::CancelFlag;
use log::{info, warn};

#[derive(Parser)]
#[command(
    name = "intel-ferry-rs",
    about = "Harvest new intelligence records and relay them as chat attachments"
)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Force headless browser mode regardless of the configured run mode
    #[arg(long)]
    headless: bool,

    /// Minutes between cycles, overriding the configuration
    #[arg(long)]
    interval_minutes: Option<u64>,
}

fn init_logging(default_level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();
}

/// Watch for 'q' on a blocking task and trip the cancel flag. The worker
/// notices at its next boundary check.
fn spawn_key_watcher(cancel: CancelFlag) {
    tokio::task::spawn_blocking(move || loop {
        if cancel.is_cancelled() {
            break;
        }
        match event::poll(Duration::from_millis(500)) {
            Ok(true) => {
                if let Ok(Event::Key(key)) = event::read() {
                    if key.code == KeyCode::Char('q') {
                        println!("stop requested, finishing the current step...");
                        pipeline::teardown(&cancel);
                        break;
                    }
                }
            }
            Ok(false) => {}
            Err(_) => break,
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut cfg = AppConfig::load(&args.config)
        .with_context(|| format!("could not load {}", args.config.display()))?;
    if args.headless {
        cfg.run_mode = RunMode::Headless;
    }
    if let Some(minutes) = args.interval_minutes {
        cfg.cycle_minutes = minutes;
    }
    init_logging(&cfg.log_level);

    if args.config.exists() {
        info!("configuration loaded from {}", args.config.display());
    } else {
        warn!("no configuration file at {}, running on defaults", args.config.display());
    }
    info!(
        "{} portal account(s) configured, cycle every {} minute(s), run mode {:?}",
        cfg.accounts().len(),
        cfg.cycle_minutes,
        cfg.run_mode
    );
    println!("press q to stop after the current step");

    let cancel = CancelFlag::new();
    spawn_key_watcher(cancel.clone());

    let mut state = PipelineState::default();
    let mut cycle: u64 = 1;
    loop {
        pipeline::log_cycle_start(cycle);
        let report = pipeline::run_one_cycle(&cfg, &mut state, &cancel).await;
        pipeline::log_cycle_end(cycle, &report);

        if args.once {
            break;
        }
        if cancel.is_cancelled() {
            info!("stopped");
            break;
        }

        info!("next cycle in {} minute(s)", cfg.cycle_minutes);
        let wait = Duration::from_secs(cfg.cycle_minutes * 60);
        let started = Instant::now();
        while started.elapsed() < wait && !cancel.is_cancelled() {
            thirtyfour::support::sleep(Duration::from_secs(1)).await;
        }
        if cancel.is_cancelled() {
            info!("stopped");
            break;
        }
        cycle += 1;
    }

    Ok(())
}
