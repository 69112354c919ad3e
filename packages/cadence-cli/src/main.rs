mod phases;
mod replay;
mod script;
mod settings;

use anyhow::{Context, Result};
use cadence_scheduler::{ManualClock, MonotonicClock};
use clap::{Parser, Subcommand};
use settings::{LogLevel, Settings};
use std::fs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Phase-ordered event loop and shopping-list service", long_about = None)]
struct Cli {
    /// JSON settings file; flags below override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level (RUST_LOG takes precedence when set)
    #[arg(long, value_enum, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a request script against an in-memory shopping-list service
    Replay {
        /// Script with one `METHOD TARGET [JSON]` request per line
        script: PathBuf,
        /// Simulated datastore latency in milliseconds
        #[arg(long)]
        latency_ms: Option<u64>,
        /// JSON file of seed records, keyed by collection
        #[arg(long)]
        seed: Option<PathBuf>,
        /// Fail if the loop needs more ticks than this
        #[arg(long)]
        max_ticks: Option<u64>,
    },
    /// Print where timers, I/O, immediates and microtasks run in each tick
    Phases {
        /// Interval firings before the interval clears itself
        #[arg(long, default_value_t = 2)]
        iterations: u32,
        /// Wait on the wall clock instead of jumping virtual time
        #[arg(long)]
        real_time: bool,
    },
}

fn init_logging(level: LogLevel) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = match &cli.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(level) = cli.log_level {
        settings.log_level = level;
    }
    init_logging(settings.log_level);

    match cli.command {
        Commands::Replay {
            script,
            latency_ms,
            seed,
            max_ticks,
        } => {
            if let Some(latency_ms) = latency_ms {
                settings.latency_ms = latency_ms;
            }
            if seed.is_some() {
                settings.seed = seed;
            }
            if max_ticks.is_some() {
                settings.max_ticks = max_ticks;
            }

            let text = fs::read_to_string(&script)
                .with_context(|| format!("reading script {}", script.display()))?;
            let requests = script::parse(&text)?;
            tracing::info!(requests = requests.len(), latency_ms = settings.latency_ms, "replaying");

            let transcript = replay::run(&settings, requests)?;
            for line in &transcript.lines {
                println!("{line}");
            }
        }
        Commands::Phases {
            iterations,
            real_time,
        } => {
            let lines = if real_time {
                phases::walkthrough(MonotonicClock::new(), iterations)?
            } else {
                phases::walkthrough(ManualClock::new(), iterations)?
            };
            for line in &lines {
                println!("{line}");
            }
        }
    }

    Ok(())
}
