//! Top-level launcher (§6 "CLI / entry"): constructs a `RollOffRoof` from a
//! configuration file and an OB queue, then calls `wake_up()`. Exit codes:
//! `0` on `pau`, `2` on `alert`, `1` on startup configuration error.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Utc;
use clap::Parser;
use roof_sequencer::config::load_config;
use roof_sequencer::devices::registry::DeviceRegistry;
use roof_sequencer::model::ObservingBlock;
use roof_sequencer::runner::{exit_code, RollOffRoof};
use roof_sequencer::scheduler::FifoScheduler;
use roof_sequencer::site::{SolarSkyOracle, TimerSkyOracle};

#[derive(Debug, Parser)]
#[command(name = "roof-sequencer", about = "Autonomous roll-off-roof observing sequencer")]
struct Cli {
    /// Path to the YAML configuration file (§6).
    #[arg(long)]
    config: PathBuf,

    /// Path to a JSON array of observing blocks to queue, FIFO.
    #[arg(long)]
    obs: PathBuf,

    /// Validate configuration and the OB queue, then exit without running.
    #[arg(long)]
    dry_run: bool,

    /// Use the timer-based sky oracle instead of the solar-position one —
    /// matches what the test suite uses, handy for a dry run at any hour.
    #[arg(long)]
    timer_sky: bool,

    /// Repeat for more verbosity: unset = warn, -v = info, -vv = debug.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let registry = DeviceRegistry::default();
    let config = match load_config(&cli.config, &registry) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "startup configuration error");
            return ExitCode::from(1);
        }
    };

    let obs_text = match std::fs::read_to_string(&cli.obs) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!(error = %e, path = %cli.obs.display(), "reading OB queue");
            return ExitCode::from(1);
        }
    };
    let obs: Vec<ObservingBlock> = match serde_json::from_str(&obs_text) {
        Ok(obs) => obs,
        Err(e) => {
            tracing::error!(error = %e, "parsing OB queue");
            return ExitCode::from(1);
        }
    };

    if cli.dry_run {
        tracing::info!(name = %config.name, obs = obs.len(), "configuration and OB queue are valid");
        return ExitCode::from(0);
    }

    let maxwait = config.maxwait_secs;
    let site = config.site.clone();
    let scheduler = Box::new(FifoScheduler::new(obs));

    let mut roof = if cli.timer_sky {
        RollOffRoof::new(config, scheduler, Box::new(TimerSkyOracle::new(Utc::now(), maxwait)))
    } else {
        RollOffRoof::new(config, scheduler, Box::new(SolarSkyOracle::new(site)))
    };

    let final_state = roof.wake_up().await;
    tracing::info!(state = %final_state, errors = roof.fault_book().error_count(), "run complete");
    ExitCode::from(exit_code(final_state) as u8)
}
