use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;

use grid_fleet::config::{RoomModel, SessionConfig, WorkerConfig};
use grid_fleet::logging;
use grid_fleet::session::{self, EXIT_STARTUP_FAILURE};
use grid_fleet::types::{BatteryLevel, MAX_BATTERY, Position, RobotId};
use grid_fleet::worker;

#[derive(Parser)]
#[command(name = "grid_fleet")]
#[command(about = "Drive a fleet of robot processes across a grid room")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log filter for diagnostics on stderr (RUST_LOG overrides)
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the coordinator and read operator commands from stdin.
    Run {
        /// Room description file
        #[arg(long)]
        room: PathBuf,
        /// Start positions, one "(row,col)" per line
        #[arg(long)]
        robots: PathBuf,
        /// Initial battery for every robot
        #[arg(long, default_value_t = MAX_BATTERY)]
        battery: BatteryLevel,
        /// Battery tick interval in milliseconds; 0 disables ticking
        #[arg(long, default_value_t = 1000)]
        tick_ms: u64,
        /// How long to wait for each worker reply
        #[arg(long, default_value_t = 2000)]
        reply_timeout_ms: u64,
        /// How long workers get to exit before being killed
        #[arg(long, default_value_t = 2000)]
        grace_ms: u64,
    },

    /// Run one robot (launched by the coordinator).
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        id: RobotId,
        #[arg(long, allow_hyphen_values = true)]
        row: i64,
        #[arg(long, allow_hyphen_values = true)]
        col: i64,
        #[arg(long, default_value_t = MAX_BATTERY)]
        battery: BatteryLevel,
        #[arg(long, default_value_t = 0)]
        tick_ms: u64,
        #[arg(long)]
        room: PathBuf,
    },
}

fn tick(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn session_config(cli_log_level: &str, command: Commands) -> Result<SessionConfig> {
    let Commands::Run {
        room,
        robots,
        battery,
        tick_ms,
        reply_timeout_ms,
        grace_ms,
    } = command
    else {
        anyhow::bail!("not a run command");
    };
    let worker_program = std::env::current_exe().context("cannot locate own executable")?;
    let mut config = SessionConfig::load(&room, &robots, worker_program)
        .with_context(|| format!("invalid configuration ({} / {})", room.display(), robots.display()))?;
    config.initial_battery = battery.min(MAX_BATTERY);
    config.tick = tick(tick_ms);
    config.reply_timeout = Duration::from_millis(reply_timeout_ms);
    config.grace_period = Duration::from_millis(grace_ms);
    config.worker_log_level = cli_log_level.to_string();
    Ok(config)
}

fn main() {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let status = match cli.command {
        command @ Commands::Run { .. } => match session_config(&cli.log_level, command) {
            Ok(config) => session::run(config),
            Err(err) => {
                error!("{err:#}");
                eprintln!("error: {err:#}");
                EXIT_STARTUP_FAILURE
            }
        },
        Commands::Worker {
            id,
            row,
            col,
            battery,
            tick_ms,
            room,
        } => match RoomModel::load(&room) {
            Ok(model) => worker::run(
                WorkerConfig {
                    id,
                    start: Position::new(row, col),
                    battery,
                    tick: tick(tick_ms),
                },
                model,
            ),
            Err(err) => {
                error!(robot = id, "cannot load room: {err}");
                EXIT_STARTUP_FAILURE
            }
        },
    };
    process::exit(status);
}
