//! # MPS Comm Probe
//!
//! Brings up every station of a configuration, optionally drives a signal
//! light on each, and prints one JSON snapshot per station.
//!
//! # Usage
//!
//! ```bash
//! # Probe the configured stations
//! mps_comm --config /etc/mps/comm.toml
//!
//! # Same stations, all replaced by the in-process model
//! mps_comm --config comm.toml --simulate
//!
//! # No configuration file: one simulated station of every type
//! mps_comm -s --light green:blink -v
//! ```

use clap::Parser;
use mps_common::config::{
    CommConfig, ConfigError, ConfigLoader, LogLevel, Protocol, StationConfig,
};
use mps_common::consts::DEFAULT_CONFIG_PATH;
use mps_common::error::CommError;
use mps_common::machine::{LIGHT_INDEFINITE, LightColor, LightState, MachineType};
use mps_comm::{BackendRegistry, Fleet, Machine, TracingEventLog};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// MPS Comm - probe stations through the machine control engine
#[derive(Parser, Debug)]
#[command(name = "mps_comm")]
#[command(version)]
#[command(about = "Probe MPS stations through the machine control engine")]
#[command(long_about = None)]
struct Args {
    /// Path to the engine configuration (comm.toml)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Replace every station link with the in-process station model
    #[arg(short = 's', long)]
    simulate: bool,

    /// Drive one light on every station, e.g. `red`, `yellow:blink`, `green:off`
    #[arg(long, value_name = "COLOR[:STATE]")]
    light: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Error)]
enum ProbeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Comm(#[from] CommError),

    #[error("invalid --light value '{0}'")]
    Light(String),

    #[error("snapshot encoding failed: {0}")]
    Json(#[from] serde_json::Error),
}

fn main() {
    let args = Args::parse();
    let loaded = CommConfig::load(&args.config);
    let log_level = loaded
        .as_ref()
        .map(|config| config.shared.log_level)
        .unwrap_or_default();
    setup_tracing(&args, log_level);

    if let Err(e) = run(&args, loaded) {
        error!("Probe failed: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args, loaded: Result<CommConfig, ConfigError>) -> Result<(), ProbeError> {
    info!("MPS Comm v{} starting...", env!("CARGO_PKG_VERSION"));

    let light = args.light.as_deref().map(parse_light).transpose()?;
    let config = load_config(args, loaded)?;
    info!(stations = config.stations.len(), "Configuration loaded");

    let fleet = Fleet::from_config(
        &config,
        &BackendRegistry::with_defaults(),
        Arc::new(TracingEventLog),
    )?;
    for name in fleet.wait_ready(config.dispatcher.startup_wait()) {
        warn!(station = %name, "Station not ready");
    }

    if let Some((color, state)) = light {
        for name in fleet.names() {
            if let Some(machine) = fleet.machine(name) {
                drive_light(machine.as_ref(), color, state);
            }
        }
    }

    for snapshot in fleet.snapshots() {
        println!("{}", snapshot.to_json()?);
    }

    fleet.shutdown();
    info!("MPS Comm shutdown complete");
    Ok(())
}

fn load_config(
    args: &Args,
    loaded: Result<CommConfig, ConfigError>,
) -> Result<CommConfig, ProbeError> {
    let mut config = match loaded {
        Ok(config) => config,
        Err(ConfigError::FileNotFound) if args.simulate => {
            warn!(path = %args.config.display(), "No configuration found, simulating one station per type");
            demo_config()
        }
        Err(e) => return Err(e.into()),
    };
    if args.simulate {
        for station in &mut config.stations {
            station.simulate = true;
        }
    }
    config.validate()?;
    Ok(config)
}

fn demo_config() -> CommConfig {
    let mut config = CommConfig::default();
    config.stations = MachineType::ALL
        .into_iter()
        .map(|machine_type| {
            let protocol = if machine_type == MachineType::PickPlace {
                Protocol::Modbus
            } else {
                Protocol::Simulation
            };
            let mut station =
                StationConfig::new(format!("SIM-{}", machine_type.abbrev()), machine_type, protocol);
            station.simulate = true;
            station
        })
        .collect();
    config
}

fn parse_light(arg: &str) -> Result<(LightColor, LightState), ProbeError> {
    let (color, state) = arg.split_once(':').unwrap_or((arg, "on"));
    match (LightColor::parse(color), LightState::parse(state)) {
        (Some(color), Some(state)) => Ok((color, state)),
        _ => Err(ProbeError::Light(arg.to_string())),
    }
}

fn drive_light(machine: &dyn Machine, color: LightColor, state: LightState) {
    let handle = match machine.set_light(color, state, LIGHT_INDEFINITE) {
        Ok(handle) => handle,
        Err(e) => {
            warn!(station = machine.name(), error = %e, "Light rejected");
            return;
        }
    };
    match handle.wait_timeout(Duration::from_secs(10)) {
        Some(outcome) if outcome.is_completed() => {
            info!(station = machine.name(), ?color, ?state, "Light set");
        }
        Some(outcome) => warn!(station = machine.name(), ?outcome, "Light failed"),
        None => warn!(station = machine.name(), "Light still pending"),
    }
}

fn log_directive(verbose: bool, log_level: LogLevel) -> &'static str {
    if verbose {
        LogLevel::Debug.as_filter()
    } else {
        log_level.as_filter()
    }
}

/// Setup tracing subscriber. `RUST_LOG` wins, then `--verbose`, then the
/// configured `shared.log_level`.
fn setup_tracing(args: &Args, log_level: LogLevel) {
    let directive = log_directive(args.verbose, log_level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
