use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use livelybot_can_runtime::config::{
    Cadence, ConfigError, RuntimeConfig, trajectory_duration,
};
use livelybot_can_runtime::motor::StreamKind;
use livelybot_can_runtime::motor::trajectory::{StepSequence, Trajectory};
use livelybot_can_runtime::runtime::{self, ControlMode};

/// Stream setpoints to a LivelyBot motor over CAN
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// JSON config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// CAN interface
    #[arg(long)]
    interface: Option<String>,

    /// Bus bitrate (bit/s)
    #[arg(long)]
    bitrate: Option<u32>,

    /// Motor device id (1-127)
    #[arg(long)]
    device_id: Option<u8>,

    /// Which stream to drive
    #[arg(long, value_enum, default_value_t = StreamArg::Velocity)]
    stream: StreamArg,

    /// Continuous stream, or a burst of frames per setpoint change
    #[arg(long, value_enum)]
    cadence: Option<CadenceArg>,

    /// Run against an in-memory bus, no motor needed
    #[arg(long)]
    dry_run: bool,

    /// Travel acceleration for velocity streams (rev/s²)
    #[arg(long, allow_negative_numbers = true)]
    acceleration: Option<f64>,

    /// Acceleration forced when braking to zero velocity (rev/s²)
    #[arg(long)]
    brake_acceleration: Option<f64>,

    /// Velocity limit for angle streams (rev/s)
    #[arg(long)]
    max_velocity: Option<f64>,

    /// Torque limit for angle streams (N·m)
    #[arg(long)]
    max_torque: Option<f64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Type targets at a prompt (default)
    Interactive,
    /// Sine wave around zero
    Sine {
        /// Peak value (degrees or rev/s); 90° or 2 rev/s if omitted
        #[arg(long)]
        amplitude: Option<f64>,
        /// Hz; 0.2 for angles, 0.5 for velocity if omitted
        #[arg(long)]
        frequency: Option<f64>,
        /// Seconds
        #[arg(long, default_value_t = 10.0)]
        duration: f64,
    },
    /// Linear ramp between two values
    Ramp {
        #[arg(long, allow_negative_numbers = true)]
        start: f64,
        #[arg(long, allow_negative_numbers = true)]
        end: f64,
        /// Seconds
        #[arg(long, default_value_t = 10.0)]
        duration: f64,
    },
    /// Hold each value in turn (e.g. a multi-position test)
    Step {
        /// Comma separated values, e.g. 0,90,-90
        #[arg(long, value_delimiter = ',', required = true, allow_negative_numbers = true)]
        values: Vec<f64>,
        /// Seconds per value
        #[arg(long, default_value_t = 2.0)]
        hold: f64,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StreamArg {
    Angle,
    Velocity,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CadenceArg {
    Continuous,
    Burst,
}

fn build_config(args: &Args) -> Result<RuntimeConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::load(path)?,
        None => RuntimeConfig::default(),
    };

    if let Some(interface) = &args.interface {
        config.interface = interface.clone();
    }
    if let Some(bitrate) = args.bitrate {
        config.bitrate = bitrate;
    }
    if let Some(device_id) = args.device_id {
        config.device_id = device_id;
    }
    if let Some(cadence) = args.cadence {
        config.stream.cadence = match cadence {
            CadenceArg::Continuous => Cadence::Continuous,
            CadenceArg::Burst => Cadence::Burst,
        };
    }
    if args.dry_run {
        config.motor_enabled = false;
    }
    if let Some(acceleration) = args.acceleration {
        config.limits.acceleration = acceleration.abs();
    }
    if let Some(brake) = args.brake_acceleration {
        config.stream.max_brake_acceleration = brake;
    }
    if let Some(max_velocity) = args.max_velocity {
        config.limits.max_velocity = max_velocity;
    }
    if let Some(max_torque) = args.max_torque {
        config.limits.max_torque = max_torque;
    }

    config.validate()?;
    Ok(config)
}

fn build_mode(command: Option<&Command>, kind: StreamKind) -> Result<ControlMode, ConfigError> {
    let angle = kind == StreamKind::Position;
    let mode = match command {
        None | Some(Command::Interactive) => ControlMode::Interactive,
        Some(Command::Sine {
            amplitude,
            frequency,
            duration,
        }) => ControlMode::Trajectory(Trajectory::Sine {
            amplitude: amplitude.unwrap_or(if angle { 90.0 } else { 2.0 }),
            frequency: frequency.unwrap_or(if angle { 0.2 } else { 0.5 }),
            duration: trajectory_duration(*duration)?,
        }),
        Some(Command::Ramp {
            start,
            end,
            duration,
        }) => ControlMode::Trajectory(Trajectory::Ramp {
            start: *start,
            end: *end,
            duration: trajectory_duration(*duration)?,
        }),
        Some(Command::Step { values, hold }) => ControlMode::Trajectory(Trajectory::Step(
            StepSequence::new(values.clone(), trajectory_duration(*hold)?),
        )),
    };
    Ok(mode)
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    let args = Args::parse();
    let kind = match args.stream {
        StreamArg::Angle => StreamKind::Position,
        StreamArg::Velocity => StreamKind::Velocity,
    };

    let setup = build_config(&args)
        .and_then(|config| Ok((config, build_mode(args.command.as_ref(), kind)?)));
    let (config, mode) = match setup {
        Ok(setup) => setup,
        Err(e) => {
            eprintln!("Runtime error: {}", e);
            std::process::exit(1);
        }
    };

    // Ctrl+C requests an orderly stop: stream off, motor disabled, bus closed
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping motor...");
            let _ = shutdown_tx.send(true);
        }
    });

    match runtime::run(config, kind, mode, shutdown_rx).await {
        Ok(Some(stats)) => info!(
            "Done: {} frames sent, {} failed, {} brake overrides",
            stats.sent, stats.send_failures, stats.brake_overrides
        ),
        Ok(None) => info!("Done: no frames streamed"),
        Err(e) => {
            eprintln!("Runtime error: {}", e);
            std::process::exit(1);
        }
    }

    // A pending stdin read would otherwise hold the runtime open
    std::process::exit(0);
}
