// Controller runtime: one motor, one stream, guaranteed teardown
//
// The ControllerContext owns everything a run needs (bus handle, motor
// session, shared setpoint, transmitter) and is passed explicitly; there is
// no process-wide state. Whatever happens while driving the motor, teardown
// runs in order: stop the stream, disable the motor, close the bus.

use std::io::{self, Write, stdout};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use crossterm::execute;
use crossterm::style::{Print, Stylize};
use futures::FutureExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{BRAKE_HOLD, ConfigError, RuntimeConfig, STREAM_PERIOD};
use crate::messages::{OperatorCommand, Setpoint, SetpointCell};
use crate::motor::bus::{BusError, CanBus, MemoryBus, open_socketcan};
use crate::motor::driver::{GainProfile, MotorSession, SessionError};
use crate::motor::protocol::StreamKind;
use crate::motor::stream::{StreamStats, Transmitter};
use crate::motor::trajectory::{FollowOutcome, Follower, Trajectory};

/// Error types for a controller run
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Terminal I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// What drives the setpoint during a run
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMode {
    /// Targets typed at the prompt
    Interactive,
    /// Sine, ramp or step generator
    Trajectory(Trajectory),
}

/// Open the configured transport; dry runs get an in-memory bus
pub fn open_bus(config: &RuntimeConfig) -> Result<Arc<dyn CanBus>> {
    if !config.motor_enabled {
        info!("Motor disabled in config, running on an in-memory bus");
        return Ok(Arc::new(MemoryBus::new()));
    }
    info!("Opening CAN interface {}...", config.interface);
    Ok(open_socketcan(&config.interface, config.bitrate)?)
}

/// Everything one controller run owns
pub struct ControllerContext {
    config: RuntimeConfig,
    kind: StreamKind,
    bus: Arc<dyn CanBus>,
    // Declared before the session so it is dropped first
    transmitter: Option<Transmitter>,
    session: MotorSession,
    setpoint: Arc<SetpointCell>,
}

impl ControllerContext {
    pub fn new(bus: Arc<dyn CanBus>, config: RuntimeConfig, kind: StreamKind) -> Result<Self> {
        let device = config.device()?;
        let session = MotorSession::new(bus.clone(), device, config.settle);

        let limits = &config.limits;
        let initial = match kind {
            StreamKind::Position => Setpoint::Angle {
                degrees: 0.0,
                max_velocity: limits.max_velocity,
                max_torque: limits.max_torque,
            },
            StreamKind::Velocity => Setpoint::Velocity {
                velocity: 0.0,
                acceleration: limits.acceleration.abs(),
            },
        };

        Ok(Self {
            config,
            kind,
            bus,
            transmitter: None,
            session,
            setpoint: Arc::new(SetpointCell::new(initial)),
        })
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn setpoint(&self) -> Setpoint {
        self.setpoint.snapshot()
    }

    /// Enable the motor. Velocity streams start right away (holding zero);
    /// angle streams start with the first target so the motor does not
    /// jump to 0° on enable.
    pub async fn start(&mut self) -> Result<()> {
        let gains = self
            .config
            .gains
            .unwrap_or_else(|| GainProfile::for_stream(self.kind));
        self.session.enable(&gains).await?;

        if self.kind == StreamKind::Velocity {
            self.ensure_streaming()?;
        }
        Ok(())
    }

    fn ensure_streaming(&mut self) -> Result<()> {
        if self.transmitter.is_none() {
            let transmitter = self
                .session
                .begin_streaming(self.setpoint.clone(), &self.config.stream)?;
            self.transmitter = Some(transmitter);
        }
        Ok(())
    }

    async fn notify(&self) {
        if let Some(transmitter) = &self.transmitter {
            transmitter.setpoint_changed().await;
        }
    }

    /// Set a new target: degrees for angle streams, rev/s for velocity
    pub async fn apply(&mut self, target: f64) -> Result<()> {
        match self.kind {
            StreamKind::Position => {
                let limits = &self.config.limits;
                self.setpoint
                    .set_angle(target, limits.max_velocity, limits.max_torque);
            }
            StreamKind::Velocity => self.setpoint.set_velocity(target),
        }
        self.ensure_streaming()?;
        self.notify().await;
        Ok(())
    }

    /// Set the travel acceleration of a velocity stream
    pub async fn set_acceleration(&mut self, acceleration: f64) {
        self.setpoint.set_acceleration(acceleration);
        self.notify().await;
    }

    /// Command zero velocity and let the brake frames go out for a while.
    /// Angle streams are left where they are.
    pub async fn brake(&mut self) {
        if self.kind != StreamKind::Velocity || self.transmitter.is_none() {
            return;
        }
        info!("Braking to zero velocity");
        self.setpoint.set_velocity(0.0);
        self.notify().await;
        tokio::time::sleep(BRAKE_HOLD).await;
    }

    /// Stop the stream, disable the motor and release the bus
    pub async fn shutdown(mut self) -> Option<StreamStats> {
        let stats = self.session.disable(self.transmitter.take()).await;
        self.bus.close();
        stats
    }
}

/// Resolves once shutdown is requested; never if the sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Run one controller session on the configured bus
pub async fn run(
    config: RuntimeConfig,
    kind: StreamKind,
    mode: ControlMode,
    shutdown: watch::Receiver<bool>,
) -> Result<Option<StreamStats>> {
    let bus = open_bus(&config)?;
    let input = BufReader::new(tokio::io::stdin());
    run_on_bus(bus, config, kind, mode, shutdown, input).await
}

/// Run one controller session on `bus`, reading operator input from `input`
pub async fn run_on_bus<R>(
    bus: Arc<dyn CanBus>,
    config: RuntimeConfig,
    kind: StreamKind,
    mode: ControlMode,
    shutdown: watch::Receiver<bool>,
    input: R,
) -> Result<Option<StreamStats>>
where
    R: AsyncBufRead + Unpin,
{
    let mut context = match ControllerContext::new(bus.clone(), config, kind) {
        Ok(context) => context,
        Err(e) => {
            bus.close();
            return Err(e);
        }
    };

    info!(
        "Controller started: motor {}, {:?} stream, {}ms period, {:?} cadence, brake {} rev/s² (raw {})",
        context.config.device_id,
        kind,
        context.config.stream.period_ms,
        context.config.stream.cadence,
        context.config.stream.max_brake_acceleration,
        context.config.brake_raw()
    );

    let outcome = AssertUnwindSafe(drive(&mut context, mode, shutdown, input))
        .catch_unwind()
        .await;

    // Always runs, whether drive() returned or panicked
    let result = match outcome {
        Ok(result) => {
            if let Err(e) = &result {
                warn!("Control stopped on error: {}", e);
            }
            result
        }
        Err(panic) => {
            error!("Control panicked, stopping motor");
            context.shutdown().await;
            std::panic::resume_unwind(panic);
        }
    };
    let stats = context.shutdown().await;
    result.map(|_| stats)
}

async fn drive<R>(
    context: &mut ControllerContext,
    mode: ControlMode,
    mut shutdown: watch::Receiver<bool>,
    input: R,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    tokio::select! {
        biased;
        _ = shutdown_requested(&mut shutdown) => {
            info!("Interrupted during enable");
            return Ok(());
        }
        started = context.start() => started?,
    }

    let result = match mode {
        ControlMode::Interactive => interactive(context, &mut shutdown, input).await,
        ControlMode::Trajectory(trajectory) => follow(context, trajectory, shutdown).await,
    };

    context.brake().await;
    result
}

async fn follow(
    context: &mut ControllerContext,
    trajectory: Trajectory,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(
        "Following {:?} trajectory for {:.1}s",
        context.kind(),
        trajectory.duration().as_secs_f64()
    );

    let mut follower = Follower::new(trajectory, STREAM_PERIOD, shutdown);
    while let Some(target) = follower.next().await {
        debug!("Trajectory target {:.3}", target);
        context.apply(target).await?;
    }

    match follower.outcome() {
        Some(FollowOutcome::Interrupted) => info!("Trajectory interrupted"),
        _ => info!("Trajectory complete"),
    }
    Ok(())
}

async fn interactive<R>(
    context: &mut ControllerContext,
    shutdown: &mut watch::Receiver<bool>,
    mut input: R,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    print_help(context.kind())?;
    let mut raw = Vec::new();

    loop {
        prompt(context.kind())?;

        raw.clear();
        let read = tokio::select! {
            biased;
            _ = shutdown_requested(shutdown) => {
                println!();
                return Ok(());
            }
            read = input.read_until(b'\n', &mut raw) => read?,
        };
        // End of input
        if read == 0 {
            return Ok(());
        }

        // Undecodable bytes become U+FFFD and are rejected by the parser
        let line = String::from_utf8_lossy(&raw);
        match OperatorCommand::parse(&line, context.kind()) {
            Ok(None) => {}
            Ok(Some(OperatorCommand::Quit)) => return Ok(()),
            Ok(Some(OperatorCommand::Target(target))) => {
                context.apply(target).await?;
                report(context.setpoint())?;
            }
            Ok(Some(OperatorCommand::Acceleration(acceleration))) => {
                context.set_acceleration(acceleration).await;
                report(context.setpoint())?;
            }
            Err(e) => {
                execute!(stdout(), Print(format!("  ✗ {}\n", e).red()))?;
            }
        }
    }
}

fn print_help(kind: StreamKind) -> io::Result<()> {
    let mut out = stdout();
    execute!(
        out,
        Print("\n"),
        Print("=".repeat(50).cyan()),
        Print("\n"),
    )?;
    match kind {
        StreamKind::Velocity => execute!(
            out,
            Print("Velocity control\n".bold()),
            Print("  <v>      target velocity (rev/s)\n"),
            Print("  acc <a>  acceleration (rev/s²)\n"),
            Print("  0        brake to stop\n"),
        )?,
        StreamKind::Position => execute!(
            out,
            Print("Angle control\n".bold()),
            Print("  <deg>    target angle (degrees)\n"),
        )?,
    }
    execute!(
        out,
        Print("  q, exit  quit\n"),
        Print("=".repeat(50).cyan()),
        Print("\n"),
    )
}

fn prompt(kind: StreamKind) -> io::Result<()> {
    let label = match kind {
        StreamKind::Velocity => "velocity> ",
        StreamKind::Position => "angle> ",
    };
    let mut out = stdout();
    execute!(out, Print(label.green()))?;
    out.flush()
}

fn report(setpoint: Setpoint) -> io::Result<()> {
    let text = match setpoint {
        Setpoint::Angle {
            degrees,
            max_velocity,
            max_torque,
        } => format!(
            "  → {:.1}° (max {:.2} rev/s, {:.2} N·m)\n",
            degrees, max_velocity, max_torque
        ),
        Setpoint::Velocity {
            velocity,
            acceleration,
        } => format!("  → {:.2} rev/s, acc {:.2} rev/s²\n", velocity, acceleration),
    };
    execute!(stdout(), Print(text.cyan()))
}
