// Motor session for one LivelyBot motor
//
// Sequences the enable writes (mode, gains), hands control to the streaming
// transmitter and tears down with a single disable write. Every register
// write is fire-and-forget followed by a settle delay: the motor never
// acknowledges writes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::bus::CanBus;
use super::protocol::{DeviceId, Frame, MotorMode, Register, RegisterValue, StreamKind};
use super::stream::{BrakePolicy, FrameStreamer, StreamStats, Transmitter};
use crate::config::{SettleTiming, StreamConfig};
use crate::messages::SetpointCell;

/// Lifecycle of a motor session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    ModeSet,
    GainsPreset,
    Streaming,
    Disabled,
}

/// Gains written before streaming starts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GainProfile {
    /// Written to the torque-limit register first when set (N·m)
    #[serde(default)]
    pub torque_limit: Option<f32>,
    pub kp: f32,
    pub kd: f32,
}

impl GainProfile {
    /// Light stiffness for angle streaming
    pub const POSITION: Self = Self {
        torque_limit: None,
        kp: 1.0,
        kd: 0.1,
    };

    /// Velocity loop gains; the torque limit must be set or the motor stays limp
    pub const VELOCITY: Self = Self {
        torque_limit: Some(3.0),
        kp: 2.0,
        kd: 0.2,
    };

    pub fn for_stream(kind: StreamKind) -> Self {
        match kind {
            StreamKind::Position => Self::POSITION,
            StreamKind::Velocity => Self::VELOCITY,
        }
    }
}

/// Error types for session transitions
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("Motor {device}: cannot go from {from:?} to {to:?}")]
    InvalidTransition {
        device: DeviceId,
        from: SessionState,
        to: SessionState,
    },
}

/// Enable/disable state machine for one motor
pub struct MotorSession {
    bus: Arc<dyn CanBus>,
    device: DeviceId,
    settle: SettleTiming,
    state: SessionState,
}

impl MotorSession {
    pub fn new(bus: Arc<dyn CanBus>, device: DeviceId, settle: SettleTiming) -> Self {
        Self {
            bus,
            device,
            settle,
            state: SessionState::Idle,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    fn advance(&mut self, from: SessionState, to: SessionState) -> Result<(), SessionError> {
        if self.state != from {
            return Err(SessionError::InvalidTransition {
                device: self.device,
                from: self.state,
                to,
            });
        }
        debug!("Motor {}: {:?} -> {:?}", self.device, from, to);
        self.state = to;
        Ok(())
    }

    /// Write one register; send failures are logged and swallowed
    fn write(&self, register: Register, value: RegisterValue) {
        let frame = Frame::register_write(self.device, register as u8, value);
        debug!(
            "Write to motor {}: reg={:?}, value={:?}",
            self.device, register, value
        );
        if let Err(e) = self.bus.send(&frame) {
            warn!("Motor {}: write {:?} failed: {}", self.device, register, e);
        }
    }

    /// Idle -> ModeSet: put the motor in its active control mode
    pub async fn set_mode(&mut self) -> Result<(), SessionError> {
        self.advance(SessionState::Idle, SessionState::ModeSet)?;
        self.write(Register::Mode, RegisterValue::Int8(MotorMode::Active as u8));
        tokio::time::sleep(self.settle.mode()).await;
        Ok(())
    }

    /// ModeSet -> GainsPreset: write torque limit (optional), Kp and Kd
    pub async fn preset_gains(&mut self, gains: &GainProfile) -> Result<(), SessionError> {
        self.advance(SessionState::ModeSet, SessionState::GainsPreset)?;

        let mut writes = Vec::with_capacity(3);
        if let Some(limit) = gains.torque_limit {
            writes.push((Register::TorqueLimit, limit));
        }
        writes.push((Register::Kp, gains.kp));
        writes.push((Register::Kd, gains.kd));

        for (register, value) in writes {
            self.write(register, RegisterValue::Float32(value));
            tokio::time::sleep(self.settle.gain()).await;
        }
        Ok(())
    }

    /// Run the full enable sequence
    pub async fn enable(&mut self, gains: &GainProfile) -> Result<(), SessionError> {
        info!("Enabling motor {} ({:?})", self.device, gains);
        self.set_mode().await?;
        self.preset_gains(gains).await?;
        info!("Motor {} enabled", self.device);
        Ok(())
    }

    /// GainsPreset -> Streaming: start the transmitter for `setpoint`.
    ///
    /// No frame is sent by the transition itself.
    pub fn begin_streaming(
        &mut self,
        setpoint: Arc<SetpointCell>,
        config: &StreamConfig,
    ) -> Result<Transmitter, SessionError> {
        self.advance(SessionState::GainsPreset, SessionState::Streaming)?;

        let streamer = FrameStreamer::new(
            self.bus.clone(),
            setpoint,
            BrakePolicy::new(config.max_brake_acceleration),
            config.period(),
        );
        Ok(Transmitter::start(streamer, config.cadence, config.burst_ticks))
    }

    /// Any state -> Disabled.
    ///
    /// The transmitter, if any, is fully stopped before the disable write so
    /// that no stale stream frame can follow it. The disable frame is sent at
    /// most once per session.
    pub async fn disable(&mut self, transmitter: Option<Transmitter>) -> Option<StreamStats> {
        let stats = match transmitter {
            Some(transmitter) => Some(transmitter.stop().await),
            None => None,
        };

        if self.state == SessionState::Disabled {
            debug!("Motor {} already disabled", self.device);
            return stats;
        }

        self.write(Register::Mode, RegisterValue::Int8(MotorMode::Stopped as u8));
        self.state = SessionState::Disabled;
        info!("Motor {} disabled", self.device);
        stats
    }
}

impl Drop for MotorSession {
    fn drop(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Disabled => {}
            SessionState::ModeSet | SessionState::GainsPreset => {
                // No stream can be running yet, so disabling here is safe
                warn!("Motor {} dropped while enabled, disabling", self.device);
                self.write(Register::Mode, RegisterValue::Int8(MotorMode::Stopped as u8));
            }
            SessionState::Streaming => {
                error!(
                    "Motor {} dropped while streaming without disable()",
                    self.device
                );
            }
        }
    }
}
