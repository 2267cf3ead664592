// Stream timing, bus defaults, motor configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::motor::driver::GainProfile;
use crate::motor::fixed_point::{Quantity, SCALE_ACCELERATION};
use crate::motor::protocol::DeviceId;

// Stream frequency (100 Hz)
pub const STREAM_PERIOD: Duration = Duration::from_millis(10);

// Settle delays between configuration writes (no acknowledgment exists)
pub const MODE_SETTLE: Duration = Duration::from_millis(50);
pub const GAIN_SETTLE: Duration = Duration::from_millis(20);

// Smart brake acceleration, close to the raw ceiling of 32.767 rev/s²
pub const MAX_BRAKE_ACCELERATION: f64 = 30.0;

// Frames sent per setpoint change in burst cadence
pub const BURST_TICKS: usize = 5;

// How long brake frames keep going out before teardown
pub const BRAKE_HOLD: Duration = Duration::from_millis(100);

// Longest accepted trajectory duration or step hold
pub const MAX_TRAJECTORY_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

// Bus defaults
pub const DEFAULT_INTERFACE: &str = "can0";
pub const DEFAULT_BITRATE: u32 = 1_000_000;
pub const DEFAULT_DEVICE_ID: u8 = 1;

// Motion defaults
pub const DEFAULT_MAX_VELOCITY: f64 = 2.0; // rev/s
pub const DEFAULT_MAX_TORQUE: f64 = 3.0; // N·m
pub const DEFAULT_ACCELERATION: f64 = 5.0; // rev/s²

/// Parse a trajectory duration or step hold given in seconds
pub fn trajectory_duration(seconds: f64) -> Result<Duration, ConfigError> {
    match Duration::try_from_secs_f64(seconds) {
        Ok(duration) if duration <= MAX_TRAJECTORY_DURATION => Ok(duration),
        _ => Err(ConfigError::Invalid(format!(
            "{}s is not a duration in [0, {}]s",
            seconds,
            MAX_TRAJECTORY_DURATION.as_secs()
        ))),
    }
}

/// Error types for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// How stream frames are paced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Background task ticking until stopped
    #[default]
    Continuous,
    /// A bounded burst of ticks after each setpoint change
    Burst,
}

/// Streaming transmitter settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    pub period_ms: u64,
    pub max_brake_acceleration: f64,
    pub burst_ticks: usize,
    pub cadence: Cadence,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            period_ms: STREAM_PERIOD.as_millis() as u64,
            max_brake_acceleration: MAX_BRAKE_ACCELERATION,
            burst_ticks: BURST_TICKS,
            cadence: Cadence::Continuous,
        }
    }
}

impl StreamConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

/// Limits applied to streamed setpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MotionLimits {
    pub max_velocity: f64,
    pub max_torque: f64,
    pub acceleration: f64,
}

impl Default for MotionLimits {
    fn default() -> Self {
        Self {
            max_velocity: DEFAULT_MAX_VELOCITY,
            max_torque: DEFAULT_MAX_TORQUE,
            acceleration: DEFAULT_ACCELERATION,
        }
    }
}

/// Settle delays used by the enable sequence
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SettleTiming {
    pub mode_ms: u64,
    pub gain_ms: u64,
}

impl Default for SettleTiming {
    fn default() -> Self {
        Self {
            mode_ms: MODE_SETTLE.as_millis() as u64,
            gain_ms: GAIN_SETTLE.as_millis() as u64,
        }
    }
}

impl SettleTiming {
    pub fn mode(&self) -> Duration {
        Duration::from_millis(self.mode_ms)
    }

    pub fn gain(&self) -> Duration {
        Duration::from_millis(self.gain_ms)
    }
}

/// Runtime configuration, loadable from a JSON file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub interface: String,
    pub bitrate: u32,
    pub device_id: u8,
    // Enable hardware motor control (false = dry run on an in-memory bus)
    pub motor_enabled: bool,
    pub stream: StreamConfig,
    pub limits: MotionLimits,
    // Overrides the per-stream gain preset when set
    pub gains: Option<GainProfile>,
    pub settle: SettleTiming,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            interface: DEFAULT_INTERFACE.to_string(),
            bitrate: DEFAULT_BITRATE,
            device_id: DEFAULT_DEVICE_ID,
            motor_enabled: true,
            stream: StreamConfig::default(),
            limits: MotionLimits::default(),
            gains: None,
            settle: SettleTiming::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load and validate a JSON config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        DeviceId::new(self.device_id).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.stream.period_ms == 0 {
            return Err(ConfigError::Invalid("stream.period_ms must be > 0".into()));
        }
        if self.stream.burst_ticks == 0 {
            return Err(ConfigError::Invalid("stream.burst_ticks must be > 0".into()));
        }

        let ceiling = i16::MAX as f64 / SCALE_ACCELERATION;
        let brake = self.stream.max_brake_acceleration;
        if !(brake > 0.0 && brake <= ceiling) {
            return Err(ConfigError::Invalid(format!(
                "stream.max_brake_acceleration must be in (0, {}] rev/s²",
                ceiling
            )));
        }

        for (name, value) in [
            ("limits.max_velocity", self.limits.max_velocity),
            ("limits.max_torque", self.limits.max_torque),
            ("limits.acceleration", self.limits.acceleration),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!("{} must be >= 0", name)));
            }
        }

        Ok(())
    }

    pub fn device(&self) -> Result<DeviceId, ConfigError> {
        DeviceId::new(self.device_id).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Raw brake acceleration, for logging
    pub fn brake_raw(&self) -> i16 {
        crate::motor::fixed_point::encode(Quantity::Acceleration, self.stream.max_brake_acceleration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stream.period(), Duration::from_millis(10));
        assert_eq!(config.brake_raw(), 30000);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = RuntimeConfig::from_json(
            r#"{ "device_id": 3, "stream": { "cadence": "burst" }, "motor_enabled": false }"#,
        )
        .unwrap();
        assert_eq!(config.device_id, 3);
        assert_eq!(config.stream.cadence, Cadence::Burst);
        assert_eq!(config.stream.burst_ticks, BURST_TICKS);
        assert_eq!(config.interface, "can0");
        assert!(!config.motor_enabled);
        assert!(config.gains.is_none());
    }

    #[test]
    fn test_gain_override_json() {
        let config = RuntimeConfig::from_json(
            r#"{ "gains": { "kp": 1.5, "kd": 0.05, "torque_limit": 2.0 } }"#,
        )
        .unwrap();
        let gains = config.gains.unwrap();
        assert_eq!(gains.kp, 1.5);
        assert_eq!(gains.torque_limit, Some(2.0));
    }

    #[test]
    fn test_trajectory_duration_bounds() {
        assert_eq!(trajectory_duration(2.0).unwrap(), Duration::from_secs(2));
        assert_eq!(
            trajectory_duration(86_400.0).unwrap(),
            MAX_TRAJECTORY_DURATION
        );
        for bad in [1e18, 86_400.5, -1.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                trajectory_duration(bad),
                Err(ConfigError::Invalid(_))
            ));
        }
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            RuntimeConfig::from_json(r#"{ "device_id": 0 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_json(r#"{ "stream": { "period_ms": 0 } }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_json(r#"{ "stream": { "max_brake_acceleration": 40.0 } }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_json(r#"{ "limits": { "max_torque": -1.0 } }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RuntimeConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
