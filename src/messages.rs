// Shared setpoint and operator commands
//
// The setpoint is written by the control path (operator input or a
// trajectory) and read once per tick by the streaming task. Values are
// immutable; the cell swaps whole snapshots so a tick never sees a mix of
// old and new fields.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::DEFAULT_ACCELERATION;
use crate::motor::protocol::StreamKind;

/// Target the motor is streamed towards
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Setpoint {
    /// Position stream: hold an angle within velocity and torque limits
    Angle {
        degrees: f64,
        max_velocity: f64, // rev/s
        max_torque: f64,   // N·m
    },
    /// Velocity stream: reach a velocity with a bounded acceleration
    Velocity {
        velocity: f64,     // rev/s
        acceleration: f64, // rev/s², always >= 0
    },
}

impl Setpoint {
    pub fn stream_kind(&self) -> StreamKind {
        match self {
            Setpoint::Angle { .. } => StreamKind::Position,
            Setpoint::Velocity { .. } => StreamKind::Velocity,
        }
    }
}

/// Snapshot cell shared between the setpoint producer and the streaming task
pub struct SetpointCell {
    current: ArcSwap<Setpoint>,
}

impl SetpointCell {
    pub fn new(initial: Setpoint) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    /// Consistent copy of the current setpoint
    pub fn snapshot(&self) -> Setpoint {
        **self.current.load()
    }

    pub fn store(&self, setpoint: Setpoint) {
        self.current.store(setpoint.into());
    }

    pub fn set_angle(&self, degrees: f64, max_velocity: f64, max_torque: f64) {
        self.store(Setpoint::Angle {
            degrees,
            max_velocity,
            max_torque,
        });
    }

    /// Set the target velocity, keeping the stored acceleration
    pub fn set_velocity(&self, velocity: f64) {
        self.current.rcu(|current| {
            let acceleration = match **current {
                Setpoint::Velocity { acceleration, .. } => acceleration,
                Setpoint::Angle { .. } => DEFAULT_ACCELERATION,
            };
            Setpoint::Velocity {
                velocity,
                acceleration,
            }
        });
    }

    /// Set the travel acceleration (stored as an absolute value).
    ///
    /// Has no effect on an angle setpoint.
    pub fn set_acceleration(&self, acceleration: f64) {
        let acceleration = acceleration.abs();
        self.current.rcu(|current| match **current {
            Setpoint::Velocity { velocity, .. } => Setpoint::Velocity {
                velocity,
                acceleration,
            },
            angle @ Setpoint::Angle { .. } => {
                debug!("Ignoring acceleration {} for angle setpoint", acceleration);
                angle
            }
        });
    }
}

/// Operator input error
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputError {
    #[error("Not a number: {0:?}")]
    InvalidNumber(String),

    #[error("Missing value after {0:?}")]
    MissingValue(&'static str),

    #[error("{0:?} is not available for {1:?} streams")]
    Unsupported(&'static str, StreamKind),
}

/// Command typed at the interactive prompt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OperatorCommand {
    /// Angle in degrees or velocity in rev/s, depending on the stream
    Target(f64),
    /// Travel acceleration in rev/s²
    Acceleration(f64),
    Quit,
}

impl OperatorCommand {
    /// Parse one input line; blank lines yield `Ok(None)`
    pub fn parse(line: &str, kind: StreamKind) -> Result<Option<Self>, InputError> {
        let line = line.trim().to_lowercase();
        let mut parts = line.split_whitespace();
        let Some(head) = parts.next() else {
            return Ok(None);
        };

        match head {
            "q" | "exit" => Ok(Some(OperatorCommand::Quit)),
            "acc" => {
                if kind != StreamKind::Velocity {
                    return Err(InputError::Unsupported("acc", kind));
                }
                let value = parts.next().ok_or(InputError::MissingValue("acc"))?;
                Ok(Some(OperatorCommand::Acceleration(parse_number(value)?)))
            }
            other => Ok(Some(OperatorCommand::Target(parse_number(other)?))),
        }
    }
}

fn parse_number(text: &str) -> Result<f64, InputError> {
    match text.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(InputError::InvalidNumber(text.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_velocity_keeps_acceleration() {
        let cell = SetpointCell::new(Setpoint::Velocity {
            velocity: 0.0,
            acceleration: 5.0,
        });
        cell.set_acceleration(12.0);
        cell.set_velocity(3.0);
        assert_eq!(
            cell.snapshot(),
            Setpoint::Velocity {
                velocity: 3.0,
                acceleration: 12.0
            }
        );
    }

    #[test]
    fn test_acceleration_stored_as_absolute() {
        let cell = SetpointCell::new(Setpoint::Velocity {
            velocity: 1.0,
            acceleration: 5.0,
        });
        cell.set_acceleration(-8.0);
        assert_eq!(
            cell.snapshot(),
            Setpoint::Velocity {
                velocity: 1.0,
                acceleration: 8.0
            }
        );
    }

    #[test]
    fn test_acceleration_ignored_for_angle() {
        let cell = SetpointCell::new(Setpoint::Angle {
            degrees: 10.0,
            max_velocity: 2.0,
            max_torque: 3.0,
        });
        cell.set_acceleration(4.0);
        assert_eq!(cell.snapshot().stream_kind(), StreamKind::Position);
    }

    #[test]
    fn test_velocity_from_angle_uses_default_acceleration() {
        let cell = SetpointCell::new(Setpoint::Angle {
            degrees: 0.0,
            max_velocity: 2.0,
            max_torque: 3.0,
        });
        cell.set_velocity(1.5);
        assert_eq!(
            cell.snapshot(),
            Setpoint::Velocity {
                velocity: 1.5,
                acceleration: DEFAULT_ACCELERATION
            }
        );
    }

    #[test]
    fn test_snapshot_is_detached() {
        let cell = SetpointCell::new(Setpoint::Velocity {
            velocity: 1.0,
            acceleration: 5.0,
        });
        let before = cell.snapshot();
        cell.set_velocity(2.0);
        assert_eq!(
            before,
            Setpoint::Velocity {
                velocity: 1.0,
                acceleration: 5.0
            }
        );
    }

    #[test]
    fn test_parse_velocity_commands() {
        let kind = StreamKind::Velocity;
        assert_eq!(
            OperatorCommand::parse("5.0", kind),
            Ok(Some(OperatorCommand::Target(5.0)))
        );
        assert_eq!(
            OperatorCommand::parse("  ACC 10 ", kind),
            Ok(Some(OperatorCommand::Acceleration(10.0)))
        );
        assert_eq!(
            OperatorCommand::parse("0", kind),
            Ok(Some(OperatorCommand::Target(0.0)))
        );
        assert_eq!(
            OperatorCommand::parse("exit", kind),
            Ok(Some(OperatorCommand::Quit))
        );
        assert_eq!(OperatorCommand::parse("   ", kind), Ok(None));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(
            OperatorCommand::parse("fast", StreamKind::Velocity),
            Err(InputError::InvalidNumber("fast".to_string()))
        );
        assert_eq!(
            OperatorCommand::parse("acc", StreamKind::Velocity),
            Err(InputError::MissingValue("acc"))
        );
        assert_eq!(
            OperatorCommand::parse("acc 3", StreamKind::Position),
            Err(InputError::Unsupported("acc", StreamKind::Position))
        );
        assert_eq!(
            OperatorCommand::parse("nan", StreamKind::Position),
            Err(InputError::InvalidNumber("nan".to_string()))
        );
    }

    #[test]
    fn test_setpoint_json() {
        let json = serde_json::to_string(&Setpoint::Velocity {
            velocity: 1.0,
            acceleration: 5.0,
        })
        .unwrap();
        assert_eq!(json, r#"{"kind":"velocity","velocity":1.0,"acceleration":5.0}"#);
    }
}
