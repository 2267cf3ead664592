// Fixed-point conversion between physical units and protocol raw values.
//
// Every streamed quantity travels as a signed 16-bit integer. The scale
// factors below come from the motor vendor's SDK and never change at runtime.

use serde::{Deserialize, Serialize};

/// 1 revolution = 10000 raw units
pub const SCALE_POSITION: f64 = 10000.0;
/// 1 rev/s = 4000 raw units
pub const SCALE_VELOCITY: f64 = 4000.0;
/// 1 rev/s² = 1000 raw units
pub const SCALE_ACCELERATION: f64 = 1000.0;
/// 1 N·m = 200 raw units
pub const SCALE_TORQUE: f64 = 200.0;

/// Raw position meaning "no position constraint" in velocity-stream frames
pub const POSITION_SENTINEL: i16 = i16::MIN;

/// Physical quantity carried in a stream frame field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quantity {
    /// Revolutions
    Position,
    /// Revolutions per second
    Velocity,
    /// Revolutions per second squared
    Acceleration,
    /// Newton-metres
    Torque,
}

impl Quantity {
    /// Raw units per physical unit
    pub const fn scale(self) -> f64 {
        match self {
            Quantity::Position => SCALE_POSITION,
            Quantity::Velocity => SCALE_VELOCITY,
            Quantity::Acceleration => SCALE_ACCELERATION,
            Quantity::Torque => SCALE_TORQUE,
        }
    }
}

/// Convert a physical value to its raw int16 representation.
///
/// The product is rounded to the nearest integer (ties away from zero) and
/// saturated to the int16 range. Saturation is silent. NaN encodes to 0.
pub fn encode(quantity: Quantity, value: f64) -> i16 {
    let scaled = (value * quantity.scale()).round();
    if scaled.is_nan() {
        return 0;
    }

    // Clamp to signed 16-bit range
    scaled.clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

/// Inverse of [`encode`] for values that were not saturated
pub fn decode(quantity: Quantity, raw: i16) -> f64 {
    raw as f64 / quantity.scale()
}

/// Convert an angle in degrees to revolutions
pub fn degrees_to_revolutions(degrees: f64) -> f64 {
    degrees / 360.0
}
