// Motor control for LivelyBot CAN motors
//
// Provides:
// - Fixed-point conversion of physical units
// - Frame encoding for register writes, reads and setpoint streams
// - CAN bus transport (SocketCAN, in-memory)
// - Motor session state machine and streaming transmitter
// - Trajectory generators and bus discovery

pub mod bus;
pub mod discovery;
pub mod driver;
pub mod fixed_point;
pub mod protocol;
pub mod stream;
pub mod trajectory;

pub use bus::{BusError, CanBus, MemoryBus, ReceivedFrame, open_socketcan};
pub use driver::{GainProfile, MotorSession, SessionError, SessionState};
pub use fixed_point::{Quantity, decode, encode};
pub use protocol::{DeviceId, Frame, FrameError, StreamKind};
pub use stream::{BrakePolicy, FrameStreamer, StreamStats, Transmitter};
pub use trajectory::{FollowOutcome, Follower, StepSequence, Trajectory};
