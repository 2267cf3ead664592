// LivelyBot high-torque motor CAN protocol
//
// Every frame carries exactly 8 payload bytes. Unused bytes are padded with
// the sentinel 0x50. Two frame families exist:
//   Register access: [opcode, register, value..., 0x50...]
//   Stream command:  [a_lo, a_hi, b_lo, b_hi, c_lo, c_hi, 0x50, 0x50]

use std::fmt;

use serde::{Deserialize, Serialize};

/// Payload length of every frame
pub const FRAME_LEN: usize = 8;

/// Padding byte for unused payload bytes
pub const SENTINEL: u8 = 0x50;

/// Identifier bit asking the addressed device to reply
pub const REPLY_FLAG: u16 = 0x8000;

/// Broadcast identifier of position-stream frames
pub const POSITION_STREAM_ID: u16 = 0x0090;

/// Broadcast identifier of velocity-stream frames
pub const VELOCITY_STREAM_ID: u16 = 0x00AD;

/// First byte of a device-info reply
pub const INFO_REPLY_MARKER: u8 = 0x51;

/// Register access opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    WriteInt8 = 0x01,
    WriteFloat32 = 0x0D,
    Read = 0x11,
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(raw: u8) -> Result<Self> {
        match raw {
            0x01 => Ok(Opcode::WriteInt8),
            0x0D => Ok(Opcode::WriteFloat32),
            0x11 => Ok(Opcode::Read),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

/// Register addresses used by the runtime
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Mode = 0x00,        // int8: see MotorMode
    TorqueLimit = 0x22, // float32, N·m
    Kp = 0x23,          // float32
    Kd = 0x24,          // float32
}

/// Values of the mode register
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotorMode {
    Stopped = 0x00,
    Active = 0x0A,
}

/// Value written to a register; the variant selects the write opcode
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegisterValue {
    Int8(u8),
    Float32(f32),
}

impl RegisterValue {
    pub fn opcode(&self) -> Opcode {
        match self {
            RegisterValue::Int8(_) => Opcode::WriteInt8,
            RegisterValue::Float32(_) => Opcode::WriteFloat32,
        }
    }
}

/// Motor identifier on the bus (1-127)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(u8);

impl DeviceId {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 127;

    pub fn new(id: u8) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&id) {
            Ok(Self(id))
        } else {
            Err(FrameError::InvalidDeviceId(id))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stream frame family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    /// [position, velocity limit, torque limit]
    Position,
    /// [position sentinel, velocity, acceleration]
    Velocity,
}

impl StreamKind {
    pub fn identifier(self) -> u16 {
        match self {
            StreamKind::Position => POSITION_STREAM_ID,
            StreamKind::Velocity => VELOCITY_STREAM_ID,
        }
    }
}

/// How a frame is addressed on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// Sent to one device, no reply expected
    Command,
    /// Sent to one device, reply requested (discovery)
    ReplyRequested,
    /// Fixed broadcast identifier, device id ignored
    Stream(StreamKind),
}

/// Error types for frame building and reply parsing
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("Device id {0} outside 1-127")]
    InvalidDeviceId(u8),

    #[error("Unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("Opcode {opcode:?} does not match the supplied value")]
    ValueMismatch { opcode: Opcode },

    #[error("Malformed reply 0x{id:04X}: {reason}")]
    MalformedReply { id: u16, reason: String },
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// Arbitration identifier for a frame
pub fn identifier_for(addressing: Addressing, device: DeviceId) -> u16 {
    match addressing {
        Addressing::Command => device.get() as u16,
        Addressing::ReplyRequested => REPLY_FLAG | device.get() as u16,
        Addressing::Stream(kind) => kind.identifier(),
    }
}

/// A single bus frame: 16-bit identifier plus 8-byte payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub id: u16,
    pub data: [u8; FRAME_LEN],
}

impl Frame {
    pub fn new(id: u16, data: [u8; FRAME_LEN]) -> Self {
        Self { id, data }
    }

    /// Write a register on one device (no reply)
    pub fn register_write(device: DeviceId, register: u8, value: RegisterValue) -> Self {
        let mut data = [SENTINEL; FRAME_LEN];
        data[0] = value.opcode() as u8;
        data[1] = register;
        match value {
            RegisterValue::Int8(v) => data[2] = v,
            RegisterValue::Float32(v) => data[2..6].copy_from_slice(&v.to_le_bytes()),
        }

        Self::new(identifier_for(Addressing::Command, device), data)
    }

    /// Read a register from one device (reply requested)
    pub fn register_read(device: DeviceId, register: u8) -> Self {
        let mut data = [SENTINEL; FRAME_LEN];
        data[0] = Opcode::Read as u8;
        data[1] = register;

        Self::new(identifier_for(Addressing::ReplyRequested, device), data)
    }

    /// Build a register frame from a raw opcode, validating it first.
    ///
    /// Writes need a value whose width matches the opcode; reads take none.
    pub fn register(
        opcode: u8,
        device: DeviceId,
        register: u8,
        value: Option<RegisterValue>,
    ) -> Result<Self> {
        let opcode = Opcode::try_from(opcode)?;
        match (opcode, value) {
            (Opcode::Read, None) => Ok(Self::register_read(device, register)),
            (Opcode::WriteInt8, Some(v @ RegisterValue::Int8(_)))
            | (Opcode::WriteFloat32, Some(v @ RegisterValue::Float32(_))) => {
                Ok(Self::register_write(device, register, v))
            }
            (opcode, _) => Err(FrameError::ValueMismatch { opcode }),
        }
    }

    /// Pack three raw values into a stream frame
    pub fn stream(kind: StreamKind, a: i16, b: i16, c: i16) -> Self {
        let mut data = [SENTINEL; FRAME_LEN];
        data[0..2].copy_from_slice(&a.to_le_bytes());
        data[2..4].copy_from_slice(&b.to_le_bytes());
        data[4..6].copy_from_slice(&c.to_le_bytes());

        Self::new(kind.identifier(), data)
    }

    /// Read back one little-endian int16 field of a stream frame
    pub fn stream_field(&self, index: usize) -> Option<i16> {
        let start = index.checked_mul(2)?;
        let bytes = self.data.get(start..start.checked_add(2)?)?;
        Some(i16::from_le_bytes([bytes[0], bytes[1]]))
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X} [", self.id)?;
        for (i, b) in self.data.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        write!(f, "]")
    }
}

/// Identity fields decoded from a reply identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplyIdentity {
    /// High byte, 7 bits: device that answered (0 if absent)
    pub source: u8,
    /// Low byte
    pub direct: u8,
}

impl ReplyIdentity {
    pub fn from_identifier(id: u32) -> Self {
        Self {
            source: ((id >> 8) & 0x7F) as u8,
            direct: (id & 0xFF) as u8,
        }
    }

    /// Device this reply came from, if attributable.
    ///
    /// A valid source id (1-127) wins; otherwise the low byte must equal the
    /// probed id exactly.
    pub fn attributed_device(&self, probed: DeviceId) -> Option<u8> {
        if (DeviceId::MIN..=DeviceId::MAX).contains(&self.source) {
            Some(self.source)
        } else if self.direct == probed.get() {
            Some(self.direct)
        } else {
            None
        }
    }
}

/// Model and hardware version carried by a device-info reply
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    pub name: Option<String>,
    pub hardware_version: Option<String>,
}

impl DeviceDescriptor {
    /// Decode the ASCII fields of an info reply payload
    pub fn parse(id: u16, data: &[u8]) -> Result<Self> {
        if data.first() != Some(&INFO_REPLY_MARKER) {
            return Err(FrameError::MalformedReply {
                id,
                reason: format!("Expected marker 0x{:02X}", INFO_REPLY_MARKER),
            });
        }

        let name = data.get(1..4).and_then(ascii_field);
        let hardware_version = data.get(4..8).and_then(ascii_field);

        Ok(Self {
            name,
            hardware_version,
        })
    }
}

fn ascii_field(bytes: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    let trimmed = text.trim_end_matches('\0');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: u8) -> DeviceId {
        DeviceId::new(id).unwrap()
    }

    #[test]
    fn test_write_int8_mode_active() {
        let frame = Frame::register_write(
            device(1),
            Register::Mode as u8,
            RegisterValue::Int8(MotorMode::Active as u8),
        );
        assert_eq!(frame.id, 0x0001);
        assert_eq!(frame.data, [0x01, 0x00, 0x0A, 0x50, 0x50, 0x50, 0x50, 0x50]);
    }

    #[test]
    fn test_write_float32_kp() {
        let frame = Frame::register_write(device(3), Register::Kp as u8, RegisterValue::Float32(1.0));
        assert_eq!(frame.id, 0x0003);
        // 1.0f32 = 0x3F800000
        assert_eq!(frame.data, [0x0D, 0x23, 0x00, 0x00, 0x80, 0x3F, 0x50, 0x50]);
    }

    #[test]
    fn test_read_requests_reply() {
        let frame = Frame::register_read(device(5), Register::Mode as u8);
        assert_eq!(frame.id, 0x8005);
        assert_eq!(frame.data, [0x11, 0x00, 0x50, 0x50, 0x50, 0x50, 0x50, 0x50]);
    }

    #[test]
    fn test_position_stream_layout() {
        let frame = Frame::stream(StreamKind::Position, 2500, 8000, 600);
        assert_eq!(frame.id, POSITION_STREAM_ID);
        assert_eq!(frame.data, [0xC4, 0x09, 0x40, 0x1F, 0x58, 0x02, 0x50, 0x50]);
        assert_eq!(frame.stream_field(2), Some(600));
        assert_eq!(frame.stream_field(4), None);
    }

    #[test]
    fn test_velocity_stream_sentinel_position() {
        let frame = Frame::stream(StreamKind::Velocity, i16::MIN, -4000, 30000);
        assert_eq!(frame.id, VELOCITY_STREAM_ID);
        assert_eq!(&frame.data[0..2], &[0x00, 0x80]);
        assert_eq!(&frame.data[4..6], &[0x30, 0x75]);
        assert_eq!(frame.stream_field(1), Some(-4000));
    }

    #[test]
    fn test_identifier_rules() {
        let d = device(0x2A);
        assert_eq!(identifier_for(Addressing::Command, d), 0x002A);
        assert_eq!(identifier_for(Addressing::ReplyRequested, d), 0x802A);
        // stream identifiers ignore the device
        assert_eq!(
            identifier_for(Addressing::Stream(StreamKind::Velocity), d),
            identifier_for(Addressing::Stream(StreamKind::Velocity), device(1))
        );
    }

    #[test]
    fn test_raw_opcode_validation() {
        assert_eq!(
            Frame::register(0x42, device(1), 0x00, None),
            Err(FrameError::UnknownOpcode(0x42))
        );
        assert_eq!(
            Frame::register(0x01, device(1), 0x00, Some(RegisterValue::Float32(1.0))),
            Err(FrameError::ValueMismatch {
                opcode: Opcode::WriteInt8
            })
        );
        assert_eq!(
            Frame::register(0x11, device(1), 0x00, Some(RegisterValue::Int8(0))),
            Err(FrameError::ValueMismatch { opcode: Opcode::Read })
        );
        let frame = Frame::register(0x11, device(9), 0x00, None).unwrap();
        assert_eq!(frame, Frame::register_read(device(9), 0x00));
    }

    #[test]
    fn test_device_id_range() {
        assert!(DeviceId::new(0).is_err());
        assert!(DeviceId::new(128).is_err());
        assert_eq!(DeviceId::new(127).map(DeviceId::get), Ok(127));
    }

    #[test]
    fn test_every_frame_is_eight_bytes() {
        let frames = [
            Frame::register_write(device(1), 0x22, RegisterValue::Float32(3.0)),
            Frame::register_write(device(1), 0x00, RegisterValue::Int8(0)),
            Frame::register_read(device(1), 0x00),
            Frame::stream(StreamKind::Position, 0, 0, 0),
        ];
        for frame in frames {
            assert_eq!(frame.data.len(), FRAME_LEN);
        }
    }

    #[test]
    fn test_reply_attribution() {
        // Source id in the high byte
        let reply = ReplyIdentity::from_identifier(0x0500);
        assert_eq!(reply.attributed_device(device(5)), Some(5));

        // No source, low byte echoes the probed id
        let reply = ReplyIdentity::from_identifier(0x0007);
        assert_eq!(reply.attributed_device(device(7)), Some(7));
        assert_eq!(reply.attributed_device(device(8)), None);
    }

    #[test]
    fn test_descriptor_parse() {
        let data = [0x51, b'H', b'T', b'M', b'v', b'1', b'.', 0];
        let info = DeviceDescriptor::parse(0x0100, &data).unwrap();
        assert_eq!(info.name.as_deref(), Some("HTM"));
        assert_eq!(info.hardware_version.as_deref(), Some("v1."));

        assert!(DeviceDescriptor::parse(0x0100, &[0x00; 8]).is_err());
    }

    #[test]
    fn test_frame_display() {
        let frame = Frame::stream(StreamKind::Position, 2500, 8000, 600);
        assert_eq!(frame.to_string(), "0x0090 [C4 09 40 1F 58 02 50 50]");
    }
}
