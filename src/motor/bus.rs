// CAN bus transport
//
// The runtime only needs three things from the bus: fire-and-forget send,
// receive with a timeout (discovery only) and close. SocketCAN provides the
// hardware path on Linux; MemoryBus is the dry-run and test double.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{info, trace};

use super::protocol::Frame;

/// Error types for bus access
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Failed to open CAN interface {interface}: {source}")]
    Open {
        interface: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to transmit frame 0x{id:04X}: {source}")]
    Transmit {
        id: u16,
        #[source]
        source: io::Error,
    },

    #[error("Receive error: {0}")]
    Receive(#[source] io::Error),

    #[error("Frame 0x{0:04X} cannot be represented on this bus")]
    InvalidFrame(u16),

    #[error("Bus is closed")]
    Closed,

    #[error("{0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Frame read back from the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    /// Raw arbitration id (29 bits max)
    pub id: u32,
    pub data: Vec<u8>,
}

/// Transport used by every component that touches the bus.
///
/// `send` never waits for a reply. Implementations must be safe to share
/// between the streaming task and the control path.
pub trait CanBus: Send + Sync {
    fn send(&self, frame: &Frame) -> Result<()>;

    /// Wait up to `timeout` for one frame; `Ok(None)` when nothing arrived
    fn receive(&self, timeout: Duration) -> Result<Option<ReceivedFrame>>;

    /// Release the bus; later sends fail with [`BusError::Closed`]
    fn close(&self);
}

/// Open the SocketCAN interface.
///
/// The bitrate is configured by the system (`ip link set can0 type can
/// bitrate 1000000`); it is only recorded here.
#[cfg(target_os = "linux")]
pub fn open_socketcan(interface: &str, bitrate: u32) -> Result<Arc<dyn CanBus>> {
    Ok(Arc::new(socketcan_bus::SocketCanBus::open(interface, bitrate)?))
}

#[cfg(not(target_os = "linux"))]
pub fn open_socketcan(interface: &str, _bitrate: u32) -> Result<Arc<dyn CanBus>> {
    Err(BusError::Unsupported(format!(
        "SocketCAN interface {} requires Linux",
        interface
    )))
}

#[cfg(target_os = "linux")]
mod socketcan_bus {
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame as _, Socket};
    use tracing::{debug, info};

    use super::{BusError, CanBus, ReceivedFrame, Result};
    use crate::motor::protocol::Frame;

    /// Upper bound on stale frames discarded when the socket is opened
    const MAX_DRAIN: usize = 1024;

    /// SocketCAN-backed bus; frames are sent with extended identifiers
    pub struct SocketCanBus {
        socket: CanSocket,
        interface: String,
        closed: AtomicBool,
    }

    impl SocketCanBus {
        pub fn open(interface: &str, bitrate: u32) -> Result<Self> {
            let socket = CanSocket::open(interface).map_err(|source| BusError::Open {
                interface: interface.to_string(),
                source,
            })?;

            let bus = Self {
                socket,
                interface: interface.to_string(),
                closed: AtomicBool::new(false),
            };
            let drained = bus.drain();
            info!(
                "Opened CAN interface {} ({} bit/s, {} stale frames dropped)",
                interface, bitrate, drained
            );
            Ok(bus)
        }

        /// Discard anything already queued on the socket
        fn drain(&self) -> usize {
            let mut drained = 0;
            while drained < MAX_DRAIN {
                match self.receive(Duration::from_millis(1)) {
                    Ok(Some(_)) => drained += 1,
                    _ => break,
                }
            }
            drained
        }
    }

    impl CanBus for SocketCanBus {
        fn send(&self, frame: &Frame) -> Result<()> {
            if self.closed.load(Ordering::Acquire) {
                return Err(BusError::Closed);
            }

            let id = ExtendedId::new(frame.id as u32).ok_or(BusError::InvalidFrame(frame.id))?;
            let can_frame = CanFrame::new(id, &frame.data).ok_or(BusError::InvalidFrame(frame.id))?;
            self.socket
                .write_frame(&can_frame)
                .map_err(|source| BusError::Transmit {
                    id: frame.id,
                    source,
                })
        }

        fn receive(&self, timeout: Duration) -> Result<Option<ReceivedFrame>> {
            if self.closed.load(Ordering::Acquire) {
                return Err(BusError::Closed);
            }

            // A zero read timeout means "block forever" to the kernel
            let timeout = timeout.max(Duration::from_millis(1));
            self.socket
                .set_read_timeout(timeout)
                .map_err(BusError::Receive)?;

            match self.socket.read_frame() {
                Ok(frame) if frame.is_error_frame() => {
                    debug!("Ignoring error frame on {}", self.interface);
                    Ok(None)
                }
                Ok(frame) => Ok(Some(ReceivedFrame {
                    id: frame.raw_id() & 0x1FFF_FFFF,
                    data: frame.data().to_vec(),
                })),
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                    Ok(None)
                }
                Err(e) => Err(BusError::Receive(e)),
            }
        }

        fn close(&self) {
            if !self.closed.swap(true, Ordering::AcqRel) {
                info!("Closed CAN interface {}", self.interface);
            }
        }
    }
}

/// Produces the reply (if any) a simulated device gives to a sent frame
pub type Responder = Box<dyn Fn(&Frame) -> Option<ReceivedFrame> + Send + Sync>;

/// In-memory bus: records sent frames and serves queued replies.
///
/// Used for dry runs (no motor attached) and as the test double.
#[derive(Default)]
pub struct MemoryBus {
    sent: Mutex<Vec<Frame>>,
    replies: Mutex<VecDeque<ReceivedFrame>>,
    responder: Option<Responder>,
    fail_sends: AtomicBool,
    closed: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate devices answering sent frames
    pub fn with_responder(responder: Responder) -> Self {
        Self {
            responder: Some(responder),
            ..Self::default()
        }
    }

    /// Make every following send fail (or succeed again)
    pub fn set_fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::Release);
    }

    pub fn push_reply(&self, reply: ReceivedFrame) {
        self.replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(reply);
    }

    /// Copy of every frame sent so far
    pub fn sent(&self) -> Vec<Frame> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl CanBus for MemoryBus {
    fn send(&self, frame: &Frame) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }
        if self.fail_sends.load(Ordering::Acquire) {
            return Err(BusError::Transmit {
                id: frame.id,
                source: io::Error::other("injected send failure"),
            });
        }

        trace!("MemoryBus send {}", frame);
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*frame);

        if let Some(reply) = self.responder.as_ref().and_then(|respond| respond(frame)) {
            self.push_reply(reply);
        }
        Ok(())
    }

    fn receive(&self, timeout: Duration) -> Result<Option<ReceivedFrame>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(BusError::Closed);
        }

        let reply = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if reply.is_none() {
            // Behave like a quiet bus
            std::thread::sleep(timeout);
        }
        Ok(reply)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Closed in-memory bus ({} frames sent)", self.sent_count());
        }
    }
}
