// Bus discovery
//
// Probes device ids one at a time with a reply-requested mode read and
// records who answers. Nothing persists between probes; a device that stays
// quiet for the listen window is reported offline.

use std::ops::RangeInclusive;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use super::bus::{CanBus, ReceivedFrame, Result};
use super::protocol::{
    DeviceDescriptor, DeviceId, Frame, INFO_REPLY_MARKER, Register, ReplyIdentity,
};

pub const DEFAULT_SCAN_RANGE: RangeInclusive<u8> = 1..=14;

/// Per-probe timing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeTiming {
    /// Pause after sending the probe
    pub settle: Duration,
    /// How long to listen for a reply
    pub window: Duration,
    /// Pause between consecutive probes
    pub gap: Duration,
}

impl Default for ProbeTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(10),
            window: Duration::from_millis(50),
            gap: Duration::from_millis(10),
        }
    }
}

/// Longest single receive call while listening
const POLL_SLICE: Duration = Duration::from_millis(10);

/// Result of probing one device id
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MotorInfo {
    pub device_id: u8,
    pub online: bool,
    pub name: Option<String>,
    pub hardware_version: Option<String>,
    /// Raw identifier of the reply
    pub reply_id: Option<u32>,
    #[serde(serialize_with = "serialize_millis")]
    pub response_time: Option<Duration>,
}

impl MotorInfo {
    pub fn offline(device: DeviceId) -> Self {
        Self {
            device_id: device.get(),
            online: false,
            name: None,
            hardware_version: None,
            reply_id: None,
            response_time: None,
        }
    }
}

fn serialize_millis<S: serde::Serializer>(
    value: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match value {
        Some(d) => serializer.serialize_some(&(d.as_secs_f64() * 1000.0)),
        None => serializer.serialize_none(),
    }
}

/// Probe one device and wait for its reply
pub fn ping(bus: &dyn CanBus, device: DeviceId, timing: &ProbeTiming) -> Result<MotorInfo> {
    let probe = Frame::register_read(device, Register::Mode as u8);
    let sent_at = Instant::now();
    bus.send(&probe)?;
    trace!("Probe {}", probe);
    thread::sleep(timing.settle);

    let deadline = sent_at + timing.settle + timing.window;
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let Some(reply) = bus.receive((deadline - now).min(POLL_SLICE))? else {
            continue;
        };

        if let Some(info) = attribute(&reply, device, sent_at.elapsed()) {
            return Ok(info);
        }
    }

    debug!("Motor {}: no response", device);
    Ok(MotorInfo::offline(device))
}

/// Turn a reply into a result for `device`, or `None` if it is not ours
fn attribute(reply: &ReceivedFrame, device: DeviceId, elapsed: Duration) -> Option<MotorInfo> {
    let identity = ReplyIdentity::from_identifier(reply.id);
    let Some(source) = identity.attributed_device(device) else {
        trace!("Ignoring reply 0x{:X} while probing {}", reply.id, device);
        return None;
    };
    if source != device.get() {
        debug!("Probe for {} answered by device {}", device, source);
    }

    let mut info = MotorInfo {
        device_id: device.get(),
        online: true,
        name: None,
        hardware_version: None,
        reply_id: Some(reply.id),
        response_time: Some(elapsed),
    };

    if reply.data.first() == Some(&INFO_REPLY_MARKER) {
        match DeviceDescriptor::parse((reply.id & 0xFFFF) as u16, &reply.data) {
            Ok(descriptor) => {
                info.name = descriptor.name;
                info.hardware_version = descriptor.hardware_version;
            }
            Err(e) => debug!("Motor {}: {}", device, e),
        }
    }
    Some(info)
}

/// Probe every id in `range`; invalid ids are skipped and failed probes
/// reported offline
pub fn scan(bus: &dyn CanBus, range: RangeInclusive<u8>, timing: &ProbeTiming) -> Vec<MotorInfo> {
    info!("Scanning device ids {}-{}", range.start(), range.end());

    let mut results = Vec::new();
    for id in range {
        let Ok(device) = DeviceId::new(id) else {
            debug!("Skipping invalid device id {}", id);
            continue;
        };

        let info = match ping(bus, device, timing) {
            Ok(info) => info,
            Err(e) => {
                warn!("Probe for motor {} failed: {}", device, e);
                MotorInfo::offline(device)
            }
        };
        results.push(info);
        thread::sleep(timing.gap);
    }

    let online = results.iter().filter(|m| m.online).count();
    info!("Scan complete: {} of {} ids responded", online, results.len());
    results
}

/// Link quality grade from repeated pings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkGrade {
    Excellent,
    Fair,
    Poor,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LinkQuality {
    pub attempts: u32,
    pub successes: u32,
}

impl LinkQuality {
    pub fn percent(&self) -> f64 {
        if self.attempts == 0 {
            return 0.0;
        }
        self.successes as f64 * 100.0 / self.attempts as f64
    }

    pub fn grade(&self) -> LinkGrade {
        match self.percent() {
            p if p >= 90.0 => LinkGrade::Excellent,
            p if p >= 70.0 => LinkGrade::Fair,
            _ => LinkGrade::Poor,
        }
    }
}

/// Ping one device `attempts` times and count the answers
pub fn link_quality(
    bus: &dyn CanBus,
    device: DeviceId,
    attempts: u32,
    timing: &ProbeTiming,
) -> LinkQuality {
    let mut successes = 0;
    for _ in 0..attempts {
        match ping(bus, device, timing) {
            Ok(info) if info.online => successes += 1,
            Ok(_) => {}
            Err(e) => warn!("Probe for motor {} failed: {}", device, e),
        }
        thread::sleep(timing.gap);
    }

    let quality = LinkQuality {
        attempts,
        successes,
    };
    info!(
        "Motor {}: {}/{} replies ({:.1}%)",
        device,
        successes,
        attempts,
        quality.percent()
    );
    quality
}

/// Scan summary, written out as JSON by the scan tool
#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub interface: String,
    pub bitrate: u32,
    pub range: (u8, u8),
    pub found: Vec<u8>,
    pub motors: Vec<MotorInfo>,
}

impl ScanReport {
    pub fn new(
        interface: &str,
        bitrate: u32,
        range: RangeInclusive<u8>,
        motors: Vec<MotorInfo>,
    ) -> Self {
        let found = motors.iter().filter(|m| m.online).map(|m| m.device_id).collect();
        Self {
            interface: interface.to_string(),
            bitrate,
            range: (*range.start(), *range.end()),
            found,
            motors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::bus::MemoryBus;
    use crate::motor::protocol::REPLY_FLAG;

    fn fast() -> ProbeTiming {
        ProbeTiming {
            settle: Duration::from_millis(1),
            window: Duration::from_millis(5),
            gap: Duration::ZERO,
        }
    }

    /// Devices 2 and 5 answer; 5 also reports name and version
    fn simulated_bus() -> MemoryBus {
        MemoryBus::with_responder(Box::new(|frame: &Frame| {
            if frame.id & REPLY_FLAG == 0 {
                return None;
            }
            match frame.id & 0xFF {
                2 => Some(ReceivedFrame {
                    id: 0x0200,
                    data: vec![0x11, 0x0A, 0x50, 0x50, 0x50, 0x50, 0x50, 0x50],
                }),
                5 => Some(ReceivedFrame {
                    id: 0x0500,
                    data: b"\x51HTDv1.2".to_vec(),
                }),
                _ => None,
            }
        }))
    }

    #[test]
    fn test_ping_sends_mode_read() {
        let bus = MemoryBus::new();
        let info = ping(&bus, DeviceId::new(3).unwrap(), &fast()).unwrap();
        assert!(!info.online);

        let sent = bus.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, 0x8003);
        assert_eq!(sent[0].data, [0x11, 0x00, 0x50, 0x50, 0x50, 0x50, 0x50, 0x50]);
    }

    #[test]
    fn test_scan_finds_responding_devices() {
        let bus = simulated_bus();
        let results = scan(&bus, 1..=6, &fast());
        assert_eq!(results.len(), 6);

        let online: Vec<u8> = results.iter().filter(|m| m.online).map(|m| m.device_id).collect();
        assert_eq!(online, vec![2, 5]);

        let five = &results[4];
        assert_eq!(five.name.as_deref(), Some("HTD"));
        assert_eq!(five.hardware_version.as_deref(), Some("v1.2"));
        assert_eq!(five.reply_id, Some(0x0500));
        assert!(five.response_time.is_some());

        let two = &results[1];
        assert_eq!(two.name, None);
    }

    #[test]
    fn test_reply_matched_by_low_byte() {
        let bus = MemoryBus::new();
        bus.push_reply(ReceivedFrame {
            id: 0x0004,
            data: vec![0x11, 0x00],
        });
        let info = ping(&bus, DeviceId::new(4).unwrap(), &fast()).unwrap();
        assert!(info.online);
    }

    #[test]
    fn test_unattributable_reply_ignored() {
        let bus = MemoryBus::new();
        // No source in the high byte, low byte is another device
        bus.push_reply(ReceivedFrame {
            id: 0x0009,
            data: vec![0x11, 0x00],
        });
        let info = ping(&bus, DeviceId::new(4).unwrap(), &fast()).unwrap();
        assert!(!info.online);
    }

    #[test]
    fn test_scan_skips_invalid_ids() {
        let bus = MemoryBus::new();
        let results = scan(&bus, 0..=2, &fast());
        assert_eq!(results.iter().map(|m| m.device_id).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_send_failure_reported_offline() {
        let bus = simulated_bus();
        bus.set_fail_sends(true);
        assert!(ping(&bus, DeviceId::new(2).unwrap(), &fast()).is_err());
        let results = scan(&bus, 2..=2, &fast());
        assert!(!results[0].online);
    }

    #[test]
    fn test_link_quality_grades() {
        let bus = simulated_bus();
        let quality = link_quality(&bus, DeviceId::new(2).unwrap(), 4, &fast());
        assert_eq!(quality.successes, 4);
        assert_eq!(quality.grade(), LinkGrade::Excellent);

        let silent = link_quality(&bus, DeviceId::new(3).unwrap(), 2, &fast());
        assert_eq!(silent.successes, 0);
        assert_eq!(silent.grade(), LinkGrade::Poor);

        let fair = LinkQuality {
            attempts: 10,
            successes: 7,
        };
        assert_eq!(fair.grade(), LinkGrade::Fair);
    }

    #[test]
    fn test_report_json() {
        let bus = simulated_bus();
        let motors = scan(&bus, 1..=3, &fast());
        let report = ScanReport::new("can0", 1_000_000, 1..=3, motors);
        assert_eq!(report.found, vec![2]);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["range"], serde_json::json!([1, 3]));
        assert_eq!(json["motors"][0]["online"], false);
        assert!(json["motors"][1]["response_time"].is_number());
    }
}
