// Periodic stream transmitter with smart brake
//
// Each tick reads one snapshot of the shared setpoint, applies the brake
// override, encodes a stream frame and sends it without waiting for any
// reply. Ticks come from a tokio interval (monotonic, deadline based), so
// slow sends do not accumulate drift.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, trace, warn};

use super::bus::CanBus;
use super::fixed_point::{POSITION_SENTINEL, Quantity, degrees_to_revolutions, encode};
use super::protocol::{Frame, StreamKind};
use crate::config::Cadence;
use crate::messages::{Setpoint, SetpointCell};

/// Log every n-th consecutive send failure after the first
const FAILURE_LOG_EVERY: u64 = 100;

/// Forces maximum deceleration whenever a zero velocity is requested
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BrakePolicy {
    /// rev/s²
    pub max_acceleration: f64,
}

impl BrakePolicy {
    pub fn new(max_acceleration: f64) -> Self {
        Self { max_acceleration }
    }

    /// Acceleration to encode for a velocity target, and whether the brake
    /// override kicked in
    pub fn effective_acceleration(&self, velocity: f64, acceleration: f64) -> (f64, bool) {
        if velocity == 0.0 {
            (self.max_acceleration, true)
        } else {
            (acceleration, false)
        }
    }
}

/// Encode a setpoint snapshot into the frame sent on this tick.
///
/// The brake override only affects the returned frame, never the stored
/// setpoint. The flag reports whether it was applied.
pub fn encode_setpoint(setpoint: &Setpoint, brake: &BrakePolicy) -> (Frame, bool) {
    match *setpoint {
        Setpoint::Angle {
            degrees,
            max_velocity,
            max_torque,
        } => {
            let frame = Frame::stream(
                StreamKind::Position,
                encode(Quantity::Position, degrees_to_revolutions(degrees)),
                encode(Quantity::Velocity, max_velocity),
                encode(Quantity::Torque, max_torque),
            );
            (frame, false)
        }
        Setpoint::Velocity {
            velocity,
            acceleration,
        } => {
            let (acceleration, braking) = brake.effective_acceleration(velocity, acceleration);
            let frame = Frame::stream(
                StreamKind::Velocity,
                POSITION_SENTINEL,
                encode(Quantity::Velocity, velocity),
                encode(Quantity::Acceleration, acceleration),
            );
            (frame, braking)
        }
    }
}

/// Counters reported when a transmitter stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub ticks: u64,
    pub sent: u64,
    pub send_failures: u64,
    pub brake_overrides: u64,
}

#[derive(Default)]
struct Counters {
    ticks: AtomicU64,
    sent: AtomicU64,
    send_failures: AtomicU64,
    brake_overrides: AtomicU64,
}

/// Per-tick encode/brake/send logic shared by every cadence
pub struct FrameStreamer {
    bus: Arc<dyn CanBus>,
    setpoint: Arc<SetpointCell>,
    brake: BrakePolicy,
    period: Duration,
    counters: Counters,
}

impl FrameStreamer {
    pub fn new(
        bus: Arc<dyn CanBus>,
        setpoint: Arc<SetpointCell>,
        brake: BrakePolicy,
        period: Duration,
    ) -> Self {
        Self {
            bus,
            setpoint,
            brake,
            period,
            counters: Counters::default(),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Run one tick and return the frame that was (or failed to be) sent
    pub fn tick(&self) -> Frame {
        let snapshot = self.setpoint.snapshot();
        let (frame, braking) = encode_setpoint(&snapshot, &self.brake);

        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        if braking {
            self.counters.brake_overrides.fetch_add(1, Ordering::Relaxed);
        }

        match self.bus.send(&frame) {
            Ok(()) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                trace!("Stream {}", frame);
            }
            Err(e) => {
                let failures = self.counters.send_failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures == 1 || failures % FAILURE_LOG_EVERY == 0 {
                    warn!("Stream send failed ({} failures so far): {}", failures, e);
                }
            }
        }

        frame
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            ticks: self.counters.ticks.load(Ordering::Relaxed),
            sent: self.counters.sent.load(Ordering::Relaxed),
            send_failures: self.counters.send_failures.load(Ordering::Relaxed),
            brake_overrides: self.counters.brake_overrides.load(Ordering::Relaxed),
        }
    }

    /// Tick at the stream period until `stop` fires or `limit` ticks ran.
    ///
    /// The stop signal is checked before every tick, so no frame goes out
    /// once it has been observed.
    async fn run(&self, limit: Option<usize>, mut stop: oneshot::Receiver<()>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut count = 0usize;
        loop {
            if limit.is_some_and(|max| count >= max) {
                break;
            }

            tokio::select! {
                biased;
                _ = &mut stop => break,
                _ = ticker.tick() => {}
            }

            self.tick();
            count += 1;
        }
    }

    /// Issue `ticks` frames at the stream period, then return
    pub async fn burst(&self, ticks: usize) {
        // Never fired; the sender lives until the burst is over
        let (_keep, stop) = oneshot::channel();
        self.run(Some(ticks), stop).await;
    }
}

/// Background task streaming until stopped
pub struct StreamingTransmitter {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<StreamStats>>,
}

impl StreamingTransmitter {
    /// Spawn the streaming task; it ticks immediately, then every period
    pub fn start(streamer: FrameStreamer) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        info!(
            "Streaming started ({}ms period)",
            streamer.period().as_millis()
        );
        let handle = tokio::spawn(async move {
            streamer.run(None, stop_rx).await;
            streamer.stats()
        });

        Self {
            stop: Some(stop_tx),
            handle: Some(handle),
        }
    }

    /// Signal the task and wait until it has exited.
    ///
    /// Once this returns the task can no longer transmit.
    pub async fn stop(mut self) -> StreamStats {
        if let Some(stop) = self.stop.take() {
            // The task may already be gone; nothing to signal then
            let _ = stop.send(());
        }

        let Some(handle) = self.handle.take() else {
            return StreamStats::default();
        };
        match handle.await {
            Ok(stats) => {
                info!(
                    "Streaming stopped: {} ticks, {} sent, {} failed, {} brake overrides",
                    stats.ticks, stats.sent, stats.send_failures, stats.brake_overrides
                );
                stats
            }
            Err(e) => {
                warn!("Streaming task ended abnormally: {}", e);
                StreamStats::default()
            }
        }
    }
}

impl Drop for StreamingTransmitter {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            warn!("Streaming transmitter dropped without stop()");
            let _ = stop.send(());
        }
    }
}

/// Stream transmitter in one of the two cadence styles
pub enum Transmitter {
    /// Ticks continuously in a background task
    Continuous(StreamingTransmitter),
    /// Ticks `ticks` times after each setpoint change, on the caller's task
    Burst { streamer: FrameStreamer, ticks: usize },
}

impl Transmitter {
    pub fn start(streamer: FrameStreamer, cadence: Cadence, burst_ticks: usize) -> Self {
        match cadence {
            Cadence::Continuous => Transmitter::Continuous(StreamingTransmitter::start(streamer)),
            Cadence::Burst => {
                debug!("Burst cadence: {} ticks per setpoint change", burst_ticks);
                Transmitter::Burst {
                    streamer,
                    ticks: burst_ticks,
                }
            }
        }
    }

    pub fn cadence(&self) -> Cadence {
        match self {
            Transmitter::Continuous(_) => Cadence::Continuous,
            Transmitter::Burst { .. } => Cadence::Burst,
        }
    }

    /// Notify the transmitter that the setpoint was updated.
    ///
    /// Burst cadence transmits its frames here; the continuous task picks
    /// the change up on its next tick.
    pub async fn setpoint_changed(&self) {
        if let Transmitter::Burst { streamer, ticks } = self {
            streamer.burst(*ticks).await;
        }
    }

    /// Stop transmitting; returns once no further frame can be sent
    pub async fn stop(self) -> StreamStats {
        match self {
            Transmitter::Continuous(transmitter) => transmitter.stop().await,
            Transmitter::Burst { streamer, .. } => streamer.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::bus::MemoryBus;
    use crate::motor::protocol::{POSITION_STREAM_ID, VELOCITY_STREAM_ID};

    const PERIOD: Duration = Duration::from_millis(10);

    fn streamer(bus: &Arc<MemoryBus>, cell: &Arc<SetpointCell>) -> FrameStreamer {
        FrameStreamer::new(bus.clone(), cell.clone(), BrakePolicy::new(30.0), PERIOD)
    }

    fn velocity_cell(velocity: f64, acceleration: f64) -> Arc<SetpointCell> {
        Arc::new(SetpointCell::new(Setpoint::Velocity {
            velocity,
            acceleration,
        }))
    }

    #[test]
    fn test_angle_scenario_payload() {
        let (frame, braking) = encode_setpoint(
            &Setpoint::Angle {
                degrees: 90.0,
                max_velocity: 2.0,
                max_torque: 3.0,
            },
            &BrakePolicy::new(30.0),
        );
        assert!(!braking);
        assert_eq!(frame.id, POSITION_STREAM_ID);
        assert_eq!(frame.data, [0xC4, 0x09, 0x40, 0x1F, 0x58, 0x02, 0x50, 0x50]);
    }

    #[test]
    fn test_smart_brake_overrides_acceleration() {
        let bus = Arc::new(MemoryBus::new());
        let cell = velocity_cell(2.0, 5.0);
        let streamer = streamer(&bus, &cell);

        cell.set_acceleration(5.0);
        cell.set_velocity(0.0);
        let frame = streamer.tick();

        assert_eq!(frame.id, VELOCITY_STREAM_ID);
        assert_eq!(frame.stream_field(0), Some(i16::MIN));
        assert_eq!(frame.stream_field(1), Some(0));
        assert_eq!(frame.stream_field(2), Some(30000));
        assert_eq!(&frame.data[4..6], &[0x30, 0x75]);

        // Stored acceleration is untouched
        assert_eq!(
            cell.snapshot(),
            Setpoint::Velocity {
                velocity: 0.0,
                acceleration: 5.0
            }
        );
        assert_eq!(streamer.stats().brake_overrides, 1);
    }

    #[test]
    fn test_nonzero_velocity_uses_stored_acceleration() {
        let bus = Arc::new(MemoryBus::new());
        let cell = velocity_cell(-1.5, 12.0);
        let frame = streamer(&bus, &cell).tick();
        assert_eq!(frame.stream_field(1), Some(-6000));
        assert_eq!(frame.stream_field(2), Some(12000));
    }

    #[test]
    fn test_brake_for_any_stored_acceleration() {
        let brake = BrakePolicy::new(30.0);
        for stored in [0.0, 0.5, 5.0, 29.0, 32.0] {
            let (frame, braking) = encode_setpoint(
                &Setpoint::Velocity {
                    velocity: 0.0,
                    acceleration: stored,
                },
                &brake,
            );
            assert!(braking);
            assert_eq!(frame.stream_field(2), Some(30000));
        }
    }

    #[test]
    fn test_send_failure_counted_not_fatal() {
        let bus = Arc::new(MemoryBus::new());
        let cell = velocity_cell(1.0, 5.0);
        let streamer = streamer(&bus, &cell);

        bus.set_fail_sends(true);
        streamer.tick();
        streamer.tick();
        bus.set_fail_sends(false);
        streamer.tick();

        let stats = streamer.stats();
        assert_eq!(stats.ticks, 3);
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.send_failures, 2);
        assert_eq!(bus.sent_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_ticks_at_period() {
        let bus = Arc::new(MemoryBus::new());
        let cell = velocity_cell(1.0, 5.0);
        let transmitter = StreamingTransmitter::start(streamer(&bus, &cell));

        tokio::time::sleep(Duration::from_millis(95)).await;
        let count = bus.sent_count();
        // t = 0, 10, ... 90
        assert!((9..=11).contains(&count), "sent {}", count);

        transmitter.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_frames_after_stop() {
        let bus = Arc::new(MemoryBus::new());
        let cell = velocity_cell(1.0, 5.0);
        let transmitter = StreamingTransmitter::start(streamer(&bus, &cell));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let stats = transmitter.stop().await;
        let at_stop = bus.sent_count();
        assert_eq!(stats.sent as usize, at_stop);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(bus.sent_count(), at_stop);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_visible_next_tick() {
        let bus = Arc::new(MemoryBus::new());
        let cell = velocity_cell(1.0, 5.0);
        let transmitter = StreamingTransmitter::start(streamer(&bus, &cell));

        tokio::time::sleep(Duration::from_millis(25)).await;
        cell.set_velocity(0.0);
        tokio::time::sleep(Duration::from_millis(10)).await;
        transmitter.stop().await;

        let last = bus.sent().last().copied().unwrap();
        assert_eq!(last.stream_field(1), Some(0));
        assert_eq!(last.stream_field(2), Some(30000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_sends_exact_count() {
        let bus = Arc::new(MemoryBus::new());
        let cell = Arc::new(SetpointCell::new(Setpoint::Angle {
            degrees: 90.0,
            max_velocity: 2.0,
            max_torque: 3.0,
        }));
        let transmitter = Transmitter::start(streamer(&bus, &cell), Cadence::Burst, 5);
        assert_eq!(transmitter.cadence(), Cadence::Burst);

        let start = tokio::time::Instant::now();
        transmitter.setpoint_changed().await;
        assert_eq!(bus.sent_count(), 5);
        assert!(start.elapsed() >= Duration::from_millis(40));
        assert!(
            bus.sent()
                .iter()
                .all(|f| f.data == [0xC4, 0x09, 0x40, 0x1F, 0x58, 0x02, 0x50, 0x50])
        );

        // Nothing in between setpoint changes
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bus.sent_count(), 5);

        let stats = transmitter.stop().await;
        assert_eq!(stats.ticks, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_continuous_ignores_setpoint_changed() {
        let bus = Arc::new(MemoryBus::new());
        let cell = velocity_cell(1.0, 5.0);
        let transmitter = Transmitter::start(streamer(&bus, &cell), Cadence::Continuous, 5);
        transmitter.setpoint_changed().await;
        assert_eq!(transmitter.cadence(), Cadence::Continuous);
        transmitter.stop().await;
    }
}
