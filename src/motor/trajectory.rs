// Trajectory generators
//
// Pure functions of elapsed time. A Follower samples a trajectory at the
// caller's update period and hands back target values; it never touches the
// bus. Transmission stays with the stream transmitter.

use std::f64::consts::PI;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval};
use tracing::debug;

/// `amplitude * sin(2π * frequency * t)`
pub fn sine(amplitude: f64, frequency: f64, t: f64) -> f64 {
    amplitude * (2.0 * PI * frequency * t).sin()
}

/// Linear interpolation from `start` to `end`, clamped to the ramp duration
pub fn ramp(start: f64, end: f64, duration: f64, t: f64) -> f64 {
    if duration <= 0.0 {
        return end;
    }
    start + (end - start) * (t / duration).clamp(0.0, 1.0)
}

/// Holds each value for a fixed time before advancing
#[derive(Debug, Clone, PartialEq)]
pub struct StepSequence {
    values: Vec<f64>,
    hold: Duration,
}

impl StepSequence {
    pub fn new(values: Vec<f64>, hold: Duration) -> Self {
        Self { values, hold }
    }

    /// Value active at `elapsed`, or `None` once every step has been held
    pub fn value_at(&self, elapsed: Duration) -> Option<f64> {
        if self.hold.is_zero() {
            return None;
        }
        let index = (elapsed.as_nanos() / self.hold.as_nanos()) as usize;
        self.values.get(index).copied()
    }

    /// Total time, saturating at `Duration::MAX`
    pub fn duration(&self) -> Duration {
        u32::try_from(self.values.len())
            .ok()
            .and_then(|steps| self.hold.checked_mul(steps))
            .unwrap_or(Duration::MAX)
    }
}

/// Time-parameterised target for a stream
#[derive(Debug, Clone, PartialEq)]
pub enum Trajectory {
    Sine {
        amplitude: f64,
        frequency: f64, // Hz
        duration: Duration,
    },
    Ramp {
        start: f64,
        end: f64,
        duration: Duration,
    },
    Step(StepSequence),
}

impl Trajectory {
    /// Target at `elapsed`, or `None` once the trajectory is over
    pub fn value_at(&self, elapsed: Duration) -> Option<f64> {
        match self {
            Trajectory::Sine {
                amplitude,
                frequency,
                duration,
            } => (elapsed < *duration)
                .then(|| sine(*amplitude, *frequency, elapsed.as_secs_f64())),
            Trajectory::Ramp {
                start,
                end,
                duration,
            } => (elapsed < *duration).then(|| {
                ramp(
                    *start,
                    *end,
                    duration.as_secs_f64(),
                    elapsed.as_secs_f64(),
                )
            }),
            Trajectory::Step(steps) => steps.value_at(elapsed),
        }
    }

    /// Value emitted once after the trajectory ends
    pub fn final_value(&self) -> Option<f64> {
        match self {
            Trajectory::Ramp { end, .. } => Some(*end),
            Trajectory::Sine { .. } | Trajectory::Step(_) => None,
        }
    }

    pub fn duration(&self) -> Duration {
        match self {
            Trajectory::Sine { duration, .. } | Trajectory::Ramp { duration, .. } => *duration,
            Trajectory::Step(steps) => steps.duration(),
        }
    }
}

/// How a followed trajectory ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowOutcome {
    Completed,
    Interrupted,
}

/// Samples a trajectory at a fixed update period.
///
/// Only values that differ from the previous one are returned, so a held
/// step does not produce repeated setpoint writes.
pub struct Follower {
    trajectory: Trajectory,
    ticker: Interval,
    started: Option<Instant>,
    shutdown: watch::Receiver<bool>,
    watching: bool,
    last: Option<f64>,
    outcome: Option<FollowOutcome>,
}

impl Follower {
    pub fn new(
        trajectory: Trajectory,
        update_period: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let mut ticker = interval(update_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            trajectory,
            ticker,
            started: None,
            shutdown,
            watching: true,
            last: None,
            outcome: None,
        }
    }

    /// Wait for the next update and return the new target, or `None` when
    /// the trajectory is over or shutdown was requested
    pub async fn next(&mut self) -> Option<f64> {
        if self.outcome.is_some() {
            return None;
        }

        loop {
            if *self.shutdown.borrow() {
                return self.finish(FollowOutcome::Interrupted);
            }

            tokio::select! {
                biased;
                changed = self.shutdown.changed(), if self.watching => {
                    // A dropped sender can never request shutdown
                    if changed.is_err() {
                        self.watching = false;
                    }
                    continue;
                }
                _ = self.ticker.tick() => {}
            }

            let started = *self.started.get_or_insert_with(Instant::now);
            let value = match self.trajectory.value_at(started.elapsed()) {
                Some(value) => value,
                None => {
                    let last = self.trajectory.final_value().filter(|v| Some(*v) != self.last);
                    self.outcome = Some(FollowOutcome::Completed);
                    debug!("Trajectory completed after {:?}", started.elapsed());
                    return last;
                }
            };

            if Some(value) != self.last {
                self.last = Some(value);
                return Some(value);
            }
        }
    }

    fn finish(&mut self, outcome: FollowOutcome) -> Option<f64> {
        debug!("Trajectory finished: {:?}", outcome);
        self.outcome = Some(outcome);
        None
    }

    /// Set once `next()` has returned `None`
    pub fn outcome(&self) -> Option<FollowOutcome> {
        self.outcome
    }
}
