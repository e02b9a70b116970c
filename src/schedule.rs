use std::future;

use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};

/// Returns the tick period for `rate_hz`, or `None` when the channel is disabled.
///
/// The period is `floor(1000 / rate_hz)` milliseconds, clamped to at least 1 ms.
#[must_use]
pub fn period_for_rate(rate_hz: u32) -> Option<Duration> {
    if rate_hz == 0 {
        return None;
    }
    let millis = (1_000 / rate_hz).max(1);
    Some(Duration::from_millis(u64::from(millis)))
}

/// Shared end-of-run instant checked by every tick before doing any work.
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    end_at: Instant,
}

impl Deadline {
    #[must_use]
    pub fn after(duration: Duration) -> Self {
        Self::at(Instant::now() + duration)
    }

    #[must_use]
    pub const fn at(end_at: Instant) -> Self {
        Self { end_at }
    }

    #[must_use]
    pub fn is_open_at(&self, now: Instant) -> bool {
        now < self.end_at
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.is_open_at(Instant::now())
    }

    /// Resolves once the deadline has passed.
    pub async fn elapsed(&self) {
        time::sleep_until(self.end_at).await;
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Tick {
    /// The tick landed before the deadline; do the work.
    Fire,
    /// The tick was already queued when the deadline passed; do nothing.
    Expired,
}

/// Fixed-rate tick source bounded by a [`Deadline`].
///
/// A metronome built for a zero rate never ticks.
#[derive(Debug)]
pub struct Metronome {
    interval: Option<Interval>,
    deadline: Deadline,
}

impl Metronome {
    #[must_use]
    pub fn new(rate_hz: u32, deadline: Deadline) -> Self {
        Self::with_period(period_for_rate(rate_hz), deadline)
    }

    /// Builds a metronome from an explicit period. The first tick fires one period
    /// after creation and missed ticks are delayed rather than burst.
    #[must_use]
    pub fn with_period(period: Option<Duration>, deadline: Deadline) -> Self {
        let interval = period.map(|period| {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        Self { interval, deadline }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    #[must_use]
    pub fn period(&self) -> Option<Duration> {
        self.interval.as_ref().map(Interval::period)
    }

    /// Stops ticking for the rest of the run.
    pub fn stop(&mut self) {
        self.interval = None;
    }

    /// Waits for the next tick. Pends forever when disabled or stopped.
    pub async fn tick(&mut self) -> Tick {
        let Some(interval) = self.interval.as_mut() else {
            return future::pending().await;
        };
        let fired_at = interval.tick().await;
        if self.deadline.is_open_at(fired_at) && self.deadline.is_open() {
            Tick::Fire
        } else {
            Tick::Expired
        }
    }
}
