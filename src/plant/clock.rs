//! clock.rs
//! Fixed-rate tick clock for the plant.
//!
//! - Absolute deadline schedule with `SpinSleeper`, so sleep error does not accumulate.
//! - `dt` is always the measured time since the previous tick (first tick: since the clock started).
//! - Overrun: the deadline had already passed when the clock was asked to wait. The tick fires
//!   immediately and the schedule restarts from that instant; missed ticks are not replayed.
//! - Every 5 s the effective tick rate is logged against the target.

use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use spin_sleep::{SpinSleeper, SpinStrategy};

const RATE_LOG_INTERVAL: Duration = Duration::from_secs(5);
const SUSTAINED_OVERRUNS: u64 = 10;

/// Timing of one tick as handed to the tick loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tick {
    pub index: u64,
    /// Measured time since the previous tick.
    pub dt: Duration,
    /// Nominal periods covered by `dt`, at least 1.
    pub elapsed_ticks: u64,
    pub overrun: bool,
}

pub struct TickClock {
    tick_rate_hz: u32,
    period: Duration,
    sleeper: SpinSleeper,
    start: Instant,
    last_tick: Instant,
    next_deadline: Instant,
    ticks: u64,
    overruns: u64,
    overrun_streak: u64,
    window_start: Instant,
    window_ticks: u64,
}

impl TickClock {
    /// Starts the clock; the first tick is due immediately.
    pub fn start(tick_rate_hz: u32) -> Self {
        let period = Duration::from_secs_f64(1.0 / f64::from(tick_rate_hz.max(1)));
        let now = Instant::now();
        Self {
            tick_rate_hz,
            period,
            sleeper: SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread),
            start: now,
            last_tick: now,
            next_deadline: now,
            ticks: 0,
            overruns: 0,
            overrun_streak: 0,
            window_start: now,
            window_ticks: 0,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    pub fn started_at(&self) -> Instant {
        self.start
    }

    /// Offset of the next scheduled tick from the clock start.
    pub fn next_tick_offset(&self) -> Duration {
        self.next_deadline.saturating_duration_since(self.start)
    }

    /// Blocks until the next tick is due and returns its timing.
    pub fn wait(&mut self) -> Tick {
        let now = Instant::now();
        let overrun = self.ticks > 0 && now >= self.next_deadline;
        if now < self.next_deadline {
            self.sleeper.sleep(self.next_deadline - now);
        }

        let tick_at = Instant::now();
        let dt = tick_at.duration_since(self.last_tick);
        self.last_tick = tick_at;

        let elapsed_ticks = if self.ticks == 0 {
            1
        } else {
            ((dt.as_secs_f64() / self.period.as_secs_f64()).floor() as u64).max(1)
        };

        // No catch-up: after an overrun the schedule restarts from this tick.
        self.next_deadline = if overrun {
            tick_at + self.period
        } else {
            self.next_deadline + self.period
        };

        if overrun {
            self.overruns += 1;
            self.overrun_streak += 1;
            if self.overrun_streak == SUSTAINED_OVERRUNS || self.overrun_streak % (SUSTAINED_OVERRUNS * 100) == 0 {
                warn!(
                    "[Plant] {} consecutive tick overruns (last dt={:?}, period={:?})",
                    self.overrun_streak, dt, self.period
                );
            } else {
                debug!("[Plant] tick {} overran, dt={:?}", self.ticks, dt);
            }
        } else {
            self.overrun_streak = 0;
        }

        let tick = Tick {
            index: self.ticks,
            dt,
            elapsed_ticks,
            overrun,
        };
        self.ticks += 1;
        self.window_ticks += 1;
        self.log_rate(tick_at);
        tick
    }

    fn log_rate(&mut self, now: Instant) {
        let window = now.duration_since(self.window_start);
        if window < RATE_LOG_INTERVAL {
            return;
        }
        let rate = self.window_ticks as f64 / window.as_secs_f64();
        let target = f64::from(self.tick_rate_hz);
        let ratio = rate / target;
        if ratio >= 0.95 {
            info!("[Plant] effective tick rate {:.1} Hz (target {} Hz)", rate, self.tick_rate_hz);
        } else if ratio >= 0.85 {
            warn!(
                "[Plant] effective tick rate {:.1} Hz is below target {} Hz ({} overruns so far)",
                rate, self.tick_rate_hz, self.overruns
            );
        } else {
            error!(
                "[Plant] effective tick rate {:.1} Hz is far below target {} Hz ({} overruns so far)",
                rate, self.tick_rate_hz, self.overruns
            );
        }
        self.window_start = now;
        self.window_ticks = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn first_tick_fires_immediately() {
        let mut clock = TickClock::start(100);
        let tick = clock.wait();
        assert_eq!(tick.index, 0);
        assert!(!tick.overrun);
        assert_eq!(tick.elapsed_ticks, 1);
        assert!(tick.dt < Duration::from_millis(5));
    }

    #[test]
    fn dt_tracks_wall_clock() {
        let mut clock = TickClock::start(200);
        let mut total = Duration::ZERO;
        for _ in 0..40 {
            total += clock.wait().dt;
        }
        let wall = clock.last_tick.duration_since(clock.started_at());
        assert_eq!(total, wall);
        // 39 periods of 5 ms after the immediate first tick.
        assert!(wall >= Duration::from_millis(190), "wall={:?}", wall);
    }

    #[test]
    fn overrun_fires_next_tick_immediately_without_catch_up() {
        let mut clock = TickClock::start(200);
        clock.wait();
        clock.wait();
        thread::sleep(Duration::from_millis(23));

        let late = clock.wait();
        assert!(late.overrun);
        assert!(late.dt >= Duration::from_millis(23));
        assert!(late.elapsed_ticks >= 4);

        let next = clock.wait();
        assert!(!next.overrun);
        assert!(next.dt >= Duration::from_millis(4), "dt={:?}", next.dt);
        assert_eq!(clock.overruns(), 1);
    }
}
