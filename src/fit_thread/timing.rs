//! Fitter run timing.
//!
//! [`RunTimer`] measures the wall-clock duration of consecutive fitter runs inside one
//! job and keeps an exponential moving average of them, so batch jobs can log a stable
//! per-dataset cost even when individual datasets converge at very different speeds.
//!
//! The update rule is `ema ← α·dt + (1–α)·ema` with `α ∈ (0, 1]`; the first lap
//! initializes the average.
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub(crate) struct RunTimer {
    last: Instant,
    ema_ns: f64,
    alpha: f64,
    laps: u64,
}

impl RunTimer {
    pub(crate) fn new(alpha: f64) -> Self {
        Self {
            last: Instant::now(),
            ema_ns: 0.0,
            alpha: alpha.clamp(f64::EPSILON, 1.0),
            laps: 0,
        }
    }

    /// Close the current lap and return its duration.
    pub(crate) fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let dt = now.duration_since(self.last);
        self.last = now;
        self.laps += 1;

        let dt_ns = dt.as_nanos() as f64;
        self.ema_ns = if self.laps == 1 {
            dt_ns
        } else {
            self.alpha * dt_ns + (1.0 - self.alpha) * self.ema_ns
        };
        dt
    }

    pub(crate) fn mean(&self) -> Duration {
        if self.laps == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.ema_ns as u64)
        }
    }

    pub(crate) fn laps(&self) -> u64 {
        self.laps
    }
}

/// Short human-readable duration: `253µs`, `42ms` or `3.14s`.
pub(crate) fn format_duration(d: Duration) -> String {
    let us = d.as_micros();
    if us < 1_000 {
        return format!("{us}µs");
    }
    let ms = d.as_millis();
    if ms < 1_000 {
        format!("{ms}ms")
    } else {
        format!("{:.2}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod timing_tests {
    use super::*;

    #[test]
    fn test_first_lap_sets_mean() {
        let mut timer = RunTimer::new(0.5);
        assert_eq!(timer.mean(), Duration::ZERO);
        let dt = timer.lap();
        assert_eq!(timer.laps(), 1);
        assert!(timer.mean().as_nanos().abs_diff(dt.as_nanos()) <= 1);
    }

    #[test]
    fn test_format_duration_scales() {
        assert_eq!(format_duration(Duration::from_micros(253)), "253µs");
        assert_eq!(format_duration(Duration::from_millis(42)), "42ms");
        assert_eq!(format_duration(Duration::from_millis(3140)), "3.14s");
    }
}
