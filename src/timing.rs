//! Walltime tracking for the inner loop.
//!
//! The inner loop charges different segments to walltime depending on the
//! run mode: the training forward/backward and the parameter update are
//! always measured, but the held-out forward only counts when the outer
//! optimizer is actually being trained. A small nanosecond-precision
//! [`Duration`] avoids repeated float conversions during collection;
//! conversions to other units happen on demand.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// High-precision duration stored as nanoseconds.
///
/// The internal `u64` representation gives ~584 years of range, which is
/// sufficient for any inner-loop run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Duration {
    nanos: u64,
}

impl Duration {
    /// Zero duration constant.
    pub const ZERO: Self = Self { nanos: 0 };

    /// Creates a duration from nanoseconds.
    #[inline]
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self { nanos }
    }

    /// Creates a duration from milliseconds.
    #[inline]
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self {
            nanos: millis * 1_000_000,
        }
    }

    /// Returns the duration in nanoseconds.
    #[inline]
    #[must_use]
    pub const fn as_nanos(&self) -> u64 {
        self.nanos
    }

    /// Returns the duration in milliseconds.
    #[inline]
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.nanos / 1_000_000
    }

    /// Returns the duration in milliseconds as f64.
    #[inline]
    #[must_use]
    pub fn as_millis_f64(&self) -> f64 {
        self.nanos as f64 / 1_000_000.0
    }

    /// Returns the duration in seconds as f64.
    #[inline]
    #[must_use]
    pub fn as_secs_f64(&self) -> f64 {
        self.nanos as f64 / 1_000_000_000.0
    }

    /// Adds two durations, saturating at the maximum.
    #[inline]
    #[must_use]
    pub const fn saturating_add(self, other: Self) -> Self {
        Self {
            nanos: self.nanos.saturating_add(other.nanos),
        }
    }
}

impl std::ops::Add for Duration {
    type Output = Self;

    #[inline]
    fn add(self, other: Self) -> Self {
        Self {
            nanos: self.nanos + other.nanos,
        }
    }
}

impl std::ops::AddAssign for Duration {
    #[inline]
    fn add_assign(&mut self, other: Self) {
        self.nanos += other.nanos;
    }
}

impl From<std::time::Duration> for Duration {
    #[inline]
    fn from(d: std::time::Duration) -> Self {
        Self {
            nanos: d.as_nanos() as u64,
        }
    }
}

/// Low-overhead wall-clock timer.
#[derive(Debug, Clone)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Starts a new timer.
    #[inline]
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Returns the elapsed duration since the timer was started.
    #[inline]
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        Duration::from(self.start.elapsed())
    }

    /// Resets the timer and returns the elapsed duration.
    #[inline]
    pub fn reset(&mut self) -> Duration {
        let elapsed = self.elapsed();
        self.start = Instant::now();
        elapsed
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::start()
    }
}

/// Accumulated walltime for one inner-loop run.
///
/// Segments are charged explicitly via [`Walltime::charge`] so the caller
/// decides which parts of an iteration count (mode-dependent).
#[derive(Debug, Clone, Copy, Default)]
pub struct Walltime {
    total: Duration,
}

impl Walltime {
    /// Creates a fresh walltime accumulator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Charges a measured segment to the accumulated time.
    #[inline]
    pub fn charge(&mut self, segment: Duration) {
        self.total = self.total.saturating_add(segment);
    }

    /// Total accumulated walltime.
    #[inline]
    #[must_use]
    pub fn total(&self) -> Duration {
        self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_conversions() {
        let d = Duration::from_millis(2);
        assert_eq!(d.as_nanos(), 2_000_000);
        assert_eq!(d.as_millis(), 2);
        assert!((d.as_millis_f64() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_timer_measures_something() {
        let timer = Timer::start();
        std::thread::sleep(std::time::Duration::from_millis(1));
        assert!(timer.elapsed().as_nanos() >= 900_000);
    }

    #[test]
    fn test_walltime_accumulates() {
        let mut wt = Walltime::new();
        wt.charge(Duration::from_nanos(100));
        wt.charge(Duration::from_nanos(50));
        assert_eq!(wt.total().as_nanos(), 150);
    }
}
