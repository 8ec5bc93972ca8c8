//! Time management utilities

use std::time::{Duration, Instant};

/// Wall-clock stopwatch used to pace periodic work such as buffer GC
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::start_new()
    }
}

impl Stopwatch {
    /// Create a stopwatch running from now
    pub fn start_new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    /// Reset the stopwatch to zero
    pub fn restart(&mut self) {
        self.started = Instant::now();
    }

    /// Time since the last (re)start
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time since the last (re)start in seconds
    pub fn elapsed_secs(&self) -> f32 {
        self.elapsed().as_secs_f32()
    }

    /// Restart the stopwatch if at least `interval_secs` have elapsed
    ///
    /// Returns `true` when the interval was reached.
    pub fn lap_if_elapsed(&mut self, interval_secs: f32) -> bool {
        if self.elapsed_secs() >= interval_secs {
            self.restart();
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_always_laps() {
        let mut watch = Stopwatch::start_new();
        assert!(watch.lap_if_elapsed(0.0));
        assert!(watch.lap_if_elapsed(0.0));
    }

    #[test]
    fn test_long_interval_does_not_lap() {
        let mut watch = Stopwatch::start_new();
        assert!(!watch.lap_if_elapsed(3600.0));
    }

    #[test]
    fn test_restart_resets_elapsed_time() {
        let mut watch = Stopwatch::start_new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(watch.elapsed() >= Duration::from_millis(20));
        watch.restart();
        assert!(watch.elapsed() < Duration::from_millis(20));
    }
}
