//! Frame timing

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Number of frames averaged by [`FrameTimer::average_frame_time`]
pub const AVERAGE_FRAME_COUNT: usize = 100;

/// Rolling frame timer
///
/// Keeps the last [`AVERAGE_FRAME_COUNT`] frame durations and reports their
/// average, which is steadier to display than the instantaneous delta.
pub struct FrameTimer {
    last_frame: Instant,
    delta_time: f32,
    samples: VecDeque<Duration>,
    frame_count: u64,
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameTimer {
    /// Create a new timer
    pub fn new() -> Self {
        Self {
            last_frame: Instant::now(),
            delta_time: 0.0,
            samples: VecDeque::with_capacity(AVERAGE_FRAME_COUNT),
            frame_count: 0,
        }
    }

    /// Update the timer (should be called once per frame)
    pub fn update(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_frame);
        self.last_frame = now;
        self.record(elapsed);
    }

    /// Record one frame duration
    pub fn record(&mut self, elapsed: Duration) {
        self.delta_time = elapsed.as_secs_f32();
        if self.samples.len() == AVERAGE_FRAME_COUNT {
            self.samples.pop_front();
        }
        self.samples.push_back(elapsed);
        self.frame_count += 1;
    }

    /// Get the time since the last frame in seconds
    pub const fn delta_time(&self) -> f32 {
        self.delta_time
    }

    /// Get the current frame count
    pub const fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Average duration over the retained window, in milliseconds
    #[allow(clippy::cast_precision_loss)]
    pub fn average_frame_time(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let total: Duration = self.samples.iter().sum();
        total.as_secs_f32() * 1000.0 / self.samples.len() as f32
    }

    /// Frames per second derived from the rolling average
    pub fn average_fps(&self) -> f32 {
        let ms = self.average_frame_time();
        if ms > 0.0 {
            1000.0 / ms
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_average_uses_only_recent_window() {
        let mut timer = FrameTimer::new();
        for _ in 0..AVERAGE_FRAME_COUNT {
            timer.record(Duration::from_millis(40));
        }
        for _ in 0..AVERAGE_FRAME_COUNT {
            timer.record(Duration::from_millis(10));
        }
        assert_relative_eq!(timer.average_frame_time(), 10.0, epsilon = 1e-3);
        assert_relative_eq!(timer.average_fps(), 100.0, epsilon = 1e-2);
        assert_eq!(timer.frame_count(), 2 * AVERAGE_FRAME_COUNT as u64);
    }

    #[test]
    fn test_empty_timer_reports_zero() {
        let timer = FrameTimer::new();
        assert_eq!(timer.average_frame_time(), 0.0);
        assert_eq!(timer.average_fps(), 0.0);
    }
}
