// Frame timing, averaged over one-second windows

use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

/// Read-only numbers handed to the overlay every frame
#[derive(Debug, Clone, Default)]
pub struct FrameStats {
    pub fps: f32,
    pub frame_time_ms: f32,
    pub device_name: String,
    pub vsync: bool,
}

#[derive(Debug)]
pub struct FrameTimer {
    frame_count: u32,
    window_start: Instant,
    fps: f32,
    frame_time_ms: f32,
}

impl FrameTimer {
    pub fn new(now: Instant) -> Self {
        Self {
            frame_count: 0,
            window_start: now,
            fps: 0.0,
            frame_time_ms: 0.0,
        }
    }

    /// Count a presented frame. Returns true when a new average was published.
    pub fn record_frame(&mut self, now: Instant) -> bool {
        self.frame_count += 1;

        let elapsed = now.duration_since(self.window_start);
        if elapsed < WINDOW {
            return false;
        }

        let secs = elapsed.as_secs_f32();
        self.fps = self.frame_count as f32 / secs;
        self.frame_time_ms = secs * 1000.0 / self.frame_count as f32;
        self.frame_count = 0;
        self.window_start = now;
        true
    }

    pub fn fps(&self) -> f32 {
        self.fps
    }

    pub fn frame_time_ms(&self) -> f32 {
        self.frame_time_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_once_per_window() {
        let start = Instant::now();
        let mut timer = FrameTimer::new(start);

        for i in 1..60 {
            assert!(!timer.record_frame(start + Duration::from_millis(i * 16)));
        }
        assert_eq!(timer.fps(), 0.0);

        assert!(timer.record_frame(start + Duration::from_secs(1)));
        assert!((timer.fps() - 60.0).abs() < 1e-3);
        assert!((timer.frame_time_ms() - 1000.0 / 60.0).abs() < 1e-3);
    }

    #[test]
    fn window_restarts_after_publish() {
        let start = Instant::now();
        let mut timer = FrameTimer::new(start);

        assert!(timer.record_frame(start + Duration::from_secs(2)));
        assert!((timer.fps() - 0.5).abs() < 1e-6);

        // One frame into the next window is not enough
        assert!(!timer.record_frame(start + Duration::from_millis(2500)));
        assert!((timer.fps() - 0.5).abs() < 1e-6);
    }
}
