use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::{Duration, Instant},
};

const FPS_WINDOW: Duration = Duration::from_secs(1);

/// Counts processed frames and yields a rate once per window.
#[derive(Debug)]
pub struct FpsMeter {
    window_start: Instant,
    frames: u32,
}

impl FpsMeter {
    pub fn new(now: Instant) -> Self {
        Self {
            window_start: now,
            frames: 0,
        }
    }

    pub fn tick(&mut self, now: Instant) -> Option<f32> {
        self.frames += 1;
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < FPS_WINDOW {
            return None;
        }

        let fps = self.frames as f32 / elapsed.as_secs_f32();
        self.frames = 0;
        self.window_start = now;
        Some(fps)
    }
}

/// Latest FPS estimate, readable from outside the capture thread.
#[derive(Clone, Debug, Default)]
pub struct FpsGauge(Arc<AtomicU32>);

impl FpsGauge {
    pub fn set(&self, fps: f32) {
        self.0.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}
