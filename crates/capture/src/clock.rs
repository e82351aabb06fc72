use std::sync::atomic::{AtomicU64, Ordering};

/// Logical capture time in milliseconds.
///
/// Shared between the session and the frame driver; only the driver advances it, and only after a
/// frame was captured.
#[derive(Debug)]
pub struct FrameClock {
    timestamp_bits: AtomicU64,
    interval: f64,
}

impl FrameClock {
    pub fn new(fps: f64) -> Self {
        Self {
            timestamp_bits: AtomicU64::new(0f64.to_bits()),
            interval: frame_interval(fps),
        }
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    pub fn now(&self) -> f64 {
        f64::from_bits(self.timestamp_bits.load(Ordering::Acquire))
    }

    pub fn advance(&self) -> f64 {
        let next = self.now() + self.interval;
        self.timestamp_bits.store(next.to_bits(), Ordering::Release);
        next
    }

    pub fn reset(&self) {
        self.timestamp_bits.store(0f64.to_bits(), Ordering::Release);
    }
}

/// Milliseconds between frames; infinite when `fps` is zero.
pub fn frame_interval(fps: f64) -> f64 {
    if fps == 0.0 {
        f64::INFINITY
    } else {
        1000.0 / fps
    }
}
