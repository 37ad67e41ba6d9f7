//! Frame sampler: limits how often stream frames reach the encoder.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct FrameSampler {
    period: Duration,
    last: Option<Instant>,
}

impl FrameSampler {
    pub fn new(period: Duration) -> Self {
        Self { period, last: None }
    }

    /// Sampler admitting at most `fps` frames per second.
    /// A non-positive or non-finite rate admits every frame.
    pub fn from_fps(fps: f64) -> Self {
        let period = if fps.is_finite() && fps > 0.0 {
            Duration::from_secs_f64(1.0 / fps)
        } else {
            Duration::ZERO
        };
        Self::new(period)
    }

    /// Sampler that admits every frame (the source paces itself).
    pub fn unthrottled() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Admit the frame seen at `now` if a full period has passed since the
    /// last admitted frame. The first frame is always admitted.
    pub fn admit(&mut self, now: Instant) -> bool {
        let due = match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.period,
        };
        if due {
            self.last = Some(now);
        }
        due
    }
}
