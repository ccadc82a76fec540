//! Heartbeat delay estimation

use std::collections::VecDeque;
use std::time::Duration;

/// Moving-window estimator of how far a heartbeat round trip exceeds the
/// recent average.
#[derive(Debug, Clone)]
pub struct DelayTimer {
    window: usize,
    samples: VecDeque<Duration>,
    sum: Duration,
}

impl DelayTimer {
    #[must_use]
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            sum: Duration::ZERO,
        }
    }

    /// Record `interval` and return its excess over the mean of the samples
    /// seen before it. The first sample always yields zero.
    pub fn observe(&mut self, interval: Duration) -> Duration {
        let excess = if self.samples.is_empty() {
            Duration::ZERO
        } else {
            interval.saturating_sub(self.mean())
        };

        if self.samples.len() == self.window {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum = self.sum.saturating_sub(oldest);
            }
        }
        self.samples.push_back(interval);
        self.sum = self.sum.saturating_add(interval);

        excess
    }

    /// Mean of the samples currently in the window
    pub fn mean(&self) -> Duration {
        match u32::try_from(self.samples.len()) {
            Ok(0) | Err(_) => Duration::ZERO,
            Ok(n) => self.sum / n,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
