use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const MIN_DELAY_SECS: f64 = 1.0;

/// Normally distributed gap between posts, never shorter than one second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PacingPolicy {
    pub mean_secs: f64,
    pub stddev_secs: f64,
}

impl PacingPolicy {
    pub fn new(mean_secs: f64, stddev_secs: f64) -> Self {
        Self {
            mean_secs,
            stddev_secs,
        }
    }

    pub fn sample_secs<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        let raw = match Normal::new(self.mean_secs, self.stddev_secs.abs()) {
            Ok(normal) => normal.sample(rng),
            Err(_) => self.mean_secs,
        };
        if raw.is_finite() {
            raw.max(MIN_DELAY_SECS)
        } else {
            MIN_DELAY_SECS
        }
    }

    pub fn next_delay<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        Duration::try_from_secs_f64(self.sample_secs(rng)).unwrap_or(Duration::MAX)
    }
}
