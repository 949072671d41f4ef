//! Exponential reconnection backoff with uniform jitter
//!
//! Delays double on every attempt starting from the multiplier until they hit
//! the cutoff, then settle there. Each returned delay is perturbed by up to one
//! multiplier in either direction so that a fleet of devices does not reconnect
//! in lockstep after a broker outage.

use rand::Rng;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Invalid backoff coefficients
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackoffError {
    #[error("backoff multiplier must be greater than zero")]
    ZeroMultiplier,
    #[error("backoff cutoff must be greater than zero")]
    ZeroCutoff,
    #[error("backoff cutoff ({cutoff_ms}ms) is smaller than the multiplier ({multiplier_ms}ms)")]
    CutoffBelowMultiplier { multiplier_ms: u64, cutoff_ms: u64 },
}

/// Reconnection delay generator
#[derive(Debug, Clone)]
pub struct BackoffScheduler {
    multiplier_ms: u64,
    cutoff_ms: u64,
    /// Last un-jittered delay, zero when no attempt has been made yet
    prev_delay_ms: u64,
}

impl BackoffScheduler {
    /// Create a scheduler, both coefficients are in milliseconds
    pub fn new(multiplier_ms: u64, cutoff_ms: u64) -> Result<Self, BackoffError> {
        if multiplier_ms == 0 {
            return Err(BackoffError::ZeroMultiplier);
        }
        if cutoff_ms == 0 {
            return Err(BackoffError::ZeroCutoff);
        }
        if cutoff_ms < multiplier_ms {
            return Err(BackoffError::CutoffBelowMultiplier {
                multiplier_ms,
                cutoff_ms,
            });
        }

        Ok(Self {
            multiplier_ms,
            cutoff_ms,
            prev_delay_ms: 0,
        })
    }

    pub fn multiplier(&self) -> Duration {
        Duration::from_millis(self.multiplier_ms)
    }

    pub fn cutoff(&self) -> Duration {
        Duration::from_millis(self.cutoff_ms)
    }

    /// Compute the delay before the next connection attempt
    pub fn next_delay(&mut self) -> Duration {
        let raw = if self.prev_delay_ms == 0 {
            self.multiplier_ms
        } else {
            self.prev_delay_ms.saturating_mul(2)
        };
        let bounded = raw.min(self.cutoff_ms);
        self.prev_delay_ms = bounded;

        let mut rng = rand::thread_rng();
        let lower = bounded.saturating_sub(self.multiplier_ms);
        let delay_ms = match bounded.checked_add(self.multiplier_ms) {
            Some(upper) => rng.gen_range(lower..=upper),
            // Jitter window does not fit in the delay type
            None => rng.gen::<u64>(),
        };

        debug!(
            bounded_ms = bounded,
            delay_ms = delay_ms,
            "Computed next reconnection delay"
        );
        Duration::from_millis(delay_ms)
    }

    /// Forget previous attempts, the next delay is again close to the multiplier
    pub fn reset(&mut self) {
        self.prev_delay_ms = 0;
    }
}
