//! Retry policy - exponential backoff with per-item jitter
//!
//! Backoff is evaluated across cycles: an item whose last attempt is more
//! recent than its delay is left out of the cycle, nothing sleeps.
//! Jitter is derived from the item id, so an item's delays never shrink
//! from one attempt to the next.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

use super::models::QueueItem;

const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_JITTER_RATIO: f64 = 0.2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Attempts after which a failing item becomes terminal
    pub max_attempts: u32,
    /// Upper bound of the extra delay, as a fraction of the raw delay
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

impl RetryPolicy {
    /// Policy with no delay between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay required after `attempts` failed attempts before the next one
    pub fn delay_for(&self, attempts: u32, seed: &str) -> Duration {
        if attempts == 0 || self.base_delay_ms == 0 {
            return Duration::ZERO;
        }

        let exponent = (attempts - 1).min(63) as i32;
        let raw_ms = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let jittered_ms = raw_ms * (1.0 + self.jitter_ratio.max(0.0) * jitter_fraction(seed));
        let capped_ms = jittered_ms.min(self.max_delay_ms as f64);

        Duration::from_millis(capped_ms as u64)
    }

    /// Earliest time the item may be attempted again
    pub fn next_attempt_at(&self, item: &QueueItem) -> Option<DateTime<Utc>> {
        let last = item.last_attempt_at?;
        let delay = chrono::Duration::from_std(self.delay_for(item.attempt_count, &item.id)).ok()?;
        last.checked_add_signed(delay)
    }

    pub fn is_due(&self, item: &QueueItem, now: DateTime<Utc>) -> bool {
        match self.next_attempt_at(item) {
            Some(at) => now >= at,
            None => true,
        }
    }

    /// No attempts remain after `attempts` failures
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Stable fraction in [0, 1) derived from the seed
fn jitter_fraction(seed: &str) -> f64 {
    let digest = Sha256::digest(seed.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(bytes) >> 11) as f64 / (1u64 << 53) as f64
}

// ============================================================================
// Tests
// ============================================================================
