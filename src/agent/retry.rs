//! Backoff schedule for transient backend failures.
//!
//! The wait before each retry grows exponentially up to a cap. Batches of
//! the same round that fail together would otherwise retry in lockstep, so
//! the delay is scaled by a fixed factor picked from the batch index. The
//! schedule has no randomness: the same batch always waits the same time.

use std::time::Duration;

/// Scale factors applied per (retry, batch) pair when spreading is on.
const SPREAD: [f64; 5] = [0.75, 0.90, 0.60, 0.85, 0.70];

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt; 0 fails on the first transient error.
    pub max_retries: u32,
    /// Wait before the first retry.
    pub base_delay: Duration,
    /// No single wait is longer than this.
    pub max_delay: Duration,
    pub factor: f64,
    /// Spread concurrent batches apart.
    pub spread: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            spread: true,
        }
    }
}

impl RetryConfig {
    pub fn with_retries(retries: u32) -> Self {
        Self {
            max_retries: retries,
            ..Default::default()
        }
    }

    #[cfg(test)]
    pub fn immediate(retries: u32) -> Self {
        Self {
            max_retries: retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
            spread: false,
        }
    }

    /// Wait before retry number `retry` (0 = first retry) of batch `batch_index`.
    pub fn backoff(&self, retry: u32, batch_index: usize) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let grown = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        let capped = grown.min(self.max_delay.as_secs_f64());

        if !self.spread {
            return Duration::from_secs_f64(capped);
        }
        let slot = (retry as usize).wrapping_add(batch_index) % SPREAD.len();
        Duration::from_secs_f64(capped * SPREAD[slot])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unspread() -> RetryConfig {
        RetryConfig {
            spread: false,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn test_retries_come_from_config() {
        assert_eq!(RetryConfig::with_retries(5).max_retries, 5);
        assert_eq!(RetryConfig::default().max_retries, 3);
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let schedule: Vec<u64> = (0..8)
            .map(|retry| unspread().backoff(retry, 0).as_millis() as u64)
            .collect();
        assert_eq!(
            schedule,
            vec![500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
        );
    }

    #[test]
    fn test_batches_of_one_round_back_off_apart() {
        // Five batches failing on the same retry all wait differently.
        let config = RetryConfig::default();
        let mut waits: Vec<Duration> = (0..5).map(|batch| config.backoff(1, batch)).collect();
        waits.sort();
        waits.dedup();
        assert_eq!(waits.len(), 5);
    }

    #[test]
    fn test_spread_only_shortens_the_wait() {
        let config = RetryConfig::default();
        for batch in 0..12 {
            for retry in 0..4 {
                assert!(config.backoff(retry, batch) <= unspread().backoff(retry, batch));
            }
        }
    }

    #[test]
    fn test_same_batch_waits_the_same_every_run() {
        let first = RetryConfig::default();
        let second = RetryConfig::default();
        assert_eq!(first.backoff(2, 7), second.backoff(2, 7));
        assert_eq!(first.backoff(2, 7), Duration::from_secs_f64(2.0 * 0.70));
    }

    #[test]
    fn test_immediate_never_waits() {
        let config = RetryConfig::immediate(4);
        assert_eq!(config.backoff(0, 3), Duration::ZERO);
        assert_eq!(config.backoff(9, 0), Duration::ZERO);
    }
}
