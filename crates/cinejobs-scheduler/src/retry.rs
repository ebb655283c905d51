use chrono::{DateTime, Duration, Utc};
use cinejobs_core::config::{RetryConfig, MAX_RETRY_DELAY_SECS};

/// Exponential backoff between attempts of a failed job.
///
/// `delay(n) = base * multiplier^n`, capped at `max`. Deterministic in `n`
/// and never decreasing as `n` grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    multiplier: u32,
    max: Duration,
}

impl Default for RetryPolicy {
    /// 1 min, 5 min, 25 min, then capped at 1 h.
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// `base` is clamped to at least 1 ms so a retry is always strictly
    /// later than the failure that caused it.
    pub fn new(base: Duration, multiplier: u32, max: Duration) -> Self {
        let base = base.max(Duration::milliseconds(1));
        Self {
            base,
            multiplier: multiplier.max(1),
            max: max.max(base),
        }
    }

    /// Delays beyond [`MAX_RETRY_DELAY_SECS`] are clamped to it.
    pub fn from_config(config: &RetryConfig) -> Self {
        let secs = |s: u64| Duration::seconds(s.min(MAX_RETRY_DELAY_SECS) as i64);
        Self::new(
            secs(config.base_delay_secs),
            config.multiplier,
            secs(config.max_delay_secs),
        )
    }

    /// Delay before the attempt that follows failed attempt `retry_count`.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let base_ms = self.base.num_milliseconds();
        let max_ms = self.max.num_milliseconds();
        let factor = i64::from(self.multiplier)
            .checked_pow(retry_count)
            .unwrap_or(i64::MAX);
        Duration::milliseconds(base_ms.saturating_mul(factor).min(max_ms))
    }

    pub fn next_retry_at(&self, failed_at: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        failed_at + self.delay(retry_count)
    }

    /// Whether an attempt that already made `retry_count` retries may be retried.
    pub fn should_retry(retry_count: u32, max_retries: u32) -> bool {
        retry_count < max_retries
    }
}
