use std::time::Duration;

/// Default exponential back-off schedule: 200ms → 400ms → 800ms → 1600ms,
/// with ±20% jitter.
pub(crate) fn backoff(attempt: u64) -> Duration {
    let base_delay_ms = 200u64 * (1u64 << (attempt.saturating_sub(1)).min(8));
    let jitter: f64 = rand::random_range(0.8..1.2);
    let delay_ms = (base_delay_ms as f64 * jitter) as u64;
    Duration::from_millis(delay_ms)
}
